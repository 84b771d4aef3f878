//! Durable ordered key-value store backed by redb.
//!
//! One table over byte keys holds the whole logical key space of
//! [`crate::keys`]. Write batches commit atomically inside a single redb
//! write transaction; prefix scans run on a read transaction and therefore
//! see a point-in-time snapshot without blocking writers.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use drivemirror_common::{Error, Result};

/// Metadata: key bytes → JSON-encoded value bytes
const METADATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("metadata");

fn store_err(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Store(format!("{context}: {err}"))
}

/// Encodes a value into the store's value representation.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Encoding(e.to_string()))
}

/// Decodes a value from the store's value representation.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Encoding(e.to_string()))
}

/// One pending operation of a [`WriteBatch`].
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of put/delete operations that commit atomically or not at all.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Tracks scans in flight so close() can drain them before the store goes
/// away.
#[derive(Default)]
struct IterGate {
    active: Mutex<usize>,
    drained: Condvar,
}

struct IterGuard<'a> {
    gate: &'a IterGate,
}

impl IterGate {
    fn enter(&self) -> IterGuard<'_> {
        *self.active.lock() += 1;
        IterGuard { gate: self }
    }

    fn wait_drained(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.drained.wait(&mut active);
        }
    }
}

impl Drop for IterGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.gate.active.lock();
        *active -= 1;
        if *active == 0 {
            self.gate.drained.notify_all();
        }
    }
}

/// Durable metadata store.
pub struct MetaStore {
    db: Database,
    iters: IterGate,
    closed: AtomicBool,
}

impl MetaStore {
    /// Open (or create) the store at `path`.
    ///
    /// A store left dirty by a crash is repaired during open; repair progress
    /// is logged. If repair fails, the open fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder()
            .set_repair_callback(|session| {
                warn!(
                    "repairing metadata store: {:.0}% done",
                    session.progress() * 100.0
                );
            })
            .create(path.as_ref())
            .map_err(|e| store_err("open metadata store", e))?;

        // Ensure the table exists so later read transactions can open it.
        let wtx = db
            .begin_write()
            .map_err(|e| store_err("init metadata store", e))?;
        wtx.open_table(METADATA)
            .map_err(|e| store_err("init metadata table", e))?;
        wtx.commit().map_err(|e| store_err("init metadata store", e))?;

        Ok(Self {
            db,
            iters: IterGate::default(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Fetch the raw value stored under `key`.
    pub fn get_raw(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let rtx = self
            .db
            .begin_read()
            .map_err(|e| store_err("begin read", e))?;
        let table = rtx
            .open_table(METADATA)
            .map_err(|e| store_err("open table", e))?;
        match table.get(key).map_err(|e| store_err("get", e))? {
            Some(value) => Ok(value.value().to_vec()),
            None => Err(Error::NotFound),
        }
    }

    /// Fetch and decode the value stored under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<T> {
        decode(&self.get_raw(key)?)
    }

    /// True when `key` is present.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        match self.get_raw(key) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Store a single key/value pair.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    /// Remove a single key. Removing an absent key is not an error.
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    /// Commit a batch atomically.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.ensure_open()?;
        let wtx = self
            .db
            .begin_write()
            .map_err(|e| store_err("begin write", e))?;
        {
            let mut table = wtx
                .open_table(METADATA)
                .map_err(|e| store_err("open table", e))?;
            for op in &batch.ops {
                match op {
                    BatchOp::Put(key, value) => {
                        table
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(|e| store_err("batch put", e))?;
                    }
                    BatchOp::Delete(key) => {
                        table
                            .remove(key.as_slice())
                            .map_err(|e| store_err("batch delete", e))?;
                    }
                }
            }
        }
        wtx.commit().map_err(|e| store_err("commit", e))
    }

    /// All key/value pairs whose key starts with `prefix`, in key order.
    ///
    /// The scan runs on its own read transaction: it observes a snapshot of
    /// the store and never blocks concurrent writers.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let _guard = self.iters.enter();
        self.ensure_open()?;

        let rtx = self
            .db
            .begin_read()
            .map_err(|e| store_err("begin read", e))?;
        let table = rtx
            .open_table(METADATA)
            .map_err(|e| store_err("open table", e))?;

        let mut entries = Vec::new();
        for item in table.range(prefix..).map_err(|e| store_err("scan", e))? {
            let (key, value) = item.map_err(|e| store_err("scan", e))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            entries.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(entries)
    }

    /// Refuse new scans and wait for outstanding ones to release.
    ///
    /// The underlying database stays usable for point reads until the store
    /// is dropped; scans started after this call fail with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.iters.wait_drained();
    }
}
