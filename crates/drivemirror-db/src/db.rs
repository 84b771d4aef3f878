//! The public database handle and its shared state.
//!
//! `DriveDb` owns the durable store, the in-memory cache, and the two
//! background tasks (poller and applier). Queries run against the store and
//! cache; the change feed is applied behind the scenes.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drivemirror_common::{Checkpoint, Error, Inode, MirrorConfig, RemoteFile, Result};

use crate::applier::{self, Applier};
use crate::cache::FileCache;
use crate::keys;
use crate::poller::Poller;
use crate::source::ChangeSource;
use crate::store::{encode, MetaStore, WriteBatch};
use crate::view::FileView;

/// Coalesces concurrent allocations of the same remote id: the inserting
/// caller runs the allocation, everyone else waits for `done` and re-reads
/// the mapping.
#[derive(Default)]
struct AllocGate {
    done: Mutex<bool>,
    cv: Condvar,
}

/// State shared between the database handle and the background tasks.
pub(crate) struct Inner {
    pub(crate) store: MetaStore,
    pub(crate) cache: FileCache,
    pub(crate) config: MirrorConfig,
    checkpoint: Mutex<Checkpoint>,
    alloc_gates: Mutex<HashMap<String, Arc<AllocGate>>>,
    synced_tx: broadcast::Sender<()>,
}

impl Inner {
    /// Open the store at `path` and recover (or initialise) the checkpoint.
    pub(crate) fn open(path: impl AsRef<Path>, config: MirrorConfig) -> Result<Arc<Self>> {
        let store = MetaStore::open(path)?;

        let checkpoint = match store.get::<Checkpoint>(&keys::internal(keys::CHECKPOINT)) {
            Ok(cpt) => cpt,
            Err(Error::NotFound) => {
                info!(
                    "no checkpoint found, starting fresh at inode floor {}",
                    config.inode_floor
                );
                Checkpoint {
                    last_change_id: 0,
                    last_inode: config.inode_floor,
                }
            }
            // An unreadable checkpoint must not silently restart allocation
            // at the floor: that would re-issue live inode numbers.
            Err(e) => return Err(e),
        };
        store.put(keys::internal(keys::CHECKPOINT), encode(&checkpoint)?)?;
        info!(
            "recovered checkpoint: last_change_id={} last_inode={}",
            checkpoint.last_change_id, checkpoint.last_inode
        );

        let (synced_tx, _) = broadcast::channel(16);
        let cache = FileCache::new(config.lru_capacity);

        Ok(Arc::new(Self {
            store,
            cache,
            config,
            checkpoint: Mutex::new(checkpoint),
            alloc_gates: Mutex::new(HashMap::new()),
            synced_tx,
        }))
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        *self.checkpoint.lock()
    }

    pub(crate) fn last_change_id(&self) -> i64 {
        self.checkpoint.lock().last_change_id
    }

    /// Best-effort broadcast to whoever is currently waiting for sync.
    pub(crate) fn notify_synced(&self) {
        let _ = self.synced_tx.send(());
    }

    pub(crate) fn subscribe_synced(&self) -> broadcast::Receiver<()> {
        self.synced_tx.subscribe()
    }

    /// Commit `batch` together with a checkpoint advanced to `change_id`.
    ///
    /// The checkpoint mutex is held across the commit; the in-memory
    /// checkpoint moves only once the batch is durable, so a failed commit
    /// leaves the synchronisation position untouched.
    pub(crate) fn commit_with_checkpoint(&self, mut batch: WriteBatch, change_id: i64) -> Result<()> {
        let mut cpt = self.checkpoint.lock();
        let mut next = *cpt;
        next.last_change_id = next.last_change_id.max(change_id);
        batch.put(keys::internal(keys::CHECKPOINT), encode(&next)?);
        self.store.write(batch)?;
        *cpt = next;
        Ok(())
    }

    pub(crate) fn lookup_inode(&self, id: &str) -> Result<Option<Inode>> {
        match self.store.get::<Inode>(&keys::id_to_inode(id)) {
            Ok(inode) => Ok(Some(inode)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The inode assigned to `id`, allocating one when none exists yet.
    ///
    /// Concurrent calls for the same id coalesce onto a single allocation;
    /// calls for different ids proceed independently.
    pub(crate) fn inode_for_id(&self, id: &str) -> Result<Inode> {
        loop {
            if let Some(inode) = self.lookup_inode(id)? {
                return Ok(inode);
            }

            let (gate, leader) = {
                let mut gates = self.alloc_gates.lock();
                match gates.entry(id.to_owned()) {
                    Entry::Occupied(e) => (Arc::clone(e.get()), false),
                    Entry::Vacant(v) => {
                        (Arc::clone(v.insert(Arc::new(AllocGate::default()))), true)
                    }
                }
            };

            if leader {
                let result = self.allocate(id);
                {
                    let mut done = gate.done.lock();
                    *done = true;
                    gate.cv.notify_all();
                }
                self.alloc_gates.lock().remove(id);
                return result;
            }

            let mut done = gate.done.lock();
            while !*done {
                gate.cv.wait(&mut done);
            }
            // The leader finished: re-read the mapping, or retry the
            // allocation ourselves if it failed.
        }
    }

    /// Allocate the next inode for `id` and persist both identity mappings
    /// plus the advanced checkpoint in one batch.
    fn allocate(&self, id: &str) -> Result<Inode> {
        let mut cpt = self.checkpoint.lock();
        let inode = cpt.last_inode + 1;
        if self.store.has(&keys::inode_to_id(inode))? {
            return Err(Error::InvariantViolation(format!(
                "fresh inode {inode} is already mapped"
            )));
        }

        let mut next = *cpt;
        next.last_inode = inode;

        let mut batch = WriteBatch::new();
        batch.put(keys::id_to_inode(id), encode(&inode)?);
        batch.put(keys::inode_to_id(inode), encode(&id)?);
        batch.put(keys::internal(keys::CHECKPOINT), encode(&next)?);
        self.store.write(batch)?;
        *cpt = next;
        Ok(inode)
    }

    pub(crate) fn id_for_inode(&self, inode: Inode) -> Result<String> {
        self.store.get::<String>(&keys::inode_to_id(inode))
    }

    pub(crate) fn file_by_id(&self, id: &str) -> Result<RemoteFile> {
        self.store.get::<RemoteFile>(&keys::file(id))
    }

    /// Children of `parent`, dropping (and garbage-collecting) index entries
    /// whose file entity no longer exists.
    pub(crate) fn child_file_ids(&self, parent: &str) -> Result<Vec<String>> {
        let prefix = keys::child_prefix(parent);
        let mut ids = Vec::new();
        let mut stale = WriteBatch::new();
        for (key, _) in self.store.scan_prefix(&prefix)? {
            let child = keys::strip_prefix(&key, &prefix)?.to_owned();
            if self.store.has(&keys::file(&child))? {
                ids.push(child);
            } else {
                stale.delete(key);
            }
        }
        if !stale.is_empty() {
            if let Err(e) = self.store.write(stale) {
                warn!("failed to drop stale child entries of {parent}: {e}");
            }
        }
        Ok(ids)
    }

    /// Assemble (or fetch from cache) the view of the file behind `inode`.
    pub(crate) fn file_by_inode(&self, inode: Inode) -> Result<Arc<FileView>> {
        if let Some(view) = self.cache.view(inode) {
            return Ok(view);
        }

        let id = self.id_for_inode(inode)?;
        let file = self.file_by_id(&id)?;

        let child_ids = self.child_file_ids(&id)?;
        let mut children = Vec::with_capacity(child_ids.len());
        for child_id in &child_ids {
            children.push(self.inode_for_id(child_id)?);
        }

        let view = Arc::new(FileView::new(file, inode, children));
        self.cache.put_view(Arc::clone(&view));
        Ok(view)
    }

    pub(crate) fn root_file_ids(&self) -> Result<Vec<String>> {
        let prefix = keys::root_prefix();
        let mut ids = Vec::new();
        for (key, _) in self.store.scan_prefix(&prefix)? {
            ids.push(keys::tail(&key)?.to_owned());
        }
        Ok(ids)
    }

    /// Inodes of the root set, cached under the sentinel entry until the
    /// next applied change.
    pub(crate) fn root_inodes(&self) -> Result<Vec<Inode>> {
        if let Some(roots) = self.cache.roots() {
            return Ok(roots.as_ref().clone());
        }

        let mut inodes = Vec::new();
        for id in self.root_file_ids()? {
            match self.inode_for_id(&id) {
                Ok(inode) => inodes.push(inode),
                Err(e) => warn!("no inode for root file {id}: {e}"),
            }
        }
        self.cache.put_roots(inodes.clone());
        Ok(inodes)
    }
}

/// Durable mirror of a remote drive's metadata.
///
/// Opening spawns the background synchroniser; queries serve from the local
/// store. Must be created inside a tokio runtime.
pub struct DriveDb {
    inner: Arc<Inner>,
    source: Arc<dyn ChangeSource>,
    trigger_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DriveDb {
    /// Open (or create) the mirror at `path` and start syncing from `source`.
    pub fn open(
        source: Arc<dyn ChangeSource>,
        path: impl AsRef<Path>,
        config: MirrorConfig,
    ) -> Result<Self> {
        let inner = Inner::open(path, config)?;

        let cancel = CancellationToken::new();
        let (pages_tx, pages_rx) = mpsc::channel(inner.config.change_queue_depth.max(1));
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        let applier = Applier::new(Arc::clone(&inner), pages_rx, cancel.clone());
        let poller = Poller::new(
            Arc::clone(&inner),
            Arc::clone(&source),
            pages_tx,
            trigger_rx,
            cancel.clone(),
        );

        let tasks = vec![tokio::spawn(applier.run()), tokio::spawn(poller.run())];

        Ok(Self {
            inner,
            source,
            trigger_tx,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Remote ids of every file currently mirrored.
    pub fn all_file_ids(&self) -> Result<Vec<String>> {
        let prefix = keys::file_prefix();
        let mut ids = Vec::new();
        for (key, _) in self.inner.store.scan_prefix(&prefix)? {
            ids.push(keys::tail(&key)?.to_owned());
        }
        Ok(ids)
    }

    /// Remote ids of the files at the drive root.
    pub fn root_file_ids(&self) -> Result<Vec<String>> {
        self.inner.root_file_ids()
    }

    /// Inodes of the files at the drive root.
    pub fn root_inodes(&self) -> Result<Vec<Inode>> {
        self.inner.root_inodes()
    }

    /// Remote ids of the children of `parent`.
    pub fn child_file_ids(&self, parent: &str) -> Result<Vec<String>> {
        self.inner.child_file_ids(parent)
    }

    /// The stored metadata snapshot of one file.
    pub fn file_by_id(&self, id: &str) -> Result<RemoteFile> {
        self.inner.file_by_id(id)
    }

    /// The assembled view of the file behind `inode`.
    pub fn file_by_inode(&self, inode: Inode) -> Result<Arc<FileView>> {
        self.inner.file_by_inode(inode)
    }

    /// The inode assigned to `id`, allocating one if needed.
    pub fn inode_for_id(&self, id: &str) -> Result<Inode> {
        self.inner.inode_for_id(id)
    }

    /// The remote id behind `inode`.
    pub fn id_for_inode(&self, inode: Inode) -> Result<String> {
        self.inner.id_for_inode(inode)
    }

    /// Re-fetch one file from the remote, write it through to the store, and
    /// return its rebuilt view. Does not advance the checkpoint.
    pub async fn refresh(&self, id: &str) -> Result<Arc<FileView>> {
        let file = self.source.get_file(id).await?;
        let mut batch = WriteBatch::new();
        let inode = applier::upsert_file(&self.inner, &mut batch, &file)?;
        self.inner.store.write(batch)?;
        self.inner.cache.remove_inode(inode);
        self.inner.file_by_inode(inode)
    }

    /// A download url for `view` that is fresh within the configured
    /// lifetime.
    ///
    /// Returns the cached url while it is fresh; otherwise re-fetches the
    /// file and caches the new url on the view. A failed fetch falls back to
    /// the stale url instead of failing.
    pub async fn fresh_download_url(&self, view: &FileView) -> Option<String> {
        view.file.download_url.as_ref()?;

        let lifetime = self.inner.config.download_url_lifetime();
        if let Some(url) = view.cached_download_url(lifetime) {
            return Some(url);
        }

        match self.source.get_file(&view.file.id).await {
            Ok(fresh) => match fresh.download_url {
                Some(url) => {
                    info!("refreshed download url for {}", view.file.id);
                    view.store_download_url(url.clone());
                    Some(url)
                }
                None => view.file.download_url.clone(),
            },
            Err(e) => {
                warn!("failed to refresh download url for {}: {e}", view.file.id);
                view.file.download_url.clone()
            }
        }
    }

    /// Drop the cached view of `inode`, forcing the next lookup to re-read
    /// the store.
    pub fn flush_cached_inode(&self, inode: Inode) {
        self.inner.cache.remove_inode(inode);
    }

    /// Ask the poller for an immediate poll cycle, ahead of the timer.
    pub fn sync_now(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Wait until the mirror next converges with the remote change feed.
    /// Returns early if the database is closed meanwhile.
    pub async fn wait_until_synced(&self) {
        let mut synced = self.inner.subscribe_synced();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = synced.recv() => {}
        }
    }

    /// The current synchronisation position.
    pub fn checkpoint(&self) -> Checkpoint {
        self.inner.checkpoint()
    }

    /// Stop the background tasks, drain outstanding scans, and close the
    /// store. Every later operation fails with `Closed`.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.store.close();
    }
}

impl Drop for DriveDb {
    fn drop(&mut self) {
        // Stops the background tasks even when close() was never called.
        self.cancel.cancel();
    }
}
