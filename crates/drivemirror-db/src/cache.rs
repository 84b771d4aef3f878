//! Bounded in-memory cache for assembled file views.
//!
//! Least-recently-used over a logical access clock. Two kinds of entries
//! share the map: per-inode file views and a single sentinel entry holding
//! the derived root-inode list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use drivemirror_common::Inode;

use crate::view::FileView;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum CacheKey {
    Inode(Inode),
    RootInodes,
}

#[derive(Clone)]
enum CacheValue {
    View(Arc<FileView>),
    Roots(Arc<Vec<Inode>>),
}

struct CacheEntry {
    value: CacheValue,
    last_access: u64,
}

/// LRU cache over file views plus the root-set sentinel.
pub(crate) struct FileCache {
    capacity: usize,
    clock: AtomicU64,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl FileCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        let now = self.tick();
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.last_access = now;
        Some(entry.value.clone())
    }

    fn insert(&self, key: CacheKey, value: CacheValue) {
        if self.capacity == 0 {
            return;
        }
        let now = self.tick();
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            if let Some(victim) = Self::lru_key(&entries) {
                entries.remove(&victim);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                last_access: now,
            },
        );
    }

    fn lru_key(entries: &HashMap<CacheKey, CacheEntry>) -> Option<CacheKey> {
        entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone())
    }

    pub(crate) fn view(&self, inode: Inode) -> Option<Arc<FileView>> {
        match self.get(&CacheKey::Inode(inode)) {
            Some(CacheValue::View(view)) => Some(view),
            _ => None,
        }
    }

    pub(crate) fn put_view(&self, view: Arc<FileView>) {
        self.insert(CacheKey::Inode(view.inode), CacheValue::View(view));
    }

    pub(crate) fn roots(&self) -> Option<Arc<Vec<Inode>>> {
        match self.get(&CacheKey::RootInodes) {
            Some(CacheValue::Roots(roots)) => Some(roots),
            _ => None,
        }
    }

    pub(crate) fn put_roots(&self, roots: Vec<Inode>) {
        self.insert(CacheKey::RootInodes, CacheValue::Roots(Arc::new(roots)));
    }

    pub(crate) fn remove_inode(&self, inode: Inode) {
        self.entries.lock().remove(&CacheKey::Inode(inode));
    }

    pub(crate) fn remove_roots(&self) {
        self.entries.lock().remove(&CacheKey::RootInodes);
    }
}
