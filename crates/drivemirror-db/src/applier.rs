//! Applies change pages to the durable store.
//!
//! Each change item becomes one atomic batch: entity write or tombstone,
//! secondary index updates, and the advanced checkpoint. A batch that fails
//! to commit aborts the page; the poller re-observes the remainder from the
//! persisted checkpoint on its next cycle, and re-application is idempotent.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drivemirror_common::{ChangePage, Error, Inode, RemoteFile, Result};

use crate::db::Inner;
use crate::keys;
use crate::store::{encode, WriteBatch};

/// Tombstone `id`: drop the entity, its root entry, and the child index
/// entries in both directions. The identity mappings stay so the file keeps
/// its inode across delete and undelete.
pub(crate) fn remove_file(inner: &Inner, batch: &mut WriteBatch, id: &str) -> Result<()> {
    batch.delete(keys::file(id));
    batch.delete(keys::root(id));

    // References from this file to its children.
    for (key, _) in inner.store.scan_prefix(&keys::child_prefix(id))? {
        batch.delete(key);
    }

    // References from its parents to this file.
    match inner.file_by_id(id) {
        Ok(prior) => {
            for parent in &prior.parents {
                batch.delete(keys::child(&parent.id, id));
            }
        }
        Err(Error::NotFound) => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Write the snapshot of `file` and its parent-relation index entries,
/// allocating an inode when the file is new.
pub(crate) fn upsert_file(inner: &Inner, batch: &mut WriteBatch, file: &RemoteFile) -> Result<Inode> {
    let inode = inner.inode_for_id(&file.id)?;

    batch.put(keys::file(&file.id), encode(file)?);
    for parent in &file.parents {
        if parent.is_root {
            batch.put(keys::root(&file.id), Vec::new());
        } else {
            batch.put(keys::child(&parent.id, &file.id), Vec::new());
        }
    }
    Ok(inode)
}

/// Apply one page in feed order, one atomic batch per item.
pub(crate) fn apply_page(inner: &Inner, page: &ChangePage) -> Result<()> {
    if page.changes.is_empty() {
        if inner.last_change_id() >= page.largest_change_id {
            inner.notify_synced();
        }
        return Ok(());
    }

    info!(
        "applying {} changes ({}/{})",
        page.changes.len(),
        inner.last_change_id(),
        page.largest_change_id
    );

    for change in &page.changes {
        // Whatever happens to the file, its cached view is out of date.
        if let Some(inode) = inner.lookup_inode(&change.file_id)? {
            inner.cache.remove_inode(inode);
        }

        let mut batch = WriteBatch::new();
        if change.is_deleting() {
            remove_file(inner, &mut batch, &change.file_id)?;
        } else if let Some(file) = &change.file {
            upsert_file(inner, &mut batch, file)?;
        } else {
            warn!(
                "change {} for {} carries no snapshot, skipping",
                change.change_id, change.file_id
            );
        }
        inner.commit_with_checkpoint(batch, change.change_id)?;
    }

    inner.cache.remove_roots();
    if inner.last_change_id() >= page.largest_change_id {
        inner.notify_synced();
    }
    Ok(())
}

/// Background task draining the poller's handoff channel.
pub(crate) struct Applier {
    inner: Arc<Inner>,
    pages: mpsc::Receiver<ChangePage>,
    cancel: CancellationToken,
}

impl Applier {
    pub(crate) fn new(
        inner: Arc<Inner>,
        pages: mpsc::Receiver<ChangePage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            pages,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                page = self.pages.recv() => match page {
                    Some(page) => {
                        if let Err(e) = apply_page(&self.inner, &page) {
                            error!("failed to apply change page: {e}");
                        }
                    }
                    None => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivemirror_common::{Change, MirrorConfig, ParentRef};
    use tempfile::tempdir;

    fn test_config() -> MirrorConfig {
        MirrorConfig {
            poll_interval_ms: 10,
            lru_capacity: 16,
            download_url_lifetime_secs: 0,
            inode_floor: 1000,
            max_results: 100,
            change_queue_depth: 8,
        }
    }

    fn remote_file(id: &str, parents: Vec<ParentRef>) -> RemoteFile {
        RemoteFile {
            id: id.to_string(),
            name: format!("{id}.bin"),
            mime_type: Some("application/octet-stream".to_string()),
            size: 42,
            parents,
            trashed: false,
            hidden: false,
            download_url: Some(format!("https://remote/{id}")),
        }
    }

    fn upsert(change_id: i64, file: RemoteFile) -> Change {
        Change {
            change_id,
            file_id: file.id.clone(),
            deleted: false,
            file: Some(file),
        }
    }

    fn delete(change_id: i64, id: &str) -> Change {
        Change {
            change_id,
            file_id: id.to_string(),
            deleted: true,
            file: None,
        }
    }

    fn root_ref() -> ParentRef {
        ParentRef {
            id: "root".to_string(),
            is_root: true,
        }
    }

    fn child_of(parent: &str) -> ParentRef {
        ParentRef {
            id: parent.to_string(),
            is_root: false,
        }
    }

    fn page(changes: Vec<Change>, largest: i64) -> ChangePage {
        ChangePage {
            changes,
            largest_change_id: largest,
            next_page_token: None,
        }
    }

    fn dump(inner: &Inner) -> Vec<(Vec<u8>, Vec<u8>)> {
        inner.store.scan_prefix(b"").unwrap()
    }

    #[test]
    fn first_page_builds_hierarchy_and_checkpoint() {
        let dir = tempdir().unwrap();
        let inner = Inner::open(dir.path().join("meta.redb"), test_config()).unwrap();

        let first = page(
            vec![
                upsert(1, remote_file("A", vec![root_ref()])),
                upsert(2, remote_file("B", vec![child_of("A")])),
            ],
            2,
        );
        apply_page(&inner, &first).unwrap();

        assert_eq!(inner.root_file_ids().unwrap(), vec!["A".to_string()]);
        assert_eq!(inner.child_file_ids("A").unwrap(), vec!["B".to_string()]);
        assert_eq!(inner.inode_for_id("A").unwrap(), 1001);
        assert_eq!(inner.inode_for_id("B").unwrap(), 1002);
        assert_eq!(inner.last_change_id(), 2);
    }

    #[test]
    fn reapplying_a_page_is_idempotent() {
        let dir = tempdir().unwrap();
        let inner = Inner::open(dir.path().join("meta.redb"), test_config()).unwrap();

        let changes = page(
            vec![
                upsert(1, remote_file("A", vec![root_ref()])),
                upsert(2, remote_file("B", vec![child_of("A")])),
                delete(3, "B"),
            ],
            3,
        );

        apply_page(&inner, &changes).unwrap();
        let once = dump(&inner);
        apply_page(&inner, &changes).unwrap();
        let twice = dump(&inner);

        assert_eq!(once, twice);
    }

    #[test]
    fn tombstone_removes_entity_but_keeps_identity() {
        let dir = tempdir().unwrap();
        let inner = Inner::open(dir.path().join("meta.redb"), test_config()).unwrap();

        apply_page(
            &inner,
            &page(
                vec![
                    upsert(1, remote_file("A", vec![root_ref()])),
                    upsert(2, remote_file("B", vec![child_of("A")])),
                ],
                2,
            ),
        )
        .unwrap();
        apply_page(&inner, &page(vec![delete(3, "B")], 3)).unwrap();

        assert!(matches!(inner.file_by_id("B"), Err(Error::NotFound)));
        assert!(inner.child_file_ids("A").unwrap().is_empty());
        // Both directions of the identity mapping survive the tombstone.
        assert_eq!(inner.id_for_inode(1002).unwrap(), "B");
        assert_eq!(inner.inode_for_id("B").unwrap(), 1002);
        assert_eq!(inner.last_change_id(), 3);
    }

    #[test]
    fn undelete_reattaches_to_the_original_inode() {
        let dir = tempdir().unwrap();
        let inner = Inner::open(dir.path().join("meta.redb"), test_config()).unwrap();

        apply_page(
            &inner,
            &page(vec![upsert(1, remote_file("A", vec![root_ref()]))], 1),
        )
        .unwrap();
        let before = inner.inode_for_id("A").unwrap();

        apply_page(&inner, &page(vec![delete(2, "A")], 2)).unwrap();
        apply_page(
            &inner,
            &page(vec![upsert(3, remote_file("A", vec![root_ref()]))], 3),
        )
        .unwrap();

        assert_eq!(inner.inode_for_id("A").unwrap(), before);
        assert_eq!(inner.root_file_ids().unwrap(), vec!["A".to_string()]);
    }

    #[test]
    fn trashed_and_hidden_count_as_deleting() {
        let dir = tempdir().unwrap();
        let inner = Inner::open(dir.path().join("meta.redb"), test_config()).unwrap();

        apply_page(
            &inner,
            &page(vec![upsert(1, remote_file("A", vec![root_ref()]))], 1),
        )
        .unwrap();

        apply_page(
            &inner,
            &page(vec![upsert(2, remote_file("B", vec![root_ref()]))], 2),
        )
        .unwrap();

        let mut trashed = remote_file("A", vec![root_ref()]);
        trashed.trashed = true;
        let mut hidden = remote_file("B", vec![root_ref()]);
        hidden.hidden = true;
        apply_page(
            &inner,
            &page(
                vec![
                    Change {
                        change_id: 3,
                        file_id: "A".to_string(),
                        deleted: false,
                        file: Some(trashed),
                    },
                    Change {
                        change_id: 4,
                        file_id: "B".to_string(),
                        deleted: false,
                        file: Some(hidden),
                    },
                ],
                4,
            ),
        )
        .unwrap();

        assert!(matches!(inner.file_by_id("A"), Err(Error::NotFound)));
        assert!(matches!(inner.file_by_id("B"), Err(Error::NotFound)));
        assert!(inner.root_file_ids().unwrap().is_empty());
    }

    #[test]
    fn each_parent_ref_lands_in_exactly_one_index() {
        let dir = tempdir().unwrap();
        let inner = Inner::open(dir.path().join("meta.redb"), test_config()).unwrap();

        apply_page(
            &inner,
            &page(
                vec![
                    upsert(1, remote_file("P", vec![root_ref()])),
                    upsert(2, remote_file("F", vec![root_ref(), child_of("P")])),
                ],
                2,
            ),
        )
        .unwrap();

        // The root parent produced an rtf entry, the regular parent a kid
        // entry; neither produced the other.
        assert!(inner.store.has(&keys::root("F")).unwrap());
        assert!(inner.store.has(&keys::child("P", "F")).unwrap());
        assert!(!inner.store.has(&keys::child("root", "F")).unwrap());
        assert_eq!(inner.child_file_ids("P").unwrap(), vec!["F".to_string()]);
    }

    #[test]
    fn resuming_a_partial_page_converges_to_the_full_state() {
        let all = vec![
            upsert(1, remote_file("A", vec![root_ref()])),
            upsert(2, remote_file("B", vec![child_of("A")])),
            upsert(3, remote_file("C", vec![child_of("A")])),
        ];

        // Interrupted run: the first two items commit, then the process dies
        // before the third; on restart the feed replays from the persisted
        // checkpoint.
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        {
            let inner = Inner::open(&path, test_config()).unwrap();
            apply_page(&inner, &page(all[..2].to_vec(), 3)).unwrap();
            assert_eq!(inner.last_change_id(), 2);
        }
        let resumed = Inner::open(&path, test_config()).unwrap();
        apply_page(&resumed, &page(all[2..].to_vec(), 3)).unwrap();

        // Uninterrupted run of the full page from empty.
        let dir2 = tempdir().unwrap();
        let full = Inner::open(dir2.path().join("meta.redb"), test_config()).unwrap();
        apply_page(&full, &page(all.clone(), 3)).unwrap();

        assert_eq!(dump(&resumed), dump(&full));
        assert_eq!(resumed.last_change_id(), 3);
    }

    #[test]
    fn move_leaves_stale_child_entry_for_readers_to_collect() {
        let dir = tempdir().unwrap();
        let inner = Inner::open(dir.path().join("meta.redb"), test_config()).unwrap();

        apply_page(
            &inner,
            &page(
                vec![
                    upsert(1, remote_file("P1", vec![root_ref()])),
                    upsert(2, remote_file("P2", vec![root_ref()])),
                    upsert(3, remote_file("F", vec![child_of("P1")])),
                ],
                3,
            ),
        )
        .unwrap();

        // F moves from P1 to P2; the old index entry lingers until a reader
        // garbage-collects it.
        apply_page(
            &inner,
            &page(vec![upsert(4, remote_file("F", vec![child_of("P2")]))], 4),
        )
        .unwrap();

        assert_eq!(inner.child_file_ids("P2").unwrap(), vec!["F".to_string()]);
        // F still exists, so the stale P1 entry is reported as well until the
        // entity disappears; delete F and the P1 entry gets collected.
        apply_page(&inner, &page(vec![delete(5, "F")], 5)).unwrap();
        assert!(inner.child_file_ids("P1").unwrap().is_empty());
        assert!(!inner.store.has(&keys::child("P1", "F")).unwrap());
    }
}
