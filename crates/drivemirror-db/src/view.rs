//! Assembled read-model of one mirrored file.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use drivemirror_common::{Inode, RemoteFile};

#[derive(Clone, Debug)]
struct CachedUrl {
    url: String,
    fetched_at: Instant,
}

/// A remote file snapshot joined with its local identity: the assigned inode
/// and the inodes of its current children. Carries a short-lived cached
/// download url refreshed on demand.
#[derive(Debug)]
pub struct FileView {
    /// Remote metadata snapshot
    pub file: RemoteFile,
    /// Locally assigned inode
    pub inode: Inode,
    /// Inodes of the children at assembly time
    pub children: Vec<Inode>,
    cached_url: Mutex<Option<CachedUrl>>,
}

impl FileView {
    pub(crate) fn new(file: RemoteFile, inode: Inode, children: Vec<Inode>) -> Self {
        Self {
            file,
            inode,
            children,
            cached_url: Mutex::new(None),
        }
    }

    /// The cached download url, if one was fetched within `lifetime`.
    pub fn cached_download_url(&self, lifetime: Duration) -> Option<String> {
        let cached = self.cached_url.lock();
        cached
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < lifetime)
            .map(|c| c.url.clone())
    }

    pub(crate) fn store_download_url(&self, url: String) {
        *self.cached_url.lock() = Some(CachedUrl {
            url,
            fetched_at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_url_expires_after_lifetime() {
        let view = FileView::new(
            RemoteFile {
                id: "a".to_string(),
                name: "a".to_string(),
                mime_type: None,
                size: 0,
                parents: Vec::new(),
                trashed: false,
                hidden: false,
                download_url: Some("https://remote/a?v=1".to_string()),
            },
            1001,
            Vec::new(),
        );

        assert!(view.cached_download_url(Duration::from_secs(60)).is_none());

        view.store_download_url("https://remote/a?v=2".to_string());
        assert_eq!(
            view.cached_download_url(Duration::from_secs(60)).as_deref(),
            Some("https://remote/a?v=2")
        );
        // A zero lifetime means every cached url is already stale.
        assert!(view.cached_download_url(Duration::ZERO).is_none());
    }
}
