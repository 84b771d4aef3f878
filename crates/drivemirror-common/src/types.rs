//! Core data types for drivemirror
//!
//! These model the remote drive's change feed and the locally persisted
//! state derived from it.

use serde::{Deserialize, Serialize};

/// Locally-assigned file identifier, stable across restarts.
pub type Inode = u64;

/// A single parent reference carried by a remote file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    /// Remote id of the parent
    pub id: String,
    /// True when the parent is the drive root
    pub is_root: bool,
}

/// Metadata snapshot of one remote file, as supplied by the change source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Opaque remote identifier, non-empty
    pub id: String,
    /// Display name
    pub name: String,
    /// MIME type, when the remote reports one
    pub mime_type: Option<String>,
    /// Content size in bytes
    pub size: u64,
    /// Parent references; empty for orphans
    pub parents: Vec<ParentRef>,
    /// File is in the remote trash
    pub trashed: bool,
    /// File is hidden at the remote
    pub hidden: bool,
    /// Short-lived content url, when the remote handed one out
    pub download_url: Option<String>,
}

/// One entry of the remote change feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Monotonically increasing feed position
    pub change_id: i64,
    /// Remote id of the affected file
    pub file_id: String,
    /// True when the file was removed; `file` is absent in that case
    pub deleted: bool,
    /// Full snapshot for non-deleting changes
    pub file: Option<RemoteFile>,
}

impl Change {
    /// A change is deleting when the file was removed, trashed, or hidden.
    pub fn is_deleting(&self) -> bool {
        self.deleted || self.file.as_ref().is_some_and(|f| f.trashed || f.hidden)
    }
}

/// One page of the paginated change listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePage {
    /// Changes in feed order
    pub changes: Vec<Change>,
    /// Highest change id the remote currently knows of
    pub largest_change_id: i64,
    /// Token for the next page; absent or empty on the last page
    pub next_page_token: Option<String>,
}

/// Durable synchronisation position: the highest change already applied and
/// the highest inode already allocated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_change_id: i64,
    pub last_inode: Inode,
}
