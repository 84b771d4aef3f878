//! The change-source capability.
//!
//! The remote service client (transport, authorisation, pagination mechanics)
//! lives outside this crate; the core consumes this narrow interface.

use async_trait::async_trait;

use drivemirror_common::{ChangePage, RemoteFile, Result};

/// Incremental change feed plus point reads of single files.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// One page of the change listing, starting at `start_change_id` (from
    /// the beginning when absent) or continuing at `page_token` when the
    /// previous page handed one out. Deleted and subscribed items are
    /// included.
    async fn list_changes(
        &self,
        start_change_id: Option<i64>,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ChangePage>;

    /// Fresh metadata snapshot of a single file.
    async fn get_file(&self, id: &str) -> Result<RemoteFile>;
}
