//! Drivemirror DB - durable metadata mirror of a remote drive
//!
//! Mirrors the remote file hierarchy into a local redb store, assigns every
//! remote object a stable locally-unique inode, and keeps the mirror fresh by
//! applying the remote's incremental change feed in the background. Queries
//! are served from the store plus a bounded in-memory cache.

mod applier;
mod cache;
mod db;
mod poller;
mod view;

pub mod keys;
pub mod source;
pub mod store;

pub use db::DriveDb;
pub use source::ChangeSource;
pub use view::FileView;

pub use drivemirror_common::{
    Change, ChangePage, Checkpoint, Error, Inode, MirrorConfig, ParentRef, RemoteFile, Result,
};
