//! Error types for drivemirror
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for drivemirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for drivemirror
#[derive(Debug, Error)]
pub enum Error {
    /// Requested key or entity is absent. A local lookup result, never fatal.
    #[error("not found")]
    NotFound,

    /// The durable store failed a read, write, or recovery.
    #[error("store error: {0}")]
    Store(String),

    /// Serialisation or deserialisation failed. Propagated like a store
    /// error, distinguishable in logs.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The remote change feed or file read failed. Ends the current poll
    /// cycle, never fatal to the core.
    #[error("change source error: {0}")]
    ChangeSource(String),

    /// An internal consistency check failed. No automatic repair.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Operation attempted after the database was closed.
    #[error("database is closed")]
    Closed,
}

impl Error {
    /// True when the error is a plain missing-entity result.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}
