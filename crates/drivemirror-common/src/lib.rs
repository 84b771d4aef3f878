//! Drivemirror Common - Shared types and utilities
//!
//! This crate provides the data types, error definitions, and configuration
//! shared between the drivemirror components.

pub mod config;
pub mod error;
pub mod types;

pub use config::MirrorConfig;
pub use error::{Error, Result};
pub use types::*;
