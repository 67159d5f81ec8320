//! Shared types for listing-sync

pub mod error;

pub use error::{Result, SyncError};
