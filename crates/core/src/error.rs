//! Error types for the changelog
//!
//! This module defines all error types used throughout the changelog.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! # Taxonomy
//!
//! - Storage failures (`Io`, `Storage`) are propagated to the caller of the
//!   triggering operation. The log stays usable for later operations.
//! - `Decode` means a stored record does not parse. It is fatal for the log
//!   it was read from.
//! - `Consistency` means the change-number index and the replica logs have
//!   diverged. Indexing refuses to start until an administrator intervenes.
//! - `DuplicateCsn` means two replica streams of the same merge exposed the
//!   same CSN, which only an upstream CSN generation bug can produce.

use crate::csn::Csn;
use std::io;
use thiserror::Error;

/// Result type alias for changelog operations
pub type ChangelogResult<T> = std::result::Result<T, ChangelogError>;

/// Error types for the changelog
#[derive(Debug, Error)]
pub enum ChangelogError {
    /// I/O error while opening, reading, writing or syncing a log file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage layer error that did not originate from an `io::Error`
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored record could not be decoded
    #[error("Decode error in log '{log}': {detail}")]
    Decode {
        /// Path of the log the record was read from
        log: String,
        /// What failed to decode
        detail: String,
    },

    /// The change-number index disagrees with the replica logs
    #[error("Changelog consistency error: {0}")]
    Consistency(String),

    /// Two records of one merge share the same CSN
    #[error("Duplicate CSN {0} exposed by two cursors of the same merge")]
    DuplicateCsn(Csn),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Malformed textual input (CSN, cookie, DN or config)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ChangelogError {
    /// Storage error from any displayable message
    pub fn storage(msg: impl Into<String>) -> Self {
        ChangelogError::Storage(msg.into())
    }

    /// Parse error from any displayable message
    pub fn parse(msg: impl Into<String>) -> Self {
        ChangelogError::Parse(msg.into())
    }

    /// True for I/O and storage failures
    pub fn is_storage(&self) -> bool {
        matches!(self, ChangelogError::Io(_) | ChangelogError::Storage(_))
    }

    /// True for errors a background worker cannot recover from.
    ///
    /// Every error reaching a worker loop is fatal except parse errors and
    /// invalid operations, which can only come from caller input.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ChangelogError::Parse(_) | ChangelogError::InvalidOperation(_)
        )
    }
}

impl From<bincode::Error> for ChangelogError {
    fn from(e: bincode::Error) -> Self {
        ChangelogError::Storage(format!("serialization failed: {}", e))
    }
}
