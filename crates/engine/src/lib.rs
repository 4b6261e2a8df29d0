//! Changelog engine
//!
//! This crate runs the replication changelog on top of the storage layer:
//! - ChangelogRegistry: open/shutdown, publishing, cursors, administration
//! - ChangeNumberIndexer: worker assigning change numbers below the medium
//!   consistency point
//! - Purger: retention worker
//! - ChangelogConfig: `changelog.toml` settings
//!
//! The engine is the only component that knows about:
//! - Background workers and their lifecycle
//! - Cross-log coordination (replica logs + change-number index)

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;

use changelog_core::ChangelogError;

pub mod config;
pub mod indexer;
pub mod purger;
pub mod registry;

pub use config::{ChangelogConfig, DurabilityMode, CONFIG_FILE_NAME};
pub use indexer::{ChangeNumberIndexer, IndexerState};
pub use purger::{PurgeContext, Purger};
pub use registry::{ChangelogRegistry, CookieCursor, DomainCursor, LOCK_FILE_NAME};

/// Called when a background worker stops on an unrecoverable error.
///
/// The changelog can no longer guarantee change numbers advance, so the
/// owner is expected to shut the replication service down.
pub type FatalErrorHandler = Arc<dyn Fn(&ChangelogError) + Send + Sync>;
