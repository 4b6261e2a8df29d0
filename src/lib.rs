//! changelogdb - replication changelog for a multi-master directory server
//!
//! Every replica of every replicated domain gets its own append-only log of
//! updates. A background indexer merges all of them in CSN order and assigns
//! change numbers to the updates no replica can still precede, and a purge
//! worker enforces the retention period.
//!
//! # Quick Start
//!
//! ```ignore
//! use changelogdb::{BaseDn, ChangelogRegistry, Csn, UpdateMsg};
//!
//! let changelog = ChangelogRegistry::open("/var/lib/changelog")?;
//! let domain = BaseDn::new("dc=example,dc=com")?;
//!
//! changelog.publish_update(&domain, &UpdateMsg::new(Csn::new(1, 0, 1), payload))?;
//! changelog.publish_heartbeat(&domain, &Csn::new(2, 0, 1))?;
//! ```
//!
//! # Architecture
//!
//! - `changelog-core`: CSNs, cookies, domain names, errors
//! - `changelog-storage`: log files, replica logs, cursors, change-number index
//! - `changelog-engine`: registry, indexer, purger, configuration

pub use changelog_core::*;
pub use changelog_engine::*;
pub use changelog_storage::{
    ChangeNumberIndexLog, ChangeNumberIndexRecord, ChangelogCursor, CompositeCursor,
    ReplicaLogCursor,
};
