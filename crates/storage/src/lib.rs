//! Storage layer of the replication changelog
//!
//! This crate implements the durable logs and the cursors over them:
//! - LogFile: append-only framed records with a reader pool
//! - ReplicaLog: per-(domain, replica) update log with counter records
//! - ReplicaLogCursor: cursor that resumes after new appends or purges
//! - CompositeCursor: k-way merge of replica cursors in CSN order
//! - ChangeNumberIndexLog: change number -> (cookie, domain, CSN)
//! - ChangelogStateStore / DomainLogStore: on-disk layout and lazy creation
//!   of replica logs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cn_index;
pub mod composite;
pub mod cursor;
pub mod domain_store;
pub mod log_file;
pub mod record;
pub mod replica_cursor;
pub mod replica_log;
pub mod state;
pub mod testing;

pub use cn_index::{ChangeNumberIndexCursor, ChangeNumberIndexLog, ChangeNumberIndexRecord};
pub use composite::CompositeCursor;
pub use cursor::{ChangelogCursor, EmptyCursor};
pub use domain_store::{DomainLogStore, DomainLogs};
pub use log_file::{KeyMatchingStrategy, LogFile, LogFileCursor, PositionStrategy, PurgeOutcome};
pub use record::{Record, RecordParser};
pub use replica_cursor::ReplicaLogCursor;
pub use replica_log::{ReplicaLog, ReplicaRecord, ReplicaRecordParser, COUNTER_INTERVAL};
pub use state::{ChangelogStateStore, PersistedState};
