//! Core types for the replication changelog
//!
//! This crate defines the foundational types shared by the storage and
//! engine layers:
//! - Csn: logical timestamp ordering every update
//! - CsnGenerator: per-replica monotone CSN source
//! - BaseDn: normalized replication domain name
//! - ServerState / MultiDomainServerState: per-replica progress and cookies
//! - UpdateMsg: an update with its CSN and opaque payload
//! - ChangelogError: error taxonomy shared by every layer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod base_dn;
pub mod csn;
pub mod error;
pub mod server_state;
pub mod update;

pub use base_dn::BaseDn;
pub use csn::{check_server_id, now_millis, Csn, CsnGenerator, CSN_STRING_LEN, MAX_SERVER_ID};
pub use error::{ChangelogError, ChangelogResult};
pub use server_state::{MultiDomainServerState, ServerState};
pub use update::UpdateMsg;
