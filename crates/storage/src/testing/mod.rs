//! Testing utilities for crash tolerance of log files
//!
//! - **Corruption**: truncate or extend a `current.log` the way an
//!   interrupted append would leave it
//!
//! # Example
//!
//! ```ignore
//! use changelog_storage::testing::LogCorruptionTester;
//!
//! let tester = LogCorruptionTester::new(replica_log.log().dir());
//! tester.truncate_tail(3)?;
//! // Reopening must read every complete record and nothing else
//! ```

mod corruption;

pub use corruption::{FrameScan, GarbageResult, LogCorruptionTester, TruncationResult};
