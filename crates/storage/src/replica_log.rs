//! Per-replica update log
//!
//! One `ReplicaLog` stores the update stream of one replica in one domain,
//! keyed by CSN. Every [`COUNTER_INTERVAL`] updates it also appends an
//! internal counter record keyed `(time, 0, 0)` holding the number of
//! updates written before it. Counter records are invisible to cursors.

use std::path::Path;

use changelog_core::{check_server_id, BaseDn, ChangelogError, ChangelogResult, Csn, UpdateMsg};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cursor::ChangelogCursor;
use crate::log_file::{KeyMatchingStrategy, LogFile, PositionStrategy};
use crate::record::{Record, RecordParser};
use crate::replica_cursor::ReplicaLogCursor;

/// Updates between two counter records
pub const COUNTER_INTERVAL: u64 = 1000;

/// Value stored in a replica log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRecord {
    /// A replicated update
    Update(UpdateMsg),
    /// Bookkeeping: number of updates stored before this record
    Counter {
        /// Key of the counter record
        key: Csn,
        /// Updates preceding the record
        count: u64,
    },
}

impl ReplicaRecord {
    /// Key under which the record is stored
    pub fn key(&self) -> Csn {
        match self {
            ReplicaRecord::Update(msg) => msg.csn(),
            ReplicaRecord::Counter { key, .. } => *key,
        }
    }
}

/// Key of the counter record written after an update at `csn`
pub fn counter_key(csn: &Csn) -> Csn {
    Csn::new(csn.time(), 0, 0)
}

/// Whether `csn` is a counter record key
pub fn is_counter_key(csn: &Csn) -> bool {
    csn.server_id() == 0 && csn.seqnum() == 0
}

/// Record parser for replica logs
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplicaRecordParser;

impl RecordParser for ReplicaRecordParser {
    type Key = Csn;
    type Value = ReplicaRecord;

    fn encode_record(&self, _key: &Csn, value: &ReplicaRecord) -> ChangelogResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<Record<Csn, ReplicaRecord>, String> {
        let value: ReplicaRecord =
            bincode::deserialize(bytes).map_err(|e| format!("invalid replica record: {}", e))?;
        Ok(Record::new(value.key(), value))
    }

    fn is_internal_key(&self, key: &Csn) -> bool {
        is_counter_key(key)
    }
}

#[derive(Debug, Default)]
struct CounterState {
    /// Updates currently stored
    count: u64,
    /// Updates appended since the last counter record
    since_counter: u64,
    last_counter_key: Option<Csn>,
}

/// Durable update log of one replica of one domain
pub struct ReplicaLog {
    base_dn: BaseDn,
    server_id: i32,
    log: LogFile<ReplicaRecordParser>,
    counter: Mutex<CounterState>,
    sync_on_append: bool,
}

impl ReplicaLog {
    /// Open or create the log of `server_id` in `dir`.
    ///
    /// The record count is rebuilt from the last counter record plus the
    /// updates stored after it.
    pub fn open(
        dir: &Path,
        base_dn: BaseDn,
        server_id: i32,
        sync_on_append: bool,
    ) -> ChangelogResult<Self> {
        let log = LogFile::open(dir, ReplicaRecordParser, true)?;

        let mut counter = CounterState::default();
        let mut raw = log.raw_cursor();
        while raw.advance()? {
            match raw.record().map(|r| r.value()) {
                Some(ReplicaRecord::Counter { key, count }) => {
                    counter.count = *count;
                    counter.since_counter = 0;
                    counter.last_counter_key = Some(*key);
                }
                Some(ReplicaRecord::Update(_)) => {
                    counter.count += 1;
                    counter.since_counter += 1;
                }
                None => break,
            }
        }
        raw.close();

        debug!(
            target: "changelog::replica",
            base_dn = %base_dn,
            server_id,
            records = counter.count,
            "Opened replica log"
        );
        Ok(ReplicaLog {
            base_dn,
            server_id,
            log,
            counter: Mutex::new(counter),
            sync_on_append,
        })
    }

    /// Domain of the replica
    pub fn base_dn(&self) -> &BaseDn {
        &self.base_dn
    }

    /// Replica id
    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    /// Underlying log file
    pub fn log(&self) -> &LogFile<ReplicaRecordParser> {
        &self.log
    }

    /// Append an update of this replica
    pub fn add(&self, update: &UpdateMsg) -> ChangelogResult<()> {
        let csn = update.csn();
        if csn.server_id() != self.server_id {
            return Err(ChangelogError::InvalidOperation(format!(
                "update {} does not belong to replica {} of {}",
                csn, self.server_id, self.base_dn
            )));
        }
        check_server_id(csn.server_id())?;
        if is_counter_key(&csn) {
            return Err(ChangelogError::InvalidOperation(format!(
                "CSN {} collides with the counter record key space",
                csn
            )));
        }

        let mut counter = self.counter.lock();
        self.log.add_record(csn, ReplicaRecord::Update(update.clone()))?;
        counter.count += 1;
        counter.since_counter += 1;

        if counter.since_counter >= COUNTER_INTERVAL {
            let key = counter_key(&csn);
            if counter.last_counter_key != Some(key) {
                let count = counter.count;
                self.log
                    .add_record(key, ReplicaRecord::Counter { key, count })?;
                counter.since_counter = 0;
                counter.last_counter_key = Some(key);
            }
        }
        drop(counter);

        if self.sync_on_append {
            self.log.sync()?;
        }
        Ok(())
    }

    /// Cursor over the updates strictly after `after`, or all updates
    pub fn cursor_after(&self, after: Option<Csn>) -> ChangelogResult<ReplicaLogCursor> {
        let position = match after {
            Some(_) => PositionStrategy::AfterMatchingKey,
            None => PositionStrategy::OnMatchingKey,
        };
        let cursor = self.log.positioned_cursor(
            after.as_ref(),
            KeyMatchingStrategy::GreaterOrEqual,
            position,
        )?;
        Ok(ReplicaLogCursor::new(cursor, after))
    }

    /// Cursor whose first update is the one stored at `csn`, if present
    pub fn cursor_at(&self, csn: &Csn) -> ChangelogResult<ReplicaLogCursor> {
        let cursor = self.log.cursor_at(csn)?;
        Ok(ReplicaLogCursor::new(cursor, None))
    }

    /// CSN of the oldest stored update
    pub fn oldest_csn(&self) -> Option<Csn> {
        self.log.oldest_record().map(|r| *r.key())
    }

    /// CSN of the newest stored update
    pub fn newest_csn(&self) -> Option<Csn> {
        self.log.newest_record().map(|r| *r.key())
    }

    /// Number of updates stored
    pub fn number_of_records(&self) -> u64 {
        self.counter.lock().count
    }

    /// True when no update is stored
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Remove every update older than `bound`; returns the oldest survivor
    pub fn purge_up_to(&self, bound: &Csn) -> ChangelogResult<Option<Csn>> {
        let mut counter = self.counter.lock();
        let outcome = self.log.purge_up_to(bound)?;
        if outcome.removed > 0 {
            counter.count = outcome.remaining as u64;
            counter.since_counter = outcome.remaining as u64 % COUNTER_INTERVAL;
            counter.last_counter_key = None;
            info!(
                target: "changelog::replica",
                base_dn = %self.base_dn,
                server_id = self.server_id,
                removed = outcome.removed,
                remaining = outcome.remaining,
                "Purged replica log"
            );
        }
        Ok(outcome.oldest)
    }

    /// Delete every update
    pub fn clear(&self) -> ChangelogResult<()> {
        let mut counter = self.counter.lock();
        self.log.clear()?;
        *counter = CounterState::default();
        Ok(())
    }

    /// Force appended updates to durable storage
    pub fn sync(&self) -> ChangelogResult<()> {
        self.log.sync()
    }

    /// Flush, fsync and release the log
    pub fn close(&self) -> ChangelogResult<()> {
        self.log.close()
    }
}
