//! Change-number index log
//!
//! Every update admitted by the indexer gets one record here. Change
//! numbers start at 1 and grow by one per record. The number is the log
//! key, so purging old records never renumbers the survivors.

use std::path::Path;

use changelog_core::{BaseDn, ChangelogResult, Csn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::cursor::ChangelogCursor;
use crate::log_file::{KeyMatchingStrategy, LogFile, LogFileCursor, PositionStrategy};
use crate::record::{Record, RecordParser};

/// One admitted update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNumberIndexRecord {
    change_number: i64,
    previous_cookie: String,
    base_dn: BaseDn,
    csn: Csn,
}

impl ChangeNumberIndexRecord {
    /// Create a record
    pub fn new(change_number: i64, previous_cookie: String, base_dn: BaseDn, csn: Csn) -> Self {
        ChangeNumberIndexRecord {
            change_number,
            previous_cookie,
            base_dn,
            csn,
        }
    }

    /// Position of the update in the global changelog
    pub fn change_number(&self) -> i64 {
        self.change_number
    }

    /// Cookie of every update indexed before this one
    pub fn previous_cookie(&self) -> &str {
        &self.previous_cookie
    }

    /// Domain of the update
    pub fn base_dn(&self) -> &BaseDn {
        &self.base_dn
    }

    /// CSN of the update
    pub fn csn(&self) -> Csn {
        self.csn
    }
}

/// Record parser for the change-number index
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeNumberIndexParser;

impl RecordParser for ChangeNumberIndexParser {
    type Key = i64;
    type Value = ChangeNumberIndexRecord;

    fn encode_record(&self, _key: &i64, value: &ChangeNumberIndexRecord) -> ChangelogResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<Record<i64, ChangeNumberIndexRecord>, String> {
        let value: ChangeNumberIndexRecord = bincode::deserialize(bytes)
            .map_err(|e| format!("invalid change number record: {}", e))?;
        Ok(Record::new(value.change_number, value))
    }
}

/// Cursor over index records
pub type ChangeNumberIndexCursor = LogFileCursor<ChangeNumberIndexParser>;

/// Durable log of change-number index records
pub struct ChangeNumberIndexLog {
    log: LogFile<ChangeNumberIndexParser>,
    /// Last assigned change number; also serializes appends
    last_change_number: Mutex<i64>,
    sync_on_append: bool,
}

impl ChangeNumberIndexLog {
    /// Open or create the index stored in `dir`
    pub fn open(dir: &Path, sync_on_append: bool) -> ChangelogResult<Self> {
        let log = LogFile::open(dir, ChangeNumberIndexParser, true)?;
        let last = log.newest_record().map(|r| *r.key()).unwrap_or(0);
        Ok(ChangeNumberIndexLog {
            log,
            last_change_number: Mutex::new(last),
            sync_on_append,
        })
    }

    /// Append a record and return the change number assigned to it
    pub fn add_record(
        &self,
        previous_cookie: String,
        base_dn: BaseDn,
        csn: Csn,
    ) -> ChangelogResult<i64> {
        let mut last = self.last_change_number.lock();
        let change_number = *last + 1;
        let record = ChangeNumberIndexRecord::new(change_number, previous_cookie, base_dn, csn);
        self.log.add_record(change_number, record)?;
        *last = change_number;
        drop(last);

        if self.sync_on_append {
            self.log.sync()?;
        }
        trace!(target: "changelog::cn_index", change_number, %csn, "Indexed update");
        Ok(change_number)
    }

    /// Oldest record still stored
    pub fn oldest_record(&self) -> Option<ChangeNumberIndexRecord> {
        self.log.oldest_record().map(|r| r.into_parts().1)
    }

    /// Newest record
    pub fn newest_record(&self) -> Option<ChangeNumberIndexRecord> {
        self.log.newest_record().map(|r| r.into_parts().1)
    }

    /// Last change number assigned, 0 when none was
    pub fn last_change_number(&self) -> i64 {
        *self.last_change_number.lock()
    }

    /// True when no record is stored
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Number of records stored
    pub fn number_of_records(&self) -> i64 {
        match (self.log.oldest_record(), self.log.newest_record()) {
            (Some(oldest), Some(newest)) => newest.key() - oldest.key() + 1,
            _ => 0,
        }
    }

    /// Cursor whose first record has the smallest change number `>= change_number`
    pub fn cursor_from(&self, change_number: i64) -> ChangelogResult<ChangeNumberIndexCursor> {
        self.log.positioned_cursor(
            Some(&change_number),
            KeyMatchingStrategy::GreaterOrEqual,
            PositionStrategy::OnMatchingKey,
        )
    }

    /// Record with exactly `change_number`, if still stored
    pub fn record(&self, change_number: i64) -> ChangelogResult<Option<ChangeNumberIndexRecord>> {
        let mut cursor = self.log.cursor_at(&change_number)?;
        let found = if cursor.advance()? {
            cursor.record().map(|r| r.value().clone())
        } else {
            None
        };
        cursor.close();
        Ok(found)
    }

    /// Remove every record whose CSN is older than `csn`.
    ///
    /// The newest record is always kept so numbering resumes after a
    /// restart. Returns the CSN of the oldest record left, or `None` when
    /// the index is empty.
    pub fn purge_up_to(&self, csn: &Csn) -> ChangelogResult<Option<Csn>> {
        let Some(newest) = self.log.newest_record() else {
            return Ok(None);
        };

        let mut bound = *newest.key();
        let mut cursor = self.log.cursor()?;
        while cursor.advance()? {
            if let Some(record) = cursor.record() {
                if !record.value().csn().is_older_than(csn) {
                    bound = bound.min(*record.key());
                    break;
                }
            }
        }
        cursor.close();

        let outcome = self.log.purge_up_to(&bound)?;
        if outcome.removed > 0 {
            info!(
                target: "changelog::cn_index",
                removed = outcome.removed,
                oldest_change_number = ?outcome.oldest,
                "Purged change number index"
            );
        }
        Ok(self.oldest_record().map(|r| r.csn()))
    }

    /// Delete every record; numbering restarts at 1
    pub fn clear(&self) -> ChangelogResult<()> {
        let mut last = self.last_change_number.lock();
        self.log.clear()?;
        *last = 0;
        Ok(())
    }

    /// Force appended records to durable storage
    pub fn sync(&self) -> ChangelogResult<()> {
        self.log.sync()
    }

    /// Flush, fsync and release the log
    pub fn close(&self) -> ChangelogResult<()> {
        self.log.close()
    }
}
