//! Self-healing replica cursor
//!
//! Writers append to a replica log while readers drain it. When the
//! underlying cursor runs dry, `ReplicaLogCursor` repositions right after
//! the last CSN it delivered and tries once more, so callers can keep
//! calling `advance()` without reopening anything. The same repositioning
//! recovers from a purge or clear that rewrote the file under the cursor.

use changelog_core::{ChangelogResult, Csn, UpdateMsg};

use crate::cursor::ChangelogCursor;
use crate::log_file::{KeyMatchingStrategy, LogFileCursor, PositionStrategy};
use crate::replica_log::{ReplicaRecord, ReplicaRecordParser};

/// Cursor over the updates of one replica
pub struct ReplicaLogCursor {
    cursor: LogFileCursor<ReplicaRecordParser>,
    last_delivered: Option<Csn>,
    current: Option<UpdateMsg>,
}

impl ReplicaLogCursor {
    pub(crate) fn new(cursor: LogFileCursor<ReplicaRecordParser>, after: Option<Csn>) -> Self {
        ReplicaLogCursor {
            cursor,
            last_delivered: after,
            current: None,
        }
    }

    /// CSN of the last update delivered, or the starting point
    pub fn last_delivered(&self) -> Option<Csn> {
        self.last_delivered
    }

    fn pull(&mut self) -> ChangelogResult<bool> {
        while self.cursor.advance()? {
            if let Some(ReplicaRecord::Update(msg)) = self.cursor.record().map(|r| r.value()) {
                self.last_delivered = Some(msg.csn());
                self.current = Some(msg.clone());
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl ChangelogCursor for ReplicaLogCursor {
    type Item = UpdateMsg;

    fn advance(&mut self) -> ChangelogResult<bool> {
        if self.pull()? {
            return Ok(true);
        }

        let position = match self.last_delivered {
            Some(_) => PositionStrategy::AfterMatchingKey,
            None => PositionStrategy::OnMatchingKey,
        };
        let last = self.last_delivered;
        if !self.cursor.position_to(
            last.as_ref(),
            KeyMatchingStrategy::GreaterOrEqual,
            position,
        )? {
            self.current = None;
            return Ok(false);
        }
        if self.pull()? {
            return Ok(true);
        }
        self.current = None;
        Ok(false)
    }

    fn record(&self) -> Option<&UpdateMsg> {
        self.current.as_ref()
    }

    fn close(&mut self) {
        self.current = None;
        self.cursor.close();
    }
}
