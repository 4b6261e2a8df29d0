//! Change sequence numbers
//!
//! A CSN is the logical timestamp every replica stamps on the updates it
//! originates. CSNs are totally ordered by `(time, seqnum, server_id)` and are
//! the sort key of every log and merge in the changelog.
//!
//! The text form is 28 hexadecimal characters: 16 for the time in
//! milliseconds, 4 for the server id and 8 for the sequence number.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ChangelogError, ChangelogResult};

/// Length of the textual form of a CSN
pub const CSN_STRING_LEN: usize = 28;

/// Largest replica id the text form can carry
pub const MAX_SERVER_ID: i32 = u16::MAX as i32;

/// Reject replica ids that cannot round-trip through the text form.
///
/// Id 0 is reserved for bookkeeping keys.
pub fn check_server_id(server_id: i32) -> ChangelogResult<()> {
    if (1..=MAX_SERVER_ID).contains(&server_id) {
        Ok(())
    } else {
        Err(ChangelogError::InvalidOperation(format!(
            "replica id {} is outside 1..={}",
            server_id, MAX_SERVER_ID
        )))
    }
}

/// Logical timestamp `(time, seqnum, server_id)`
///
/// Field order matters: the derived `Ord` compares time first, then the
/// sequence number, then the server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Csn {
    time: i64,
    seqnum: i32,
    server_id: i32,
}

impl Csn {
    /// Create a CSN from its three components
    pub const fn new(time: i64, seqnum: i32, server_id: i32) -> Self {
        Csn {
            time,
            seqnum,
            server_id,
        }
    }

    /// The oldest CSN a replica could ever produce.
    ///
    /// Used as the "not heard from yet" sentinel by liveness tracking.
    pub const fn oldest_possible(server_id: i32) -> Self {
        Csn::new(0, 0, server_id)
    }

    /// Wall clock part, in milliseconds since the Unix epoch
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Sequence number inside one millisecond
    pub fn seqnum(&self) -> i32 {
        self.seqnum
    }

    /// Id of the replica that generated this CSN
    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    /// Strictly newer than `other`
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }

    /// Newer than or equal to `other`
    pub fn is_newer_than_or_equal(&self, other: &Csn) -> bool {
        self >= other
    }

    /// Strictly older than `other`
    pub fn is_older_than(&self, other: &Csn) -> bool {
        self < other
    }

    /// Older than or equal to `other`
    pub fn is_older_than_or_equal(&self, other: &Csn) -> bool {
        self <= other
    }

    /// Whether this is the `oldest_possible` sentinel of its replica
    pub fn is_oldest_possible(&self) -> bool {
        self.time == 0 && self.seqnum == 0
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.time as u64, self.server_id as u16, self.seqnum as u32
        )
    }
}

impl FromStr for Csn {
    type Err = ChangelogError;

    fn from_str(s: &str) -> ChangelogResult<Self> {
        if s.len() != CSN_STRING_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ChangelogError::parse(format!("invalid CSN '{}'", s)));
        }
        let bad = |_| ChangelogError::parse(format!("invalid CSN '{}'", s));
        let time = u64::from_str_radix(&s[0..16], 16).map_err(bad)?;
        let server_id = u16::from_str_radix(&s[16..20], 16).map_err(bad)?;
        let seqnum = u32::from_str_radix(&s[20..28], 16).map_err(bad)?;
        Ok(Csn::new(time as i64, seqnum as i32, server_id as i32))
    }
}

/// Current wall clock time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Monotone CSN generator for one replica
///
/// Successive CSNs from the same generator are strictly increasing, even
/// when the wall clock stands still or goes backwards.
#[derive(Debug)]
pub struct CsnGenerator {
    server_id: i32,
    state: Mutex<GeneratorState>,
}

#[derive(Debug)]
struct GeneratorState {
    last_time: i64,
    seqnum: i32,
}

impl CsnGenerator {
    /// Create a generator for `server_id`
    pub fn new(server_id: i32) -> Self {
        CsnGenerator {
            server_id,
            state: Mutex::new(GeneratorState {
                last_time: 0,
                seqnum: 0,
            }),
        }
    }

    /// Replica id stamped on generated CSNs
    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    /// Generate the next CSN
    pub fn new_csn(&self) -> Csn {
        self.new_csn_at(now_millis())
    }

    /// Generate the next CSN as if the wall clock read `now`
    pub fn new_csn_at(&self, now: i64) -> Csn {
        let mut state = self.state.lock();
        if now > state.last_time {
            state.last_time = now;
            state.seqnum = 0;
        } else if state.seqnum == i32::MAX {
            state.last_time += 1;
            state.seqnum = 0;
        } else {
            state.seqnum += 1;
        }
        Csn::new(state.last_time, state.seqnum, self.server_id)
    }

    /// Make sure later CSNs are newer than `observed`
    pub fn adjust(&self, observed: &Csn) {
        let mut state = self.state.lock();
        if observed.time > state.last_time {
            state.last_time = observed.time;
            state.seqnum = observed.seqnum;
        } else if observed.time == state.last_time && observed.seqnum > state.seqnum {
            state.seqnum = observed.seqnum;
        }
    }
}
