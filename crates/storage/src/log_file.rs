//! Append-only log file with positioned cursors
//!
//! A `LogFile` owns one `current.log` holding framed records (see
//! [`crate::record`]). It has a single writer and a pool of independent
//! read handles, so appends and reads proceed concurrently.
//!
//! # Locking
//!
//! - Structural operations (open, clear, purge, close) take the state lock
//!   exclusively.
//! - Appends, syncs and cursor reads take it shared. A reader racing an
//!   append can see a partially written frame; such a frame reads as
//!   "no record yet", never as corruption.
//!
//! Every structural rewrite bumps a generation counter. A cursor that
//! observes a new generation stops yielding records and must be
//! repositioned by key, since its byte offset no longer means anything.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use changelog_core::{ChangelogError, ChangelogResult};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cursor::ChangelogCursor;
use crate::record::{read_frame_at, write_frame, FrameRead, Record, RecordParser};

/// Name of the data file inside a log directory
pub const LOG_FILE_NAME: &str = "current.log";

/// Scratch file used while a purge rewrites the log
const PURGE_FILE_NAME: &str = "current.log.purge";

/// Idle read handles kept per log
const MAX_POOLED_READERS: usize = 16;

/// How a cursor matches the requested key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatchingStrategy {
    /// Only a record with exactly the requested key matches
    Equal,
    /// The smallest key greater than or equal to the requested key matches
    GreaterOrEqual,
}

/// Where a cursor ends up relative to the matched record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStrategy {
    /// The first `advance()` yields the matched record
    OnMatchingKey,
    /// The first `advance()` yields the record after the requested key
    AfterMatchingKey,
}

/// Summary of a purge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeOutcome<K> {
    /// Records removed
    pub removed: usize,
    /// Records left in the log
    pub remaining: usize,
    /// Key of the oldest record left, if any
    pub oldest: Option<K>,
}

struct LogState {
    closed: bool,
}

struct Bounds<K, V> {
    oldest: Option<Record<K, V>>,
    newest: Option<Record<K, V>>,
}

impl<K, V> Bounds<K, V> {
    fn empty() -> Self {
        Bounds {
            oldest: None,
            newest: None,
        }
    }
}

struct LogFileInner<P: RecordParser> {
    dir: PathBuf,
    path: PathBuf,
    parser: P,
    writable: bool,
    state: RwLock<LogState>,
    writer: Mutex<Option<BufWriter<File>>>,
    readers: Mutex<Vec<File>>,
    generation: AtomicU64,
    bounds: Mutex<Bounds<P::Key, P::Value>>,
}

/// Result of scanning a log from the start
struct ScanResult<K, V> {
    valid_end: u64,
    file_len: u64,
    bounds: Bounds<K, V>,
}

impl<P: RecordParser> LogFileInner<P> {
    fn decode(&self, payload: &[u8]) -> ChangelogResult<Record<P::Key, P::Value>> {
        self.parser
            .decode_record(payload)
            .map_err(|detail| ChangelogError::Decode {
                log: self.path.display().to_string(),
                detail,
            })
    }

    fn is_internal(&self, key: &P::Key) -> bool {
        self.parser.is_internal_key(key)
    }

    fn acquire_reader(&self) -> io::Result<File> {
        if let Some(file) = self.readers.lock().pop() {
            return Ok(file);
        }
        File::open(&self.path)
    }

    fn release_reader(&self, file: File, generation: u64) {
        if generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        let mut readers = self.readers.lock();
        if readers.len() < MAX_POOLED_READERS {
            readers.push(file);
        }
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.readers.lock().clear();
    }

    /// Decode every complete frame, stopping at the first incomplete one
    fn scan(&self) -> ChangelogResult<ScanResult<P::Key, P::Value>> {
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut bounds = Bounds::empty();
        let mut offset = 0;

        while let FrameRead::Complete { payload, len } = read_frame_at(&mut file, offset)? {
            let record = self.decode(&payload)?;
            offset += len;
            if self.is_internal(record.key()) {
                continue;
            }
            if bounds.oldest.is_none() {
                bounds.oldest = Some(record.clone());
            }
            bounds.newest = Some(record);
        }

        Ok(ScanResult {
            valid_end: offset,
            file_len,
            bounds,
        })
    }

    fn open_writer(&self) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(BufWriter::new(file))
    }
}

/// Handle to an append-only log of `(key, value)` records
///
/// Cloning the handle is cheap; all clones share the same file.
pub struct LogFile<P: RecordParser> {
    inner: Arc<LogFileInner<P>>,
}

impl<P: RecordParser> Clone for LogFile<P> {
    fn clone(&self) -> Self {
        LogFile {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: RecordParser> LogFile<P> {
    /// Open the log stored in `dir`, creating it when `writable`.
    ///
    /// A writable log whose last frame was cut short by a crash is truncated
    /// back to its last complete record, so later appends stay readable.
    pub fn open(dir: &Path, parser: P, writable: bool) -> ChangelogResult<Self> {
        let path = dir.join(LOG_FILE_NAME);
        if writable {
            fs::create_dir_all(dir)?;
        } else if !path.exists() {
            return Err(ChangelogError::storage(format!(
                "log file '{}' does not exist",
                path.display()
            )));
        }

        let inner = LogFileInner {
            dir: dir.to_path_buf(),
            path,
            parser,
            writable,
            state: RwLock::new(LogState { closed: false }),
            writer: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            bounds: Mutex::new(Bounds::empty()),
        };

        if writable {
            *inner.writer.lock() = Some(inner.open_writer()?);
        }

        let scan = inner.scan()?;
        if scan.valid_end < scan.file_len {
            if writable {
                warn!(
                    target: "changelog::log",
                    path = %inner.path.display(),
                    valid_end = scan.valid_end,
                    file_len = scan.file_len,
                    "Truncating incomplete record at log tail"
                );
                let file = OpenOptions::new().write(true).open(&inner.path)?;
                file.set_len(scan.valid_end)?;
                file.sync_all()?;
            } else {
                debug!(
                    target: "changelog::log",
                    path = %inner.path.display(),
                    valid_end = scan.valid_end,
                    "Read-only log ends with an incomplete record"
                );
            }
        }
        *inner.bounds.lock() = scan.bounds;

        Ok(LogFile {
            inner: Arc::new(inner),
        })
    }

    /// Directory holding the log
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether the log accepts appends
    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.state.read().closed
    }

    /// Current structural generation
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Parser used to encode and decode records
    pub fn parser(&self) -> &P {
        &self.inner.parser
    }

    /// Append a record and flush it to the OS.
    ///
    /// Keys are expected to be appended in increasing order; this is not
    /// re-verified. Appending to a closed log is a no-op so that writers
    /// racing shutdown do not fail.
    pub fn add_record(&self, key: P::Key, value: P::Value) -> ChangelogResult<()> {
        let state = self.inner.state.read();
        if state.closed {
            debug!(target: "changelog::log", path = %self.inner.path.display(), "Append to closed log ignored");
            return Ok(());
        }
        if !self.inner.writable {
            return Err(ChangelogError::storage(format!(
                "log '{}' is not writable",
                self.inner.path.display()
            )));
        }

        let payload = self.inner.parser.encode_record(&key, &value)?;
        {
            let mut writer = self.inner.writer.lock();
            let writer = writer.as_mut().ok_or_else(|| {
                ChangelogError::storage(format!(
                    "log '{}' has no open writer",
                    self.inner.path.display()
                ))
            })?;
            write_frame(writer, &payload)?;
            writer.flush()?;
        }

        if !self.inner.is_internal(&key) {
            let record = Record::new(key, value);
            let mut bounds = self.inner.bounds.lock();
            if bounds.oldest.is_none() {
                bounds.oldest = Some(record.clone());
            }
            bounds.newest = Some(record);
        }
        drop(state);
        Ok(())
    }

    /// Force appended records to durable storage
    pub fn sync(&self) -> ChangelogResult<()> {
        let state = self.inner.state.read();
        if state.closed {
            return Ok(());
        }
        let mut writer = self.inner.writer.lock();
        if let Some(writer) = writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Oldest consumer-visible record
    pub fn oldest_record(&self) -> Option<Record<P::Key, P::Value>> {
        self.inner.bounds.lock().oldest.clone()
    }

    /// Newest consumer-visible record
    pub fn newest_record(&self) -> Option<Record<P::Key, P::Value>> {
        self.inner.bounds.lock().newest.clone()
    }

    /// True when the log holds no consumer-visible record
    pub fn is_empty(&self) -> bool {
        self.inner.bounds.lock().newest.is_none()
    }

    /// Cursor positioned before the first record
    pub fn cursor(&self) -> ChangelogResult<LogFileCursor<P>> {
        self.positioned_cursor(None, KeyMatchingStrategy::GreaterOrEqual, PositionStrategy::OnMatchingKey)
    }

    /// Cursor whose first record is exactly `key`, or an empty cursor
    pub fn cursor_at(&self, key: &P::Key) -> ChangelogResult<LogFileCursor<P>> {
        self.positioned_cursor(Some(key), KeyMatchingStrategy::Equal, PositionStrategy::OnMatchingKey)
    }

    /// Cursor whose first record is the smallest key `>= key`
    pub fn nearest_cursor(&self, key: &P::Key) -> ChangelogResult<LogFileCursor<P>> {
        self.positioned_cursor(
            Some(key),
            KeyMatchingStrategy::GreaterOrEqual,
            PositionStrategy::OnMatchingKey,
        )
    }

    /// Cursor positioned by key. `None` means the start of the log.
    pub fn positioned_cursor(
        &self,
        key: Option<&P::Key>,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> ChangelogResult<LogFileCursor<P>> {
        let mut cursor = LogFileCursor::new(self.clone(), false);
        cursor.position_to(key, matching, position)?;
        Ok(cursor)
    }

    /// Cursor that also yields internal bookkeeping records
    pub fn raw_cursor(&self) -> LogFileCursor<P> {
        LogFileCursor::new(self.clone(), true)
    }

    /// Remove every record whose key is strictly lower than `bound`.
    ///
    /// The surviving records are rewritten to a scratch file which then
    /// replaces the log; internal records are dropped by the rewrite. When
    /// nothing is below `bound` the file is left untouched.
    pub fn purge_up_to(&self, bound: &P::Key) -> ChangelogResult<PurgeOutcome<P::Key>> {
        let state = self.inner.state.write();
        if state.closed {
            return Ok(PurgeOutcome {
                removed: 0,
                remaining: 0,
                oldest: None,
            });
        }

        let mut writer = self.inner.writer.lock();
        if let Some(writer) = writer.as_mut() {
            writer.flush()?;
        }

        let tmp_path = self.inner.dir.join(PURGE_FILE_NAME);
        let mut source = File::open(&self.inner.path)?;
        let mut out = BufWriter::new(File::create(&tmp_path)?);
        let mut bounds = Bounds::empty();
        let mut removed = 0;
        let mut remaining = 0;
        let mut offset = 0;

        while let FrameRead::Complete { payload, len } = read_frame_at(&mut source, offset)? {
            offset += len;
            let record = self.inner.decode(&payload)?;
            if self.inner.is_internal(record.key()) {
                continue;
            }
            if record.key() < bound {
                removed += 1;
                continue;
            }
            write_frame(&mut out, &payload)?;
            remaining += 1;
            if bounds.oldest.is_none() {
                bounds.oldest = Some(record.clone());
            }
            bounds.newest = Some(record);
        }

        if removed == 0 {
            drop(out);
            fs::remove_file(&tmp_path)?;
            return Ok(PurgeOutcome {
                removed,
                remaining,
                oldest: self.oldest_record().map(|r| r.into_parts().0),
            });
        }

        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(&tmp_path, &self.inner.path)?;

        if self.inner.writable {
            *writer = Some(self.inner.open_writer()?);
        }
        self.inner.bump_generation();
        let oldest = bounds.oldest.as_ref().map(|r| r.key().clone());
        *self.inner.bounds.lock() = bounds;
        drop(writer);
        drop(state);

        info!(
            target: "changelog::log",
            path = %self.inner.path.display(),
            removed,
            remaining,
            "Purged log"
        );
        Ok(PurgeOutcome {
            removed,
            remaining,
            oldest,
        })
    }

    /// Delete every record.
    ///
    /// Open cursors are aborted: they yield nothing further until
    /// repositioned.
    pub fn clear(&self) -> ChangelogResult<()> {
        let state = self.inner.state.write();
        if state.closed {
            return Err(ChangelogError::InvalidOperation(format!(
                "cannot clear closed log '{}'",
                self.inner.path.display()
            )));
        }

        let mut writer = self.inner.writer.lock();
        *writer = None;
        match fs::remove_file(&self.inner.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if self.inner.writable {
            *writer = Some(self.inner.open_writer()?);
        } else {
            File::create(&self.inner.path)?;
        }
        self.inner.bump_generation();
        *self.inner.bounds.lock() = Bounds::empty();
        drop(writer);
        drop(state);

        info!(target: "changelog::log", path = %self.inner.path.display(), "Cleared log");
        Ok(())
    }

    /// Flush, fsync and release every handle. Idempotent.
    pub fn close(&self) -> ChangelogResult<()> {
        let mut state = self.inner.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let writer = self.inner.writer.lock().take();
        self.inner.bump_generation();
        if let Some(mut writer) = writer {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// Forward cursor over a [`LogFile`]
///
/// Holds one pooled read handle, returned to the log on close or drop.
pub struct LogFileCursor<P: RecordParser> {
    log: LogFile<P>,
    reader: Option<File>,
    generation: u64,
    offset: u64,
    current: Option<Record<P::Key, P::Value>>,
    /// Key the cursor offset sits right after, if known
    anchor: Option<P::Key>,
    include_internal: bool,
    aborted: bool,
    exhausted: bool,
    closed: bool,
}

impl<P: RecordParser> LogFileCursor<P> {
    fn new(log: LogFile<P>, include_internal: bool) -> Self {
        let generation = log.generation();
        LogFileCursor {
            log,
            reader: None,
            generation,
            offset: 0,
            current: None,
            anchor: None,
            include_internal,
            aborted: false,
            exhausted: false,
            closed: false,
        }
    }

    /// True once the log was rewritten, cleared or closed under the cursor
    pub fn is_aborted(&self) -> bool {
        self.aborted || self.generation != self.log.generation()
    }

    /// Log this cursor reads from
    pub fn log(&self) -> &LogFile<P> {
        &self.log
    }

    /// Reposition the cursor.
    ///
    /// Returns false when an `Equal` match misses or the log is closed; the
    /// cursor then yields nothing until repositioned again. Repositioning
    /// right after the key the cursor already sits behind is free.
    pub fn position_to(
        &mut self,
        key: Option<&P::Key>,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> ChangelogResult<bool> {
        if self.closed {
            return Ok(false);
        }
        let inner = Arc::clone(&self.log.inner);
        let state = inner.state.read();
        self.current = None;
        if state.closed {
            self.exhausted = true;
            return Ok(false);
        }

        let generation = inner.generation.load(Ordering::Acquire);
        if !self.aborted
            && generation == self.generation
            && matching == KeyMatchingStrategy::GreaterOrEqual
            && position == PositionStrategy::AfterMatchingKey
            && key.is_some()
            && self.anchor.as_ref() == key
        {
            self.exhausted = false;
            return Ok(true);
        }

        if generation != self.generation {
            self.reader = None;
            self.generation = generation;
        }
        self.aborted = false;
        self.exhausted = false;

        let Some(key) = key else {
            self.offset = 0;
            self.anchor = None;
            return Ok(true);
        };

        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => inner.acquire_reader()?,
        };
        let result = self.seek_key(&inner, &mut reader, key, matching, position);
        self.reader = Some(reader);
        drop(state);
        result
    }

    fn seek_key(
        &mut self,
        inner: &LogFileInner<P>,
        reader: &mut File,
        key: &P::Key,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> ChangelogResult<bool> {
        let after = position == PositionStrategy::AfterMatchingKey;
        let mut offset = 0;

        loop {
            let FrameRead::Complete { payload, len } = read_frame_at(reader, offset)? else {
                // Nothing at or above the key yet
                if matching == KeyMatchingStrategy::Equal {
                    self.exhausted = true;
                    return Ok(false);
                }
                self.offset = offset;
                self.anchor = if after { Some(key.clone()) } else { None };
                return Ok(true);
            };

            let record = inner.decode(&payload)?;
            if inner.is_internal(record.key()) || record.key() < key {
                offset += len;
                continue;
            }

            if record.key() == key {
                self.offset = if after { offset + len } else { offset };
            } else if matching == KeyMatchingStrategy::Equal {
                self.exhausted = true;
                return Ok(false);
            } else {
                self.offset = offset;
            }
            self.anchor = if after { Some(key.clone()) } else { None };
            return Ok(true);
        }
    }

    fn read_next(&mut self, inner: &LogFileInner<P>, reader: &mut File) -> ChangelogResult<bool> {
        loop {
            match read_frame_at(reader, self.offset)? {
                FrameRead::Complete { payload, len } => {
                    let record = inner.decode(&payload)?;
                    self.offset += len;
                    let internal = inner.is_internal(record.key());
                    if internal && !self.include_internal {
                        continue;
                    }
                    if !internal {
                        self.anchor = Some(record.key().clone());
                    }
                    self.current = Some(record);
                    return Ok(true);
                }
                FrameRead::End | FrameRead::Truncated => {
                    self.current = None;
                    return Ok(false);
                }
            }
        }
    }
}

impl<P: RecordParser> ChangelogCursor for LogFileCursor<P> {
    type Item = Record<P::Key, P::Value>;

    fn advance(&mut self) -> ChangelogResult<bool> {
        if self.closed || self.exhausted || self.aborted {
            self.current = None;
            return Ok(false);
        }
        let inner = Arc::clone(&self.log.inner);
        let state = inner.state.read();
        if state.closed || inner.generation.load(Ordering::Acquire) != self.generation {
            self.aborted = true;
            self.current = None;
            return Ok(false);
        }

        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => inner.acquire_reader()?,
        };
        let result = self.read_next(&inner, &mut reader);
        self.reader = Some(reader);
        drop(state);
        result
    }

    fn record(&self) -> Option<&Self::Item> {
        self.current.as_ref()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current = None;
        if let Some(reader) = self.reader.take() {
            self.log.inner.release_reader(reader, self.generation);
        }
    }
}

impl<P: RecordParser> Drop for LogFileCursor<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Keys above this value are bookkeeping records
    const INTERNAL_FLOOR: u64 = 1_000_000;

    struct TestParser;

    impl RecordParser for TestParser {
        type Key = u64;
        type Value = String;

        fn encode_record(&self, key: &u64, value: &String) -> ChangelogResult<Vec<u8>> {
            let mut out = key.to_be_bytes().to_vec();
            out.extend_from_slice(value.as_bytes());
            Ok(out)
        }

        fn decode_record(&self, bytes: &[u8]) -> Result<Record<u64, String>, String> {
            if bytes.len() < 8 {
                return Err(format!("record of {} bytes is too short", bytes.len()));
            }
            let mut key = [0u8; 8];
            key.copy_from_slice(&bytes[..8]);
            let value = String::from_utf8(bytes[8..].to_vec()).map_err(|e| e.to_string())?;
            Ok(Record::new(u64::from_be_bytes(key), value))
        }

        fn is_internal_key(&self, key: &u64) -> bool {
            *key >= INTERNAL_FLOOR
        }
    }

    fn open_log(dir: &TempDir) -> LogFile<TestParser> {
        LogFile::open(dir.path(), TestParser, true).unwrap()
    }

    fn append(log: &LogFile<TestParser>, keys: &[u64]) {
        for k in keys {
            log.add_record(*k, format!("v{}", k)).unwrap();
        }
    }

    fn drain(cursor: &mut LogFileCursor<TestParser>) -> Vec<u64> {
        let mut keys = Vec::new();
        while cursor.advance().unwrap() {
            keys.push(*cursor.record().unwrap().key());
        }
        keys
    }

    #[test]
    fn test_append_and_read_in_order() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        append(&log, &[1, 2, 3]);

        let mut cursor = log.cursor().unwrap();
        assert!(cursor.record().is_none());
        assert_eq!(drain(&mut cursor), vec![1, 2, 3]);
        assert_eq!(log.oldest_record().unwrap().key(), &1);
        assert_eq!(log.newest_record().unwrap().value(), "v3");
    }

    #[test]
    fn test_cursor_sees_appends_after_exhaustion() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        append(&log, &[1]);

        let mut cursor = log.cursor().unwrap();
        assert_eq!(drain(&mut cursor), vec![1]);
        append(&log, &[2]);
        assert!(cursor.advance().unwrap());
        assert_eq!(cursor.record().unwrap().key(), &2);
    }

    #[test]
    fn test_positioning_strategies() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        append(&log, &[10, 20, 30]);

        assert_eq!(drain(&mut log.cursor_at(&20).unwrap()), vec![20, 30]);
        assert_eq!(drain(&mut log.cursor_at(&25).unwrap()), Vec::<u64>::new());
        assert_eq!(drain(&mut log.nearest_cursor(&25).unwrap()), vec![30]);
        assert_eq!(drain(&mut log.nearest_cursor(&5).unwrap()), vec![10, 20, 30]);

        let mut after = log
            .positioned_cursor(
                Some(&20),
                KeyMatchingStrategy::GreaterOrEqual,
                PositionStrategy::AfterMatchingKey,
            )
            .unwrap();
        assert_eq!(drain(&mut after), vec![30]);

        let mut past_end = log
            .positioned_cursor(
                Some(&40),
                KeyMatchingStrategy::GreaterOrEqual,
                PositionStrategy::AfterMatchingKey,
            )
            .unwrap();
        assert!(!past_end.advance().unwrap());
        append(&log, &[50]);
        assert_eq!(drain(&mut past_end), vec![50]);
    }

    #[test]
    fn test_internal_records_are_hidden() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        append(&log, &[1, INTERNAL_FLOOR + 1, 2]);

        assert_eq!(drain(&mut log.cursor().unwrap()), vec![1, 2]);
        assert_eq!(log.newest_record().unwrap().key(), &2);
        assert_eq!(drain(&mut log.raw_cursor()), vec![1, INTERNAL_FLOOR + 1, 2]);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        {
            let log = open_log(&dir);
            append(&log, &[1, 2]);
            log.close().unwrap();
        }
        let log = open_log(&dir);
        assert_eq!(drain(&mut log.cursor().unwrap()), vec![1, 2]);
        assert_eq!(log.newest_record().unwrap().key(), &2);
    }

    #[test]
    fn test_truncated_tail_is_repaired_on_writable_open() {
        let dir = TempDir::new().unwrap();
        {
            let log = open_log(&dir);
            append(&log, &[1, 2]);
            log.close().unwrap();
        }
        let path = dir.path().join(LOG_FILE_NAME);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let log = open_log(&dir);
        assert_eq!(drain(&mut log.cursor().unwrap()), vec![1]);
        append(&log, &[3]);
        assert_eq!(drain(&mut log.cursor().unwrap()), vec![1, 3]);
    }

    #[test]
    fn test_undecodable_record_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let log = open_log(&dir);
            append(&log, &[1]);
            log.close().unwrap();
        }
        let path = dir.path().join(LOG_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write_frame(&mut file, &[1, 2, 3]).unwrap();

        match LogFile::open(dir.path(), TestParser, true) {
            Err(ChangelogError::Decode { detail, .. }) => assert!(detail.contains("too short")),
            other => panic!("expected decode error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_closed_log_ignores_appends_and_yields_empty_cursors() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        append(&log, &[1]);
        log.close().unwrap();
        log.close().unwrap();

        log.add_record(2, "late".to_string()).unwrap();
        assert!(!log.cursor().unwrap().advance().unwrap());
    }

    #[test]
    fn test_read_only_log_rejects_appends() {
        let dir = TempDir::new().unwrap();
        open_log(&dir).close().unwrap();
        let log = LogFile::open(dir.path(), TestParser, false).unwrap();
        assert!(log.add_record(1, "x".to_string()).unwrap_err().is_storage());
    }

    #[test]
    fn test_purge_removes_keys_below_bound() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        append(&log, &[1, 2, INTERNAL_FLOOR, 3, 4]);

        let outcome = log.purge_up_to(&3).unwrap();
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.remaining, 2);
        assert_eq!(outcome.oldest, Some(3));
        assert_eq!(drain(&mut log.raw_cursor()), vec![3, 4]);

        let again = log.purge_up_to(&3).unwrap();
        assert_eq!(again.removed, 0);
        assert_eq!(again.oldest, Some(3));

        append(&log, &[5]);
        assert_eq!(drain(&mut log.cursor().unwrap()), vec![3, 4, 5]);
    }

    #[test]
    fn test_purge_everything_leaves_usable_log() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        append(&log, &[1, 2]);

        let outcome = log.purge_up_to(&10).unwrap();
        assert_eq!(outcome.remaining, 0);
        assert!(outcome.oldest.is_none());
        assert!(log.is_empty());

        append(&log, &[11]);
        assert_eq!(drain(&mut log.cursor().unwrap()), vec![11]);
    }

    #[test]
    fn test_purge_aborts_open_cursors() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        append(&log, &[1, 2, 3]);

        let mut cursor = log.cursor().unwrap();
        assert!(cursor.advance().unwrap());
        log.purge_up_to(&2).unwrap();

        assert!(!cursor.advance().unwrap());
        assert!(cursor.is_aborted());
        cursor
            .position_to(
                Some(&1),
                KeyMatchingStrategy::GreaterOrEqual,
                PositionStrategy::AfterMatchingKey,
            )
            .unwrap();
        assert!(!cursor.is_aborted());
        assert_eq!(drain(&mut cursor), vec![2, 3]);
    }

    #[test]
    fn test_clear_empties_log() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        append(&log, &[1, 2]);
        log.clear().unwrap();

        assert!(log.is_empty());
        assert!(!log.cursor().unwrap().advance().unwrap());
        append(&log, &[7]);
        assert_eq!(drain(&mut log.cursor().unwrap()), vec![7]);
    }

    #[test]
    fn test_concurrent_reader_and_writer() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let writer = log.clone();

        let handle = std::thread::spawn(move || {
            for k in 1..=500u64 {
                writer.add_record(k, format!("v{}", k)).unwrap();
            }
        });

        let mut cursor = log.cursor().unwrap();
        let mut seen = Vec::new();
        while seen.len() < 500 {
            if cursor.advance().unwrap() {
                seen.push(*cursor.record().unwrap().key());
            }
        }
        handle.join().unwrap();
        assert_eq!(seen, (1..=500).collect::<Vec<_>>());
    }
}
