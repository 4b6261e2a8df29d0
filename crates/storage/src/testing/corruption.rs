//! Log corruption testing utilities
//!
//! Simulates what a crash in the middle of an append leaves on disk.
//!
//! # Corruption Types
//!
//! - Truncation: removes bytes from the log tail
//! - Garbage: appends bytes that do not form a complete frame
//! - Partial record: a frame header announcing more bytes than follow

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::log_file::LOG_FILE_NAME;
use crate::record::{read_frame_at, FrameRead};

/// Outcome of a tail truncation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationResult {
    /// Size before truncation
    pub original_size: u64,
    /// Size after truncation
    pub new_size: u64,
    /// Bytes actually removed
    pub bytes_removed: u64,
}

/// Outcome of appending garbage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GarbageResult {
    /// Size before the append
    pub original_size: u64,
    /// Size after the append
    pub new_size: u64,
}

/// Frame-level view of a log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameScan {
    /// Complete frames from the start of the file
    pub complete_frames: usize,
    /// Offset right after the last complete frame
    pub valid_end: u64,
    /// File size
    pub file_len: u64,
}

impl FrameScan {
    /// True when the file ends with an incomplete frame
    pub fn has_partial_tail(&self) -> bool {
        self.valid_end < self.file_len
    }
}

/// Corrupts the `current.log` of one log directory
pub struct LogCorruptionTester {
    log_dir: PathBuf,
}

impl LogCorruptionTester {
    /// Tester for the log stored in `log_dir`
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        LogCorruptionTester {
            log_dir: log_dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the data file
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE_NAME)
    }

    /// Remove `bytes` from the end of the log
    ///
    /// Simulates a crash after part of the last frame reached the disk.
    pub fn truncate_tail(&self, bytes: u64) -> io::Result<TruncationResult> {
        let path = self.log_path();
        let original_size = fs::metadata(&path)?.len();
        let bytes_removed = bytes.min(original_size);
        let new_size = original_size - bytes_removed;

        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(new_size)?;
        file.sync_all()?;

        Ok(TruncationResult {
            original_size,
            new_size,
            bytes_removed,
        })
    }

    /// Append raw bytes to the log
    pub fn append_garbage(&self, garbage: &[u8]) -> io::Result<GarbageResult> {
        let path = self.log_path();
        let original_size = fs::metadata(&path)?.len();
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(garbage)?;
        file.sync_all()?;

        Ok(GarbageResult {
            original_size,
            new_size: original_size + garbage.len() as u64,
        })
    }

    /// Append a frame header announcing 16 bytes followed by only 3
    pub fn create_partial_record(&self) -> io::Result<GarbageResult> {
        self.append_garbage(&[0x00, 0x00, 0x00, 0x10, 0xde, 0xad, 0xbe])
    }

    /// Count complete frames without decoding them
    pub fn scan_frames(&self) -> io::Result<FrameScan> {
        let mut file = File::open(self.log_path())?;
        let file_len = file.metadata()?.len();
        let mut complete_frames = 0;
        let mut offset = 0;
        while let FrameRead::Complete { len, .. } = read_frame_at(&mut file, offset)? {
            complete_frames += 1;
            offset += len;
        }
        Ok(FrameScan {
            complete_frames,
            valid_end: offset,
            file_len,
        })
    }
}
