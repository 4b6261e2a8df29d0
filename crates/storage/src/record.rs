//! Log records and their on-disk framing
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────────────────┬──────────────────────────┐
//! │ Length (4)      │ Payload (Length bytes)   │
//! │ u32, big-endian │ RecordParser encoding    │
//! └─────────────────┴──────────────────────────┘
//! ```
//!
//! Frames carry no checksum. A frame whose header or payload is cut short
//! is the tail of an interrupted append and reads as "no record yet".
//! A complete frame whose payload fails to decode is corruption.

use std::fmt::Debug;
use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use changelog_core::{ChangelogError, ChangelogResult};

/// Size of the frame length prefix
pub const FRAME_HEADER_SIZE: u64 = 4;

/// An immutable `(key, value)` pair stored in a log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<K, V> {
    key: K,
    value: V,
}

impl<K, V> Record<K, V> {
    /// Create a record
    pub fn new(key: K, value: V) -> Self {
        Record { key, value }
    }

    /// Record key
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Record value
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Split into key and value
    pub fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }
}

/// Encodes and decodes the records of one kind of log
///
/// Encoding must be deterministic and decoding must reproduce the key
/// exactly, since cursors position themselves by comparing decoded keys.
pub trait RecordParser: Send + Sync + 'static {
    /// Ordered key of the log
    type Key: Ord + Clone + Debug + Send + Sync + 'static;
    /// Value stored beside the key
    type Value: Clone + Debug + Send + Sync + 'static;

    /// Serialize a record to its frame payload
    fn encode_record(&self, key: &Self::Key, value: &Self::Value) -> ChangelogResult<Vec<u8>>;

    /// Deserialize a frame payload
    fn decode_record(&self, bytes: &[u8]) -> Result<Record<Self::Key, Self::Value>, String>;

    /// Keys reserved for bookkeeping records that consumers never see
    fn is_internal_key(&self, _key: &Self::Key) -> bool {
        false
    }
}

/// Result of reading one frame
#[derive(Debug, PartialEq, Eq)]
pub enum FrameRead {
    /// A full frame; `len` counts header and payload
    Complete {
        /// Frame payload
        payload: Vec<u8>,
        /// Bytes consumed including the header
        len: u64,
    },
    /// Clean end of data at a frame boundary
    End,
    /// A frame was started but not finished
    Truncated,
}

/// Write one frame
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> ChangelogResult<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        ChangelogError::storage(format!("record of {} bytes exceeds frame limit", payload.len()))
    })?;
    writer.write_u32::<BigEndian>(len)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Read the frame starting at `offset`
pub fn read_frame_at<R: Read + Seek>(reader: &mut R, offset: u64) -> io::Result<FrameRead> {
    reader.seek(SeekFrom::Start(offset))?;

    let mut header = [0u8; FRAME_HEADER_SIZE as usize];
    match read_full(reader, &mut header)? {
        0 => return Ok(FrameRead::End),
        n if n < header.len() => return Ok(FrameRead::Truncated),
        _ => {}
    }
    let len = (&header[..]).read_u32::<BigEndian>()? as usize;

    // Allocation is bounded by the bytes actually present
    let mut payload = Vec::new();
    if reader.by_ref().take(len as u64).read_to_end(&mut payload)? < len {
        return Ok(FrameRead::Truncated);
    }
    Ok(FrameRead::Complete {
        payload,
        len: FRAME_HEADER_SIZE + len as u64,
    })
}

/// Read until `buf` is full or EOF, returning the byte count
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
