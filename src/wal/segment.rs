//! WAL Segment Management
//!
//! Handles individual WAL segment files. A segment is a fixed header followed
//! by length-prefixed, checksummed records.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::entry::{Tick, WalEntry};
use crate::error::{Error, Result};

/// Magic bytes at the start of each segment file
const SEGMENT_MAGIC: &[u8; 8] = b"SYNCPWAL";

/// Segment file version
const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Per-record framing: [length: u32][compressed: u8] ... [checksum: u32]
const RECORD_OVERHEAD: usize = 4 + 1 + 4;

const FLAG_SEALED: u16 = 0x1;

/// Segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// First tick stored in this segment
    pub first_tick: Tick,
    /// Last tick stored in this segment (only authoritative once sealed)
    pub last_tick: Tick,
    /// Number of entries in this segment
    pub entry_count: u32,
    /// Whether this segment is sealed (no more writes)
    pub sealed: bool,
}

impl SegmentHeader {
    /// Create header for a new segment
    pub fn new(first_tick: Tick) -> Self {
        Self {
            first_tick,
            last_tick: 0,
            entry_count: 0,
            sealed: false,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let flags = if self.sealed { FLAG_SEALED } else { 0 };
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..10].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[10..12].copy_from_slice(&flags.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.first_tick.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.last_tick.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.entry_count.to_le_bytes());
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Wal("Segment header too short".into()));
        }

        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::Wal("Invalid segment magic bytes".into()));
        }

        let version = u16::from_le_bytes([bytes[8], bytes[9]]);
        if version != SEGMENT_VERSION {
            return Err(Error::Wal(format!("Unsupported segment version: {}", version)));
        }

        let flags = u16::from_le_bytes([bytes[10], bytes[11]]);
        Ok(Self {
            first_tick: read_u64(&bytes[12..20]),
            last_tick: read_u64(&bytes[20..28]),
            entry_count: read_u32(&bytes[28..32]),
            sealed: flags & FLAG_SEALED != 0,
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Encode an entry as a framed record
pub fn encode_record(entry: &WalEntry, compression: bool) -> Result<Vec<u8>> {
    let serialized = entry.serialize()?;
    let data = if compression {
        lz4_flex::compress_prepend_size(&serialized)
    } else {
        serialized
    };

    let mut record = Vec::with_capacity(data.len() + RECORD_OVERHEAD);
    record.extend_from_slice(&(data.len() as u32).to_le_bytes());
    record.push(compression as u8);
    record.extend_from_slice(&data);
    record.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    Ok(record)
}

/// Iterator over the records in a byte buffer (everything after the header)
pub struct RecordIter<'a> {
    buf: &'a [u8],
    pos: usize,
    segment: u64,
}

impl<'a> RecordIter<'a> {
    pub fn new(buf: &'a [u8], segment: u64) -> Self {
        Self { buf, pos: 0, segment }
    }

    /// Byte offset (relative to the buffer) just past the last decoded record
    pub fn position(&self) -> usize {
        self.pos
    }

    fn corrupted(&self, reason: &str) -> Error {
        Error::WalCorrupted {
            segment: self.segment,
            reason: format!("{} at offset {}", reason, HEADER_SIZE + self.pos),
        }
    }

    fn decode_next(&mut self) -> Result<WalEntry> {
        let rest = &self.buf[self.pos..];
        if rest.len() < RECORD_OVERHEAD {
            return Err(self.corrupted("Truncated record header"));
        }

        let data_len = read_u32(&rest[0..4]) as usize;
        let compressed = rest[4] != 0;
        if rest.len() < RECORD_OVERHEAD + data_len {
            return Err(self.corrupted("Truncated record body"));
        }

        let data = &rest[5..5 + data_len];
        let stored_checksum = read_u32(&rest[5 + data_len..9 + data_len]);
        if crc32fast::hash(data) != stored_checksum {
            return Err(self.corrupted("Checksum mismatch"));
        }

        let entry = if compressed {
            let serialized = lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::Wal(format!("Decompression failed: {}", e)))?;
            WalEntry::deserialize(&serialized)?
        } else {
            WalEntry::deserialize(data)?
        };

        self.pos += RECORD_OVERHEAD + data_len;
        Ok(entry)
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }

        let result = self.decode_next();
        if result.is_err() {
            // Stop iteration on error
            self.pos = self.buf.len();
        }
        Some(result)
    }
}

/// Read the entries of a segment up to a committed byte length
pub fn read_entries(path: &Path, committed_len: u64) -> Result<Vec<WalEntry>> {
    let file = File::open(path)?;
    let mut buf = Vec::with_capacity(committed_len as usize);
    file.take(committed_len).read_to_end(&mut buf)?;

    let header = SegmentHeader::from_bytes(&buf)?;
    RecordIter::new(&buf[HEADER_SIZE..], header.first_tick).collect()
}

/// A single WAL segment file open for appending
pub struct Segment {
    /// Segment ID (the first tick)
    pub id: u64,
    /// File path
    pub path: PathBuf,
    /// File handle
    file: File,
    /// Current write position
    write_pos: u64,
    /// Segment header
    header: SegmentHeader,
    /// Maximum segment size in bytes
    max_size: u64,
    /// Whether compression is enabled
    compression: bool,
    /// Timestamp of the newest record
    last_timestamp: Option<DateTime<Utc>>,
}

impl Segment {
    /// Create a new segment file
    pub fn create(path: PathBuf, first_tick: Tick, max_size_mb: u64, compression: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut segment = Self {
            id: first_tick,
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            header: SegmentHeader::new(first_tick),
            max_size: max_size_mb * 1024 * 1024,
            compression,
            last_timestamp: None,
        };

        segment.write_header()?;
        Ok(segment)
    }

    /// Open an existing segment, validating its records and truncating a torn tail
    pub fn recover(path: PathBuf, max_size_mb: u64, compression: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let mut header = SegmentHeader::from_bytes(&buf)?;

        let mut records = RecordIter::new(&buf[HEADER_SIZE..], header.first_tick);
        let mut entry_count = 0u32;
        let mut last_tick = 0;
        let mut last_timestamp = None;
        for result in records.by_ref() {
            match result {
                Ok(entry) => {
                    last_tick = entry.tick;
                    last_timestamp = Some(entry.timestamp);
                    entry_count += 1;
                }
                Err(e) => {
                    tracing::warn!("Truncating WAL segment {:?} after torn record: {}", path, e);
                    break;
                }
            }
        }

        let valid_len = (HEADER_SIZE + records.position()) as u64;
        if valid_len < buf.len() as u64 {
            file.set_len(valid_len)?;
        }

        header.last_tick = last_tick;
        header.entry_count = entry_count;

        Ok(Self {
            id: header.first_tick,
            path,
            file,
            write_pos: valid_len,
            header,
            max_size: max_size_mb * 1024 * 1024,
            compression,
            last_timestamp,
        })
    }

    /// Write an entry to the segment, returning the new committed length
    pub fn append(&mut self, entry: &WalEntry) -> Result<u64> {
        let record = encode_record(entry, self.compression)?;
        self.write_record(entry, &record)
    }

    /// Write an already encoded record for `entry`
    pub fn write_record(&mut self, entry: &WalEntry, record: &[u8]) -> Result<u64> {
        if self.header.sealed {
            return Err(Error::Wal(format!("Segment {} is sealed", self.id)));
        }
        if self.header.entry_count > 0 && !self.has_space(record.len()) {
            return Err(Error::Wal("Segment full".into()));
        }

        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(record)?;

        self.write_pos += record.len() as u64;
        self.header.entry_count += 1;
        self.header.last_tick = entry.tick;
        self.last_timestamp = Some(entry.timestamp);

        Ok(self.write_pos)
    }

    /// Sync segment to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Seal the segment (no more writes)
    pub fn seal(&mut self) -> Result<()> {
        self.header.sealed = true;
        self.write_header()?;
        self.sync()
    }

    /// Check if segment still has space
    pub fn has_space(&self, additional_bytes: usize) -> bool {
        self.write_pos + additional_bytes as u64 <= self.max_size
    }

    pub fn is_sealed(&self) -> bool {
        self.header.sealed
    }

    pub fn first_tick(&self) -> Tick {
        self.header.first_tick
    }

    pub fn last_tick(&self) -> Tick {
        self.header.last_tick
    }

    pub fn entry_count(&self) -> u32 {
        self.header.entry_count
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    /// Committed length in bytes (header included)
    pub fn len(&self) -> u64 {
        self.write_pos
    }

    pub fn is_empty(&self) -> bool {
        self.header.entry_count == 0
    }

    /// Write header to file
    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        Ok(())
    }
}

/// List segment files in a directory, ordered by first tick
pub fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "log")
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .map_or(false, |s| s.starts_with("wal_"))
        {
            segments.push(path);
        }
    }

    // File names embed the zero-padded first tick
    segments.sort();
    Ok(segments)
}
