//! Log segment file format.
//!
//! ## File Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Header (24 bytes)                                           │
//! │  magic "DWAL" (4) | version u16 | closed u8 | reserved u8    │
//! │  segment id u64 | capacity u32 | reserved u32                │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Record (36 bytes) * n                                       │
//! │  crc32 u32 | Measurement (32 bytes)                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The closed byte is rewritten in place when the segment is sealed. A segment
//! whose byte is still zero at open time was interrupted: it is scanned until
//! the first damaged or partial record, truncated there and then sealed.

use crate::config::SyncMode;
use crate::error::{DenError, Result};
use crate::meas::Measurement;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Segment file magic bytes: "DWAL"
const SEGMENT_MAGIC: [u8; 4] = *b"DWAL";

/// Segment format version.
const SEGMENT_VERSION: u16 = 1;

/// WAL segment file extension.
const SEGMENT_EXTENSION: &str = "wal";

/// WAL segment file prefix.
const SEGMENT_PREFIX: &str = "segment";

/// Offset of the closed byte inside the header.
const CLOSED_OFFSET: u64 = 6;

/// Segment header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 24;

/// Size of one record: checksum plus measurement.
pub const RECORD_SIZE: usize = 4 + Measurement::SIZE;

/// File name of segment `id`.
pub fn segment_name(id: u64) -> String {
    format!("{}_{:016x}.{}", SEGMENT_PREFIX, id, SEGMENT_EXTENSION)
}

/// Parses the id out of a segment file name.
pub fn parse_segment_id(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(&format!(".{}", SEGMENT_EXTENSION))?;
    let id = stem.strip_prefix(&format!("{}_", SEGMENT_PREFIX))?;
    u64::from_str_radix(id, 16).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SegmentHeader {
    closed: bool,
    segment_id: u64,
    capacity: u32,
}

impl SegmentHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&SEGMENT_MAGIC);
        out.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        out.push(u8::from(self.closed));
        out.push(0);
        out.extend_from_slice(&self.segment_id.to_le_bytes());
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SEGMENT_HEADER_SIZE {
            return Err(DenError::Corrupted(format!(
                "segment header is {} bytes",
                bytes.len()
            )));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != SEGMENT_MAGIC {
            return Err(DenError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != SEGMENT_VERSION {
            return Err(DenError::UnsupportedVersion(version));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[8..16]);
        let mut capacity = [0u8; 4];
        capacity.copy_from_slice(&bytes[16..20]);
        Ok(Self {
            closed: bytes[6] != 0,
            segment_id: u64::from_le_bytes(id),
            capacity: u32::from_le_bytes(capacity),
        })
    }
}

fn encode_record(m: &Measurement) -> [u8; RECORD_SIZE] {
    let mut data = Vec::with_capacity(Measurement::SIZE);
    m.write_to(&mut data);
    let mut record = [0u8; RECORD_SIZE];
    record[..4].copy_from_slice(&crc32fast::hash(&data).to_le_bytes());
    record[4..].copy_from_slice(&data);
    record
}

fn decode_record(record: &[u8]) -> Option<Measurement> {
    let (crc, data) = record.split_at(4);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    if crc32fast::hash(data) != expected {
        return None;
    }
    Measurement::from_bytes(data).ok()
}

/// Contents of a segment read back from disk.
#[derive(Debug, Clone)]
pub struct SegmentContents {
    /// Segment id from the header.
    pub segment_id: u64,
    /// True if the segment was sealed cleanly.
    pub closed: bool,
    /// Intact records in arrival order.
    pub records: Vec<Measurement>,
    /// Length of the intact prefix of the file in bytes.
    pub valid_len: u64,
    /// True if bytes after the intact prefix were found.
    pub torn: bool,
}

/// Reads every intact record of the segment at `path`.
///
/// Stops at the first record that is partial or fails its checksum.
///
/// # Errors
///
/// Returns an error if the file cannot be read or its header is invalid.
pub fn read_segment(path: &Path) -> Result<SegmentContents> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let header = SegmentHeader::read_from(&bytes)?;

    let body = &bytes[SEGMENT_HEADER_SIZE..];
    let mut records = Vec::with_capacity(body.len() / RECORD_SIZE);
    for record in body.chunks(RECORD_SIZE) {
        if record.len() < RECORD_SIZE {
            break;
        }
        match decode_record(record) {
            Some(m) => records.push(m),
            None => break,
        }
    }
    let valid_len = (SEGMENT_HEADER_SIZE + records.len() * RECORD_SIZE) as u64;
    Ok(SegmentContents {
        segment_id: header.segment_id,
        closed: header.closed,
        torn: valid_len < bytes.len() as u64,
        records,
        valid_len,
    })
}

fn write_closed_flag(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(CLOSED_OFFSET))?;
    file.write_all(&[1])?;
    file.sync_all()?;
    Ok(())
}

/// Recovers the segment at `path` and leaves it sealed.
///
/// A cleanly closed segment is only read. Otherwise the damaged tail is cut
/// off and the closed flag is set.
///
/// # Errors
///
/// Returns an error if the file cannot be read, truncated or rewritten.
pub fn recover_segment(path: &Path) -> Result<Vec<Measurement>> {
    let contents = read_segment(path)?;
    if contents.closed {
        return Ok(contents.records);
    }

    let mut file = OpenOptions::new().write(true).open(path)?;
    if contents.torn {
        warn!(
            "Truncating segment {} to {} intact records",
            path.display(),
            contents.records.len()
        );
        file.set_len(contents.valid_len)?;
    }
    write_closed_flag(&mut file)?;
    debug!(
        "Recovered segment {} with {} records",
        path.display(),
        contents.records.len()
    );
    Ok(contents.records)
}

/// Segment open for appends.
#[derive(Debug)]
pub struct SegmentWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    name: String,
    segment_id: u64,
    capacity: usize,
    count: usize,
    sync_mode: SyncMode,
}

impl SegmentWriter {
    /// Creates segment `segment_id` holding at most `capacity` records.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(dir: &Path, segment_id: u64, capacity: usize, sync_mode: SyncMode) -> Result<Self> {
        let name = segment_name(segment_id);
        let path = dir.join(&name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);

        let header = SegmentHeader {
            closed: false,
            segment_id,
            capacity: capacity as u32,
        };
        let mut buf = Vec::with_capacity(SEGMENT_HEADER_SIZE);
        header.write_to(&mut buf);
        writer.write_all(&buf)?;
        writer.flush()?;

        debug!("Created log segment {}", path.display());
        Ok(Self {
            writer,
            path,
            name,
            segment_id,
            capacity,
            count: 0,
            sync_mode,
        })
    }

    /// Segment file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Segment id.
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Records written so far.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if no record was written.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns true if the segment holds `capacity` records.
    pub fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    /// Appends one record.
    ///
    /// Returns `Ok(false)`, writing nothing, if the segment is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    pub fn append(&mut self, m: &Measurement) -> Result<bool> {
        if self.is_full() {
            return Ok(false);
        }
        self.writer.write_all(&encode_record(m))?;
        match self.sync_mode {
            SyncMode::Fsync => {
                self.writer.flush()?;
                self.writer.get_ref().sync_all()?;
            }
            SyncMode::Fdatasync => {
                self.writer.flush()?;
                self.writer.get_ref().sync_data()?;
            }
            SyncMode::None => self.writer.flush()?,
            SyncMode::Buffered => {}
        }
        self.count += 1;
        Ok(true)
    }

    /// Flushes, sets the closed flag and syncs.
    ///
    /// # Errors
    ///
    /// Returns an error if any I/O operation fails.
    pub fn close(mut self) -> Result<String> {
        self.writer.flush()?;
        let mut file = self.writer.get_ref().try_clone()?;
        write_closed_flag(&mut file)?;
        debug!(
            "Closed log segment {} with {} records",
            self.path.display(),
            self.count
        );
        Ok(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_segment(dir: &Path, n: u64) -> SegmentWriter {
        let mut writer = SegmentWriter::create(dir, 7, 100, SyncMode::None).unwrap();
        for t in 0..n {
            assert!(writer.append(&Measurement::new(1, t, t as f64)).unwrap());
        }
        writer
    }

    #[test]
    fn test_segment_name_roundtrip() {
        assert_eq!(segment_name(255), "segment_00000000000000ff.wal");
        assert_eq!(parse_segment_id(&segment_name(255)), Some(255));
        assert_eq!(parse_segment_id("segment_zz.wal"), None);
        assert_eq!(parse_segment_id("0000000000000001"), None);
    }

    #[test]
    fn test_close_sets_flag() {
        let dir = TempDir::new().unwrap();
        let name = write_segment(dir.path(), 10).close().unwrap();
        let contents = read_segment(&dir.path().join(name)).unwrap();
        assert!(contents.closed);
        assert!(!contents.torn);
        assert_eq!(contents.segment_id, 7);
        assert_eq!(contents.records.len(), 10);
    }

    #[test]
    fn test_sync_mode_controls_flush() {
        let dir = TempDir::new().unwrap();
        let size = |writer: &SegmentWriter| {
            fs::metadata(dir.path().join(writer.name())).unwrap().len() as usize
        };

        let mut flushed = SegmentWriter::create(dir.path(), 1, 100, SyncMode::None).unwrap();
        let mut buffered = SegmentWriter::create(dir.path(), 2, 100, SyncMode::Buffered).unwrap();
        for t in 0..10u64 {
            assert!(flushed.append(&Measurement::new(1, t, 0.0)).unwrap());
            assert!(buffered.append(&Measurement::new(1, t, 0.0)).unwrap());
        }
        assert_eq!(size(&flushed), SEGMENT_HEADER_SIZE + 10 * RECORD_SIZE);
        assert_eq!(size(&buffered), SEGMENT_HEADER_SIZE);

        let name = buffered.close().unwrap();
        let contents = read_segment(&dir.path().join(name)).unwrap();
        assert!(contents.closed);
        assert_eq!(contents.records.len(), 10);
    }

    #[test]
    fn test_full_segment_refuses() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), 0, 2, SyncMode::None).unwrap();
        assert!(writer.append(&Measurement::new(1, 1, 1.0)).unwrap());
        assert!(writer.append(&Measurement::new(1, 2, 1.0)).unwrap());
        assert!(writer.is_full());
        assert!(!writer.append(&Measurement::new(1, 3, 1.0)).unwrap());
        assert_eq!(writer.len(), 2);
    }

    #[test]
    fn test_recover_truncates_partial_record() {
        let dir = TempDir::new().unwrap();
        let writer = write_segment(dir.path(), 5);
        let path = dir.path().join(writer.name());
        // Simulate a crash: drop without closing, then append half a record.
        drop(writer);
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0xAB; RECORD_SIZE / 2]);
        fs::write(&path, &bytes).unwrap();

        let records = recover_segment(&path).unwrap();
        assert_eq!(records.len(), 5);
        let contents = read_segment(&path).unwrap();
        assert!(contents.closed);
        assert!(!contents.torn);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            (SEGMENT_HEADER_SIZE + 5 * RECORD_SIZE) as u64
        );
    }

    #[test]
    fn test_recover_stops_at_bad_checksum() {
        let dir = TempDir::new().unwrap();
        let writer = write_segment(dir.path(), 5);
        let path = dir.path().join(writer.name());
        drop(writer);

        let mut bytes = fs::read(&path).unwrap();
        // Damage the third record's payload.
        bytes[SEGMENT_HEADER_SIZE + 2 * RECORD_SIZE + 10] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let records = recover_segment(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].time, 1);
    }
}
