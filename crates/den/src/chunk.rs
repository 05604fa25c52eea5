//! Fixed-capacity compressed chunks.
//!
//! A chunk holds a run of measurements of one series. The first measurement
//! lives in the [`ChunkHeader`]; every following one is appended through the
//! codec triple (time, value, flag) plus a second flag codec for `source`,
//! all sharing one bit cursor over the chunk's buffer.
//!
//! ## Header Layout (152 bytes, little-endian)
//!
//! ```text
//! id                  u64
//! first               Measurement (32 bytes)
//! last                Measurement (32 bytes)
//! min_time, max_time  u64, u64
//! count               u32
//! flag_bloom          u64
//! min/max value, sum  f64, f64, f64
//! used_bytes          u32
//! capacity            u32
//! checksum            u32
//! is_readonly         u8
//! position_in_page    u32
//! byte_offset_in_page u64
//! reserved            3 bytes
//! ```

use crate::bloom;
use crate::bytes::ByteReader;
use crate::codec::{
    bytes_for_bits, BitReader, BitWriter, DeltaCompressor, DeltaDecompressor, FlagCompressor,
    FlagDecompressor, XorCompressor, XorDecompressor,
};
use crate::error::{DenError, Result};
use crate::meas::{Flag, Id, Measurement, QueryInterval, Statistic, Time, Value};
use tracing::warn;

/// Serialized header size in bytes.
pub const CHUNK_HEADER_SIZE: usize = 152;

/// Smallest number of bits one append can take (one bit per codec).
const MIN_APPEND_BITS: usize = 4;

/// Chunk metadata, serialized in front of every payload in a page.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeader {
    /// Series of every measurement in the chunk.
    pub id: Id,
    /// First measurement, stored uncompressed.
    pub first: Measurement,
    /// Last appended measurement.
    pub last: Measurement,
    /// Smallest stored time.
    pub min_time: Time,
    /// Largest stored time.
    pub max_time: Time,
    /// Number of stored measurements, `first` included.
    pub count: u32,
    /// Bloom filter over stored flags.
    pub flag_bloom: u64,
    /// Smallest stored value.
    pub min_value: Value,
    /// Largest stored value.
    pub max_value: Value,
    /// Sum of stored values.
    pub sum: Value,
    /// Bytes of the buffer touched by the codecs.
    pub used_bytes: u32,
    /// Buffer capacity in bytes.
    pub capacity: u32,
    /// CRC32 of the used payload; valid once the chunk is read-only.
    pub checksum: u32,
    /// Set once the chunk is closed.
    pub is_readonly: bool,
    /// Ordinal of the chunk inside its page.
    pub position_in_page: u32,
    /// Byte offset of the header inside its page file.
    pub byte_offset_in_page: u64,
}

impl ChunkHeader {
    fn new(first: Measurement, capacity: usize) -> Self {
        Self {
            id: first.id,
            first,
            last: first,
            min_time: first.time,
            max_time: first.time,
            count: 1,
            flag_bloom: bloom::bloom_add(bloom::bloom_empty(), u64::from(first.flag)),
            min_value: first.value,
            max_value: first.value,
            sum: first.value,
            used_bytes: 0,
            capacity: capacity as u32,
            checksum: 0,
            is_readonly: false,
            position_in_page: 0,
            byte_offset_in_page: 0,
        }
    }

    fn account(&mut self, m: &Measurement) {
        self.last = *m;
        self.min_time = self.min_time.min(m.time);
        self.max_time = self.max_time.max(m.time);
        self.count += 1;
        self.flag_bloom = bloom::bloom_add(self.flag_bloom, u64::from(m.flag));
        self.min_value = self.min_value.min(m.value);
        self.max_value = self.max_value.max(m.value);
        self.sum += m.value;
    }

    /// Aggregate over every measurement in the chunk.
    pub fn stat(&self) -> Statistic {
        Statistic {
            min_time: self.min_time,
            max_time: self.max_time,
            count: u64::from(self.count),
            flag_bloom: self.flag_bloom,
            min_value: self.min_value,
            max_value: self.max_value,
            sum: self.sum,
        }
    }

    /// Returns true if the chunk may hold measurements with `flag`.
    pub fn check_flag(&self, flag: Flag) -> bool {
        flag == 0 || bloom::bloom_check(self.flag_bloom, u64::from(flag))
    }

    /// Returns true if `[from, to]` overlaps the chunk's time range.
    pub fn overlaps(&self, from: Time, to: Time) -> bool {
        self.min_time <= to && from <= self.max_time
    }

    /// Appends the serialized header to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.id.to_le_bytes());
        self.first.write_to(out);
        self.last.write_to(out);
        out.extend_from_slice(&self.min_time.to_le_bytes());
        out.extend_from_slice(&self.max_time.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.flag_bloom.to_le_bytes());
        out.extend_from_slice(&self.min_value.to_le_bytes());
        out.extend_from_slice(&self.max_value.to_le_bytes());
        out.extend_from_slice(&self.sum.to_le_bytes());
        out.extend_from_slice(&self.used_bytes.to_le_bytes());
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.push(u8::from(self.is_readonly));
        out.extend_from_slice(&self.position_in_page.to_le_bytes());
        out.extend_from_slice(&self.byte_offset_in_page.to_le_bytes());
        // Reserved (3 bytes)
        out.extend_from_slice(&[0u8; 3]);
        debug_assert_eq!(out.len() - start, CHUNK_HEADER_SIZE);
    }

    /// Decodes a header from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::Corrupted` if `bytes` is shorter than a header or the
    /// fields are inconsistent.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes, "chunk header");
        let header = Self {
            id: r.u64()?,
            first: Measurement::read_from(&mut r)?,
            last: Measurement::read_from(&mut r)?,
            min_time: r.u64()?,
            max_time: r.u64()?,
            count: r.u32()?,
            flag_bloom: r.u64()?,
            min_value: r.f64()?,
            max_value: r.f64()?,
            sum: r.f64()?,
            used_bytes: r.u32()?,
            capacity: r.u32()?,
            checksum: r.u32()?,
            is_readonly: r.u8()? != 0,
            position_in_page: r.u32()?,
            byte_offset_in_page: r.u64()?,
        };
        r.take(3)?;

        if header.used_bytes > header.capacity || header.count == 0 || header.first.id != header.id
        {
            return Err(DenError::Corrupted(format!(
                "chunk header for id {} is inconsistent (count {}, used {}, capacity {})",
                header.id, header.count, header.used_bytes, header.capacity
            )));
        }
        Ok(header)
    }
}

/// Codec state of a writable chunk.
#[derive(Debug, Clone)]
struct ChunkCodecs {
    time: DeltaCompressor,
    value: XorCompressor,
    flag: FlagCompressor,
    source: FlagCompressor,
    full: bool,
}

/// A compressed run of measurements of one series.
#[derive(Debug, Clone)]
pub struct Chunk {
    header: ChunkHeader,
    buffer: Vec<u8>,
    bit_cursor: usize,
    codecs: Option<ChunkCodecs>,
}

impl Chunk {
    /// Creates a writable chunk holding `first`, with a `capacity`-byte payload buffer.
    pub fn create(first: Measurement, capacity: usize) -> Self {
        Self {
            header: ChunkHeader::new(first, capacity),
            buffer: vec![0u8; capacity],
            bit_cursor: 0,
            codecs: Some(ChunkCodecs {
                time: DeltaCompressor::new(first.time),
                value: XorCompressor::new(first.value),
                flag: FlagCompressor::new(first.flag),
                source: FlagCompressor::new(first.source),
                full: false,
            }),
        }
    }

    /// Rebuilds a closed chunk from a stored header and its used payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `DenError::Corrupted` if the payload length disagrees with the
    /// header, or `DenError::ChecksumMismatch` if the payload CRC is wrong.
    pub fn from_parts(mut header: ChunkHeader, payload: Vec<u8>) -> Result<Self> {
        if payload.len() != header.used_bytes as usize {
            return Err(DenError::Corrupted(format!(
                "chunk payload is {} bytes, header says {}",
                payload.len(),
                header.used_bytes
            )));
        }
        let actual = crc32fast::hash(&payload);
        if actual != header.checksum {
            return Err(DenError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        header.is_readonly = true;
        Ok(Self {
            bit_cursor: payload.len() * 8,
            header,
            buffer: payload,
            codecs: None,
        })
    }

    /// Returns the chunk header.
    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// Series id.
    pub fn id(&self) -> Id {
        self.header.id
    }

    /// Returns the used suffix of the buffer.
    pub fn payload(&self) -> &[u8] {
        let used = self.header.used_bytes as usize;
        &self.buffer[self.buffer.len() - used..]
    }

    /// Bytes held in RAM by this chunk.
    pub fn resident_bytes(&self) -> usize {
        self.buffer.len() + std::mem::size_of::<Self>()
    }

    /// Returns true once the chunk has been closed.
    pub fn is_readonly(&self) -> bool {
        self.header.is_readonly
    }

    /// Returns true if no further measurement can be appended.
    pub fn is_full(&self) -> bool {
        match &self.codecs {
            Some(codecs) => codecs.full || self.free_bits() < MIN_APPEND_BITS,
            None => true,
        }
    }

    fn free_bits(&self) -> usize {
        self.buffer.len() * 8 - self.bit_cursor
    }

    /// Appends `m`.
    ///
    /// Returns false, writing nothing, if `m` belongs to another series, the
    /// chunk is closed, or any codec cannot fit its part of `m`.
    pub fn append(&mut self, m: &Measurement) -> bool {
        if m.id != self.header.id {
            return false;
        }
        let free = self.free_bits();
        let Some(codecs) = self.codecs.as_mut() else {
            return false;
        };
        if codecs.full {
            return false;
        }

        let Some(time_bits) = codecs.time.bits_needed(m.time) else {
            codecs.full = true;
            return false;
        };
        let needed = time_bits
            + codecs.value.bits_needed(m.value)
            + codecs.flag.bits_needed(m.flag)
            + codecs.source.bits_needed(m.source);
        if needed > free {
            codecs.full = true;
            return false;
        }

        let mut writer = BitWriter::new(&mut self.buffer, self.bit_cursor);
        let written = codecs.time.append(&mut writer, m.time)
            && codecs.value.append(&mut writer, m.value)
            && codecs.flag.append(&mut writer, m.flag)
            && codecs.source.append(&mut writer, m.source);
        debug_assert!(written, "capacity was checked before writing");
        self.bit_cursor = writer.cursor();
        self.header.used_bytes = bytes_for_bits(self.bit_cursor) as u32;
        self.header.account(m);
        true
    }

    /// Marks the chunk read-only and stores the payload checksum.
    pub fn close(&mut self) {
        if self.header.is_readonly {
            return;
        }
        self.codecs = None;
        self.header.is_readonly = true;
        self.header.checksum = crc32fast::hash(self.payload());
    }

    /// Recomputes the payload checksum and compares it with the header.
    pub fn verify_checksum(&self) -> bool {
        !self.header.is_readonly || crc32fast::hash(self.payload()) == self.header.checksum
    }

    /// Returns a forward-only reader over every stored measurement in append order.
    pub fn reader(&self) -> ChunkReader<'_> {
        ChunkReader::new(&self.header, self.payload())
    }

    /// Returns every stored measurement in append order.
    pub fn to_vec(&self) -> Vec<Measurement> {
        self.reader().collect()
    }

    /// Returns the measurements matching `query`, sorted by time.
    pub fn read_interval(&self, query: &QueryInterval) -> Vec<Measurement> {
        if !self.header.overlaps(query.from, query.to) || !self.header.check_flag(query.flag) {
            return Vec::new();
        }
        let mut out: Vec<Measurement> = self.reader().filter(|m| m.in_query(query)).collect();
        out.sort_by_key(|m| m.time);
        out
    }

    /// Returns the measurement with the greatest time `<= time_point` matching `flag`.
    pub fn value_before(&self, time_point: Time, flag: Flag) -> Option<Measurement> {
        if self.header.min_time > time_point || !self.header.check_flag(flag) {
            return None;
        }
        self.reader()
            .filter(|m| m.time <= time_point && m.in_flag(flag))
            .fold(None, |best: Option<Measurement>, m| match best {
                Some(b) if b.time > m.time => Some(b),
                _ => Some(m),
            })
    }
}

/// Forward-only decoder replaying exactly `count` measurements.
pub struct ChunkReader<'a> {
    id: Id,
    first: Option<Measurement>,
    remaining: u32,
    bits: BitReader<'a>,
    time: DeltaDecompressor,
    value: XorDecompressor,
    flag: FlagDecompressor,
    source: FlagDecompressor,
}

impl<'a> ChunkReader<'a> {
    fn new(header: &ChunkHeader, payload: &'a [u8]) -> Self {
        let first = header.first;
        Self {
            id: header.id,
            first: Some(first),
            remaining: header.count.saturating_sub(1),
            bits: BitReader::new(payload),
            time: DeltaDecompressor::new(first.time),
            value: XorDecompressor::new(first.value),
            flag: FlagDecompressor::new(first.flag),
            source: FlagDecompressor::new(first.source),
        }
    }

    fn decode(&mut self) -> Option<Measurement> {
        let time = self.time.read(&mut self.bits)?;
        let value = self.value.read(&mut self.bits)?;
        let flag = self.flag.read(&mut self.bits)?;
        let source = self.source.read(&mut self.bits)?;
        Some(Measurement::with_flag(self.id, time, value, flag, source))
    }
}

impl Iterator for ChunkReader<'_> {
    type Item = Measurement;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match self.decode() {
            Some(m) => Some(m),
            None => {
                warn!(
                    "Chunk for id {} ended {} measurements early",
                    self.id,
                    self.remaining + 1
                );
                self.remaining = 0;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize + usize::from(self.first.is_some());
        (0, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_chunk(n: u64, capacity: usize) -> Chunk {
        let mut chunk = Chunk::create(Measurement::new(7, 1000, 0.0), capacity);
        for i in 1..n {
            let m = Measurement::with_flag(7, 1000 + i * 10, i as f64 * 0.5, (i % 3) as u32, 1);
            assert!(chunk.append(&m), "append {} failed", i);
        }
        chunk
    }

    #[test]
    fn test_roundtrip_in_append_order() {
        let chunk = filled_chunk(100, 4096);
        let values = chunk.to_vec();
        assert_eq!(values.len(), 100);
        assert_eq!(values[0], Measurement::new(7, 1000, 0.0));
        for (i, m) in values.iter().enumerate().skip(1) {
            let i = i as u64;
            assert_eq!(*m, Measurement::with_flag(7, 1000 + i * 10, i as f64 * 0.5, (i % 3) as u32, 1));
        }
    }

    #[test]
    fn test_out_of_order_read_sorted() {
        let mut chunk = Chunk::create(Measurement::new(1, 100, 1.0), 64);
        assert!(chunk.append(&Measurement::new(1, 110, 2.0)));
        assert!(chunk.append(&Measurement::new(1, 105, 1.5)));

        let times: Vec<Time> = chunk
            .read_interval(&QueryInterval::new(vec![1], 0, 0, 200))
            .iter()
            .map(|m| m.time)
            .collect();
        assert_eq!(times, vec![100, 105, 110]);
        assert_eq!(chunk.header().min_time, 100);
        assert_eq!(chunk.header().max_time, 110);
    }

    #[test]
    fn test_rejects_other_series() {
        let mut chunk = Chunk::create(Measurement::new(1, 100, 1.0), 64);
        assert!(!chunk.append(&Measurement::new(2, 101, 1.0)));
        assert_eq!(chunk.header().count, 1);
    }

    #[test]
    fn test_full_chunk_keeps_consistent_state() {
        let mut chunk = Chunk::create(Measurement::new(1, 0, 0.0), 16);
        let mut appended = 1;
        for i in 1..1000u64 {
            if !chunk.append(&Measurement::new(1, i * 7919, (i as f64).sqrt())) {
                break;
            }
            appended += 1;
        }
        assert!(chunk.is_full());
        assert!(appended < 1000);
        assert_eq!(chunk.to_vec().len(), appended);
        assert!(chunk.header().used_bytes <= 16);
    }

    #[test]
    fn test_close_and_reopen() {
        let mut chunk = filled_chunk(50, 4096);
        chunk.close();
        assert!(chunk.is_readonly());
        assert!(!chunk.append(&Measurement::new(7, 99_999, 1.0)));

        let mut bytes = Vec::new();
        chunk.header().write_to(&mut bytes);
        assert_eq!(bytes.len(), CHUNK_HEADER_SIZE);
        let header = ChunkHeader::read_from(&bytes).unwrap();
        assert_eq!(&header, chunk.header());

        let reopened = Chunk::from_parts(header, chunk.payload().to_vec()).unwrap();
        assert_eq!(reopened.to_vec(), chunk.to_vec());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut chunk = filled_chunk(20, 4096);
        chunk.close();
        let mut payload = chunk.payload().to_vec();
        payload[0] ^= 0xFF;
        let result = Chunk::from_parts(chunk.header().clone(), payload);
        assert!(matches!(result, Err(DenError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let chunk = filled_chunk(3, 4096);
        let mut bytes = Vec::new();
        chunk.header().write_to(&mut bytes);
        assert!(ChunkHeader::read_from(&bytes[..CHUNK_HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn test_value_before() {
        let chunk = filled_chunk(10, 4096);
        let m = chunk.value_before(1055, 0).unwrap();
        assert_eq!(m.time, 1050);
        assert!(chunk.value_before(999, 0).is_none());
    }

    #[test]
    fn test_flag_bloom_and_stat() {
        let chunk = filled_chunk(10, 4096);
        assert!(chunk.header().check_flag(1));
        assert!(chunk.header().check_flag(2));
        let stat = chunk.header().stat();
        assert_eq!(stat.count, 10);
        assert_eq!(stat.min_time, 1000);
        assert_eq!(stat.max_time, 1090);
        assert_eq!(stat.max_value, 4.5);
    }
}
