//! Page file format.
//!
//! A page is an immutable pair of files:
//!
//! ```text
//! <name>.page
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Page Header (8 bytes): magic "DPAG", version u16, reserved │
//! ├─────────────────────────────────────────────────────────────┤
//! │  (ChunkHeader 152 bytes, payload used_bytes)*               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (56 bytes): counts, time range, blooms, CRC32,      │
//! │  reverse magic "GAPD"                                       │
//! └─────────────────────────────────────────────────────────────┘
//!
//! <name>.pagei
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Index Header (64 bytes): magic "DIDX", aggregates, CRC32    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  IndexRecord (56 bytes) per chunk                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both files are written under a `.tmp` suffix and renamed once sealed, so a
//! page either exists completely or not at all. Candidate chunks are selected
//! from the index alone; payloads are read only for chunks that pass the
//! id-bloom, flag-bloom and time-overlap filters.

use crate::bloom;
use crate::bytes::ByteReader;
use crate::chunk::{Chunk, ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::{DenError, Result};
use crate::meas::{Flag, Id, Measurement, MinMax, QueryInterval, QueryTimePoint, Statistic, Time};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Page file magic bytes: "DPAG"
pub const PAGE_MAGIC: [u8; 4] = *b"DPAG";

/// Reverse magic bytes for the page footer: "GAPD"
pub const PAGE_MAGIC_REVERSE: [u8; 4] = *b"GAPD";

/// Index file magic bytes: "DIDX"
pub const INDEX_MAGIC: [u8; 4] = *b"DIDX";

/// Current page format version.
pub const PAGE_VERSION: u16 = 1;

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 8;

/// Page footer size in bytes.
pub const PAGE_FOOTER_SIZE: usize = 56;

/// Index header size in bytes.
pub const INDEX_HEADER_SIZE: usize = 64;

/// Index record size in bytes.
pub const INDEX_RECORD_SIZE: usize = 56;

/// Page data file extension.
pub const PAGE_EXTENSION: &str = "page";

/// Page index file extension.
pub const INDEX_EXTENSION: &str = "pagei";

/// Page-level aggregate stored at the end of the page file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFooter {
    /// Number of measurements in the page.
    pub count: u64,
    /// Number of chunks in the page.
    pub chunk_count: u32,
    /// Smallest time in the page.
    pub min_time: Time,
    /// Largest time in the page.
    pub max_time: Time,
    /// Bloom filter over every series id.
    pub id_bloom: u64,
    /// Bloom filter over every flag.
    pub flag_bloom: u64,
    /// CRC32 of every byte before the footer.
    pub checksum: u32,
}

impl Default for PageFooter {
    fn default() -> Self {
        Self {
            count: 0,
            chunk_count: 0,
            min_time: Time::MAX,
            max_time: Time::MIN,
            id_bloom: bloom::bloom_empty(),
            flag_bloom: bloom::bloom_empty(),
            checksum: 0,
        }
    }
}

impl PageFooter {
    fn account(&mut self, header: &ChunkHeader) {
        self.count += u64::from(header.count);
        self.chunk_count += 1;
        self.min_time = self.min_time.min(header.min_time);
        self.max_time = self.max_time.max(header.max_time);
        self.id_bloom = bloom::bloom_add(self.id_bloom, header.id);
        self.flag_bloom = bloom::bloom_combine(self.flag_bloom, header.flag_bloom);
    }

    /// Writes the footer using little-endian byte order.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        // Measurement count (8 bytes)
        out.extend_from_slice(&self.count.to_le_bytes());
        // Chunk count (4 bytes)
        out.extend_from_slice(&self.chunk_count.to_le_bytes());
        // Time range (16 bytes)
        out.extend_from_slice(&self.min_time.to_le_bytes());
        out.extend_from_slice(&self.max_time.to_le_bytes());
        // Blooms (16 bytes)
        out.extend_from_slice(&self.id_bloom.to_le_bytes());
        out.extend_from_slice(&self.flag_bloom.to_le_bytes());
        // Checksum (4 bytes)
        out.extend_from_slice(&self.checksum.to_le_bytes());
        // Magic reverse (4 bytes)
        out.extend_from_slice(&PAGE_MAGIC_REVERSE);
        // Reserved (4 bytes)
        out.extend_from_slice(&[0u8; 4]);
    }

    /// Reads a footer.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidMagic` if the reverse magic bytes don't match.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes, "page footer");
        let footer = Self {
            count: r.u64()?,
            chunk_count: r.u32()?,
            min_time: r.u64()?,
            max_time: r.u64()?,
            id_bloom: r.u64()?,
            flag_bloom: r.u64()?,
            checksum: r.u32()?,
        };
        let magic: [u8; 4] = r.array()?;
        if magic != PAGE_MAGIC_REVERSE {
            return Err(DenError::InvalidMagic(magic));
        }
        Ok(footer)
    }
}

/// Header of the index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    /// Number of index records.
    pub count: u32,
    /// Number of measurements behind the records.
    pub measurement_count: u64,
    /// Smallest time in the page.
    pub min_time: Time,
    /// Largest time in the page.
    pub max_time: Time,
    /// Bloom filter over every series id.
    pub id_bloom: u64,
    /// Bloom filter over every flag.
    pub flag_bloom: u64,
    /// True if records are ordered by `(id, min_time)`.
    pub is_sorted: bool,
    /// CRC32 of the serialized records.
    pub checksum: u32,
}

impl IndexHeader {
    fn from_footer(footer: &PageFooter, is_sorted: bool, checksum: u32) -> Self {
        Self {
            count: footer.chunk_count,
            measurement_count: footer.count,
            min_time: footer.min_time,
            max_time: footer.max_time,
            id_bloom: footer.id_bloom,
            flag_bloom: footer.flag_bloom,
            is_sorted,
            checksum,
        }
    }

    /// Writes the header using little-endian byte order.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&INDEX_MAGIC);
        out.extend_from_slice(&PAGE_VERSION.to_le_bytes());
        out.push(u8::from(self.is_sorted));
        out.push(0);
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.measurement_count.to_le_bytes());
        out.extend_from_slice(&self.min_time.to_le_bytes());
        out.extend_from_slice(&self.max_time.to_le_bytes());
        out.extend_from_slice(&self.id_bloom.to_le_bytes());
        out.extend_from_slice(&self.flag_bloom.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        // Reserved (8 bytes)
        out.extend_from_slice(&[0u8; 8]);
    }

    /// Reads an index header.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidMagic` or `DenError::UnsupportedVersion` for
    /// foreign files.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes, "index header");
        let magic: [u8; 4] = r.array()?;
        if magic != INDEX_MAGIC {
            return Err(DenError::InvalidMagic(magic));
        }
        let version = r.u16()?;
        if version > PAGE_VERSION {
            return Err(DenError::UnsupportedVersion(version));
        }
        let is_sorted = r.u8()? != 0;
        r.u8()?;
        Ok(Self {
            count: r.u32()?,
            measurement_count: r.u64()?,
            min_time: r.u64()?,
            max_time: r.u64()?,
            id_bloom: r.u64()?,
            flag_bloom: r.u64()?,
            is_sorted,
            checksum: r.u32()?,
        })
    }
}

/// Location and summary of one chunk inside a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    /// Byte offset of the chunk header in the page file.
    pub offset: u64,
    /// Series id of the chunk.
    pub id: Id,
    /// Smallest time in the chunk.
    pub min_time: Time,
    /// Largest time in the chunk.
    pub max_time: Time,
    /// Bloom filter over the chunk's id.
    pub id_bloom: u64,
    /// Bloom filter over the chunk's flags.
    pub flag_bloom: u64,
    /// Number of measurements in the chunk.
    pub count: u32,
    /// Payload CRC32, copied from the chunk header.
    pub checksum: u32,
}

impl IndexRecord {
    fn from_header(header: &ChunkHeader) -> Self {
        Self {
            offset: header.byte_offset_in_page,
            id: header.id,
            min_time: header.min_time,
            max_time: header.max_time,
            id_bloom: bloom::bloom_add(bloom::bloom_empty(), header.id),
            flag_bloom: header.flag_bloom,
            count: header.count,
            checksum: header.checksum,
        }
    }

    /// Returns true if the chunk may hold data for the filters.
    ///
    /// Never returns false for a chunk that holds matching data.
    pub fn matches(&self, ids: &[Id], flag: Flag, from: Time, to: Time) -> bool {
        if self.min_time > to || self.max_time < from {
            return false;
        }
        if flag != 0 && !bloom::bloom_check(self.flag_bloom, u64::from(flag)) {
            return false;
        }
        ids.is_empty()
            || ids
                .iter()
                .any(|&id| bloom::bloom_check(self.id_bloom, id) && id == self.id)
    }

    /// Writes the record using little-endian byte order.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.min_time.to_le_bytes());
        out.extend_from_slice(&self.max_time.to_le_bytes());
        out.extend_from_slice(&self.id_bloom.to_le_bytes());
        out.extend_from_slice(&self.flag_bloom.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
    }

    fn read_from(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            offset: r.u64()?,
            id: r.u64()?,
            min_time: r.u64()?,
            max_time: r.u64()?,
            id_bloom: r.u64()?,
            flag_bloom: r.u64()?,
            count: r.u32()?,
            checksum: r.u32()?,
        })
    }
}

fn encode_records(records: &[IndexRecord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(records.len() * INDEX_RECORD_SIZE);
    for record in records {
        record.write_to(&mut buf);
    }
    buf
}

fn write_index_file(path: &Path, footer: &PageFooter, records: &[IndexRecord]) -> Result<IndexHeader> {
    let body = encode_records(records);
    let is_sorted = records
        .windows(2)
        .all(|w| (w[0].id, w[0].min_time) <= (w[1].id, w[1].min_time));
    let header = IndexHeader::from_footer(footer, is_sorted, crc32fast::hash(&body));

    let mut buf = Vec::with_capacity(INDEX_HEADER_SIZE + body.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(&body);

    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(header)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Page file writer.
///
/// Writes closed chunks sequentially, then seals the page by writing the
/// footer and the companion index, syncing both and renaming them into place.
pub struct PageWriter {
    writer: BufWriter<File>,
    dir: PathBuf,
    name: String,
    tmp_path: PathBuf,
    hasher: crc32fast::Hasher,
    position: u64,
    records: Vec<IndexRecord>,
    footer: PageFooter,
}

impl PageWriter {
    /// Starts writing page `name` in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be created.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        let tmp_path = with_suffix(&Page::page_path(dir, name), ".tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            dir: dir.to_path_buf(),
            name: name.to_string(),
            tmp_path,
            hasher: crc32fast::Hasher::new(),
            position: 0,
            records: Vec::new(),
            footer: PageFooter::default(),
        };

        let mut header = Vec::with_capacity(PAGE_HEADER_SIZE);
        header.extend_from_slice(&PAGE_MAGIC);
        header.extend_from_slice(&PAGE_VERSION.to_le_bytes());
        header.extend_from_slice(&[0u8; 2]);
        writer.write_bytes(&header)?;
        Ok(writer)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Appends a chunk. Open chunks are written as a closed copy.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        let mut header = chunk.header().clone();
        if !header.is_readonly {
            header.is_readonly = true;
            header.checksum = crc32fast::hash(chunk.payload());
        }
        header.position_in_page = self.records.len() as u32;
        header.byte_offset_in_page = self.position;

        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + chunk.payload().len());
        header.write_to(&mut buf);
        buf.extend_from_slice(chunk.payload());
        self.write_bytes(&buf)?;

        self.footer.account(&header);
        self.records.push(IndexRecord::from_header(&header));
        Ok(())
    }

    /// Number of chunks written so far.
    pub fn chunk_count(&self) -> usize {
        self.records.len()
    }

    /// Seals the page and returns a handle to it.
    ///
    /// # Errors
    ///
    /// Returns an error if any I/O operation fails; the temporary files are
    /// removed in that case.
    pub fn finish(mut self) -> Result<Page> {
        let result = self.seal();
        if result.is_err() {
            let _ = fs::remove_file(&self.tmp_path);
            let _ = fs::remove_file(with_suffix(&Page::index_path(&self.dir, &self.name), ".tmp"));
        }
        result
    }

    fn seal(&mut self) -> Result<Page> {
        self.footer.checksum = self.hasher.clone().finalize();
        let mut buf = Vec::with_capacity(PAGE_FOOTER_SIZE);
        self.footer.write_to(&mut buf);
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let path = Page::page_path(&self.dir, &self.name);
        let index_path = Page::index_path(&self.dir, &self.name);
        let tmp_index = with_suffix(&index_path, ".tmp");
        let index = write_index_file(&tmp_index, &self.footer, &self.records)?;

        fs::rename(&self.tmp_path, &path)?;
        fs::rename(&tmp_index, &index_path)?;
        debug!(
            "Sealed page {} ({} chunks, {} measurements)",
            self.name, self.footer.chunk_count, self.footer.count
        );

        Ok(Page {
            name: self.name.clone(),
            path,
            index_path,
            footer: self.footer.clone(),
            index,
            records: std::mem::take(&mut self.records),
            bad_chunks: Mutex::new(HashSet::new()),
        })
    }
}

/// Result of verifying one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCheck {
    /// Chunks inspected.
    pub chunks: usize,
    /// Chunks whose checksum failed or that could not be decoded.
    pub bad_chunks: usize,
    /// True if the whole-file checksum in the footer matched.
    pub file_checksum_ok: bool,
}

/// Handle to a sealed page.
#[derive(Debug)]
pub struct Page {
    name: String,
    path: PathBuf,
    index_path: PathBuf,
    footer: PageFooter,
    index: IndexHeader,
    records: Vec<IndexRecord>,
    bad_chunks: Mutex<HashSet<u64>>,
}

impl Page {
    /// Path of the data file of page `name`.
    pub fn page_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.{}", name, PAGE_EXTENSION))
    }

    /// Path of the index file of page `name`.
    pub fn index_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.{}", name, INDEX_EXTENSION))
    }

    /// Opens page `name` in `dir`.
    ///
    /// The index file is loaded without touching chunk payloads. A missing or
    /// damaged index is rebuilt by scanning the page file.
    ///
    /// # Errors
    ///
    /// Returns an error if the page file itself is missing or its footer is invalid.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = Self::page_path(dir, name);
        let index_path = Self::index_path(dir, name);
        let footer = Self::read_footer(&path)?;

        let (index, records) = match Self::read_index(&index_path) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Index of page {} is unusable ({}); rebuilding", name, e);
                let records = Self::scan_records(&path)?;
                let header = write_index_file(&index_path, &footer, &records)?;
                (header, records)
            }
        };

        Ok(Self {
            name: name.to_string(),
            path,
            index_path,
            footer,
            index,
            records,
            bad_chunks: Mutex::new(HashSet::new()),
        })
    }

    fn read_footer(path: &Path) -> Result<PageFooter> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < (PAGE_HEADER_SIZE + PAGE_FOOTER_SIZE) as u64 {
            return Err(DenError::Corrupted(format!(
                "page {} is {} bytes",
                path.display(),
                len
            )));
        }
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != PAGE_MAGIC {
            return Err(DenError::InvalidMagic(magic));
        }
        file.seek(SeekFrom::End(-(PAGE_FOOTER_SIZE as i64)))?;
        let mut buf = [0u8; PAGE_FOOTER_SIZE];
        file.read_exact(&mut buf)?;
        PageFooter::read_from(&buf)
    }

    fn read_index(path: &Path) -> Result<(IndexHeader, Vec<IndexRecord>)> {
        let bytes = fs::read(path)?;
        let header = IndexHeader::read_from(&bytes)?;
        let body = bytes.get(INDEX_HEADER_SIZE..).unwrap_or_default();
        if body.len() != header.count as usize * INDEX_RECORD_SIZE {
            return Err(DenError::Corrupted(format!(
                "index has {} bytes of records, header says {} records",
                body.len(),
                header.count
            )));
        }
        let actual = crc32fast::hash(body);
        if actual != header.checksum {
            return Err(DenError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        let mut r = ByteReader::new(body, "index record");
        let records = (0..header.count)
            .map(|_| IndexRecord::read_from(&mut r))
            .collect::<Result<Vec<_>>>()?;
        Ok((header, records))
    }

    /// Rebuilds index records by walking the chunk headers of a page file.
    fn scan_records(path: &Path) -> Result<Vec<IndexRecord>> {
        let bytes = fs::read(path)?;
        let end = bytes.len().saturating_sub(PAGE_FOOTER_SIZE);
        let mut offset = PAGE_HEADER_SIZE;
        let mut records = Vec::new();
        while offset + CHUNK_HEADER_SIZE <= end {
            let mut header = ChunkHeader::read_from(&bytes[offset..end])?;
            header.byte_offset_in_page = offset as u64;
            records.push(IndexRecord::from_header(&header));
            offset += CHUNK_HEADER_SIZE + header.used_bytes as usize;
        }
        Ok(records)
    }

    /// Page name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Page footer.
    pub fn footer(&self) -> &PageFooter {
        &self.footer
    }

    /// Index header.
    pub fn index_header(&self) -> &IndexHeader {
        &self.index
    }

    /// Index records, one per chunk.
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// Smallest time in the page.
    pub fn min_time(&self) -> Time {
        self.footer.min_time
    }

    /// Largest time in the page.
    pub fn max_time(&self) -> Time {
        self.footer.max_time
    }

    /// Returns true if the page may hold data for `id`.
    pub fn may_contain(&self, id: Id) -> bool {
        bloom::bloom_check(self.footer.id_bloom, id)
    }

    /// Index records that may hold data for the filters.
    pub fn candidates<'a>(
        &'a self,
        ids: &'a [Id],
        flag: Flag,
        from: Time,
        to: Time,
    ) -> impl Iterator<Item = &'a IndexRecord> + 'a {
        let page_hit = self.footer.min_time <= to
            && from <= self.footer.max_time
            && (ids.is_empty() || ids.iter().any(|&id| self.may_contain(id)));
        self.records
            .iter()
            .filter(move |r| page_hit && r.matches(ids, flag, from, to))
    }

    fn read_chunk_from<R: Read + Seek>(&self, file: &mut R, record: &IndexRecord) -> Result<Chunk> {
        file.seek(SeekFrom::Start(record.offset))?;
        let mut header_buf = [0u8; CHUNK_HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = ChunkHeader::read_from(&header_buf)?;
        if header.id != record.id || header.checksum != record.checksum {
            return Err(DenError::Corrupted(format!(
                "chunk at {} disagrees with its index record",
                record.offset
            )));
        }
        let mut payload = vec![0u8; header.used_bytes as usize];
        file.read_exact(&mut payload)?;
        Chunk::from_parts(header, payload)
    }

    /// Reads the chunks behind `records`, skipping corrupted ones.
    ///
    /// A chunk that fails to load is logged, remembered and never read again.
    pub fn read_chunks<'a>(&self, records: impl IntoIterator<Item = &'a IndexRecord>) -> Vec<Chunk> {
        let mut file = match File::open(&self.path) {
            Ok(file) => BufReader::new(file),
            Err(e) => {
                warn!("Cannot open page {}: {}", self.name, e);
                return Vec::new();
            }
        };
        let mut chunks = Vec::new();
        for record in records {
            if self.bad_chunks.lock().contains(&record.offset) {
                continue;
            }
            match self.read_chunk_from(&mut file, record) {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => {
                    warn!(
                        "Skipping chunk at offset {} in page {}: {}",
                        record.offset, self.name, e
                    );
                    self.bad_chunks.lock().insert(record.offset);
                }
            }
        }
        chunks
    }

    /// Every readable chunk of the page, in file order.
    pub fn all_chunks(&self) -> Vec<Chunk> {
        self.read_chunks(self.records.iter())
    }

    /// Chunks that may hold data for `query`.
    pub fn chunks_by_interval(&self, query: &QueryInterval) -> Vec<Chunk> {
        self.read_chunks(self.candidates(&query.ids, query.flag, query.from, query.to))
    }

    /// Measurements matching `query`, in chunk order.
    pub fn read_interval(&self, query: &QueryInterval) -> Vec<Measurement> {
        self.chunks_by_interval(query)
            .iter()
            .flat_map(|chunk| chunk.read_interval(query))
            .collect()
    }

    /// For each requested id, the measurement with the greatest time `<= time_point`.
    ///
    /// Candidates are visited newest first; a chunk is skipped once its id is
    /// already resolved with a time it cannot beat. Chunks of one id may
    /// overlap in time, so the scan stops only when every requested id holds
    /// a time at least the bound of the next candidate.
    pub fn values_before(&self, query: &QueryTimePoint) -> HashMap<Id, Measurement> {
        let t = query.time_point;
        let mut candidates: Vec<&IndexRecord> = self
            .candidates(&query.ids, query.flag, Time::MIN, t)
            .collect();
        candidates.sort_by_key(|r| std::cmp::Reverse(r.max_time.min(t)));

        let mut result: HashMap<Id, Measurement> = HashMap::new();
        for record in candidates {
            let bound = record.max_time.min(t);
            let settled = !query.ids.is_empty()
                && query
                    .ids
                    .iter()
                    .all(|id| result.get(id).is_some_and(|found| found.time >= bound));
            if settled {
                break;
            }
            if result.get(&record.id).is_some_and(|found| found.time >= bound) {
                continue;
            }
            for chunk in self.read_chunks(std::iter::once(record)) {
                if let Some(m) = chunk.value_before(t, query.flag) {
                    let better = result.get(&m.id).map_or(true, |found| m.time > found.time);
                    if better {
                        result.insert(m.id, m);
                    }
                }
            }
        }
        result
    }

    /// Aggregate of `id` over `[from, to]`.
    ///
    /// Chunks lying entirely inside the range contribute their header statistic
    /// without being decompressed.
    pub fn stat(&self, id: Id, from: Time, to: Time) -> Statistic {
        let ids = [id];
        let mut stat = Statistic::new();
        for chunk in self.read_chunks(self.candidates(&ids, 0, from, to)) {
            let header = chunk.header();
            if from <= header.min_time && header.max_time <= to {
                stat.merge(&header.stat());
            } else {
                for m in chunk.reader().filter(|m| m.in_interval(from, to)) {
                    stat.update(&m);
                }
            }
        }
        stat
    }

    /// Earliest and latest measurement per series.
    pub fn load_min_max(&self) -> HashMap<Id, MinMax> {
        let mut edges: HashMap<Id, (&IndexRecord, &IndexRecord)> = HashMap::new();
        for record in &self.records {
            edges
                .entry(record.id)
                .and_modify(|(lo, hi)| {
                    if record.min_time < lo.min_time {
                        *lo = record;
                    }
                    if record.max_time >= hi.max_time {
                        *hi = record;
                    }
                })
                .or_insert((record, record));
        }

        let mut result: HashMap<Id, MinMax> = HashMap::new();
        for (lo, hi) in edges.into_values() {
            let wanted: Vec<&IndexRecord> = if lo.offset == hi.offset { vec![lo] } else { vec![lo, hi] };
            for chunk in self.read_chunks(wanted) {
                for m in chunk.reader() {
                    result
                        .entry(m.id)
                        .and_modify(|mm| mm.update(&m))
                        .or_insert_with(|| MinMax::new(m));
                }
            }
        }
        result
    }

    /// Verifies the file checksum and every chunk checksum.
    pub fn verify(&self) -> PageCheck {
        let mut check = PageCheck::default();
        match fs::read(&self.path) {
            Ok(bytes) if bytes.len() >= PAGE_FOOTER_SIZE => {
                let body = &bytes[..bytes.len() - PAGE_FOOTER_SIZE];
                check.file_checksum_ok = crc32fast::hash(body) == self.footer.checksum;
            }
            Ok(_) => check.file_checksum_ok = false,
            Err(e) => {
                warn!("Cannot read page {}: {}", self.name, e);
                check.chunks = self.records.len();
                check.bad_chunks = self.records.len();
                return check;
            }
        }
        check.chunks = self.records.len();
        let good = self.read_chunks(self.records.iter());
        check.bad_chunks = self.records.len() - good.len();
        check
    }

    /// Deletes both files of the page.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be removed.
    pub fn remove_files(&self) -> Result<()> {
        for path in [&self.path, &self.index_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Removed page {}", self.name);
        Ok(())
    }
}
