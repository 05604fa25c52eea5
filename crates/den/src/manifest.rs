//! Persistent storage manifest.
//!
//! The manifest lists the live page and log segment names so that opening a
//! storage never depends on directory scans, and records the format version
//! and strategy chosen at creation.
//!
//! ## File Structure
//!
//! ```text
//! magic "DMAN" (4) | version u16 | format u16 | strategy u8 | reserved u8
//! page count u32   | (name len u16, name bytes)*
//! wal count u32    | (name len u16, name bytes)*
//! crc32 u32 over everything above
//! ```
//!
//! Every mutation rewrites the whole file through a temporary file and a rename.

use crate::bytes::ByteReader;
use crate::config::Strategy;
use crate::error::{DenError, Result};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Manifest file name inside the storage directory.
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

/// Manifest magic bytes.
const MANIFEST_MAGIC: [u8; 4] = *b"DMAN";

/// Manifest file layout version.
const MANIFEST_VERSION: u16 = 1;

/// On-disk storage format understood by this build.
pub const FORMAT_VERSION: u16 = 3;

#[derive(Debug, Clone)]
struct ManifestState {
    format: u16,
    strategy: Strategy,
    pages: Vec<String>,
    wals: Vec<String>,
}

impl ManifestState {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.format.to_le_bytes());
        buf.push(self.strategy as u8);
        buf.push(0);
        for names in [&self.pages, &self.wals] {
            buf.extend_from_slice(&(names.len() as u32).to_le_bytes());
            for name in names {
                buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
            }
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(DenError::Corrupted("manifest is truncated".to_string()));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(crc_bytes);
        let expected = u32::from_le_bytes(crc);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(DenError::ChecksumMismatch { expected, actual });
        }

        let mut r = ByteReader::new(body, "manifest");
        let magic: [u8; 4] = r.array()?;
        if magic != MANIFEST_MAGIC {
            return Err(DenError::InvalidMagic(magic));
        }
        let version = r.u16()?;
        if version != MANIFEST_VERSION {
            return Err(DenError::UnsupportedVersion(version));
        }
        let format = r.u16()?;
        let strategy_byte = r.u8()?;
        let strategy = Strategy::from_u8(strategy_byte)
            .ok_or_else(|| DenError::UnknownStrategy(strategy_byte.to_string()))?;
        r.u8()?;

        let mut lists = [Vec::new(), Vec::new()];
        for list in lists.iter_mut() {
            let count = r.u32()? as usize;
            for _ in 0..count {
                let len = r.u16()? as usize;
                let name = std::str::from_utf8(r.take(len)?)
                    .map_err(|e| DenError::Corrupted(format!("manifest name: {}", e)))?;
                list.push(name.to_string());
            }
        }
        let [pages, wals] = lists;
        Ok(Self {
            format,
            strategy,
            pages,
            wals,
        })
    }
}

/// Persistent list of live page and log segment names.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    state: Mutex<ManifestState>,
}

impl Manifest {
    /// Opens the manifest in `dir`, creating it with `strategy` if absent.
    ///
    /// # Errors
    ///
    /// Returns `DenError::IncompatibleFormat` if the stored format differs
    /// from [`FORMAT_VERSION`], or a decoding error if the file is damaged.
    pub fn open_or_create(dir: &Path, strategy: Strategy) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        if path.exists() {
            let state = ManifestState::decode(&fs::read(&path)?)?;
            if state.format != FORMAT_VERSION {
                return Err(DenError::IncompatibleFormat {
                    found: state.format,
                    expected: FORMAT_VERSION,
                });
            }
            debug!(
                "Opened manifest {} ({} pages, {} segments)",
                path.display(),
                state.pages.len(),
                state.wals.len()
            );
            return Ok(Self {
                path,
                state: Mutex::new(state),
            });
        }

        let state = ManifestState {
            format: FORMAT_VERSION,
            strategy,
            pages: Vec::new(),
            wals: Vec::new(),
        };
        Self::persist(&path, &state)?;
        debug!("Created manifest {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(path: &Path, state: &ManifestState) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&state.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut ManifestState)) -> Result<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        f(&mut next);
        Self::persist(&self.path, &next)?;
        *state = next;
        Ok(())
    }

    /// Storage format version.
    pub fn format(&self) -> u16 {
        self.state.lock().format
    }

    /// Strategy persisted at creation.
    pub fn strategy(&self) -> Strategy {
        self.state.lock().strategy
    }

    /// Live page names, oldest first.
    pub fn page_list(&self) -> Vec<String> {
        self.state.lock().pages.clone()
    }

    /// Live log segment names, oldest first.
    pub fn wal_list(&self) -> Vec<String> {
        self.state.lock().wals.clone()
    }

    /// Records a new page.
    pub fn page_add(&self, name: &str) -> Result<()> {
        self.update(|s| s.pages.push(name.to_string()))
    }

    /// Atomically replaces `removed` pages with `added` ones.
    pub fn page_replace(&self, removed: &[String], added: &[String]) -> Result<()> {
        self.update(|s| {
            s.pages.retain(|p| !removed.contains(p));
            s.pages.extend(added.iter().cloned());
        })
    }

    /// Forgets a page.
    pub fn page_rm(&self, name: &str) -> Result<()> {
        self.update(|s| s.pages.retain(|p| p != name))
    }

    /// Records a new log segment.
    pub fn wal_add(&self, name: &str) -> Result<()> {
        self.update(|s| s.wals.push(name.to_string()))
    }

    /// Forgets a log segment.
    pub fn wal_rm(&self, name: &str) -> Result<()> {
        self.update(|s| s.wals.retain(|w| w != name))
    }
}
