//! Engine configuration.
//!
//! All configuration is plain structs with `Default` and `with_*` builders.
//! The strategy and on-disk format version are persisted in the manifest, so
//! they only take effect when a storage directory is created.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_den::config::{EngineConfig, Strategy, SyncMode};
//!
//! let config = EngineConfig::new("/var/lib/den")
//!     .with_strategy(Strategy::Cache)
//!     .with_segment_capacity(4096)
//!     .with_sync_mode(SyncMode::Fdatasync);
//! ```

use crate::error::{DenError, Result};
use crate::meas::Time;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default chunk payload capacity in bytes.
pub const DEFAULT_CHUNK_CAPACITY: usize = 1024;

/// Default number of records per log segment.
pub const DEFAULT_SEGMENT_CAPACITY: usize = 2000 * 4;

/// Default number of closed log segments allowed to wait for draining.
pub const DEFAULT_MAX_CLOSED_SEGMENTS: usize = 4;

/// Default memory tier budget: 100 MiB.
pub const DEFAULT_MAX_RESIDENT_BYTES: usize = 100 * 1024 * 1024;

/// Default number of general worker threads.
pub const DEFAULT_GENERAL_THREADS: usize = 4;

/// Default number of disk I/O worker threads.
pub const DEFAULT_DISK_IO_THREADS: usize = 1;

/// Which tiers exist and how writes and reads route across them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Strategy {
    /// The log is the only write path and is continuously drained into pages.
    #[default]
    Wal = 0,
    /// The memory tier is the only write path and flushes into pages.
    Memory = 2,
    /// Every write goes to both the log and the memory tier.
    Cache = 3,
}

impl Strategy {
    /// Creates a Strategy from its persisted byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 | 1 => Some(Self::Wal),
            2 => Some(Self::Memory),
            3 => Some(Self::Cache),
            _ => None,
        }
    }

    /// Returns true if writes go through the durability log.
    pub fn uses_wal(self) -> bool {
        matches!(self, Self::Wal | Self::Cache)
    }

    /// Returns true if writes go through the memory tier.
    pub fn uses_memory(self) -> bool {
        matches!(self, Self::Memory | Self::Cache)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Wal => "WAL",
            Self::Memory => "MEMORY",
            Self::Cache => "CACHE",
        };
        f.write_str(name)
    }
}

impl FromStr for Strategy {
    type Err = DenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WAL" | "COMPRESSED" => Ok(Self::Wal),
            "MEMORY" => Ok(Self::Memory),
            "CACHE" => Ok(Self::Cache),
            _ => Err(DenError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Sync mode for log durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each append (highest durability).
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// Flush to the OS only; sync on segment close.
    #[default]
    None,
    /// Keep records in the process buffer until it fills or the segment
    /// closes (fastest, records are lost if the process dies).
    Buffered,
}

/// Durability log configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Number of records per segment before rotation.
    pub segment_capacity: usize,
    /// Closed segments allowed to wait before appends start draining them.
    pub max_closed_segments: usize,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            max_closed_segments: DEFAULT_MAX_CLOSED_SEGMENTS,
            sync_mode: SyncMode::default(),
        }
    }
}

/// Memory tier configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Chunk payload capacity in bytes.
    pub chunk_capacity: usize,
    /// Resident byte budget. Beyond it the oldest closed chunks are evicted.
    pub max_resident_bytes: usize,
    /// Chunks whose newest measurement is older than `now - window` are evicted.
    pub retention_window: Option<Time>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            max_resident_bytes: DEFAULT_MAX_RESIDENT_BYTES,
            retention_window: None,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Threads serving query fan-out.
    pub general_threads: usize,
    /// Threads serving drains, flushes and compaction.
    pub disk_io_threads: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            general_threads: DEFAULT_GENERAL_THREADS,
            disk_io_threads: DEFAULT_DISK_IO_THREADS,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Storage directory.
    pub path: PathBuf,
    /// Strategy used when the storage is created.
    pub strategy: Strategy,
    /// Payload capacity of chunks written into pages.
    pub chunk_capacity: usize,
    /// Durability log settings.
    pub wal: WalConfig,
    /// Memory tier settings.
    pub memory: MemoryConfig,
    /// Worker pool settings.
    pub pool: PoolConfig,
    /// Removes a stale lock file instead of refusing to open.
    pub ignore_lock_file: bool,
}

impl EngineConfig {
    /// Creates a configuration with defaults for the storage at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            strategy: Strategy::default(),
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            wal: WalConfig::default(),
            memory: MemoryConfig::default(),
            pool: PoolConfig::default(),
            ignore_lock_file: false,
        }
    }

    /// Sets the strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the chunk capacity for both pages and the memory tier.
    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.chunk_capacity = capacity;
        self.memory.chunk_capacity = capacity;
        self
    }

    /// Sets the number of records per log segment.
    pub fn with_segment_capacity(mut self, capacity: usize) -> Self {
        self.wal.segment_capacity = capacity;
        self
    }

    /// Sets the number of closed segments that may wait for draining.
    pub fn with_max_closed_segments(mut self, max: usize) -> Self {
        self.wal.max_closed_segments = max;
        self
    }

    /// Sets the log sync mode.
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.wal.sync_mode = mode;
        self
    }

    /// Sets the memory tier budget.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory.max_resident_bytes = bytes;
        self
    }

    /// Sets the memory tier retention window.
    pub fn with_retention_window(mut self, window: Time) -> Self {
        self.memory.retention_window = Some(window);
        self
    }

    /// Sets the worker thread counts.
    pub fn with_threads(mut self, general: usize, disk_io: usize) -> Self {
        self.pool.general_threads = general;
        self.pool.disk_io_threads = disk_io;
        self
    }

    /// Allows opening a storage whose lock file was left behind.
    pub fn with_ignore_lock_file(mut self, ignore: bool) -> Self {
        self.ignore_lock_file = ignore;
        self
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidConfig` naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_capacity < 16 || self.memory.chunk_capacity < 16 {
            return Err(DenError::InvalidConfig(
                "chunk capacity must be at least 16 bytes".to_string(),
            ));
        }
        if self.chunk_capacity > u32::MAX as usize {
            return Err(DenError::InvalidConfig(
                "chunk capacity must fit in 32 bits".to_string(),
            ));
        }
        if self.wal.segment_capacity == 0 {
            return Err(DenError::InvalidConfig(
                "segment capacity must be positive".to_string(),
            ));
        }
        if self.pool.general_threads == 0 || self.pool.disk_io_threads == 0 {
            return Err(DenError::InvalidConfig(
                "every worker category needs at least one thread".to_string(),
            ));
        }
        Ok(())
    }
}
