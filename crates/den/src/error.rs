//! Error and Result types for Den storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for Den operations.
pub type Result<T> = std::result::Result<T, DenError>;

/// The error type for storage operations.
#[derive(Debug, Error)]
pub enum DenError {
    /// Invalid magic bytes in a file header or footer.
    #[error("Invalid magic bytes: got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the computed value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// A serialized structure is truncated or internally inconsistent.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Storage directory is locked by another engine instance.
    #[error("Storage is already locked: {0}")]
    StorageLocked(PathBuf),

    /// The on-disk format was written by an incompatible version.
    #[error("Incompatible storage format: found {found}, expected {expected}")]
    IncompatibleFormat {
        /// Format version found in the manifest.
        found: u16,
        /// Format version this build understands.
        expected: u16,
    },

    /// Strategy name could not be parsed.
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    /// Configuration values are out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The worker pool was stopped before the task could run.
    #[error("Worker pool is stopped")]
    PoolStopped,

    /// A background task panicked before producing its result.
    #[error("Background task panicked")]
    TaskPanicked,

    /// Error during page compaction.
    #[error("Compaction error: {0}")]
    CompactionError(String),
}
