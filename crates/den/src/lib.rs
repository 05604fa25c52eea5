//! Den - Alopex Embeddable Time Series Storage Engine
//!
//! This crate stores `(id, time, value, flag, source)` measurements across
//! three tiers and answers interval and time-point queries over all of them.
//!
//! # Components
//!
//! - [`codec`]: delta-of-delta, XOR and run-length bit codecs
//! - [`Chunk`]: fixed-capacity compressed run of one series
//! - [`PageManager`]: immutable page files with a sidecar chunk index
//! - [`WalManager`]: segmented durability log drained into pages
//! - [`MemoryTier`]: in-memory chunks bounded by a byte budget
//! - [`Engine`]: strategy routing, lock ordering, worker pool and subscriptions
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_den::{Engine, EngineConfig, Measurement, QueryInterval, Strategy};
//!
//! let engine = Engine::open(EngineConfig::new("/var/lib/den").with_strategy(Strategy::Wal))?;
//!
//! for t in 1..=100 {
//!     engine.append(&Measurement::new(1, t, t as f64));
//! }
//! engine.flush()?;
//!
//! let values = engine.read_interval(&QueryInterval::new(vec![1], 0, 10, 20))?;
//! assert_eq!(values.len(), 11);
//! ```

#![deny(missing_docs)]

pub mod bloom;
mod bytes;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod meas;
pub mod memory;
pub mod page;
pub mod wal;

pub use chunk::{Chunk, ChunkHeader};
pub use config::{EngineConfig, MemoryConfig, PoolConfig, Strategy, SyncMode, WalConfig};
pub use engine::{Description, Engine, ReadCallback};
pub use error::{DenError, Result};
pub use meas::{
    AppendResult, Flag, Id, Measurement, MinMax, QueryInterval, QueryTimePoint, Statistic, Time,
    Value,
};
pub use memory::MemoryTier;
pub use page::{CompactionController, CompactionTarget, EraseOlderThan, FsckReport, PageManager};
pub use wal::WalManager;
