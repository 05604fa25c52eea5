//! Durability log.
//!
//! Raw measurements are appended to fixed-capacity segment files in arrival
//! order. A full segment is closed and handed to a [`SegmentSink`], which
//! drains it into pages and then erases it.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_den::wal::WalManager;
//!
//! let wal = WalManager::open(dir, WalConfig::default(), manifest)?;
//! wal.append(&Measurement::new(1, 1000, 42.5))?;
//!
//! // Hand every segment to the drain sink.
//! wal.drop_all()?;
//! ```

pub mod manager;
pub mod segment;

pub use manager::{SegmentSink, WalManager};
pub use segment::{read_segment, recover_segment, SegmentContents, SegmentWriter};
