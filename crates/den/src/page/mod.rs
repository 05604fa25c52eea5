//! On-disk page tier.
//!
//! - [`file`]: page and index file format, writer and reader
//! - [`manager`]: the set of live pages, queries and repack
//! - [`compaction`]: controllers filtering values during repack

pub mod compaction;
pub mod file;
pub mod manager;

pub use compaction::{CompactionController, CompactionTarget, EraseOlderThan};
pub use file::{IndexHeader, IndexRecord, Page, PageCheck, PageFooter, PageWriter};
pub use manager::{FsckReport, PageManager, PreparedRepack};
