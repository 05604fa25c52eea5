//! Page manager: the on-disk tier.
//!
//! Tracks the live pages listed in the manifest (oldest first), creates new
//! pages from drained measurements or evicted chunks, answers queries across
//! pages and rewrites pages during repack and compaction.
//!
//! Repack runs in two phases so that callers can write the replacement page
//! while readers are still active and only block them for the swap:
//! [`PageManager::prepare_repack`] writes the new page, and
//! [`PageManager::commit_repack`] swaps it into the manifest and deletes the
//! inputs.

use super::compaction::{self, CompactionController};
use super::file::{Page, PageCheck, PageWriter};
use crate::chunk::Chunk;
use crate::error::{DenError, Result};
use crate::manifest::Manifest;
use crate::meas::{
    self, Id, Measurement, MinMax, QueryInterval, QueryTimePoint, Statistic, Time,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of checking every page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// Pages inspected.
    pub pages: usize,
    /// Chunks inspected.
    pub chunks: usize,
    /// Chunks that failed verification.
    pub bad_chunks: usize,
    /// Pages whose whole-file checksum failed.
    pub bad_pages: Vec<String>,
}

impl FsckReport {
    /// Returns true if nothing was found damaged.
    pub fn is_clean(&self) -> bool {
        self.bad_chunks == 0 && self.bad_pages.is_empty()
    }
}

/// A replacement page written but not yet swapped in.
#[derive(Debug)]
pub struct PreparedRepack {
    inputs: Vec<String>,
    output: Option<Page>,
}

impl PreparedRepack {
    /// Names of the pages being replaced.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }
}

/// Splits time-sorted measurements into closed chunks of `capacity` bytes.
///
/// `values` must be sorted by `(id, time)`.
pub(crate) fn pack_chunks(values: &[Measurement], capacity: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current: Option<Chunk> = None;
    for m in values {
        if let Some(chunk) = current.as_mut() {
            if chunk.append(m) {
                continue;
            }
        }
        if let Some(mut full) = current.take() {
            full.close();
            chunks.push(full);
        }
        current = Some(Chunk::create(*m, capacity));
    }
    if let Some(mut last) = current {
        last.close();
        chunks.push(last);
    }
    chunks
}

/// Collection of sealed pages.
#[derive(Debug)]
pub struct PageManager {
    dir: PathBuf,
    chunk_capacity: usize,
    manifest: Arc<Manifest>,
    pages: RwLock<Vec<Arc<Page>>>,
    next_id: AtomicU64,
}

impl PageManager {
    /// Opens every page listed in `manifest`.
    ///
    /// A listed page that cannot be opened is logged and dropped from the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be updated.
    pub fn open(dir: &Path, manifest: Arc<Manifest>, chunk_capacity: usize) -> Result<Self> {
        let mut pages = Vec::new();
        let mut next_id = 0u64;
        for name in manifest.page_list() {
            if let Ok(id) = u64::from_str_radix(&name, 16) {
                next_id = next_id.max(id + 1);
            }
            match Page::open(dir, &name) {
                Ok(page) => pages.push(Arc::new(page)),
                Err(e) => {
                    warn!("Dropping unreadable page {}: {}", name, e);
                    manifest.page_rm(&name)?;
                }
            }
        }
        debug!("Opened {} pages in {}", pages.len(), dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            chunk_capacity,
            manifest,
            pages: RwLock::new(pages),
            next_id: AtomicU64::new(next_id),
        })
    }

    fn next_name(&self) -> String {
        format!("{:016x}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn write_page(&self, chunks: &[Chunk]) -> Result<Option<Page>> {
        if chunks.is_empty() {
            return Ok(None);
        }
        let name = self.next_name();
        let mut writer = PageWriter::create(&self.dir, &name)?;
        for chunk in chunks {
            writer.write_chunk(chunk)?;
        }
        writer.finish().map(Some)
    }

    fn publish(&self, page: Page) -> Result<Arc<Page>> {
        self.manifest.page_add(page.name())?;
        let page = Arc::new(page);
        self.pages.write().push(Arc::clone(&page));
        Ok(page)
    }

    /// Writes `values` into a new page.
    ///
    /// Values are sorted by `(id, time)` and packed greedily into chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the page or updating the manifest fails.
    pub fn append_measurements(&self, values: &[Measurement]) -> Result<Option<Arc<Page>>> {
        let mut sorted = values.to_vec();
        meas::sort_by_id_time(&mut sorted);
        let chunks = pack_chunks(&sorted, self.chunk_capacity);
        match self.write_page(&chunks)? {
            Some(page) => self.publish(page).map(Some),
            None => Ok(None),
        }
    }

    /// Writes already built chunks into a new page, closing open ones.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the page or updating the manifest fails.
    pub fn append_chunks(&self, mut chunks: Vec<Chunk>) -> Result<Option<Arc<Page>>> {
        for chunk in chunks.iter_mut() {
            chunk.close();
        }
        chunks.sort_by_key(|c| (c.id(), c.header().min_time));
        match self.write_page(&chunks)? {
            Some(page) => self.publish(page).map(Some),
            None => Ok(None),
        }
    }

    /// Snapshot of live pages, oldest first.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.read().clone()
    }

    /// Number of live pages.
    pub fn files_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Chunks that may hold data for `query`, oldest page first.
    pub fn chunks_by_interval(&self, query: &QueryInterval) -> Vec<Chunk> {
        self.pages()
            .iter()
            .flat_map(|page| page.chunks_by_interval(query))
            .collect()
    }

    /// Measurements matching `query`, grouped by id and sorted by time.
    pub fn read_interval(&self, query: &QueryInterval) -> Vec<Measurement> {
        let mut values: Vec<Measurement> = self
            .pages()
            .iter()
            .flat_map(|page| page.read_interval(query))
            .collect();
        meas::sort_by_id_time(&mut values);
        values
    }

    /// For each requested id, the latest measurement with `time <= time_point`.
    pub fn values_before_time_point(&self, query: &QueryTimePoint) -> HashMap<Id, Measurement> {
        let mut result: HashMap<Id, Measurement> = HashMap::new();
        for page in self.pages().iter().rev() {
            if page.min_time() > query.time_point {
                continue;
            }
            for (id, m) in page.values_before(query) {
                let better = result.get(&id).map_or(true, |found| m.time > found.time);
                if better {
                    result.insert(id, m);
                }
            }
        }
        result
    }

    /// Time range stored for `id`, from index records alone.
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        self.pages()
            .iter()
            .filter(|page| page.may_contain(id))
            .flat_map(|page| {
                page.records()
                    .iter()
                    .filter(|r| r.id == id)
                    .map(|r| (r.min_time, r.max_time))
                    .collect::<Vec<_>>()
            })
            .reduce(|(lo, hi), (min, max)| (lo.min(min), hi.max(max)))
    }

    /// Earliest and latest measurement per series over every page.
    pub fn load_min_max(&self) -> HashMap<Id, MinMax> {
        let mut result: HashMap<Id, MinMax> = HashMap::new();
        for page in self.pages() {
            for (id, mm) in page.load_min_max() {
                result
                    .entry(id)
                    .and_modify(|found| found.merge(&mm))
                    .or_insert(mm);
            }
        }
        result
    }

    /// Aggregate of `id` over `[from, to]`.
    pub fn stat(&self, id: Id, from: Time, to: Time) -> Statistic {
        let mut stat = Statistic::new();
        for page in self.pages() {
            stat.merge(&page.stat(id, from, to));
        }
        stat
    }

    /// Smallest time over every page.
    pub fn min_time(&self) -> Option<Time> {
        self.pages().iter().map(|p| p.min_time()).min()
    }

    /// Largest time over every page.
    pub fn max_time(&self) -> Option<Time> {
        self.pages().iter().map(|p| p.max_time()).max()
    }

    fn find(&self, names: &[String]) -> Result<Vec<Arc<Page>>> {
        let pages = self.pages.read();
        names
            .iter()
            .map(|name| {
                pages
                    .iter()
                    .find(|p| p.name() == name)
                    .cloned()
                    .ok_or_else(|| DenError::CompactionError(format!("unknown page {}", name)))
            })
            .collect()
    }

    /// Writes the page that will replace `names`.
    ///
    /// Without a controller, and when no two input chunks of one series overlap
    /// in time, chunks are copied verbatim. Otherwise the values of each series
    /// are merged by time, filtered through the
    /// controller and packed into fresh chunks. No value is deduplicated.
    ///
    /// # Errors
    ///
    /// Returns `DenError::CompactionError` for unknown page names, or an I/O
    /// error if writing fails.
    pub fn prepare_repack(
        &self,
        names: &[String],
        controller: Option<&mut dyn CompactionController>,
    ) -> Result<PreparedRepack> {
        let inputs = self.find(names)?;
        let mut chunks: Vec<Chunk> = inputs.iter().flat_map(|p| p.all_chunks()).collect();

        let output = match controller {
            None if !has_overlap(&mut chunks) => {
                debug!("Repacking {} pages by copying {} chunks", inputs.len(), chunks.len());
                self.write_page(&chunks)?
            }
            controller => {
                let mut by_id: BTreeMap<Id, Vec<Measurement>> = BTreeMap::new();
                for chunk in &chunks {
                    by_id.entry(chunk.id()).or_default().extend(chunk.reader());
                }
                let mut controller = controller;
                let target = controller.as_ref().map(|c| c.target());
                let mut merged = Vec::new();
                for (id, mut values) in by_id {
                    values.sort_by_key(|m| m.time);
                    if let (Some(c), Some(target)) = (controller.as_deref_mut(), target.as_ref()) {
                        values = compaction::apply(c, target, id, values);
                    }
                    merged.extend(values);
                }
                debug!(
                    "Repacking {} pages by merging {} measurements",
                    inputs.len(),
                    merged.len()
                );
                self.write_page(&pack_chunks(&merged, self.chunk_capacity))?
            }
        };

        Ok(PreparedRepack {
            inputs: names.to_vec(),
            output,
        })
    }

    /// Swaps a prepared page in and deletes its inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be updated. Input files that
    /// cannot be deleted are only logged.
    pub fn commit_repack(&self, prepared: PreparedRepack) -> Result<Option<Arc<Page>>> {
        let PreparedRepack { inputs, output } = prepared;
        let added: Vec<String> = output.iter().map(|p| p.name().to_string()).collect();
        self.manifest.page_replace(&inputs, &added)?;

        let output = output.map(Arc::new);
        let removed = {
            let mut pages = self.pages.write();
            let (removed, kept): (Vec<_>, Vec<_>) = pages
                .drain(..)
                .partition(|p| inputs.iter().any(|name| name == p.name()));
            *pages = kept;
            if let Some(page) = &output {
                pages.push(Arc::clone(page));
            }
            removed
        };
        for page in &removed {
            if let Err(e) = page.remove_files() {
                warn!("Cannot remove repacked page {}: {}", page.name(), e);
            }
        }
        info!(
            "Repacked {} pages into {}",
            removed.len(),
            added.first().map(String::as_str).unwrap_or("nothing")
        );
        Ok(output)
    }

    /// Rewrites `names` into one page.
    ///
    /// # Errors
    ///
    /// See [`prepare_repack`](Self::prepare_repack) and [`commit_repack`](Self::commit_repack).
    pub fn repack(
        &self,
        names: &[String],
        controller: Option<&mut dyn CompactionController>,
    ) -> Result<Option<Arc<Page>>> {
        let prepared = self.prepare_repack(names, controller)?;
        self.commit_repack(prepared)
    }

    /// Names of every live page, oldest first.
    pub fn page_names(&self) -> Vec<String> {
        self.pages.read().iter().map(|p| p.name().to_string()).collect()
    }

    /// Names of the oldest pages to merge so at most `pages_count` remain.
    ///
    /// Returns an empty list if nothing needs merging.
    pub fn plan_compact_to(&self, pages_count: usize) -> Vec<String> {
        let names = self.page_names();
        let target = pages_count.max(1);
        if names.len() <= target {
            return Vec::new();
        }
        names[..names.len() - target + 1].to_vec()
    }

    /// Merges the oldest pages until at most `pages_count` remain.
    ///
    /// # Errors
    ///
    /// Returns an error if the repack fails.
    pub fn compact_to(&self, pages_count: usize) -> Result<usize> {
        let names = self.plan_compact_to(pages_count);
        if names.is_empty() {
            return Ok(0);
        }
        self.repack(&names, None)?;
        Ok(names.len())
    }

    /// Names of the pages overlapping `[from, to]`.
    pub fn pages_in_range(&self, from: Time, to: Time) -> Vec<String> {
        self.pages
            .read()
            .iter()
            .filter(|p| p.min_time() <= to && from <= p.max_time())
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Merges every page overlapping `[from, to]` into one.
    ///
    /// # Errors
    ///
    /// Returns an error if the repack fails.
    pub fn compact_by_time(
        &self,
        from: Time,
        to: Time,
        controller: Option<&mut dyn CompactionController>,
    ) -> Result<Option<Arc<Page>>> {
        let names = self.pages_in_range(from, to);
        if names.is_empty() {
            return Ok(None);
        }
        self.repack(&names, controller)
    }

    /// Deletes every page whose newest measurement is `<= cutoff`.
    ///
    /// Returns the number of pages removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be updated.
    pub fn erase_old(&self, cutoff: Time) -> Result<usize> {
        let expired: Vec<String> = self
            .pages
            .read()
            .iter()
            .filter(|p| p.max_time() <= cutoff)
            .map(|p| p.name().to_string())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        self.commit_repack(PreparedRepack {
            inputs: expired.clone(),
            output: None,
        })?;
        debug!("Erased {} pages older than {}", expired.len(), cutoff);
        Ok(expired.len())
    }

    /// Verifies every page and chunk.
    pub fn fsck(&self) -> FsckReport {
        let mut report = FsckReport::default();
        for page in self.pages() {
            let PageCheck {
                chunks,
                bad_chunks,
                file_checksum_ok,
            } = page.verify();
            report.pages += 1;
            report.chunks += chunks;
            report.bad_chunks += bad_chunks;
            if !file_checksum_ok {
                warn!("Page {} failed its file checksum", page.name());
                report.bad_pages.push(page.name().to_string());
            }
        }
        report
    }
}

/// Sorts chunks by `(id, min_time)` and reports whether any two chunks of
/// one series overlap in time.
fn has_overlap(chunks: &mut [Chunk]) -> bool {
    chunks.sort_by_key(|c| (c.id(), c.header().min_time));
    chunks.windows(2).any(|w| {
        let (a, b) = (w[0].header(), w[1].header());
        a.id == b.id && b.min_time <= a.max_time
    })
}
