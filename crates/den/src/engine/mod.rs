//! Storage engine.
//!
//! The [`Engine`] owns every tier and routes writes and reads across them
//! according to the [`Strategy`] persisted when the storage was created:
//!
//! - `Wal`: the log is the only write path and is drained into pages.
//! - `Memory`: the memory tier is the only write path and flushes into pages.
//! - `Cache`: every write goes to the log and the memory tier. Reads of a
//!   series split at its sync point: disk below, memory above.
//!
//! Public calls block. Query fan-out runs on the general lane of the worker
//! pool, drains and flushes on the disk-io lane.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_den::config::{EngineConfig, Strategy};
//! use alopex_den::engine::Engine;
//! use alopex_den::meas::{Measurement, QueryInterval};
//!
//! let engine = Engine::open(EngineConfig::new("/var/lib/den").with_strategy(Strategy::Cache))?;
//! engine.append(&Measurement::new(1, 100, 1.0));
//! let values = engine.read_interval(&QueryInterval::new(vec![1], 0, 0, 200))?;
//! ```

pub mod dropper;
pub mod locks;
pub mod pool;
pub mod subscribe;

pub use dropper::{Dropper, DropperDescription};
pub use locks::LockManager;
pub use pool::{TaskHandle, TaskKind, WorkerPool};
pub use subscribe::{Callback, SubscriptionId, Subscriptions};

use crate::config::{EngineConfig, Strategy};
use crate::error::{DenError, Result};
use crate::manifest::Manifest;
use crate::memory::{MemoryDescription, MemoryTier};
use crate::meas::{
    self, current_time, AppendResult, Flag, Id, Measurement, MinMax, QueryInterval,
    QueryTimePoint, Statistic, Time, MAX_TIME,
};
use crate::page::{CompactionController, EraseOlderThan, FsckReport, PageManager};
use crate::wal::{SegmentSink, WalManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lock file created inside the storage directory while an engine is open.
pub const LOCK_FILE_NAME: &str = "LOCKFILE";

/// Number of stripes of the min/max cache.
const MIN_MAX_SHARDS: usize = 16;

/// Receiver of a streaming read.
pub trait ReadCallback {
    /// Called once per measurement, in result order.
    fn apply(&mut self, m: &Measurement);

    /// Polled before each measurement; returning true stops the read.
    fn is_canceled(&self) -> bool {
        false
    }
}

impl<F: FnMut(&Measurement)> ReadCallback for F {
    fn apply(&mut self, m: &Measurement) {
        self(m)
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    /// Log segment files, the current one included.
    pub wal_count: usize,
    /// Live pages.
    pub pages_count: usize,
    /// Tasks queued or running on the worker pool.
    pub active_works: usize,
    /// Memory tier counters.
    pub memory: MemoryDescription,
    /// Drain counters.
    pub dropper: DropperDescription,
}

#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(dir: &Path, ignore_existing: bool) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !ignore_existing {
                    return Err(DenError::StorageLocked(path));
                }
                warn!("Ignoring existing lock file {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self { path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Cannot remove lock file {}: {}", self.path.display(), e);
        }
    }
}

/// One tier as seen by the query fan-out.
#[derive(Clone)]
enum Tier {
    Pages(Arc<PageManager>),
    Wal(Arc<WalManager>),
    Memory(Arc<MemoryTier>),
}

impl Tier {
    fn read_interval(&self, query: &QueryInterval) -> Vec<Measurement> {
        match self {
            Self::Pages(pages) => pages.read_interval(query),
            Self::Wal(wal) => wal.read_interval(query),
            Self::Memory(memory) => memory.read_interval(query),
        }
    }

    fn read_time_point(&self, query: &QueryTimePoint) -> HashMap<Id, Measurement> {
        match self {
            Self::Pages(pages) => pages.values_before_time_point(query),
            Self::Wal(wal) => wal.read_time_point(query),
            Self::Memory(memory) => memory.read_time_point(query),
        }
    }

    fn stat(&self, id: Id, from: Time, to: Time) -> Statistic {
        match self {
            Self::Pages(pages) => pages.stat(id, from, to),
            Self::Wal(wal) => wal.stat(id, from, to),
            Self::Memory(memory) => memory.stat(id, from, to),
        }
    }

    fn load_min_max(&self) -> HashMap<Id, MinMax> {
        match self {
            Self::Pages(pages) => pages.load_min_max(),
            Self::Wal(wal) => wal.load_min_max(),
            Self::Memory(memory) => memory.load_min_max(),
        }
    }
}

fn read_tier(tier: &Tier, queries: &[QueryInterval]) -> Vec<Measurement> {
    queries.iter().flat_map(|q| tier.read_interval(q)).collect()
}

/// Embeddable time-series storage engine.
pub struct Engine {
    config: EngineConfig,
    strategy: Strategy,
    manifest: Arc<Manifest>,
    pool: Arc<WorkerPool>,
    locks: Arc<LockManager>,
    pages: Arc<PageManager>,
    wal: Option<Arc<WalManager>>,
    memory: Option<Arc<MemoryTier>>,
    dropper: Dropper,
    subscriptions: Subscriptions,
    min_max: Vec<Mutex<HashMap<Id, MinMax>>>,
    _lock_file: LockFile,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.config.path)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Opens or creates the storage at `config.path`.
    ///
    /// Closed log segments left by a previous run are recovered and queued
    /// for draining.
    ///
    /// # Errors
    ///
    /// - `DenError::InvalidConfig` if the configuration is unusable
    /// - `DenError::StorageLocked` if another engine holds the lock file
    /// - `DenError::IncompatibleFormat` if the storage was written by another format
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.path)?;
        let lock_file = LockFile::acquire(&config.path, config.ignore_lock_file)?;

        let manifest = Arc::new(Manifest::open_or_create(&config.path, config.strategy)?);
        let strategy = manifest.strategy();
        if strategy != config.strategy {
            warn!(
                "Storage {} was created with strategy {}; ignoring configured {}",
                config.path.display(),
                strategy,
                config.strategy
            );
        }

        let pool = Arc::new(WorkerPool::new(&config.pool)?);
        let locks = Arc::new(LockManager::new());
        let pages = Arc::new(PageManager::open(
            &config.path,
            Arc::clone(&manifest),
            config.chunk_capacity,
        )?);
        let wal = if strategy.uses_wal() {
            Some(Arc::new(WalManager::open(
                &config.path,
                config.wal.clone(),
                Arc::clone(&manifest),
            )?))
        } else {
            None
        };
        let memory = strategy
            .uses_memory()
            .then(|| Arc::new(MemoryTier::new(config.memory.clone())));

        let dropper = Dropper::new(
            strategy,
            Arc::clone(&pool),
            Arc::clone(&locks),
            Arc::clone(&pages),
            wal.as_ref(),
            memory.clone(),
        );
        if let Some(wal) = &wal {
            wal.set_sink(Arc::new(dropper.clone()));
        }

        let engine = Self {
            config,
            strategy,
            manifest,
            pool,
            locks,
            pages,
            wal,
            memory,
            dropper,
            subscriptions: Subscriptions::new(),
            min_max: (0..MIN_MAX_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            _lock_file: lock_file,
        };
        engine.reload_min_max();

        if let Some(wal) = &engine.wal {
            for name in wal.closed_segments() {
                engine.dropper.drop_segment(&name);
            }
        }
        info!(
            "Opened storage {} (strategy {}, {} pages)",
            engine.config.path.display(),
            engine.strategy,
            engine.pages.files_count()
        );
        Ok(engine)
    }

    fn tiers(&self) -> Vec<Tier> {
        let mut tiers = vec![Tier::Pages(Arc::clone(&self.pages))];
        if let Some(wal) = &self.wal {
            tiers.push(Tier::Wal(Arc::clone(wal)));
        }
        if let Some(memory) = &self.memory {
            tiers.push(Tier::Memory(Arc::clone(memory)));
        }
        tiers
    }

    fn disk_tiers(&self) -> Vec<Tier> {
        self.tiers()
            .into_iter()
            .filter(|t| !matches!(t, Tier::Memory(_)))
            .collect()
    }

    fn shard(&self, id: Id) -> &Mutex<HashMap<Id, MinMax>> {
        &self.min_max[(id % MIN_MAX_SHARDS as u64) as usize]
    }

    fn reload_min_max(&self) {
        let mut merged: HashMap<Id, MinMax> = HashMap::new();
        {
            let _guard = self.locks.read_all();
            for tier in self.tiers() {
                for (id, mm) in tier.load_min_max() {
                    merged
                        .entry(id)
                        .and_modify(|found| found.merge(&mm))
                        .or_insert(mm);
                }
            }
        }

        let mut shards: Vec<_> = self.min_max.iter().map(|s| s.lock()).collect();
        for shard in shards.iter_mut() {
            for (id, cached) in shard.drain() {
                // Keeps appends that landed after the snapshot.
                if let Some(mm) = merged.get_mut(&id) {
                    mm.update(&cached.max);
                }
            }
        }
        for (id, mm) in merged {
            shards[(id % MIN_MAX_SHARDS as u64) as usize].insert(id, mm);
        }
    }

    fn known_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self
            .min_max
            .iter()
            .flat_map(|s| s.lock().keys().copied().collect::<Vec<_>>())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn write_to_tiers(&self, m: &Measurement) -> Result<bool> {
        if let Some(wal) = &self.wal {
            wal.append(m)?;
        }
        Ok(self.memory.as_ref().is_some_and(|memory| memory.append(m)))
    }

    /// Appends one measurement.
    ///
    /// A measurement whose time is not newer than the latest stored time of
    /// its series is refused with `ignored == 1`, as is one that fails to
    /// reach its tier. Matching subscriptions are invoked before returning.
    pub fn append(&self, m: &Measurement) -> AppendResult {
        let rotated = {
            let mut cache = self.shard(m.id).lock();
            if let Some(mm) = cache.get(&m.id) {
                if mm.max.time >= m.time {
                    return AppendResult::ignored(format!(
                        "write into the past: id {} time {} is not after {}",
                        m.id, m.time, mm.max.time
                    ));
                }
            }
            let rotated = match self.write_to_tiers(m) {
                Ok(rotated) => rotated,
                Err(e) => {
                    error!("Append of id {} failed: {}", m.id, e);
                    return AppendResult::ignored(e.to_string());
                }
            };
            cache
                .entry(m.id)
                .and_modify(|mm| mm.update(m))
                .or_insert_with(|| MinMax::new(*m));
            rotated
        };

        if rotated {
            self.dropper.schedule_memory_maintenance(current_time());
        }
        self.subscriptions.notify(m);

        if let Some(wal) = &self.wal {
            if wal.closed_segments().len() > self.config.wal.max_closed_segments {
                debug!("Too many closed segments; waiting for drains");
                self.pool.wait_idle();
            }
        }
        AppendResult::ok()
    }

    /// Appends every measurement in order and sums the results.
    pub fn append_batch(&self, values: &[Measurement]) -> AppendResult {
        values
            .iter()
            .fold(AppendResult::default(), |acc, m| acc + self.append(m))
    }

    /// Per-tier interval sub-queries. Under `Cache` each of `ids` splits at its sync point.
    ///
    /// Must run under `read_all` so sync points cannot move. `ids` is resolved
    /// beforehand because the min/max cache is never locked under a tier lock.
    fn plan_interval(
        &self,
        query: &QueryInterval,
        ids: Vec<Id>,
    ) -> Vec<(Tier, Vec<QueryInterval>)> {
        let memory = match (&self.memory, self.strategy) {
            (Some(memory), Strategy::Cache) => memory,
            _ => {
                return self
                    .tiers()
                    .into_iter()
                    .map(|t| (t, vec![query.clone()]))
                    .collect();
            }
        };

        let mut whole_disk = Vec::new();
        let mut disk = Vec::new();
        let mut mem = Vec::new();
        for id in ids {
            match memory.sync_point(id) {
                None => whole_disk.push(id),
                Some(sync) => {
                    if query.from <= sync {
                        disk.push(query.narrowed(id, query.from, query.to.min(sync)));
                    }
                    if sync < query.to {
                        mem.push(query.narrowed(id, query.from.max(sync + 1), query.to));
                    }
                }
            }
        }
        if !whole_disk.is_empty() {
            disk.push(QueryInterval::new(whole_disk, query.flag, query.from, query.to));
        }

        let mut plan: Vec<(Tier, Vec<QueryInterval>)> = self
            .disk_tiers()
            .into_iter()
            .map(|t| (t, disk.clone()))
            .collect();
        plan.push((Tier::Memory(Arc::clone(memory)), mem));
        plan.retain(|(_, queries)| !queries.is_empty());
        plan
    }

    /// Measurements matching `query`, grouped by id and sorted by time.
    ///
    /// # Errors
    ///
    /// Returns an error only if a sub-query task could not run.
    pub fn read_interval(&self, query: &QueryInterval) -> Result<Vec<Measurement>> {
        let ids = self.interval_ids(query);
        let _guard = self.locks.read_all();
        let mut handles = Vec::new();
        for (tier, queries) in self.plan_interval(query, ids) {
            handles.push(
                self.pool
                    .post(TaskKind::General, move || read_tier(&tier, &queries))?,
            );
        }
        let mut out = Vec::new();
        for handle in handles {
            out.extend(handle.wait()?);
        }
        meas::sort_by_id_time(&mut out);
        out.dedup();
        Ok(out)
    }

    fn interval_ids(&self, query: &QueryInterval) -> Vec<Id> {
        if query.ids.is_empty() && self.strategy == Strategy::Cache {
            self.known_ids()
        } else {
            query.ids.clone()
        }
    }

    /// Streams the result of `query` into `callback`, stopping once it is canceled.
    ///
    /// Tiers are read one after another so a cancellation skips the tiers
    /// not read yet.
    ///
    /// # Errors
    ///
    /// See [`read_interval`](Self::read_interval).
    pub fn foreach(&self, query: &QueryInterval, callback: &mut dyn ReadCallback) -> Result<()> {
        let ids = self.interval_ids(query);
        let mut out = Vec::new();
        {
            let _guard = self.locks.read_all();
            for (tier, queries) in self.plan_interval(query, ids) {
                if callback.is_canceled() {
                    debug!("Streaming read canceled before reading every tier");
                    return Ok(());
                }
                let handle = self
                    .pool
                    .post(TaskKind::General, move || read_tier(&tier, &queries))?;
                out.extend(handle.wait()?);
            }
        }
        meas::sort_by_id_time(&mut out);
        out.dedup();
        for m in out {
            if callback.is_canceled() {
                debug!("Streaming read canceled");
                break;
            }
            callback.apply(&m);
        }
        Ok(())
    }

    /// For each requested id, the latest measurement with `time <= time_point`.
    ///
    /// Ids without such a measurement map to [`Measurement::empty`].
    ///
    /// # Errors
    ///
    /// Returns an error only if a sub-query task could not run.
    pub fn read_time_point(&self, query: &QueryTimePoint) -> Result<HashMap<Id, Measurement>> {
        let mut result: HashMap<Id, Measurement> = query
            .ids
            .iter()
            .map(|&id| (id, Measurement::empty(id, query.time_point)))
            .collect();

        let _guard = self.locks.read_all();
        let mut handles = Vec::new();
        for tier in self.tiers() {
            let query = query.clone();
            handles.push(
                self.pool
                    .post(TaskKind::General, move || tier.read_time_point(&query))?,
            );
        }
        for handle in handles {
            for (id, m) in handle.wait()? {
                let better = result
                    .get(&id)
                    .map_or(true, |found| found.is_empty() || m.time > found.time);
                if better {
                    result.insert(id, m);
                }
            }
        }
        Ok(result)
    }

    /// Latest measurement per id (every known id if `ids` is empty).
    ///
    /// # Errors
    ///
    /// Returns an error only if a flag-filtered lookup could not run.
    pub fn current_value(&self, ids: &[Id], flag: Flag) -> Result<HashMap<Id, Measurement>> {
        let ids = if ids.is_empty() {
            self.known_ids()
        } else {
            ids.to_vec()
        };
        if flag != 0 {
            return self.read_time_point(&QueryTimePoint::new(ids, flag, MAX_TIME));
        }
        Ok(ids
            .into_iter()
            .map(|id| {
                let m = self
                    .shard(id)
                    .lock()
                    .get(&id)
                    .map(|mm| mm.max)
                    .unwrap_or_else(|| Measurement::empty(id, MAX_TIME));
                (id, m)
            })
            .collect())
    }

    /// Time range stored for `id`.
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        self.shard(id)
            .lock()
            .get(&id)
            .map(|mm| (mm.min.time, mm.max.time))
    }

    /// Smallest stored time over every series.
    pub fn min_time(&self) -> Option<Time> {
        self.min_max
            .iter()
            .filter_map(|s| s.lock().values().map(|mm| mm.min.time).min())
            .min()
    }

    /// Largest stored time over every series.
    pub fn max_time(&self) -> Option<Time> {
        self.min_max
            .iter()
            .filter_map(|s| s.lock().values().map(|mm| mm.max.time).max())
            .max()
    }

    /// Aggregate of `id` over `[from, to]`.
    pub fn stat(&self, id: Id, from: Time, to: Time) -> Statistic {
        let _guard = self.locks.read_all();
        let mut stat = Statistic::new();
        match (&self.memory, self.strategy) {
            (Some(memory), Strategy::Cache) => {
                let sync = memory.sync_point(id);
                let disk_to = sync.map_or(to, |s| to.min(s));
                if sync.is_none() || sync.is_some_and(|s| from <= s) {
                    for tier in self.disk_tiers() {
                        stat.merge(&tier.stat(id, from, disk_to));
                    }
                }
                if let Some(s) = sync.filter(|&s| s < to) {
                    stat.merge(&memory.stat(id, from.max(s + 1), to));
                }
            }
            _ => {
                for tier in self.tiers() {
                    stat.merge(&tier.stat(id, from, to));
                }
            }
        }
        stat
    }

    /// Drains every tier into pages and waits for background work.
    ///
    /// # Errors
    ///
    /// Returns the first drain or flush error.
    pub fn flush(&self) -> Result<()> {
        if let Some(wal) = &self.wal {
            let names = wal.oldest(usize::MAX)?;
            self.dropper.drain_segments(&names)?;
        }
        if self.strategy == Strategy::Memory {
            self.dropper.flush_memory()?;
        }
        self.pool.wait_idle();
        debug!("Flushed storage {}", self.config.path.display());
        Ok(())
    }

    /// Forces the log and memory tiers into pages regardless of thresholds.
    ///
    /// # Errors
    ///
    /// See [`flush`](Self::flush).
    pub fn compress_all(&self) -> Result<()> {
        self.flush()
    }

    /// Drains the `count` oldest log segments, or under `Memory` the `count`
    /// oldest closed memory chunks. Returns how many were drained.
    ///
    /// # Errors
    ///
    /// Returns the first drain error.
    pub fn drop_part(&self, count: usize) -> Result<usize> {
        let drained = match &self.wal {
            Some(wal) => {
                let names = wal.oldest(count)?;
                self.dropper.drain_segments(&names)?
            }
            None => self.dropper.drop_memory_part(count)?,
        };
        debug!("Dropped {} parts", drained);
        Ok(drained)
    }

    /// Deletes pages whose newest time is `<= cutoff` and memory chunks older than it.
    ///
    /// Returns the number of pages removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be updated.
    pub fn erase_old(&self, cutoff: Time) -> Result<usize> {
        let removed = {
            let _guard = self.locks.storage_exclusive();
            let removed = self.pages.erase_old(cutoff)?;
            if let Some(memory) = &self.memory {
                let chunks = memory.evict_older_than(cutoff.saturating_add(1));
                debug!("Discarded {} memory chunks older than {}", chunks.len(), cutoff);
            }
            removed
        };
        self.reload_min_max();
        Ok(removed)
    }

    /// Removes measurements of `id` older than `cutoff` by compacting every page.
    ///
    /// Returns the number of measurements erased.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or the compaction fails.
    pub fn erase_old_series(&self, id: Id, cutoff: Time) -> Result<usize> {
        self.flush()?;
        if let (Some(memory), Strategy::Cache) = (&self.memory, self.strategy) {
            let _guard = self.locks.drain_memory();
            memory.discard_series(id);
        }
        let mut controller = EraseOlderThan::new(vec![id], cutoff);
        self.compact(&mut controller)?;
        self.reload_min_max();
        Ok(controller.erased())
    }

    fn repack_with(
        &self,
        select: impl FnOnce(&PageManager) -> Vec<String>,
        controller: Option<&mut dyn CompactionController>,
    ) -> Result<usize> {
        let guard = self.locks.pages_upgradable();
        let names = select(&self.pages);
        if names.is_empty() {
            return Ok(0);
        }
        let prepared = self.pages.prepare_repack(&names, controller)?;
        let _exclusive = guard.upgrade();
        self.pages.commit_repack(prepared)?;
        Ok(names.len())
    }

    /// Merges every page into one. Returns the number of pages merged.
    ///
    /// # Errors
    ///
    /// Returns an error if the new page cannot be written.
    pub fn repack(&self) -> Result<usize> {
        self.repack_with(
            |pages| {
                let names = pages.page_names();
                if names.len() > 1 {
                    names
                } else {
                    Vec::new()
                }
            },
            None,
        )
    }

    /// Rewrites every page through `controller`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new page cannot be written.
    pub fn compact(&self, controller: &mut dyn CompactionController) -> Result<usize> {
        self.repack_with(PageManager::page_names, Some(controller))
    }

    /// Merges the oldest pages until at most `pages_count` remain.
    ///
    /// # Errors
    ///
    /// Returns an error if the new page cannot be written.
    pub fn compact_to(&self, pages_count: usize) -> Result<usize> {
        self.repack_with(|pages| pages.plan_compact_to(pages_count), None)
    }

    /// Verifies every page and chunk checksum.
    pub fn fsck(&self) -> FsckReport {
        let _guard = self.locks.read_all();
        let report = self.pages.fsck();
        if report.is_clean() {
            info!("fsck: {} pages, {} chunks, no damage", report.pages, report.chunks);
        } else {
            warn!(
                "fsck: {} bad chunks, {} bad pages",
                report.bad_chunks,
                report.bad_pages.len()
            );
        }
        report
    }

    /// Registers `callback` for appended measurements of `ids` (all if empty) matching `flag`.
    pub fn subscribe(
        &self,
        ids: Vec<Id>,
        flag: Flag,
        callback: impl Fn(&Measurement) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscriptions.add(ids, flag, Arc::new(callback))
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(id)
    }

    /// Blocks until no background task is queued or running.
    pub fn wait_all_asyncs(&self) {
        self.pool.wait_idle();
    }

    /// Engine counters.
    pub fn description(&self) -> Description {
        Description {
            wal_count: self.wal.as_ref().map_or(0, |w| w.files_count()),
            pages_count: self.pages.files_count(),
            active_works: self.pool.active_works(),
            memory: self
                .memory
                .as_ref()
                .map(|m| m.description())
                .unwrap_or_default(),
            dropper: self.dropper.description(),
        }
    }

    /// Strategy persisted for this storage.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// On-disk format version of this storage.
    pub fn format(&self) -> u16 {
        self.manifest.format()
    }

    /// Storage directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Failed to flush storage on close: {}", e);
        }
        self.pool.stop();
        debug!("Closed storage {}", self.config.path.display());
    }
}
