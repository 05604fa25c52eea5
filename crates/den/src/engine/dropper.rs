//! Background drains from the log and memory tiers into pages.
//!
//! Closed log segments arrive through [`SegmentSink`] and are drained on the
//! disk-io lane: read, sorted, compressed into a page and erased, all under
//! the exclusive Log and Page locks. Memory chunks are evicted and written
//! under the exclusive Memory and Page locks, so a reader never sees a chunk
//! that has left memory but has not reached a page yet.

use super::locks::LockManager;
use super::pool::{TaskHandle, TaskKind, WorkerPool};
use crate::config::Strategy;
use crate::chunk::Chunk;
use crate::error::Result;
use crate::memory::MemoryTier;
use crate::meas;
use crate::page::PageManager;
use crate::wal::{SegmentSink, WalManager};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Counters of the drain machinery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropperDescription {
    /// Segments waiting to be drained.
    pub queued: usize,
    /// Segments drained since open.
    pub drained: usize,
}

struct Inner {
    strategy: Strategy,
    pool: Arc<WorkerPool>,
    locks: Arc<LockManager>,
    pages: Arc<PageManager>,
    wal: Option<Weak<WalManager>>,
    memory: Option<Arc<MemoryTier>>,
    queued: Mutex<HashSet<String>>,
    drained: AtomicUsize,
    maintenance_pending: AtomicBool,
}

impl Inner {
    /// Drains one closed segment. Returns false if it was already gone.
    fn drain_segment(&self, name: &str) -> Result<bool> {
        let Some(wal) = self.wal.as_ref().and_then(Weak::upgrade) else {
            return Ok(false);
        };
        let _guard = self.locks.drain_log();
        if !wal.closed_segments().iter().any(|n| n == name) {
            self.queued.lock().remove(name);
            return Ok(false);
        }

        let mut values = wal.read_segment_values(name)?;
        meas::sort_by_id_time(&mut values);
        self.pages.append_measurements(&values)?;
        wal.erase(name)?;

        self.queued.lock().remove(name);
        self.drained.fetch_add(1, Ordering::Relaxed);
        debug!("Drained segment {} ({} records)", name, values.len());
        Ok(true)
    }

    /// Writes evicted chunks to pages, or discards them when the log already holds them.
    fn store_evicted(&self, chunks: Vec<Chunk>) -> Result<usize> {
        let count = chunks.len();
        if count > 0 && !self.strategy.uses_wal() {
            self.pages.append_chunks(chunks)?;
        }
        Ok(count)
    }

    fn maintain_memory(&self, now: meas::Time) -> Result<usize> {
        let Some(memory) = self.memory.as_ref() else {
            return Ok(0);
        };
        let _guard = self.locks.drain_memory();
        let mut chunks = memory.evict_expired(now);
        chunks.extend(memory.evict_to_budget());
        self.store_evicted(chunks)
    }
}

/// Schedules drains on the disk-io lane.
#[derive(Clone)]
pub struct Dropper {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dropper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dropper")
            .field("description", &self.description())
            .finish()
    }
}

impl Dropper {
    /// Creates a dropper over the engine's tiers.
    pub fn new(
        strategy: Strategy,
        pool: Arc<WorkerPool>,
        locks: Arc<LockManager>,
        pages: Arc<PageManager>,
        wal: Option<&Arc<WalManager>>,
        memory: Option<Arc<MemoryTier>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                strategy,
                pool,
                locks,
                pages,
                wal: wal.map(Arc::downgrade),
                memory,
                queued: Mutex::new(HashSet::new()),
                drained: AtomicUsize::new(0),
                maintenance_pending: AtomicBool::new(false),
            }),
        }
    }

    fn post_drain(&self, name: &str) -> Result<TaskHandle<Result<bool>>> {
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        self.inner.pool.post(TaskKind::DiskIo, move || {
            let result = inner.drain_segment(&name);
            if let Err(e) = &result {
                error!("Failed to drain segment {}: {}", name, e);
            }
            result
        })
    }

    /// Drains `names` now and waits. Returns the number actually drained.
    ///
    /// # Errors
    ///
    /// Returns the first drain error.
    pub fn drain_segments(&self, names: &[String]) -> Result<usize> {
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            self.inner.queued.lock().insert(name.clone());
            handles.push(self.post_drain(name)?);
        }
        let mut drained = 0;
        for handle in handles {
            if handle.wait()?? {
                drained += 1;
            }
        }
        Ok(drained)
    }

    /// Schedules age and budget eviction unless a run is already queued.
    pub fn schedule_memory_maintenance(&self, now: meas::Time) {
        if self.inner.memory.is_none() || self.inner.maintenance_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let posted = self.inner.pool.post(TaskKind::DiskIo, move || {
            inner.maintenance_pending.store(false, Ordering::Release);
            if let Err(e) = inner.maintain_memory(now) {
                error!("Memory eviction failed: {}", e);
            }
        });
        if posted.is_err() {
            self.inner.maintenance_pending.store(false, Ordering::Release);
        }
    }

    /// Moves every memory chunk into pages and waits.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be written.
    pub fn flush_memory(&self) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .pool
            .post(TaskKind::DiskIo, move || {
                let Some(memory) = inner.memory.as_ref() else {
                    return Ok(0);
                };
                let _guard = inner.locks.drain_memory();
                let chunks = memory.take_all();
                inner.store_evicted(chunks)
            })?
            .wait()?
    }

    /// Moves the `count` oldest closed memory chunks into pages and waits.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be written.
    pub fn drop_memory_part(&self, count: usize) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .pool
            .post(TaskKind::DiskIo, move || {
                let Some(memory) = inner.memory.as_ref() else {
                    return Ok(0);
                };
                let _guard = inner.locks.drain_memory();
                let chunks = memory.take_oldest(count);
                inner.store_evicted(chunks)
            })?
            .wait()?
    }

    /// Queue and drain counters.
    pub fn description(&self) -> DropperDescription {
        DropperDescription {
            queued: self.inner.queued.lock().len(),
            drained: self.inner.drained.load(Ordering::Relaxed),
        }
    }
}

impl SegmentSink for Dropper {
    fn drop_segment(&self, name: &str) {
        if !self.inner.queued.lock().insert(name.to_string()) {
            return;
        }
        if let Err(e) = self.post_drain(name) {
            error!("Cannot schedule drain of {}: {}", name, e);
            self.inner.queued.lock().remove(name);
        }
    }
}
