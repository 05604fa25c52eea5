//! In-memory tier.
//!
//! Each series owns a vector of chunks ordered by time; only the last one is
//! open for writes. Closed chunks leave RAM through age-based eviction
//! ([`MemoryTier::evict_older_than`]), budget-based eviction
//! ([`MemoryTier::evict_to_budget`]) or an explicit flush
//! ([`MemoryTier::take_all`]). The open chunk of a series is never evicted.
//!
//! Every series also tracks a sync point: the newest time that is known to be
//! held by the disk tiers. Reads under the `Cache` strategy split at it.

use crate::chunk::Chunk;
use crate::config::MemoryConfig;
use crate::meas::{
    self, Id, Measurement, MinMax, QueryInterval, QueryTimePoint, Statistic, Time,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug)]
struct Series {
    chunks: Vec<Chunk>,
    sync_point: Time,
}

impl Series {
    fn closed_count(&self) -> usize {
        match self.chunks.last() {
            Some(last) if !last.is_readonly() => self.chunks.len() - 1,
            _ => self.chunks.len(),
        }
    }
}

/// Counters describing the memory tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryDescription {
    /// Series held in memory.
    pub series: usize,
    /// Chunks held in memory.
    pub chunks: usize,
    /// Bytes held by chunk buffers.
    pub resident_bytes: usize,
}

/// Per-series chunk vectors held in RAM.
#[derive(Debug)]
pub struct MemoryTier {
    config: MemoryConfig,
    series: RwLock<HashMap<Id, Series>>,
    resident: AtomicUsize,
}

impl MemoryTier {
    /// Creates an empty tier.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            series: RwLock::new(HashMap::new()),
            resident: AtomicUsize::new(0),
        }
    }

    /// Tier configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Appends `m` to the open chunk of its series.
    ///
    /// Returns true if a new chunk had to be opened.
    pub fn append(&self, m: &Measurement) -> bool {
        let mut series = self.series.write();
        let entry = series.entry(m.id).or_insert_with(|| Series {
            chunks: Vec::new(),
            sync_point: m.time.saturating_sub(1),
        });

        if let Some(last) = entry.chunks.last_mut() {
            if last.append(m) {
                return false;
            }
            last.close();
        }

        let chunk = Chunk::create(*m, self.config.chunk_capacity);
        self.resident.fetch_add(chunk.resident_bytes(), Ordering::Relaxed);
        entry.chunks.push(chunk);
        true
    }

    fn release(&self, chunks: &[Chunk]) {
        let bytes: usize = chunks.iter().map(Chunk::resident_bytes).sum();
        self.resident.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Removes every closed chunk whose newest time is `< cutoff`.
    pub fn evict_older_than(&self, cutoff: Time) -> Vec<Chunk> {
        let mut evicted = Vec::new();
        {
            let mut series = self.series.write();
            for entry in series.values_mut() {
                let closed = entry.closed_count();
                let expired = entry.chunks[..closed]
                    .iter()
                    .take_while(|c| c.header().max_time < cutoff)
                    .count();
                for chunk in entry.chunks.drain(..expired) {
                    entry.sync_point = entry.sync_point.max(chunk.header().max_time);
                    evicted.push(chunk);
                }
            }
        }
        self.release(&evicted);
        if !evicted.is_empty() {
            debug!("Evicted {} chunks older than {}", evicted.len(), cutoff);
        }
        evicted
    }

    /// Evicts chunks older than `now - retention_window`, if a window is set.
    pub fn evict_expired(&self, now: Time) -> Vec<Chunk> {
        match self.config.retention_window {
            Some(window) => self.evict_older_than(now.saturating_sub(window)),
            None => Vec::new(),
        }
    }

    /// Removes the `count` closed chunks with the oldest newest-time, across series.
    pub fn take_oldest(&self, count: usize) -> Vec<Chunk> {
        let mut taken = Vec::new();
        {
            let mut series = self.series.write();
            while taken.len() < count {
                let oldest = series
                    .iter()
                    .filter(|(_, s)| s.closed_count() > 0)
                    .map(|(id, s)| (s.chunks[0].header().max_time, *id))
                    .min();
                let Some((_, id)) = oldest else {
                    break;
                };
                if let Some(entry) = series.get_mut(&id) {
                    let chunk = entry.chunks.remove(0);
                    entry.sync_point = entry.sync_point.max(chunk.header().max_time);
                    taken.push(chunk);
                }
            }
        }
        self.release(&taken);
        taken
    }

    /// Evicts the oldest closed chunks until the resident bytes fit the budget.
    pub fn evict_to_budget(&self) -> Vec<Chunk> {
        let mut evicted = Vec::new();
        while self.resident_bytes() > self.config.max_resident_bytes {
            let next = self.take_oldest(1);
            if next.is_empty() {
                break;
            }
            evicted.extend(next);
        }
        if !evicted.is_empty() {
            debug!(
                "Evicted {} chunks to fit {} bytes",
                evicted.len(),
                self.config.max_resident_bytes
            );
        }
        evicted
    }

    /// Closes and removes every chunk.
    pub fn take_all(&self) -> Vec<Chunk> {
        let mut taken = Vec::new();
        {
            let mut series = self.series.write();
            for entry in series.values_mut() {
                for mut chunk in entry.chunks.drain(..) {
                    chunk.close();
                    entry.sync_point = entry.sync_point.max(chunk.header().max_time);
                    taken.push(chunk);
                }
            }
        }
        self.release(&taken);
        taken
    }

    /// Drops every chunk of `id`, the open one included.
    ///
    /// Only valid when the disk tiers hold the same measurements.
    pub fn discard_series(&self, id: Id) -> usize {
        let discarded: Vec<Chunk> = {
            let mut series = self.series.write();
            let Some(entry) = series.get_mut(&id) else {
                return 0;
            };
            let chunks: Vec<Chunk> = entry.chunks.drain(..).collect();
            for chunk in &chunks {
                entry.sync_point = entry.sync_point.max(chunk.header().max_time);
            }
            chunks
        };
        self.release(&discarded);
        discarded.len()
    }

    /// Newest time of `id` known to be held on disk, or None if memory never saw `id`.
    pub fn sync_point(&self, id: Id) -> Option<Time> {
        self.series.read().get(&id).map(|s| s.sync_point)
    }

    /// Bytes held by chunk buffers.
    pub fn resident_bytes(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    /// Measurements matching `query`, grouped by id and sorted by time.
    pub fn read_interval(&self, query: &QueryInterval) -> Vec<Measurement> {
        let series = self.series.read();
        let mut out = Vec::new();
        let mut visit = |entry: &Series| {
            for chunk in &entry.chunks {
                out.extend(chunk.read_interval(query));
            }
        };
        if query.ids.is_empty() {
            series.values().for_each(&mut visit);
        } else {
            query.ids.iter().filter_map(|id| series.get(id)).for_each(&mut visit);
        }
        drop(series);
        meas::sort_by_id_time(&mut out);
        out
    }

    /// For each requested id (every held id when `ids` is empty), the latest
    /// measurement with `time <= time_point`.
    pub fn read_time_point(&self, query: &QueryTimePoint) -> HashMap<Id, Measurement> {
        let series = self.series.read();
        let mut result = HashMap::new();
        let mut visit = |id: Id, entry: &Series| {
            let best = entry
                .chunks
                .iter()
                .rev()
                .filter_map(|c| c.value_before(query.time_point, query.flag))
                .max_by_key(|m| m.time);
            if let Some(m) = best {
                result.insert(id, m);
            }
        };
        if query.ids.is_empty() {
            series.iter().for_each(|(id, entry)| visit(*id, entry));
        } else {
            for id in &query.ids {
                if let Some(entry) = series.get(id) {
                    visit(*id, entry);
                }
            }
        }
        result
    }

    /// Time range held for `id`.
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        let series = self.series.read();
        let entry = series.get(&id)?;
        entry
            .chunks
            .iter()
            .map(|c| (c.header().min_time, c.header().max_time))
            .reduce(|(lo, hi), (min, max)| (lo.min(min), hi.max(max)))
    }

    /// Earliest and latest measurement per series.
    pub fn load_min_max(&self) -> HashMap<Id, MinMax> {
        let series = self.series.read();
        let mut result = HashMap::new();
        for (id, entry) in series.iter() {
            let mut mm: Option<MinMax> = None;
            for m in entry.chunks.iter().flat_map(|c| c.reader()) {
                match mm.as_mut() {
                    Some(found) => found.update(&m),
                    None => mm = Some(MinMax::new(m)),
                }
            }
            if let Some(mm) = mm {
                result.insert(*id, mm);
            }
        }
        result
    }

    /// Aggregate of `id` over `[from, to]`.
    pub fn stat(&self, id: Id, from: Time, to: Time) -> Statistic {
        let series = self.series.read();
        let mut stat = Statistic::new();
        let Some(entry) = series.get(&id) else {
            return stat;
        };
        for chunk in &entry.chunks {
            let header = chunk.header();
            if !header.overlaps(from, to) {
                continue;
            }
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

    /// Counters for [`Engine::description`](crate::engine::Engine::description).
    pub fn description(&self) -> MemoryDescription {
        let series = self.series.read();
        MemoryDescription {
            series: series.len(),
            chunks: series.values().map(|s| s.chunks.len()).sum(),
            resident_bytes: self.resident_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(capacity: usize, budget: usize) -> MemoryTier {
        MemoryTier::new(MemoryConfig {
            chunk_capacity: capacity,
            max_resident_bytes: budget,
            retention_window: Some(100),
        })
    }

    fn fill(tier: &MemoryTier, id: Id, times: std::ops::Range<u64>) {
        for t in times {
            tier.append(&Measurement::new(id, t, (t * 7 % 13) as f64));
        }
    }

    #[test]
    fn test_append_rotates_chunks() {
        let tier = tier(32, usize::MAX);
        fill(&tier, 1, 0..500);
        let desc = tier.description();
        assert_eq!(desc.series, 1);
        assert!(desc.chunks > 1);
        assert!(desc.resident_bytes > 0);

        let values = tier.read_interval(&QueryInterval::new(vec![1], 0, 0, 1000));
        assert_eq!(values.len(), 500);
        assert!(values.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[test]
    fn test_age_eviction_never_takes_open_chunk() {
        let tier = tier(32, usize::MAX);
        fill(&tier, 1, 0..500);
        let evicted = tier.evict_older_than(u64::MAX);
        assert!(!evicted.is_empty());
        assert!(evicted.iter().all(|c| c.is_readonly()));
        assert_eq!(tier.description().chunks, 1);

        let left = tier.read_interval(&QueryInterval::new(vec![1], 0, 0, 1000));
        let evicted_count: u32 = evicted.iter().map(|c| c.header().count).sum();
        assert_eq!(left.len() + evicted_count as usize, 500);
    }

    #[test]
    fn test_age_eviction_cutoff() {
        let tier = tier(32, usize::MAX);
        fill(&tier, 1, 0..500);
        let cutoff = 250;
        let evicted = tier.evict_older_than(cutoff);
        assert!(evicted.iter().all(|c| c.header().max_time < cutoff));
        let left = tier.read_interval(&QueryInterval::new(vec![1], 0, 0, 1000));
        let first_left = left[0].time;
        assert!(evicted.iter().all(|c| c.header().max_time < first_left));
        assert_eq!(tier.sync_point(1), Some(first_left - 1));
    }

    #[test]
    fn test_evict_expired_uses_window() {
        let tier = tier(32, usize::MAX);
        fill(&tier, 1, 0..500);
        let evicted = tier.evict_expired(400);
        assert!(!evicted.is_empty());
        assert!(evicted.iter().all(|c| c.header().max_time < 300));
    }

    #[test]
    fn test_budget_eviction_takes_globally_oldest() {
        let unbounded = tier(32, usize::MAX);
        fill(&unbounded, 1, 0..200);
        fill(&unbounded, 2, 1000..1200);
        let budget = unbounded.resident_bytes() / 2;

        let tier = tier(32, budget);
        fill(&tier, 1, 0..200);
        fill(&tier, 2, 1000..1200);
        let evicted = tier.evict_to_budget();
        assert!(!evicted.is_empty());
        assert!(tier.resident_bytes() <= budget);
        // Series 1 is older and goes first.
        assert_eq!(evicted[0].id(), 1);
        assert!(evicted
            .windows(2)
            .all(|w| w[0].header().max_time <= w[1].header().max_time));
    }

    #[test]
    fn test_take_all_closes_everything() {
        let tier = tier(1024, usize::MAX);
        fill(&tier, 1, 0..10);
        fill(&tier, 2, 0..10);
        let taken = tier.take_all();
        assert_eq!(taken.len(), 2);
        assert!(taken.iter().all(|c| c.is_readonly()));
        assert_eq!(tier.resident_bytes(), 0);
        assert_eq!(tier.sync_point(1), Some(9));
        assert!(tier.read_interval(&QueryInterval::new(vec![], 0, 0, 100)).is_empty());
    }

    #[test]
    fn test_discard_series() {
        let tier = tier(32, usize::MAX);
        fill(&tier, 1, 0..100);
        fill(&tier, 2, 0..100);
        assert!(tier.discard_series(1) > 0);
        assert_eq!(tier.sync_point(1), Some(99));
        assert!(tier.read_interval(&QueryInterval::new(vec![1], 0, 0, 1000)).is_empty());
        assert_eq!(tier.read_interval(&QueryInterval::new(vec![2], 0, 0, 1000)).len(), 100);
        assert_eq!(tier.discard_series(3), 0);
    }

    #[test]
    fn test_time_point_and_stat() {
        let tier = tier(32, usize::MAX);
        fill(&tier, 1, 10..100);
        let q = QueryTimePoint::new(vec![1, 2], 0, 50);
        let result = tier.read_time_point(&q);
        assert_eq!(result[&1].time, 50);
        assert!(!result.contains_key(&2));

        assert_eq!(tier.min_max_time(1), Some((10, 99)));
        assert_eq!(tier.stat(1, 20, 29).count, 10);
        assert_eq!(tier.load_min_max()[&1].max.time, 99);
    }

    #[test]
    fn test_time_point_without_ids_covers_every_series() {
        let tier = tier(32, usize::MAX);
        fill(&tier, 1, 10..100);
        fill(&tier, 2, 60..70);
        let result = tier.read_time_point(&QueryTimePoint::new(Vec::new(), 0, 65));
        assert_eq!(result.len(), 2);
        assert_eq!(result[&1].time, 65);
        assert_eq!(result[&2].time, 65);

        let early = tier.read_time_point(&QueryTimePoint::new(Vec::new(), 0, 30));
        assert_eq!(early.len(), 1);
        assert_eq!(early[&1].time, 30);
    }
}
