//! Durability log manager.
//!
//! Owns the segment currently accepting writes and the list of closed
//! segments waiting to be drained into pages. The current segment is mirrored
//! in memory so reads never touch a file that is still being written.

use super::segment::{self, SegmentWriter};
use crate::config::WalConfig;
use crate::error::Result;
use crate::manifest::Manifest;
use crate::meas::{
    Flag, Id, Measurement, MinMax, QueryInterval, QueryTimePoint, Statistic, Time, MAX_TIME,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receiver of closed segments.
pub trait SegmentSink: Send + Sync {
    /// Called once for each segment that was closed and awaits draining.
    fn drop_segment(&self, name: &str);
}

#[derive(Debug)]
struct WalState {
    current: Option<SegmentWriter>,
    current_values: Vec<Measurement>,
    closed: Vec<String>,
    next_id: u64,
}

/// Set of log segments.
pub struct WalManager {
    dir: PathBuf,
    config: WalConfig,
    manifest: Arc<Manifest>,
    state: Mutex<WalState>,
    sink: RwLock<Option<Arc<dyn SegmentSink>>>,
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WalManager {
    /// Opens the segments listed in `manifest`.
    ///
    /// Every listed segment is recovered and treated as closed; the first
    /// append opens a fresh segment. Listed segments missing on disk are
    /// dropped from the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery or a manifest update fails.
    pub fn open(dir: &Path, config: WalConfig, manifest: Arc<Manifest>) -> Result<Self> {
        let mut closed = Vec::new();
        let mut next_id = 0u64;
        for name in manifest.wal_list() {
            if let Some(id) = segment::parse_segment_id(&name) {
                next_id = next_id.max(id + 1);
            }
            let path = dir.join(&name);
            match segment::recover_segment(&path) {
                Ok(_) => closed.push(name),
                Err(e) => {
                    warn!("Dropping unreadable segment {}: {}", name, e);
                    let _ = fs::remove_file(&path);
                    manifest.wal_rm(&name)?;
                }
            }
        }
        debug!("Opened {} log segments in {}", closed.len(), dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            manifest,
            state: Mutex::new(WalState {
                current: None,
                current_values: Vec::new(),
                closed,
                next_id,
            }),
            sink: RwLock::new(None),
        })
    }

    /// Installs the receiver of closed segments.
    pub fn set_sink(&self, sink: Arc<dyn SegmentSink>) {
        *self.sink.write() = Some(sink);
    }

    fn notify(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        if let Some(sink) = self.sink.read().as_ref() {
            for name in names {
                sink.drop_segment(name);
            }
        }
    }

    fn close_current(&self, state: &mut WalState) -> Result<Option<String>> {
        let Some(writer) = state.current.take() else {
            return Ok(None);
        };
        state.current_values.clear();
        if writer.is_empty() {
            let name = writer.name().to_string();
            drop(writer);
            self.manifest.wal_rm(&name)?;
            fs::remove_file(self.dir.join(&name))?;
            return Ok(None);
        }
        let name = writer.close()?;
        state.closed.push(name.clone());
        Ok(Some(name))
    }

    /// Appends `m` to the current segment, rotating when it is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be written or created.
    pub fn append(&self, m: &Measurement) -> Result<()> {
        let mut rotated = Vec::new();
        {
            let mut state = self.state.lock();
            if state.current.as_ref().is_some_and(|w| w.is_full()) {
                rotated.extend(self.close_current(&mut state)?);
            }
            if state.current.is_none() {
                let id = state.next_id;
                state.next_id += 1;
                let writer = SegmentWriter::create(
                    &self.dir,
                    id,
                    self.config.segment_capacity,
                    self.config.sync_mode,
                )?;
                self.manifest.wal_add(writer.name())?;
                state.current = Some(writer);
            }
            if let Some(writer) = state.current.as_mut() {
                writer.append(m)?;
            }
            state.current_values.push(*m);
        }
        self.notify(&rotated);
        Ok(())
    }

    /// Closes the current segment and hands every closed segment to the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the current segment cannot be closed.
    pub fn drop_all(&self) -> Result<Vec<String>> {
        let closed = {
            let mut state = self.state.lock();
            self.close_current(&mut state)?;
            state.closed.clone()
        };
        self.notify(&closed);
        Ok(closed)
    }

    /// Closes the current segment and returns the `count` oldest closed ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the current segment cannot be closed.
    pub fn oldest(&self, count: usize) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        if state.closed.len() < count {
            self.close_current(&mut state)?;
        }
        Ok(state.closed.iter().take(count).cloned().collect())
    }

    /// Names of closed segments, oldest first.
    pub fn closed_segments(&self) -> Vec<String> {
        self.state.lock().closed.clone()
    }

    /// Number of segment files, the current one included.
    pub fn files_count(&self) -> usize {
        let state = self.state.lock();
        state.closed.len() + usize::from(state.current.is_some())
    }

    /// Reads the records of a closed segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_segment_values(&self, name: &str) -> Result<Vec<Measurement>> {
        Ok(segment::read_segment(&self.dir.join(name))?.records)
    }

    /// Deletes a drained segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be updated.
    pub fn erase(&self, name: &str) -> Result<()> {
        self.state.lock().closed.retain(|n| n != name);
        self.manifest.wal_rm(name)?;
        if let Err(e) = fs::remove_file(self.dir.join(name)) {
            warn!("Cannot remove drained segment {}: {}", name, e);
        }
        debug!("Erased log segment {}", name);
        Ok(())
    }

    /// Calls `f` for every stored record: closed segments first, then the current one.
    fn for_each(&self, mut f: impl FnMut(&Measurement)) {
        let (closed, current) = {
            let state = self.state.lock();
            (state.closed.clone(), state.current_values.clone())
        };
        for name in &closed {
            match self.read_segment_values(name) {
                Ok(values) => values.iter().for_each(&mut f),
                Err(e) => warn!("Skipping unreadable segment {}: {}", name, e),
            }
        }
        current.iter().for_each(&mut f);
    }

    /// Measurements matching `query`, grouped by id and sorted by time.
    pub fn read_interval(&self, query: &QueryInterval) -> Vec<Measurement> {
        let mut out = Vec::new();
        self.for_each(|m| {
            if m.in_query(query) {
                out.push(*m);
            }
        });
        crate::meas::sort_by_id_time(&mut out);
        out
    }

    /// For each requested id, the latest record with `time <= time_point`.
    pub fn read_time_point(&self, query: &QueryTimePoint) -> HashMap<Id, Measurement> {
        let mut result: HashMap<Id, Measurement> = HashMap::new();
        self.for_each(|m| {
            if m.time > query.time_point || !m.in_ids(&query.ids) || !m.in_flag(query.flag) {
                return;
            }
            let better = result.get(&m.id).map_or(true, |found| m.time >= found.time);
            if better {
                result.insert(m.id, *m);
            }
        });
        result
    }

    /// Latest record per requested id.
    pub fn current_value(&self, ids: &[Id], flag: Flag) -> HashMap<Id, Measurement> {
        self.read_time_point(&QueryTimePoint::new(ids.to_vec(), flag, MAX_TIME))
    }

    /// Time range stored for `id`.
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        let mut range: Option<(Time, Time)> = None;
        self.for_each(|m| {
            if m.id == id {
                range = Some(match range {
                    Some((lo, hi)) => (lo.min(m.time), hi.max(m.time)),
                    None => (m.time, m.time),
                });
            }
        });
        range
    }

    /// Earliest and latest record per series.
    pub fn load_min_max(&self) -> HashMap<Id, MinMax> {
        let mut result: HashMap<Id, MinMax> = HashMap::new();
        self.for_each(|m| {
            result
                .entry(m.id)
                .and_modify(|mm| mm.update(m))
                .or_insert_with(|| MinMax::new(*m));
        });
        result
    }

    /// Aggregate of `id` over `[from, to]`.
    pub fn stat(&self, id: Id, from: Time, to: Time) -> Statistic {
        let mut stat = Statistic::new();
        self.for_each(|m| {
            if m.id == id && m.in_interval(from, to) {
                stat.update(m);
            }
        });
        stat
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(e) = self.close_current(&mut state) {
            warn!("Failed to close log segment on drop: {:?}", e);
        }
    }
}
