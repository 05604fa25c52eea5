//! Compaction controllers.
//!
//! A controller decides, during a repack, which measurements of a series
//! survive. The page manager hands it the time-sorted values of each targeted
//! series that fall inside the target range, together with a `keep` mask that
//! starts all `true`. Values outside the target pass through untouched.

use crate::meas::{Id, Measurement, Time, MAX_TIME, MIN_TIME};

/// Series and time range a controller wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTarget {
    /// Targeted series. Empty means every series.
    pub ids: Vec<Id>,
    /// Inclusive lower bound.
    pub from: Time,
    /// Inclusive upper bound.
    pub to: Time,
}

impl CompactionTarget {
    /// Targets every series over all time.
    pub fn all() -> Self {
        Self {
            ids: Vec::new(),
            from: MIN_TIME,
            to: MAX_TIME,
        }
    }

    /// Returns true if `id` is targeted.
    pub fn contains_id(&self, id: Id) -> bool {
        self.ids.is_empty() || self.ids.contains(&id)
    }
}

/// Filter applied to measurements while pages are rewritten.
pub trait CompactionController: Send {
    /// Series and time range handed to [`compact`](Self::compact).
    fn target(&self) -> CompactionTarget {
        CompactionTarget::all()
    }

    /// Clears `keep[i]` for every `values[i]` that must be dropped.
    ///
    /// `values` belong to series `id` and are sorted by time. A controller
    /// may also rewrite values in place.
    fn compact(&mut self, id: Id, values: &mut [Measurement], keep: &mut [bool]);
}

/// Drops measurements of selected series older than a cutoff.
#[derive(Debug, Clone)]
pub struct EraseOlderThan {
    ids: Vec<Id>,
    cutoff: Time,
    erased: usize,
}

impl EraseOlderThan {
    /// Erases measurements of `ids` (every series if empty) with `time < cutoff`.
    pub fn new(ids: Vec<Id>, cutoff: Time) -> Self {
        Self {
            ids,
            cutoff,
            erased: 0,
        }
    }

    /// Number of measurements dropped so far.
    pub fn erased(&self) -> usize {
        self.erased
    }
}

impl CompactionController for EraseOlderThan {
    fn target(&self) -> CompactionTarget {
        CompactionTarget {
            ids: self.ids.clone(),
            from: MIN_TIME,
            to: self.cutoff.saturating_sub(1),
        }
    }

    fn compact(&mut self, _id: Id, values: &mut [Measurement], keep: &mut [bool]) {
        for (m, keep) in values.iter().zip(keep.iter_mut()) {
            if m.time < self.cutoff {
                *keep = false;
                self.erased += 1;
            }
        }
    }
}

/// Applies `controller` to the values of one series.
///
/// `values` must be sorted by time; the result keeps that order.
pub(crate) fn apply(
    controller: &mut dyn CompactionController,
    target: &CompactionTarget,
    id: Id,
    mut values: Vec<Measurement>,
) -> Vec<Measurement> {
    if !target.contains_id(id) {
        return values;
    }
    let start = values.partition_point(|m| m.time < target.from);
    let end = values.partition_point(|m| m.time <= target.to);
    if start >= end {
        return values;
    }

    let mut keep = vec![true; end - start];
    controller.compact(id, &mut values[start..end], &mut keep);

    let mut mask = keep.into_iter();
    let mut index = 0;
    values.retain(|_| {
        let inside = index >= start && index < end;
        index += 1;
        !inside || mask.next().unwrap_or(true)
    });
    values
}
