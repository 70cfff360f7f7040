//! The process-wide histogram table.
//!
//! One fixed-length vector of signed counters per function identifier,
//! lazily created on the first exit probe for that identifier and never
//! removed. Bucket `i` covers `[intervals[i], intervals[i + 1])`; the last
//! bucket has no upper bound and doubles as the overflow bucket.
//!
//! A single mutex serialises every increment and gives the flusher a
//! consistent snapshot. The steady-state critical section is one binary
//! search and one add.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Buckets per histogram. The last one is the overflow bucket.
pub const BUCKETS: usize = 1024;
/// Default bucket width, in units of the configured clock.
pub const DEFAULT_STEP: i64 = 5000;

pub(crate) struct Histograms {
    intervals: Vec<i64>,
    table: Mutex<HashMap<u64, Vec<i64>>>,
}

impl Histograms {
    pub(crate) fn new(step: i64) -> Self {
        Self {
            intervals: (0..BUCKETS as i64).map(|i| i * step).collect(),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Count one exit of `fid` whose cost was `delta`.
    pub(crate) fn record(&self, fid: u64, delta: i64) {
        let i = bucket_index(&self.intervals, delta);
        let mut lk = self.table.lock();
        let hist = lk.entry(fid).or_insert_with(|| vec![0; BUCKETS]);
        hist[i] += 1;
    }

    /// Run `f` against the table while holding its lock; this is how the
    /// flusher sees a consistent snapshot.
    pub(crate) fn with_table<R>(&self, f: impl FnOnce(&HashMap<u64, Vec<i64>>) -> R) -> R {
        f(&self.table.lock())
    }

    #[cfg(test)]
    fn intervals(&self) -> &[i64] {
        &self.intervals
    }
}

/// The largest `i` with `intervals[i] <= delta`, clamped to the bucket
/// range. Binary search rather than division: nothing here may assume the
/// bucket widths stay uniform.
fn bucket_index(intervals: &[i64], delta: i64) -> usize {
    intervals
        .partition_point(|&lo| lo <= delta)
        .saturating_sub(1)
        .min(BUCKETS - 1)
}
