//! Rolling baseline of recent normal latencies with a cached (mean, stdev).
//!
//! The cache is refreshed at most every `refresh_every` insertions so the
//! O(n) recomputation does not run on every sample.

use std::collections::VecDeque;

use crate::types::BaselineSummary;

/// Default number of normal latencies kept.
pub const DEFAULT_BASELINE_WINDOW: usize = 100;

/// Default number of insertions between cache refreshes.
pub const DEFAULT_REFRESH_EVERY: usize = 10;

// ─── Baseline ───────────────────────────────────────────────────────

/// Bounded FIFO of normal latencies (milliseconds).
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    window: VecDeque<f64>,
    capacity: usize,
    refresh_every: usize,
    /// Cached (mean, sample stdev).
    cached: Option<(f64, f64)>,
    /// Insertions since the cache was last computed.
    since_refresh: usize,
}

impl Baseline {
    /// Create with defaults: 100 values, refresh every 10 insertions.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_BASELINE_WINDOW, DEFAULT_REFRESH_EVERY)
    }

    pub fn with_config(capacity: usize, refresh_every: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            refresh_every: refresh_every.max(1),
            cached: None,
            since_refresh: 0,
        }
    }

    /// Append a normal latency, evicting the oldest when full.
    pub fn observe(&mut self, latency_ms: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(latency_ms);
        self.since_refresh += 1;
    }

    /// Mean and sample standard deviation (n-1 denominator).
    ///
    /// Returns `None` with fewer than 2 values. The cached pair is reused
    /// until `refresh_every` insertions have happened since it was computed.
    pub fn mean_and_stdev(&mut self) -> Option<(f64, f64)> {
        if self.window.len() < 2 {
            return None;
        }
        if self.cached.is_none() || self.since_refresh >= self.refresh_every {
            self.cached = Some(mean_and_sample_stdev(self.window.iter().copied()));
            self.since_refresh = 0;
        }
        self.cached
    }

    /// Mean/min/max over the most recent `last` values, if at least
    /// `min_required` values exist.
    pub fn recent_summary(&self, last: usize, min_required: usize) -> Option<BaselineSummary> {
        let len = self.window.len();
        if len < min_required || len == 0 {
            return None;
        }
        let recent = self.window.iter().skip(len.saturating_sub(last)).copied();
        let (mut sum, mut count) = (0.0, 0usize);
        let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
        for v in recent {
            sum += v;
            count += 1;
            min = min.min(v);
            max = max.max(v);
        }
        Some(BaselineSummary {
            avg_ms: sum / count as f64,
            min_ms: min,
            max_ms: max,
        })
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Whether a cached pair currently exists (it may be stale).
    pub fn has_cache(&self) -> bool {
        self.cached.is_some()
    }
}

impl Default for Baseline {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Statistics ─────────────────────────────────────────────────────

/// Two-pass mean and n-1 standard deviation. Caller guarantees n >= 2.
fn mean_and_sample_stdev(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let (sum, n) = values.clone().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    let nf = n as f64;
    let mean = sum / nf;
    let sq: f64 = values.map(|v| (v - mean).powi(2)).sum();
    (mean, (sq / (nf - 1.0)).sqrt())
}
