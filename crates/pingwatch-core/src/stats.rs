//! Running per-session statistics over a stream of probe samples.

use std::collections::VecDeque;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::types::Sample;

/// Default number of successful latencies retained for the running mean.
pub const DEFAULT_HISTORY_WINDOW: usize = 200;

/// Session-scoped counters. `successes + failures == total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    /// Mean over the retained history window, not the whole session.
    pub mean_ms: Option<f64>,
    pub packet_loss_percent: f64,
    pub alert_count: u64,
    pub consecutive_failures: u32,
    pub started_at: Option<DateTime<Local>>,
}

/// Accumulates [`SessionStats`] and the bounded latency history behind the mean.
#[derive(Debug, Clone)]
pub struct StatsTracker {
    stats: SessionStats,
    history: VecDeque<f64>,
    history_cap: usize,
}

impl StatsTracker {
    pub fn new(history_cap: usize) -> Self {
        let history_cap = history_cap.max(1);
        Self {
            stats: SessionStats::default(),
            history: VecDeque::with_capacity(history_cap),
            history_cap,
        }
    }

    /// Sequence number the next recorded sample will carry.
    pub fn next_seq(&self) -> u64 {
        self.stats.total + 1
    }

    pub fn record(&mut self, sample: &Sample) {
        let stats = &mut self.stats;
        if stats.started_at.is_none() {
            stats.started_at = Some(sample.timestamp);
        }
        stats.total += 1;

        match sample.latency_ms {
            Some(latency) => {
                stats.successes += 1;
                stats.consecutive_failures = 0;
                stats.min_ms = Some(stats.min_ms.map_or(latency, |m| m.min(latency)));
                stats.max_ms = Some(stats.max_ms.map_or(latency, |m| m.max(latency)));

                if self.history.len() == self.history_cap {
                    self.history.pop_front();
                }
                self.history.push_back(latency);
                let len = self.history.len() as f64;
                stats.mean_ms = Some(self.history.iter().sum::<f64>() / len);
            }
            None => {
                stats.failures += 1;
                stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
            }
        }

        let loss = stats.failures as f64 / stats.total as f64 * 100.0;
        stats.packet_loss_percent = loss;
    }

    pub fn note_alert(&mut self) {
        self.stats.alert_count += 1;
    }

    /// Zero all counters and clear the history. Episode history lives
    /// elsewhere and is never touched here.
    pub fn reset(&mut self) {
        self.stats = SessionStats::default();
        self.history.clear();
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Retained successful latencies, oldest first.
    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}
