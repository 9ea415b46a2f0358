use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Sample ───────────────────────────────────────────────────────

/// One probe result. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// 1-based position of this sample within the current session.
    pub seq: u64,
    pub timestamp: DateTime<Local>,
    /// Round-trip latency in milliseconds; `None` when the probe failed.
    pub latency_ms: Option<f64>,
    pub target: String,
}

impl Sample {
    pub fn is_success(&self) -> bool {
        self.latency_ms.is_some()
    }

    pub fn status(&self) -> ProbeStatus {
        if self.is_success() {
            ProbeStatus::Success
        } else {
            ProbeStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Success,
    Failed,
}

impl ProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Detection method ─────────────────────────────────────────────

/// Criterion that opened an anomaly episode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Latency reached the absolute threshold.
    FixedThreshold { threshold_ms: f64 },
    /// Latency exceeded `mean + multiplier * stdev` of the baseline.
    Deviation { mean_ms: f64, limit_ms: f64 },
}

impl DetectionMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FixedThreshold { .. } => "fixed threshold",
            Self::Deviation { .. } => "statistical deviation",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedThreshold { threshold_ms } => {
                write!(f, "fixed threshold ({threshold_ms}ms)")
            }
            Self::Deviation { mean_ms, limit_ms } => write!(
                f,
                "statistical deviation (mean={mean_ms:.1}ms, limit={limit_ms:.1}ms)"
            ),
        }
    }
}

// ─── Anomaly episode ──────────────────────────────────────────────

/// Latency summary of the normal samples that preceded an episode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineSummary {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// A closed period of anomalous latency with its summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEpisode {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub duration_secs: f64,
    pub samples_affected: usize,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    /// `None` when fewer than the required pre-episode normal samples existed.
    pub baseline: Option<BaselineSummary>,
    /// Increase of the episode average over the baseline average, in percent.
    pub increase_percent: Option<f64>,
    pub method: DetectionMethod,
    pub start_index: u64,
}

// ─── Alerts ───────────────────────────────────────────────────────

/// Per-tick alert, independent of episode detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    HighLatency { latency_ms: f64, threshold_ms: f64 },
    ConnectionLost { consecutive_failures: u32 },
    PacketLoss { loss_percent: f64, threshold_percent: f64 },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighLatency {
                latency_ms,
                threshold_ms,
            } => write!(
                f,
                "high latency: {latency_ms:.1}ms (threshold {threshold_ms:.0}ms)"
            ),
            Self::ConnectionLost {
                consecutive_failures,
            } => write!(
                f,
                "connection lost: {consecutive_failures} consecutive failures"
            ),
            Self::PacketLoss {
                loss_percent,
                threshold_percent,
            } => write!(
                f,
                "packet loss {loss_percent:.1}% above {threshold_percent:.1}%"
            ),
        }
    }
}
