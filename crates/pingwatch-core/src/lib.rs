//! Latency statistics and anomaly-episode detection.
//!
//! Pure logic only: samples come in, statistics, alerts and episode events
//! come out. Probing, persistence and scheduling live in `pingwatch-runtime`.

pub mod alerts;
pub mod baseline;
pub mod config;
pub mod detector;
pub mod stats;
pub mod types;

pub use alerts::{AlertEvaluator, AlertPolicy};
pub use baseline::Baseline;
pub use config::{ConfigIssue, MonitorConfig};
pub use detector::{AnomalyDetector, DetectorConfig, DetectorEvent, DiscardReason, EpisodeOutcome};
pub use stats::{SessionStats, StatsTracker};
pub use types::{Alert, AnomalyEpisode, BaselineSummary, DetectionMethod, ProbeStatus, Sample};
