//! Monitor configuration: a flat TOML document of independently settable keys.
//!
//! Loading never fails. Each key is validated on its own; a bad value falls
//! back to its default and is reported as a [`ConfigIssue`] next to the
//! effective configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toml::Value;

use crate::detector::DetectorConfig;

/// Non-fatal finding produced while loading a configuration document.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigIssue {
    #[error("cannot read {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("malformed config document, using defaults: {0}")]
    Malformed(String),

    #[error("invalid value for `{key}` ({reason}), using default")]
    InvalidValue { key: String, reason: String },

    #[error("unknown key `{0}` ignored")]
    UnknownKey(String),
}

/// Settings for one monitor instance. Copied, never shared, between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Host to probe.
    pub target: String,
    /// Probe interval in seconds.
    pub interval: f64,
    /// Fixed latency threshold (ms): alerts above it, episodes open at it.
    pub latency_threshold: f64,
    /// Packet-loss alert threshold in percent.
    pub packet_loss_threshold: f64,
    pub deviation_multiplier: f64,
    /// Baseline size required before the statistical criterion is used.
    pub anomaly_min_samples: usize,
    /// Consecutive normal samples needed to close an open episode.
    pub anomaly_min_consecutive_normal: usize,
    /// Minimum affected samples for an episode to be kept.
    pub anomaly_min_pings: usize,
    /// Minimum increase over baseline (percent) for an episode to be kept.
    pub anomaly_min_increase_percent: f64,
    pub enable_alerts: bool,
    pub enable_sound_alerts: bool,
    pub probe_timeout_ms: u64,
    /// Probe records buffered before a flush.
    pub log_buffer_size: usize,
    pub baseline_window: usize,
    pub baseline_refresh_every: usize,
    /// Successful latencies retained for the running mean.
    pub history_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            target: "8.8.8.8".to_string(),
            interval: 1.0,
            latency_threshold: 100.0,
            packet_loss_threshold: 5.0,
            deviation_multiplier: 2.5,
            anomaly_min_samples: 30,
            anomaly_min_consecutive_normal: 10,
            anomaly_min_pings: 5,
            anomaly_min_increase_percent: 50.0,
            enable_alerts: true,
            enable_sound_alerts: true,
            probe_timeout_ms: 2_000,
            log_buffer_size: 10,
            baseline_window: 100,
            baseline_refresh_every: 10,
            history_window: 200,
        }
    }
}

impl MonitorConfig {
    /// Parse a TOML document value by value.
    pub fn from_toml_str(text: &str) -> (Self, Vec<ConfigIssue>) {
        let mut config = Self::default();
        let mut issues = Vec::new();

        let table: toml::Table = match text.parse() {
            Ok(table) => table,
            Err(e) => {
                issues.push(ConfigIssue::Malformed(e.to_string()));
                return (config, issues);
            }
        };

        for (key, value) in &table {
            if let Err(issue) = config.apply(key, value) {
                issues.push(issue);
            }
        }
        (config, issues)
    }

    /// Load from `path`. A missing file yields defaults without issues.
    pub fn load(path: &Path) -> (Self, Vec<ConfigIssue>) {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Self::default(), Vec::new()),
            Err(e) => (
                Self::default(),
                vec![ConfigIssue::Unreadable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }],
            ),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval.max(0.0))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            fixed_threshold_ms: self.latency_threshold,
            deviation_multiplier: self.deviation_multiplier,
            min_samples: self.anomaly_min_samples,
            min_consecutive_normal: self.anomaly_min_consecutive_normal,
            min_pings: self.anomaly_min_pings,
            min_increase_percent: self.anomaly_min_increase_percent,
            baseline_window: self.baseline_window,
            baseline_refresh_every: self.baseline_refresh_every,
        }
    }

    fn apply(&mut self, key: &str, value: &Value) -> Result<(), ConfigIssue> {
        match key {
            "target" => {
                let host = text(key, value)?;
                if host.trim().is_empty() {
                    return Err(invalid(key, "must not be empty"));
                }
                self.target = host.trim().to_string();
            }
            "interval" => self.interval = number(key, value, |v| v > 0.0, "must be > 0")?,
            "latency_threshold" => {
                self.latency_threshold = number(key, value, |v| v > 0.0, "must be > 0")?;
            }
            "packet_loss_threshold" => {
                self.packet_loss_threshold =
                    number(key, value, |v| (0.0..=100.0).contains(&v), "must be in 0..=100")?;
            }
            "deviation_multiplier" => {
                self.deviation_multiplier = number(key, value, |v| v > 0.0, "must be > 0")?;
            }
            "anomaly_min_samples" => self.anomaly_min_samples = count(key, value, 2)?,
            "anomaly_min_consecutive_normal" => {
                self.anomaly_min_consecutive_normal = count(key, value, 1)?;
            }
            "anomaly_min_pings" => self.anomaly_min_pings = count(key, value, 1)?,
            "anomaly_min_increase_percent" => {
                self.anomaly_min_increase_percent =
                    number(key, value, |v| v >= 0.0, "must be >= 0")?;
            }
            "enable_alerts" => self.enable_alerts = flag(key, value)?,
            "enable_sound_alerts" => self.enable_sound_alerts = flag(key, value)?,
            "probe_timeout_ms" => self.probe_timeout_ms = count(key, value, 1)? as u64,
            "log_buffer_size" => self.log_buffer_size = count(key, value, 1)?,
            "baseline_window" => self.baseline_window = count(key, value, 2)?,
            "baseline_refresh_every" => self.baseline_refresh_every = count(key, value, 1)?,
            "history_window" => self.history_window = count(key, value, 1)?,
            _ => return Err(ConfigIssue::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

// ─── Value coercion ───────────────────────────────────────────────

fn invalid(key: &str, reason: impl Into<String>) -> ConfigIssue {
    ConfigIssue::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn text(key: &str, value: &Value) -> Result<String, ConfigIssue> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(key, format!("expected string, found {}", value.type_str())))
}

fn number(
    key: &str,
    value: &Value,
    valid: impl Fn(f64) -> bool,
    rule: &str,
) -> Result<f64, ConfigIssue> {
    let v = match value {
        Value::Float(f) => *f,
        Value::Integer(i) => *i as f64,
        other => {
            return Err(invalid(
                key,
                format!("expected number, found {}", other.type_str()),
            ));
        }
    };
    if !v.is_finite() || !valid(v) {
        return Err(invalid(key, rule));
    }
    Ok(v)
}

fn count(key: &str, value: &Value, min: usize) -> Result<usize, ConfigIssue> {
    let Some(i) = value.as_integer() else {
        return Err(invalid(
            key,
            format!("expected integer, found {}", value.type_str()),
        ));
    };
    usize::try_from(i)
        .ok()
        .filter(|n| *n >= min)
        .ok_or_else(|| invalid(key, format!("must be >= {min}")))
}

fn flag(key: &str, value: &Value) -> Result<bool, ConfigIssue> {
    value
        .as_bool()
        .ok_or_else(|| invalid(key, format!("expected boolean, found {}", value.type_str())))
}
