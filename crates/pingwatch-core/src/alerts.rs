//! Per-tick alert evaluation, independent of episode detection.

use crate::config::MonitorConfig;
use crate::stats::SessionStats;
use crate::types::{Alert, Sample};

/// Consecutive failures after which a connectivity alert fires.
pub const CONNECTION_LOST_AFTER: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    pub enabled: bool,
    pub latency_threshold_ms: f64,
    pub packet_loss_threshold_percent: f64,
}

impl From<&MonitorConfig> for AlertPolicy {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            enabled: config.enable_alerts,
            latency_threshold_ms: config.latency_threshold,
            packet_loss_threshold_percent: config.packet_loss_threshold,
        }
    }
}

/// Evaluates alerts for each recorded sample.
///
/// Latency and connectivity alerts are level-triggered: they fire on every
/// qualifying sample. The packet-loss alert is edge-triggered and re-arms
/// once the running loss drops back to the threshold or below.
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    policy: AlertPolicy,
    loss_alert_active: bool,
}

impl AlertEvaluator {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            loss_alert_active: false,
        }
    }

    /// `stats` must already include `sample`.
    pub fn evaluate(&mut self, sample: &Sample, stats: &SessionStats) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let policy = &self.policy;

        match sample.latency_ms {
            Some(latency) if latency > policy.latency_threshold_ms => {
                alerts.push(Alert::HighLatency {
                    latency_ms: latency,
                    threshold_ms: policy.latency_threshold_ms,
                });
            }
            Some(_) => {}
            None if stats.consecutive_failures >= CONNECTION_LOST_AFTER => {
                alerts.push(Alert::ConnectionLost {
                    consecutive_failures: stats.consecutive_failures,
                });
            }
            None => {}
        }

        let loss = stats.packet_loss_percent;
        if loss > policy.packet_loss_threshold_percent {
            if !self.loss_alert_active {
                self.loss_alert_active = true;
                alerts.push(Alert::PacketLoss {
                    loss_percent: loss,
                    threshold_percent: policy.packet_loss_threshold_percent,
                });
            }
        } else {
            self.loss_alert_active = false;
        }

        if !policy.enabled {
            alerts.clear();
        }
        alerts
    }

    /// Re-arm edge-triggered alerts (used when session stats are reset).
    pub fn reset(&mut self) {
        self.loss_alert_active = false;
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }
}
