//! Anomaly episode state machine.
//!
//! Two states, `Normal` and `InAnomaly`. A successful sample is anomalous when
//! it reaches the fixed threshold, or (once the baseline holds enough values)
//! when it exceeds `mean + multiplier * stdev`. An open episode only closes
//! after a run of consecutive normal samples; a shorter run followed by a new
//! anomalous sample is folded back into the episode so one outage is not split
//! into many. Closed episodes pass a retention filter before being kept.
//!
//! [`AnomalyDetector::observe`] is the single place where state changes.

use chrono::{DateTime, Local};

use crate::baseline::Baseline;
use crate::types::{AnomalyEpisode, DetectionMethod};

/// Number of most recent baseline values summarized when an episode closes.
pub const BASELINE_SUMMARY_WINDOW: usize = 50;

/// Baseline values required before a pre-episode summary is computed.
pub const BASELINE_SUMMARY_MIN: usize = 10;

// ─── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub fixed_threshold_ms: f64,
    pub deviation_multiplier: f64,
    /// Baseline size required before the statistical criterion is evaluated.
    pub min_samples: usize,
    pub min_consecutive_normal: usize,
    pub min_pings: usize,
    pub min_increase_percent: f64,
    pub baseline_window: usize,
    pub baseline_refresh_every: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        crate::config::MonitorConfig::default().detector_config()
    }
}

// ─── Events ─────────────────────────────────────────────────────────

/// Why a closed episode was not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Fewer affected samples than `min_pings`.
    TooFewSamples { affected: usize, required: usize },
    /// Average stayed below the fixed threshold and the increase was too small.
    MarginalBlip,
    /// Increase over baseline below `min_increase_percent`.
    BelowIncrease,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewSamples { affected, required } => {
                write!(f, "only {affected} sample(s) affected, {required} required")
            }
            Self::MarginalBlip => f.write_str("below fixed threshold and increase too small"),
            Self::BelowIncrease => f.write_str("increase over baseline too small"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeOutcome {
    Retained(AnomalyEpisode),
    Discarded {
        episode: AnomalyEpisode,
        reason: DiscardReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// `Normal -> InAnomaly`.
    Opened {
        method: DetectionMethod,
        start_index: u64,
    },
    /// `InAnomaly -> Normal`, with the filtered result.
    Closed(EpisodeOutcome),
}

// ─── State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct OpenEpisode {
    started_at: DateTime<Local>,
    start_index: u64,
    method: DetectionMethod,
    /// Latencies belonging to the episode.
    window: Vec<f64>,
    /// Normal latencies seen since the last anomalous one.
    confirmation: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
enum DetectorState {
    Normal,
    InAnomaly(OpenEpisode),
}

// ─── AnomalyDetector ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    config: DetectorConfig,
    baseline: Baseline,
    state: DetectorState,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let baseline = Baseline::with_config(config.baseline_window, config.baseline_refresh_every);
        Self {
            config,
            baseline,
            state: DetectorState::Normal,
        }
    }

    /// Feed one successful latency. Failed probes must not be fed here.
    ///
    /// `index` is the session sequence number of the sample.
    pub fn observe(
        &mut self,
        latency_ms: f64,
        at: DateTime<Local>,
        index: u64,
    ) -> Option<DetectorEvent> {
        let verdict = self.classify(latency_ms);
        let state = std::mem::replace(&mut self.state, DetectorState::Normal);

        let (next, event) = match (state, verdict) {
            (DetectorState::Normal, None) => {
                self.baseline.observe(latency_ms);
                (DetectorState::Normal, None)
            }
            (DetectorState::Normal, Some(method)) => {
                let episode = OpenEpisode {
                    started_at: at,
                    start_index: index,
                    method,
                    window: vec![latency_ms],
                    confirmation: Vec::new(),
                };
                let event = DetectorEvent::Opened {
                    method,
                    start_index: index,
                };
                (DetectorState::InAnomaly(episode), Some(event))
            }
            (DetectorState::InAnomaly(mut episode), Some(_)) => {
                // A brief improvement, not a recovery.
                episode.window.append(&mut episode.confirmation);
                episode.window.push(latency_ms);
                (DetectorState::InAnomaly(episode), None)
            }
            (DetectorState::InAnomaly(mut episode), None) => {
                episode.confirmation.push(latency_ms);
                if episode.confirmation.len() >= self.config.min_consecutive_normal {
                    let outcome = self.close(episode, at);
                    (DetectorState::Normal, Some(DetectorEvent::Closed(outcome)))
                } else {
                    (DetectorState::InAnomaly(episode), None)
                }
            }
        };

        self.state = next;
        event
    }

    pub fn is_in_anomaly(&self) -> bool {
        matches!(self.state, DetectorState::InAnomaly(_))
    }

    /// Samples in the currently open episode (0 when normal).
    pub fn open_episode_len(&self) -> usize {
        match &self.state {
            DetectorState::Normal => 0,
            DetectorState::InAnomaly(episode) => episode.window.len(),
        }
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Fixed threshold first; it short-circuits the statistical check.
    fn classify(&mut self, latency_ms: f64) -> Option<DetectionMethod> {
        if latency_ms >= self.config.fixed_threshold_ms {
            return Some(DetectionMethod::FixedThreshold {
                threshold_ms: self.config.fixed_threshold_ms,
            });
        }
        if self.baseline.len() < self.config.min_samples {
            return None;
        }
        let (mean, stdev) = self.baseline.mean_and_stdev()?;
        let limit = mean + self.config.deviation_multiplier * stdev;
        (latency_ms > limit).then_some(DetectionMethod::Deviation {
            mean_ms: mean,
            limit_ms: limit,
        })
    }

    fn close(&self, episode: OpenEpisode, at: DateTime<Local>) -> EpisodeOutcome {
        let window = &episode.window;
        let count = window.len();
        let avg = window.iter().sum::<f64>() / count as f64;
        let min = window.iter().copied().fold(f64::INFINITY, f64::min);
        let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        // Anomalous samples never enter the baseline, so its tail is pre-episode.
        let baseline = self
            .baseline
            .recent_summary(BASELINE_SUMMARY_WINDOW, BASELINE_SUMMARY_MIN);
        let increase_percent = baseline
            .filter(|b| b.avg_ms > 0.0)
            .map(|b| (avg - b.avg_ms) / b.avg_ms * 100.0);

        let duration_secs = (at - episode.started_at).num_milliseconds() as f64 / 1000.0;

        let record = AnomalyEpisode {
            started_at: episode.started_at,
            ended_at: at,
            duration_secs,
            samples_affected: count,
            avg_latency_ms: avg,
            min_latency_ms: min,
            max_latency_ms: max,
            baseline,
            increase_percent,
            method: episode.method,
            start_index: episode.start_index,
        };

        match self.retention(&record) {
            Ok(()) => EpisodeOutcome::Retained(record),
            Err(reason) => EpisodeOutcome::Discarded {
                episode: record,
                reason,
            },
        }
    }

    fn retention(&self, episode: &AnomalyEpisode) -> Result<(), DiscardReason> {
        let cfg = &self.config;
        if episode.samples_affected < cfg.min_pings {
            return Err(DiscardReason::TooFewSamples {
                affected: episode.samples_affected,
                required: cfg.min_pings,
            });
        }
        // An undefined increase (no baseline yet) does not block retention.
        if let Some(increase) = episode.increase_percent {
            if increase < cfg.min_increase_percent {
                if episode.avg_latency_ms < cfg.fixed_threshold_ms {
                    return Err(DiscardReason::MarginalBlip);
                }
                return Err(DiscardReason::BelowIncrease);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid local time")
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            fixed_threshold_ms: 100.0,
            deviation_multiplier: 2.5,
            min_samples: 30,
            min_consecutive_normal: 10,
            min_pings: 5,
            min_increase_percent: 50.0,
            baseline_window: 100,
            baseline_refresh_every: 10,
        }
    }

    /// Feed latencies one second apart; returns every event with its index.
    fn feed(det: &mut AnomalyDetector, latencies: &[f64]) -> Vec<(u64, DetectorEvent)> {
        let mut events = Vec::new();
        for (i, &latency) in latencies.iter().enumerate() {
            let index = i as u64 + 1;
            let at = t0() + TimeDelta::seconds(i as i64);
            if let Some(ev) = det.observe(latency, at, index) {
                events.push((index, ev));
            }
        }
        events
    }

    fn retained(events: &[(u64, DetectorEvent)]) -> Vec<AnomalyEpisode> {
        events
            .iter()
            .filter_map(|(_, ev)| match ev {
                DetectorEvent::Closed(EpisodeOutcome::Retained(e)) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    const SCENARIO: [f64; 17] = [
        20.0, 25.0, 22.0, 150.0, 160.0, 155.0, 140.0, 30.0, 28.0, 31.0, 29.0, 33.0, 27.0, 30.0,
        32.0, 31.0, 29.0,
    ];

    // ── fixed-threshold episode ─────────────────────────────────────

    #[test]
    fn scenario_fixed_threshold_single_episode() {
        let mut det = AnomalyDetector::new(DetectorConfig {
            min_consecutive_normal: 9,
            min_pings: 4,
            ..config()
        });
        let events = feed(&mut det, &SCENARIO);

        let opened: Vec<_> = events
            .iter()
            .filter(|(_, ev)| matches!(ev, DetectorEvent::Opened { .. }))
            .collect();
        assert_eq!(opened.len(), 1);

        let episodes = retained(&events);
        assert_eq!(episodes.len(), 1);
        let ep = &episodes[0];
        assert_eq!(ep.samples_affected, 4);
        assert_eq!(ep.method.kind(), "fixed threshold");
        assert_eq!(ep.start_index, 4);
        assert_eq!(ep.max_latency_ms, 160.0);
        assert_eq!(ep.min_latency_ms, 140.0);
        assert_eq!(ep.avg_latency_ms, 151.25);
        // opened at index 4 (t0+3s), closed by the 9th normal at index 16 (t0+15s)
        assert_eq!(ep.duration_secs, 12.0);
        // only 3 pre-episode values: no baseline, increase undefined
        assert_eq!(ep.baseline, None);
        assert_eq!(ep.increase_percent, None);
        assert!(!det.is_in_anomaly());
    }

    #[test]
    fn open_episode_is_not_closed_by_short_recovery() {
        let mut det = AnomalyDetector::new(DetectorConfig {
            min_consecutive_normal: 9,
            min_pings: 4,
            ..config()
        });
        let events = feed(&mut det, &SCENARIO[..10]);
        assert!(retained(&events).is_empty());
        assert!(det.is_in_anomaly());
        assert_eq!(det.open_episode_len(), 4);
    }

    #[test]
    fn n_anomalous_then_m_normal_keeps_exactly_n() {
        let mut det = AnomalyDetector::new(config());
        let mut stream = vec![150.0; 7];
        stream.extend(std::iter::repeat_n(20.0, 10));
        let events = feed(&mut det, &stream);
        let episodes = retained(&events);
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].samples_affected, 7);
    }

    #[test]
    fn fixed_path_works_with_empty_baseline() {
        let mut det = AnomalyDetector::new(config());
        let ev = det.observe(250.0, t0(), 1);
        assert!(matches!(
            ev,
            Some(DetectorEvent::Opened {
                method: DetectionMethod::FixedThreshold { .. },
                start_index: 1
            })
        ));
        assert!(det.baseline().is_empty());
    }

    // ── confirmation buffer ─────────────────────────────────────────

    #[test]
    fn brief_dip_is_folded_into_episode() {
        let mut det = AnomalyDetector::new(config());
        let mut stream = vec![150.0, 150.0, 150.0];
        stream.extend([20.0, 20.0, 20.0]); // short dip
        stream.extend([150.0, 150.0]);
        stream.extend(std::iter::repeat_n(20.0, 10));
        let events = feed(&mut det, &stream);

        let opened = events
            .iter()
            .filter(|(_, ev)| matches!(ev, DetectorEvent::Opened { .. }))
            .count();
        assert_eq!(opened, 1);
        let episodes = retained(&events);
        assert_eq!(episodes.len(), 1);
        // 3 + 3 folded + 2
        assert_eq!(episodes[0].samples_affected, 8);
        assert_eq!(episodes[0].min_latency_ms, 20.0);
    }

    #[test]
    fn anomalous_samples_do_not_enter_baseline() {
        let mut det = AnomalyDetector::new(config());
        feed(&mut det, &[20.0, 20.0, 150.0, 150.0, 20.0]);
        // two pre-episode normals only; the 20.0 after the spike is buffered
        assert_eq!(det.baseline().len(), 2);
    }

    // ── retention filter ────────────────────────────────────────────

    #[test]
    fn too_few_samples_is_discarded() {
        let mut det = AnomalyDetector::new(config());
        let mut stream = vec![150.0; 3];
        stream.extend(std::iter::repeat_n(20.0, 10));
        let events = feed(&mut det, &stream);
        assert!(retained(&events).is_empty());
        assert!(events.iter().any(|(_, ev)| matches!(
            ev,
            DetectorEvent::Closed(EpisodeOutcome::Discarded {
                reason: DiscardReason::TooFewSamples {
                    affected: 3,
                    required: 5
                },
                ..
            })
        )));
    }

    #[test]
    fn marginal_statistical_blip_is_discarded() {
        // Tight baseline around 40ms, then a run at 52ms: statistically
        // anomalous, below the fixed threshold, only +30% over baseline.
        let mut det = AnomalyDetector::new(config());
        let mut stream: Vec<f64> = (0..40).map(|i| 40.0 + f64::from(i % 3)).collect();
        stream.extend(std::iter::repeat_n(52.0, 8));
        stream.extend(std::iter::repeat_n(40.0, 10));
        let events = feed(&mut det, &stream);

        assert!(retained(&events).is_empty());
        let discarded: Vec<_> = events
            .iter()
            .filter_map(|(_, ev)| match ev {
                DetectorEvent::Closed(EpisodeOutcome::Discarded { episode, reason }) => {
                    Some((episode.clone(), *reason))
                }
                _ => None,
            })
            .collect();
        assert_eq!(discarded.len(), 1);
        let (episode, reason) = &discarded[0];
        assert_eq!(*reason, DiscardReason::MarginalBlip);
        assert_eq!(episode.method.kind(), "statistical deviation");
        assert_eq!(episode.samples_affected, 8);
        assert!(episode.increase_percent.expect("baseline present") < 50.0);
    }

    #[test]
    fn high_but_flat_latency_is_discarded_as_below_increase() {
        // Baseline around 81ms; a run at 110ms crosses the fixed threshold
        // but is only ~36% above what the link normally does.
        let mut det = AnomalyDetector::new(config());
        let mut stream: Vec<f64> = (0..40).map(|i| 80.0 + f64::from(i % 3)).collect();
        stream.extend(std::iter::repeat_n(110.0, 6));
        stream.extend(std::iter::repeat_n(80.0, 10));
        let events = feed(&mut det, &stream);

        assert!(retained(&events).is_empty());
        let outcome = events.iter().find_map(|(_, ev)| match ev {
            DetectorEvent::Closed(outcome) => Some(outcome.clone()),
            _ => None,
        });
        let Some(EpisodeOutcome::Discarded { episode, reason }) = outcome else {
            panic!("expected a discarded episode");
        };
        assert_eq!(reason, DiscardReason::BelowIncrease);
        assert_eq!(episode.method.kind(), "fixed threshold");
        assert_eq!(episode.samples_affected, 6);
        assert_eq!(episode.avg_latency_ms, 110.0);
        let increase = episode.increase_percent.expect("baseline present");
        assert!((30.0..50.0).contains(&increase), "{increase}");
        assert!(!det.is_in_anomaly());
    }

    #[test]
    fn large_statistical_increase_is_retained() {
        let mut det = AnomalyDetector::new(config());
        let mut stream: Vec<f64> = (0..40).map(|i| 20.0 + f64::from(i % 3)).collect();
        stream.extend(std::iter::repeat_n(60.0, 6));
        stream.extend(std::iter::repeat_n(20.0, 10));
        let events = feed(&mut det, &stream);

        let episodes = retained(&events);
        assert_eq!(episodes.len(), 1);
        let ep = &episodes[0];
        assert!(matches!(ep.method, DetectionMethod::Deviation { .. }));
        let baseline = ep.baseline.expect("baseline summary");
        assert!((20.0..=22.0).contains(&baseline.avg_ms));
        assert!(ep.increase_percent.expect("defined") > 150.0);
    }

    #[test]
    fn statistical_path_waits_for_min_samples() {
        let mut det = AnomalyDetector::new(config());
        let stream: Vec<f64> = (0..29).map(|i| 20.0 + f64::from(i % 2)).collect();
        feed(&mut det, &stream);
        // 29 values: a 90ms sample is far above mean+2.5σ but the gate holds
        assert_eq!(det.observe(90.0, t0(), 30), None);
        assert!(!det.baseline().has_cache());
    }

    proptest! {
        #[test]
        fn deviation_never_fires_below_min_samples(
            latencies in proptest::collection::vec(1.0f64..300.0, 1..200)
        ) {
            let mut det = AnomalyDetector::new(config());
            for (i, latency) in latencies.iter().enumerate() {
                let before = det.baseline().len();
                let ev = det.observe(*latency, t0(), i as u64 + 1);
                if let Some(DetectorEvent::Opened { method: DetectionMethod::Deviation { .. }, .. }) = ev {
                    prop_assert!(before >= 30);
                }
                if let Some(DetectorEvent::Closed(outcome)) = ev {
                    let episode = match outcome {
                        EpisodeOutcome::Retained(e) => e,
                        EpisodeOutcome::Discarded { episode, .. } => episode,
                    };
                    prop_assert!(episode.samples_affected > 0);
                }
            }
        }
    }
}
