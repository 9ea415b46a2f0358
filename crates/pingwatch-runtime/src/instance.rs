//! Monitor instance: one target, one probe loop.
//!
//! All mutable state lives behind a single lock and is only changed by
//! [`MonitorInstance::tick`] (plus the explicit `reset_stats`/`flush`). The
//! probe itself runs outside the lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use pingwatch_core::{
    Alert, AlertEvaluator, AlertPolicy, AnomalyDetector, AnomalyEpisode, DetectorEvent,
    EpisodeOutcome, MonitorConfig, Sample, SessionStats, StatsTracker,
};

use crate::persist::{EpisodeStore, PersistError, ProbeLogBuffer, ProbeLogSink, ProbeRecord};
use crate::prober::Prober;

/// Everything one tick produced, handed to the instance callback.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub sample: Sample,
    pub alerts: Vec<Alert>,
    pub detector: Option<DetectorEvent>,
    /// Persistence failure message; the affected records stay queued.
    pub persist_error: Option<String>,
}

/// Read-only copy of an instance's state.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub key: String,
    pub target: String,
    pub running: bool,
    pub stats: SessionStats,
    pub episodes: Vec<AnomalyEpisode>,
    pub in_anomaly: bool,
    pub baseline_len: usize,
}

/// Where an instance persists to.
#[derive(Debug, Clone)]
pub struct Persistence {
    /// Shared dated probe-log writer.
    pub probe_sink: Arc<ProbeLogSink>,
    pub episode_dir: PathBuf,
    /// Identity used to tag the episode log (attachment name or target).
    pub identity: String,
}

struct MonitorState {
    stats: StatsTracker,
    detector: AnomalyDetector,
    alerts: AlertEvaluator,
    /// Retained episodes for the session; never cleared by a stats reset.
    episodes: Vec<AnomalyEpisode>,
    probe_log: ProbeLogBuffer,
    episode_log: EpisodeStore,
}

pub struct MonitorInstance<P> {
    key: String,
    config: MonitorConfig,
    prober: P,
    state: Mutex<MonitorState>,
    running: AtomicBool,
}

impl<P: Prober> MonitorInstance<P> {
    /// `config` is owned by the instance; later edits to the caller's copy
    /// have no effect.
    pub fn new(
        key: impl Into<String>,
        config: MonitorConfig,
        prober: P,
        persistence: Persistence,
    ) -> Self {
        let state = MonitorState {
            stats: StatsTracker::new(config.history_window),
            detector: AnomalyDetector::new(config.detector_config()),
            alerts: AlertEvaluator::new(AlertPolicy::from(&config)),
            episodes: Vec::new(),
            probe_log: ProbeLogBuffer::new(persistence.probe_sink, config.log_buffer_size),
            episode_log: EpisodeStore::new(persistence.episode_dir, &persistence.identity),
        };
        Self {
            key: key.into(),
            config,
            prober,
            state: Mutex::new(state),
            running: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Probe once and fold the result into stats, alerts, detector and logs.
    pub async fn tick(&self) -> TickReport {
        let target = &self.config.target;
        let latency_ms = self.prober.probe(target, self.config.probe_timeout()).await;

        let mut guard = self.state.lock().await;
        let st = &mut *guard;

        let sample = Sample {
            seq: st.stats.next_seq(),
            timestamp: Local::now(),
            latency_ms,
            target: target.clone(),
        };
        st.stats.record(&sample);

        let alerts = st.alerts.evaluate(&sample, st.stats.stats());
        for alert in &alerts {
            st.stats.note_alert();
            tracing::warn!(key = %self.key, target = %target, "{alert}");
        }

        let mut persist_errors: Vec<PersistError> = Vec::new();
        let detector = latency_ms
            .and_then(|latency| st.detector.observe(latency, sample.timestamp, sample.seq));
        match &detector {
            Some(DetectorEvent::Opened {
                method,
                start_index,
            }) => {
                tracing::debug!(key = %self.key, start_index, method = %method, "anomaly opened");
            }
            Some(DetectorEvent::Closed(EpisodeOutcome::Retained(episode))) => {
                tracing::info!(
                    key = %self.key,
                    samples = episode.samples_affected,
                    avg_ms = episode.avg_latency_ms,
                    method = %episode.method,
                    "anomaly episode retained"
                );
                st.episodes.push(episode.clone());
                st.episode_log.push(episode.clone());
            }
            Some(DetectorEvent::Closed(EpisodeOutcome::Discarded { episode, reason })) => {
                tracing::info!(
                    key = %self.key,
                    samples = episode.samples_affected,
                    reason = %reason,
                    "anomaly episode discarded"
                );
            }
            None => {}
        }
        // Also retries episodes left over from an earlier failed write.
        if st.episode_log.pending() > 0 {
            if let Err(e) = st.episode_log.flush() {
                persist_errors.push(e);
            }
        }

        let record = ProbeRecord::new(&sample, st.stats.stats());
        if let Err(e) = st.probe_log.push(record) {
            persist_errors.push(e);
        }

        for e in &persist_errors {
            tracing::warn!(
                key = %self.key,
                error = %e,
                queued_records = st.probe_log.pending(),
                queued_episodes = st.episode_log.pending(),
                "persistence failed"
            );
        }
        let persist_error = (!persist_errors.is_empty()).then(|| {
            persist_errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        });

        TickReport {
            sample,
            alerts,
            detector,
            persist_error,
        }
    }

    /// Periodic loop: tick, report, then sleep for `max(0, interval - elapsed)`.
    ///
    /// Cancellation is checked once per iteration; the tick in progress
    /// always completes. Buffered probe records are flushed before return.
    pub async fn run<F>(self: Arc<Self>, token: CancellationToken, mut on_tick: F)
    where
        F: FnMut(&TickReport) + Send,
    {
        self.running.store(true, Ordering::SeqCst);
        // Cleared on every exit, including an abort of this task.
        let _running = RunningFlag(&self.running);
        tracing::info!(key = %self.key, target = %self.config.target, "monitor started");
        let interval = self.config.interval_duration();

        while !token.is_cancelled() {
            let started = Instant::now();
            let report = self.tick().await;
            on_tick(&report);

            let remaining = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }

        // Failure is logged inside; records stay buffered.
        let _ = self.flush().await;
        tracing::info!(key = %self.key, "monitor stopped");
    }

    /// Write any buffered probe records and queued episodes now. Both are
    /// attempted; the first error is returned.
    pub async fn flush(&self) -> Result<(), PersistError> {
        let mut st = self.state.lock().await;
        let probes = st.probe_log.flush();
        let episodes = st.episode_log.flush().map(|_| ());
        let result = probes.and(episodes);
        if let Err(e) = &result {
            tracing::warn!(key = %self.key, error = %e, "flush failed");
        }
        result
    }

    /// Zero the session statistics. Retained episodes are kept.
    pub async fn reset_stats(&self) {
        let mut st = self.state.lock().await;
        st.stats.reset();
        st.alerts.reset();
    }

    pub async fn snapshot(&self) -> MonitorSnapshot {
        let st = self.state.lock().await;
        MonitorSnapshot {
            key: self.key.clone(),
            target: self.config.target.clone(),
            running: self.is_running(),
            stats: st.stats.stats().clone(),
            episodes: st.episodes.clone(),
            in_anomaly: st.detector.is_in_anomaly(),
            baseline_len: st.detector.baseline().len(),
        }
    }

    /// Latencies behind the running mean, oldest first.
    pub async fn history(&self) -> Vec<f64> {
        self.state.lock().await.stats.history().collect()
    }

    pub async fn pending_records(&self) -> usize {
        self.state.lock().await.probe_log.pending()
    }

    pub async fn pending_episodes(&self) -> usize {
        self.state.lock().await.episode_log.pending()
    }
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Replays a fixed latency script, then fails every probe.
    struct Script(StdMutex<VecDeque<Option<f64>>>);

    impl Script {
        fn new(values: impl IntoIterator<Item = Option<f64>>) -> Self {
            Self(StdMutex::new(values.into_iter().collect()))
        }
    }

    impl Prober for Script {
        async fn probe(&self, _host: &str, _timeout: Duration) -> Option<f64> {
            self.0.lock().unwrap().pop_front().flatten()
        }
    }

    fn instance(tmp: &TempDir, config: MonitorConfig, script: Script) -> MonitorInstance<Script> {
        let persistence = Persistence {
            probe_sink: Arc::new(ProbeLogSink::new(tmp.path())),
            episode_dir: tmp.path().to_path_buf(),
            identity: config.target.clone(),
        };
        MonitorInstance::new("m1", config, script, persistence)
    }

    #[tokio::test]
    async fn tick_records_sample_and_buffers_log() {
        let tmp = TempDir::new().unwrap();
        let mi = instance(&tmp, MonitorConfig::default(), Script::new([Some(12.0)]));

        let report = mi.tick().await;
        assert_eq!(report.sample.seq, 1);
        assert_eq!(report.sample.latency_ms, Some(12.0));
        assert!(report.alerts.is_empty());
        assert!(report.persist_error.is_none());
        assert_eq!(mi.pending_records().await, 1);

        let snap = mi.snapshot().await;
        assert_eq!(snap.stats.total, 1);
        assert_eq!(snap.baseline_len, 1);
        assert!(!snap.running);
    }

    #[tokio::test]
    async fn alerts_are_counted() {
        let tmp = TempDir::new().unwrap();
        let config = MonitorConfig {
            packet_loss_threshold: 100.0,
            ..MonitorConfig::default()
        };
        let mi = instance(&tmp, config, Script::new([Some(250.0), None, None, None]));
        let mut fired = 0;
        for _ in 0..4 {
            fired += mi.tick().await.alerts.len();
        }
        // one high-latency alert, one connection-lost alert on the 3rd failure
        assert_eq!(fired, 2);
        assert_eq!(mi.snapshot().await.stats.alert_count, 2);
    }

    #[tokio::test]
    async fn reset_keeps_episodes() {
        let tmp = TempDir::new().unwrap();
        let mut script = vec![Some(150.0); 5];
        script.extend(std::iter::repeat_n(Some(20.0), 10));
        let mi = instance(&tmp, MonitorConfig::default(), Script::new(script));
        for _ in 0..15 {
            mi.tick().await;
        }
        assert_eq!(mi.snapshot().await.episodes.len(), 1);

        mi.reset_stats().await;
        mi.reset_stats().await;
        let snap = mi.snapshot().await;
        assert_eq!(snap.stats, SessionStats::default());
        assert_eq!(snap.episodes.len(), 1);
        assert!(mi.history().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let config = MonitorConfig {
            interval: 0.5,
            log_buffer_size: 100,
            ..MonitorConfig::default()
        };
        let mi = Arc::new(instance(&tmp, config, Script::new(vec![Some(10.0); 20])));
        let token = CancellationToken::new();
        let calls = Arc::new(StdMutex::new(0u64));

        let handle = tokio::spawn(Arc::clone(&mi).run(token.clone(), {
            let calls = Arc::clone(&calls);
            move |_report: &TickReport| *calls.lock().unwrap() += 1
        }));
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(mi.is_running());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits after cancel")
            .unwrap();

        let snap = mi.snapshot().await;
        assert!(!snap.running);
        assert_eq!(snap.stats.total, *calls.lock().unwrap());
        assert_eq!(mi.pending_records().await, 0);
        let logs = crate::persist::list_probe_logs(tmp.path()).unwrap();
        let lines: usize = logs
            .iter()
            .map(|(_, p)| std::fs::read_to_string(p).unwrap().lines().count() - 1)
            .sum();
        assert_eq!(lines as u64, snap.stats.total);
    }
}
