//! Concurrency manager: keyed monitor instances, each on its own task.
//!
//! The key→entry map is the only structure shared between callers, and all
//! mutation goes through its lock. The lock is never held across a task join.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pingwatch_core::MonitorConfig;

use crate::instance::{MonitorInstance, MonitorSnapshot, Persistence, TickReport};
use crate::persist::ProbeLogSink;
use crate::prober::Prober;

/// How long `stop` waits for a loop to finish before aborting it.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("no monitor named `{0}`")]
    UnknownMonitor(String),

    #[error("monitor `{0}` already exists")]
    DuplicateMonitor(String),

    #[error("monitor `{0}` is already running")]
    AlreadyRunning(String),

    #[error("monitor `{0}` is not running")]
    NotRunning(String),

    #[error("monitor `{0}` is stopping")]
    Stopping(String),
}

/// Per-instance settings that are not part of the template.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub target: String,
    /// Episode-log identity; defaults to the target.
    pub identity: Option<String>,
}

impl InstanceOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            identity: None,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

/// Loop bookkeeping for one entry.
enum Task {
    Idle,
    Running(JoinHandle<()>, CancellationToken),
    /// `stop` owns the handle and is waiting for the loop to exit.
    Stopping,
}

impl Task {
    fn is_live(&self) -> bool {
        match self {
            Self::Idle => false,
            Self::Running(handle, _) => !handle.is_finished(),
            Self::Stopping => true,
        }
    }
}

struct Entry<P> {
    instance: Arc<MonitorInstance<P>>,
    task: Task,
}

pub struct MonitorManager<P> {
    prober: P,
    probe_sink: Arc<ProbeLogSink>,
    log_dir: PathBuf,
    stop_timeout: Duration,
    entries: Mutex<HashMap<String, Entry<P>>>,
}

impl<P: Prober + Clone + 'static> MonitorManager<P> {
    /// All instances share `prober` (cloned per instance) and write their
    /// logs under `log_dir`.
    pub fn new(prober: P, log_dir: impl Into<PathBuf>) -> Self {
        let log_dir = log_dir.into();
        Self {
            prober,
            probe_sink: Arc::new(ProbeLogSink::new(log_dir.clone())),
            log_dir,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Register an instance. Its configuration is a copy of `template`
    /// with the target from `options` applied.
    pub async fn add(
        &self,
        key: &str,
        options: InstanceOptions,
        template: &MonitorConfig,
    ) -> Result<Arc<MonitorInstance<P>>, ManagerError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Err(ManagerError::DuplicateMonitor(key.to_string()));
        }

        let mut config = template.clone();
        config.target = options.target;
        let identity = options.identity.unwrap_or_else(|| config.target.clone());
        let persistence = Persistence {
            probe_sink: Arc::clone(&self.probe_sink),
            episode_dir: self.log_dir.clone(),
            identity,
        };
        let instance = Arc::new(MonitorInstance::new(
            key,
            config,
            self.prober.clone(),
            persistence,
        ));
        entries.insert(
            key.to_string(),
            Entry {
                instance: Arc::clone(&instance),
                task: Task::Idle,
            },
        );
        tracing::debug!(key = %key, "monitor added");
        Ok(instance)
    }

    /// Launch the instance loop on its own task. Rejected while a previous
    /// loop is running or still being stopped.
    pub async fn start<F>(&self, key: &str, on_tick: F) -> Result<(), ManagerError>
    where
        F: FnMut(&TickReport) + Send + 'static,
    {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| ManagerError::UnknownMonitor(key.to_string()))?;
        match &entry.task {
            Task::Stopping => return Err(ManagerError::Stopping(key.to_string())),
            task if task.is_live() => return Err(ManagerError::AlreadyRunning(key.to_string())),
            _ => {}
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&entry.instance).run(token.clone(), on_tick));
        entry.task = Task::Running(handle, token);
        Ok(())
    }

    /// Signal the loop and wait (bounded) for it to finish. On return the
    /// instance's buffered records have been flushed.
    ///
    /// The entry stays marked as stopping until the loop has exited, so a
    /// concurrent `start` cannot launch a second loop on the same instance.
    pub async fn stop(&self, key: &str) -> Result<(), ManagerError> {
        let (instance, mut handle, token) = {
            let mut entries = self.entries.lock().await;
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| ManagerError::UnknownMonitor(key.to_string()))?;
            match std::mem::replace(&mut entry.task, Task::Stopping) {
                Task::Running(handle, token) => (Arc::clone(&entry.instance), handle, token),
                Task::Stopping => return Err(ManagerError::Stopping(key.to_string())),
                Task::Idle => {
                    entry.task = Task::Idle;
                    return Err(ManagerError::NotRunning(key.to_string()));
                }
            }
        };

        token.cancel();
        if tokio::time::timeout(self.stop_timeout, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(key = %key, timeout = ?self.stop_timeout, "monitor did not stop in time, aborting");
            handle.abort();
            let _ = handle.await;
            // The aborted loop skipped its own final flush.
            let _ = instance.flush().await;
        }

        if let Some(entry) = self.entries.lock().await.get_mut(key) {
            entry.task = Task::Idle;
        }
        Ok(())
    }

    /// Stop every running instance. Instances never started are skipped.
    pub async fn stop_all(&self) {
        for key in self.running_keys().await {
            match self.stop(&key).await {
                Ok(()) | Err(ManagerError::NotRunning(_)) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "stop failed"),
            }
        }
    }

    /// Stop (if running) and forget an instance.
    pub async fn remove(&self, key: &str) -> Result<Arc<MonitorInstance<P>>, ManagerError> {
        match self.stop(key).await {
            Ok(()) | Err(ManagerError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.entries
            .lock()
            .await
            .remove(key)
            .map(|entry| entry.instance)
            .ok_or_else(|| ManagerError::UnknownMonitor(key.to_string()))
    }

    pub async fn get(&self, key: &str) -> Option<Arc<MonitorInstance<P>>> {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|entry| Arc::clone(&entry.instance))
    }

    pub async fn is_running(&self, key: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(key)
            .is_some_and(|entry| entry.task.is_live())
    }

    /// Registered keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn snapshot(&self, key: &str) -> Result<MonitorSnapshot, ManagerError> {
        let instance = self
            .get(key)
            .await
            .ok_or_else(|| ManagerError::UnknownMonitor(key.to_string()))?;
        Ok(instance.snapshot().await)
    }

    /// Snapshots of every instance, sorted by key.
    pub async fn snapshots(&self) -> Vec<MonitorSnapshot> {
        let instances: Vec<_> = {
            let entries = self.entries.lock().await;
            entries.values().map(|e| Arc::clone(&e.instance)).collect()
        };
        let mut snaps = Vec::with_capacity(instances.len());
        for instance in instances {
            snaps.push(instance.snapshot().await);
        }
        snaps.sort_by(|a, b| a.key.cmp(&b.key));
        snaps
    }

    async fn running_keys(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| matches!(entry.task, Task::Running(..)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Clone)]
    struct Constant(f64);

    impl Prober for Constant {
        async fn probe(&self, _host: &str, _timeout: Duration) -> Option<f64> {
            Some(self.0)
        }
    }

    /// Sleeps `delay` per probe and records the peak number of probes in flight.
    #[derive(Default)]
    struct Slow {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Prober for Slow {
        async fn probe(&self, _host: &str, _timeout: Duration) -> Option<f64> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Some(10.0)
        }
    }

    fn fast_template() -> MonitorConfig {
        MonitorConfig {
            interval: 0.2,
            ..MonitorConfig::default()
        }
    }

    #[tokio::test]
    async fn add_copies_template() {
        let tmp = TempDir::new().unwrap();
        let mgr = MonitorManager::new(Constant(10.0), tmp.path());
        let mut template = MonitorConfig {
            anomaly_min_samples: 12,
            anomaly_min_consecutive_normal: 4,
            anomaly_min_pings: 3,
            anomaly_min_increase_percent: 25.0,
            deviation_multiplier: 3.0,
            ..fast_template()
        };
        let expected = MonitorConfig {
            target: "10.0.0.1".to_string(),
            ..template.clone()
        };
        let mi = mgr
            .add("a", InstanceOptions::new("10.0.0.1"), &template)
            .await
            .unwrap();

        template.latency_threshold = 5.0;
        template.deviation_multiplier = 1.0;
        template.anomaly_min_samples = 99;
        template.anomaly_min_consecutive_normal = 99;
        template.anomaly_min_pings = 99;
        template.anomaly_min_increase_percent = 99.0;
        template.baseline_window = 7;

        assert_eq!(*mi.config(), expected);
        assert_eq!(mi.config().detector_config(), expected.detector_config());
        assert_ne!(mi.config().detector_config(), template.detector_config());
    }

    #[tokio::test]
    async fn duplicate_and_unknown_keys_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = MonitorManager::new(Constant(10.0), tmp.path());
        mgr.add("a", InstanceOptions::new("h"), &fast_template())
            .await
            .unwrap();
        assert_eq!(
            mgr.add("a", InstanceOptions::new("h2"), &fast_template())
                .await
                .err(),
            Some(ManagerError::DuplicateMonitor("a".into()))
        );
        assert_eq!(
            mgr.start("zz", |_| {}).await,
            Err(ManagerError::UnknownMonitor("zz".into()))
        );
        assert_eq!(
            mgr.stop("a").await,
            Err(ManagerError::NotRunning("a".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = MonitorManager::new(Constant(10.0), tmp.path());
        mgr.add("a", InstanceOptions::new("h"), &fast_template())
            .await
            .unwrap();
        mgr.start("a", |_| {}).await.unwrap();
        assert_eq!(
            mgr.start("a", |_| {}).await,
            Err(ManagerError::AlreadyRunning("a".into()))
        );
        assert!(mgr.is_running("a").await);

        mgr.stop("a").await.unwrap();
        assert!(!mgr.is_running("a").await);
        // a stopped instance can be started again
        mgr.start("a", |_| {}).await.unwrap();
        mgr.stop_all().await;
        assert!(!mgr.is_running("a").await);
    }

    #[tokio::test]
    async fn stop_all_tolerates_never_started() {
        let tmp = TempDir::new().unwrap();
        let mgr = MonitorManager::new(Constant(10.0), tmp.path());
        mgr.add("idle", InstanceOptions::new("h1"), &fast_template())
            .await
            .unwrap();
        mgr.stop_all().await;
        assert_eq!(mgr.keys().await, vec!["idle".to_string()]);
    }

    #[tokio::test]
    async fn remove_forgets_instance() {
        let tmp = TempDir::new().unwrap();
        let mgr = MonitorManager::new(Constant(10.0), tmp.path());
        mgr.add("a", InstanceOptions::new("h"), &fast_template())
            .await
            .unwrap();
        mgr.start("a", |_| {}).await.unwrap();
        let removed = mgr.remove("a").await.unwrap();
        assert!(!removed.is_running());
        assert!(mgr.get("a").await.is_none());
        assert!(matches!(
            mgr.snapshot("a").await,
            Err(ManagerError::UnknownMonitor(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_rejected_while_stop_is_in_flight() {
        let tmp = TempDir::new().unwrap();
        let prober = Arc::new(Slow {
            delay: Duration::from_millis(800),
            ..Slow::default()
        });
        let mgr = MonitorManager::new(Arc::clone(&prober), tmp.path());
        mgr.add("a", InstanceOptions::new("h"), &fast_template())
            .await
            .unwrap();
        mgr.start("a", |_| {}).await.unwrap();
        // first probe in flight
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (stopped, (during, running_meanwhile)) = tokio::join!(mgr.stop("a"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let during = mgr.start("a", |_| {}).await;
            (during, mgr.is_running("a").await)
        });
        stopped.unwrap();
        assert_eq!(during, Err(ManagerError::Stopping("a".into())));
        assert!(running_meanwhile, "a stopping loop still counts as running");
        assert!(!mgr.is_running("a").await);
        assert_eq!(prober.peak.load(Ordering::SeqCst), 1);

        // once stopped, a fresh start is accepted
        mgr.start("a", |_| {}).await.unwrap();
        mgr.stop("a").await.unwrap();
        assert_eq!(prober.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_loop_is_not_reported_running() {
        let tmp = TempDir::new().unwrap();
        let prober = Arc::new(Slow {
            delay: Duration::from_secs(60),
            ..Slow::default()
        });
        let mgr = MonitorManager::new(prober, tmp.path()).with_stop_timeout(Duration::from_secs(1));
        let mi = mgr
            .add("a", InstanceOptions::new("h"), &fast_template())
            .await
            .unwrap();
        mgr.start("a", |_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mi.is_running());

        mgr.stop("a").await.unwrap();
        assert!(!mgr.is_running("a").await);
        assert!(!mi.is_running());
        assert!(!mgr.snapshot("a").await.unwrap().running);
    }
}
