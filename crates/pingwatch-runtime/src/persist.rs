//! CSV persistence: the buffered per-tick probe log and the unbuffered
//! episode log.
//!
//! Probe logs are keyed by date only, so every instance writes through one
//! shared [`ProbeLogSink`]. The sink holds a lock for the duration of a flush
//! and emits each batch with a single `write_all`, so records from concurrent
//! instances never interleave within a line.
//!
//! Episode logs are keyed by (identity tag, date) and written immediately;
//! an episode whose write fails stays queued and is retried.

use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, NaiveDate};
use thiserror::Error;

use pingwatch_core::{AnomalyEpisode, ProbeStatus, Sample, SessionStats};

pub const PROBE_LOG_PREFIX: &str = "network_log_";
pub const PROBE_LOG_HEADER: &str = "Timestamp,Target,Latency (ms),Status,Packet_Loss_%";
pub const EPISODE_LOG_PREFIX: &str = "anomalies_";
pub const EPISODE_LOG_HEADER: &str = "Date,Start,End,Duration_s,Avg_ms,Min_ms,Max_ms,\
Samples_Affected,Start_Sample,Detection_Method,Baseline_Avg_ms,Baseline_Min_ms,\
Baseline_Max_ms,Increase_Pct";
pub const DEFAULT_CONSOLIDATED_NAME: &str = "network_log_consolidated.csv";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Io { path, .. } => path,
        }
    }
}

// ─── Probe records ──────────────────────────────────────────────────

/// One row of the probe log.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    pub timestamp: DateTime<Local>,
    pub target: String,
    pub latency_ms: Option<f64>,
    pub status: ProbeStatus,
    pub packet_loss_percent: f64,
}

impl ProbeRecord {
    /// Build from a sample and the stats that already include it.
    pub fn new(sample: &Sample, stats: &SessionStats) -> Self {
        Self {
            timestamp: sample.timestamp,
            target: sample.target.clone(),
            latency_ms: sample.latency_ms,
            status: sample.status(),
            packet_loss_percent: stats.packet_loss_percent,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{:.2}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            csv_field(&self.target),
            self.latency_ms
                .map_or_else(|| "N/A".to_string(), |l| format!("{l:.2}")),
            self.status,
            self.packet_loss_percent,
        )
    }
}

pub fn probe_log_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{PROBE_LOG_PREFIX}{}.csv", date.format(DATE_FORMAT)))
}

// ─── ProbeLogSink ───────────────────────────────────────────────────

/// Serializing writer for the dated probe logs, shared by all instances.
#[derive(Debug)]
pub struct ProbeLogSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ProbeLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append records that all fall on `date`, header first if the file is new.
    pub fn append_day(&self, date: NaiveDate, records: &[ProbeRecord]) -> Result<(), PersistError> {
        if records.is_empty() {
            return Ok(());
        }
        let path = probe_log_path(&self.dir, date);
        let mut chunk = String::new();
        for record in records {
            chunk.push_str(&record.to_csv_line());
            chunk.push('\n');
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        append_with_header(&path, PROBE_LOG_HEADER, &chunk)
    }
}

// ─── ProbeLogBuffer ─────────────────────────────────────────────────

/// Per-instance buffer in front of the shared sink.
///
/// After a failed write the backlog is kept and the next attempt waits until
/// another `capacity` records have arrived, so a dead destination costs one
/// write attempt per buffer's worth of ticks rather than one per tick.
#[derive(Debug)]
pub struct ProbeLogBuffer {
    sink: Arc<ProbeLogSink>,
    pending: Vec<ProbeRecord>,
    capacity: usize,
    /// Backlog length that triggers the next automatic flush.
    flush_at: usize,
}

impl ProbeLogBuffer {
    pub fn new(sink: Arc<ProbeLogSink>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            sink,
            pending: Vec::with_capacity(capacity),
            capacity,
            flush_at: capacity,
        }
    }

    /// Buffer a record; flush once the buffer is full.
    pub fn push(&mut self, record: ProbeRecord) -> Result<(), PersistError> {
        self.pending.push(record);
        if self.pending.len() >= self.flush_at {
            self.flush()?;
        }
        Ok(())
    }

    /// Write everything pending. On failure the unwritten records stay
    /// buffered for the next attempt.
    pub fn flush(&mut self) -> Result<(), PersistError> {
        let mut written = 0;
        let mut result = Ok(());
        for day in self.pending.chunk_by(|a, b| a.date() == b.date()) {
            if let Err(e) = self.sink.append_day(day[0].date(), day) {
                result = Err(e);
                break;
            }
            written += day.len();
        }
        self.pending.drain(..written);
        self.flush_at = if result.is_ok() {
            self.capacity
        } else {
            self.pending.len() + self.capacity
        };
        result
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ─── EpisodeStore ───────────────────────────────────────────────────

/// Episode writer for one identity tag.
///
/// Episodes are written as soon as they are queued. A failed write leaves
/// them queued, in order, until a later [`EpisodeStore::flush`] succeeds.
/// The destination directory is created on first write, and the file name
/// is recomputed whenever the calendar date has moved on.
#[derive(Debug)]
pub struct EpisodeStore {
    dir: PathBuf,
    tag: String,
    current: Option<(NaiveDate, PathBuf)>,
    pending: Vec<AnomalyEpisode>,
}

impl EpisodeStore {
    pub fn new(dir: impl Into<PathBuf>, identity: &str) -> Self {
        Self {
            dir: dir.into(),
            tag: sanitize_tag(identity),
            current: None,
            pending: Vec::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Queue `episode` for the next flush.
    pub fn push(&mut self, episode: AnomalyEpisode) {
        self.pending.push(episode);
    }

    pub fn flush(&mut self) -> Result<PathBuf, PersistError> {
        self.flush_on(Local::now().date_naive())
    }

    /// Write every queued episode to the file for `today`, in one append.
    pub fn flush_on(&mut self, today: NaiveDate) -> Result<PathBuf, PersistError> {
        let path = self.destination(today);
        if self.pending.is_empty() {
            return Ok(path);
        }
        let mut chunk = String::new();
        for episode in &self.pending {
            chunk.push_str(&episode_csv_line(episode));
            chunk.push('\n');
        }
        append_with_header(&path, EPISODE_LOG_HEADER, &chunk)?;
        self.pending.clear();
        Ok(path)
    }

    /// Episodes waiting for a successful write.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn destination(&mut self, today: NaiveDate) -> PathBuf {
        match &self.current {
            Some((date, path)) if *date == today => path.clone(),
            _ => {
                let path = self.dir.join(format!(
                    "{EPISODE_LOG_PREFIX}{}_{}.csv",
                    self.tag,
                    today.format(DATE_FORMAT)
                ));
                self.current = Some((today, path.clone()));
                path
            }
        }
    }
}

/// Filesystem-safe identity tag.
pub fn sanitize_tag(identity: &str) -> String {
    let tag: String = identity
        .trim()
        .chars()
        .filter(|c| *c != ':')
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            other => other,
        })
        .collect();
    if tag.is_empty() {
        "default".to_string()
    } else {
        tag
    }
}

pub fn episode_csv_line(ep: &AnomalyEpisode) -> String {
    let na = || "N/A".to_string();
    let baseline = |f: fn(&pingwatch_core::BaselineSummary) -> f64| {
        ep.baseline.as_ref().map_or_else(na, |b| format!("{:.2}", f(b)))
    };
    [
        ep.started_at.format(DATE_FORMAT).to_string(),
        ep.started_at.format("%H:%M:%S").to_string(),
        ep.ended_at.format("%H:%M:%S").to_string(),
        format!("{:.1}", ep.duration_secs),
        format!("{:.2}", ep.avg_latency_ms),
        format!("{:.2}", ep.min_latency_ms),
        format!("{:.2}", ep.max_latency_ms),
        ep.samples_affected.to_string(),
        ep.start_index.to_string(),
        csv_field(&ep.method.to_string()).into_owned(),
        baseline(|b| b.avg_ms),
        baseline(|b| b.min_ms),
        baseline(|b| b.max_ms),
        ep.increase_percent.map_or_else(na, |p| format!("{p:.1}")),
    ]
    .join(",")
}

// ─── Consolidation ──────────────────────────────────────────────────

/// Daily probe logs in `dir`, newest first. A missing directory is empty.
pub fn list_probe_logs(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>, PersistError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PersistError::io(dir, e)),
    };

    let mut logs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PersistError::io(dir, e))?.path();
        let date = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(PROBE_LOG_PREFIX))
            .and_then(|n| n.strip_suffix(".csv"))
            .and_then(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok());
        if let Some(date) = date {
            logs.push((date, path));
        }
    }
    logs.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(logs)
}

/// Merge every daily probe log, oldest first, into `dir/output_name` with a
/// single header. Returns the number of data rows written; with no daily
/// logs nothing is written and 0 is returned.
pub fn consolidate(dir: &Path, output_name: &str) -> Result<usize, PersistError> {
    let logs = list_probe_logs(dir)?;
    if logs.is_empty() {
        return Ok(0);
    }

    let mut out = String::new();
    let mut header_written = false;
    let mut rows = 0;
    for (_, path) in logs.iter().rev() {
        let text = fs::read_to_string(path).map_err(|e| PersistError::io(path, e))?;
        let mut lines = text.lines();
        let Some(header) = lines.next() else {
            continue;
        };
        if !header_written {
            out.push_str(header);
            out.push('\n');
            header_written = true;
        }
        for line in lines.filter(|l| !l.is_empty()) {
            out.push_str(line);
            out.push('\n');
            rows += 1;
        }
    }

    let output = dir.join(output_name);
    fs::write(&output, out).map_err(|e| PersistError::io(&output, e))?;
    tracing::info!(path = %output.display(), rows, "probe logs consolidated");
    Ok(rows)
}

// ─── Helpers ────────────────────────────────────────────────────────

/// Append `chunk` to `path` in one write, prefixed by `header` when the
/// file is new or empty. Parent directories are created on demand.
fn append_with_header(path: &Path, header: &str, chunk: &str) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PersistError::io(path, e))?;
    let is_new = file
        .metadata()
        .map_err(|e| PersistError::io(path, e))?
        .len()
        == 0;

    let payload: Cow<'_, str> = if is_new {
        Cow::Owned(format!("{header}\n{chunk}"))
    } else {
        Cow::Borrowed(chunk)
    };
    file.write_all(payload.as_bytes())
        .map_err(|e| PersistError::io(path, e))
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}
