//! `pingwatch run`: one monitor per target until a signal or `--duration`.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Serialize;

use pingwatch_core::{Alert, DetectorEvent, EpisodeOutcome, MonitorConfig};
use pingwatch_runtime::{
    InstanceOptions, MonitorManager, MonitorSnapshot, StaticAttachment, SystemPinger, TickReport,
    WirelessAttachment, resolve_identity,
};

use crate::cli::RunOpts;

/// One `--json` output line.
#[derive(Serialize)]
struct TickLine<'a> {
    key: &'a str,
    seq: u64,
    timestamp: String,
    latency_ms: Option<f64>,
    status: &'a str,
    alerts: &'a [Alert],
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    persist_error: Option<&'a str>,
}

pub async fn cmd_run(opts: RunOpts, config_path: &Path) -> anyhow::Result<()> {
    // Both flags are checked before anything starts.
    let template = load_template(config_path, opts.interval)?;
    let run_for = opts
        .duration
        .map(|secs| positive_secs("--duration", secs))
        .transpose()?;
    let targets = if opts.targets.is_empty() {
        vec![template.target.clone()]
    } else {
        opts.targets.clone()
    };

    let manager = MonitorManager::new(SystemPinger::default(), &opts.log_dir);
    for target in &targets {
        let attachment = match &opts.tag {
            Some(tag) => resolve_identity(&StaticAttachment(Some(tag.clone())), target).await,
            None => resolve_identity(&WirelessAttachment, target).await,
        };
        // Several targets on one attachment still get separate episode files.
        let identity = if targets.len() > 1 && attachment != *target {
            format!("{attachment}_{target}")
        } else {
            attachment
        };
        manager
            .add(target, InstanceOptions::new(target).with_identity(identity), &template)
            .await
            .with_context(|| format!("cannot add monitor for {target}"))?;
    }

    let bell = template.enable_sound_alerts && template.enable_alerts;
    for key in manager.keys().await {
        let json = opts.json;
        let label = key.clone();
        manager
            .start(&key, move |report: &TickReport| {
                print_report(&label, report, json, bell);
            })
            .await?;
    }

    match run_for {
        Some(limit) => {
            tokio::select! {
                () = tokio::time::sleep(limit) => {}
                () = shutdown_signal() => {}
            }
        }
        None => shutdown_signal().await,
    }

    manager.stop_all().await;
    let snapshots = manager.snapshots().await;
    print_summary(&snapshots, opts.json)?;
    Ok(())
}

fn load_template(path: &Path, interval: Option<f64>) -> anyhow::Result<MonitorConfig> {
    let (mut config, issues) = MonitorConfig::load(path);
    for issue in &issues {
        tracing::warn!(path = %path.display(), "{issue}");
    }
    if let Some(secs) = interval {
        positive_secs("--interval", secs)?;
        config.interval = secs;
    }
    Ok(config)
}

fn positive_secs(flag: &str, secs: f64) -> anyhow::Result<Duration> {
    if !(secs.is_finite() && secs > 0.0) {
        bail!("{flag} must be a positive number of seconds, got {secs}");
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot register SIGTERM handler");
                ctrl_c.await.ok();
                tracing::info!("received ctrl-c, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
}

fn describe_event(event: &DetectorEvent) -> String {
    match event {
        DetectorEvent::Opened {
            method,
            start_index,
        } => format!("anomaly opened at sample {start_index}: {method}"),
        DetectorEvent::Closed(EpisodeOutcome::Retained(ep)) => format!(
            "anomaly episode: {} samples, avg {:.1}ms (min {:.1}, max {:.1}), {:.1}s, {}",
            ep.samples_affected,
            ep.avg_latency_ms,
            ep.min_latency_ms,
            ep.max_latency_ms,
            ep.duration_secs,
            ep.method.kind(),
        ),
        DetectorEvent::Closed(EpisodeOutcome::Discarded { episode, reason }) => format!(
            "anomaly discarded after {} samples: {reason}",
            episode.samples_affected
        ),
    }
}

fn print_report(key: &str, report: &TickReport, json: bool, bell: bool) {
    let sample = &report.sample;
    let mut out = std::io::stdout().lock();

    if json {
        let line = TickLine {
            key,
            seq: sample.seq,
            timestamp: sample.timestamp.to_rfc3339(),
            latency_ms: sample.latency_ms,
            status: sample.status().as_str(),
            alerts: &report.alerts,
            event: report.detector.as_ref().map(describe_event),
            persist_error: report.persist_error.as_deref(),
        };
        match serde_json::to_string(&line) {
            Ok(text) => {
                let _ = writeln!(out, "{text}");
            }
            Err(e) => tracing::error!("tick serialization failed: {e}"),
        }
        return;
    }

    let latency = sample
        .latency_ms
        .map_or_else(|| "failed".to_string(), |l| format!("{l:.1}ms"));
    let _ = writeln!(
        out,
        "{} {key:<20} #{:<6} {latency}",
        sample.timestamp.format("%H:%M:%S"),
        sample.seq
    );
    for alert in &report.alerts {
        let _ = writeln!(out, "  ! {alert}");
    }
    if let Some(event) = &report.detector {
        let _ = writeln!(out, "  * {}", describe_event(event));
    }
    if bell && !report.alerts.is_empty() {
        let _ = write!(out, "\x07");
        let _ = out.flush();
    }
}

fn print_summary(snapshots: &[MonitorSnapshot], json: bool) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    for snap in snapshots {
        if json {
            writeln!(out, "{}", serde_json::to_string(snap)?)?;
            continue;
        }
        let s = &snap.stats;
        let ms = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"));
        writeln!(
            out,
            "{}: {} probes ({} ok, {} failed, {:.1}% loss), min/mean/max {}/{}/{} ms, {} alerts, {} episodes",
            snap.key,
            s.total,
            s.successes,
            s.failures,
            s.packet_loss_percent,
            ms(s.min_ms),
            ms(s.mean_ms),
            ms(s.max_ms),
            s.alert_count,
            snap.episodes.len(),
        )?;
    }
    Ok(())
}
