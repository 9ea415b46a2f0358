//! Prober trait and SystemPinger (async wrapper around the OS `ping` binary).

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

/// Extra time granted to the `ping` process beyond its own reply timeout.
const PROCESS_GRACE: Duration = Duration::from_secs(1);

/// One latency probe against a host. Enables scripted probers in tests.
///
/// Implementations enforce `timeout` themselves and map every transport
/// error to `None`.
pub trait Prober: Send + Sync {
    fn probe(&self, host: &str, timeout: Duration) -> impl Future<Output = Option<f64>> + Send;
}

impl<T: Prober> Prober for &T {
    fn probe(&self, host: &str, timeout: Duration) -> impl Future<Output = Option<f64>> + Send {
        (**self).probe(host, timeout)
    }
}

impl<T: Prober> Prober for Arc<T> {
    fn probe(&self, host: &str, timeout: Duration) -> impl Future<Output = Option<f64>> + Send {
        (**self).probe(host, timeout)
    }
}

/// Real prober using `tokio::process::Command`.
#[derive(Debug, Clone)]
pub struct SystemPinger {
    ping_bin: String,
}

impl SystemPinger {
    pub fn new(ping_bin: impl Into<String>) -> Self {
        Self {
            ping_bin: ping_bin.into(),
        }
    }
}

impl Default for SystemPinger {
    fn default() -> Self {
        Self::new("ping")
    }
}

impl Prober for SystemPinger {
    async fn probe(&self, host: &str, timeout: Duration) -> Option<f64> {
        let mut cmd = tokio::process::Command::new(&self.ping_bin);
        cmd.args(ping_args(host, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout + PROCESS_GRACE, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::debug!(host = %host, error = %e, "ping could not be spawned");
                return None;
            }
            Err(_) => {
                tracing::debug!(host = %host, "ping timed out");
                return None;
            }
        };
        if !output.status.success() {
            return None;
        }
        parse_ping_latency(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Single-echo arguments for the platform `ping`.
pub fn ping_args(host: &str, timeout: Duration) -> Vec<String> {
    if cfg!(windows) {
        let ms = timeout.as_millis().max(1);
        vec!["-n".into(), "1".into(), "-w".into(), ms.to_string(), host.into()]
    } else {
        // iputils and BSD ping take whole seconds for -W
        let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
        vec!["-c".into(), "1".into(), "-W".into(), secs.to_string(), host.into()]
    }
}

/// Extract the round-trip time in milliseconds from `ping` output.
///
/// Accepts `time=12.3 ms`, `time<1ms` and the Portuguese `tempo=` form.
/// A `<` reading is reported as its upper bound.
pub fn parse_ping_latency(output: &str) -> Option<f64> {
    const MARKERS: [&str; 4] = ["time=", "time<", "tempo=", "tempo<"];

    output.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        MARKERS.iter().find_map(|marker| {
            let start = lower.find(marker)? + marker.len();
            leading_number(&lower[start..])
        })
    })
}

fn leading_number(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(text.len());
    let value: f64 = text[..end].replace(',', ".").parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}
