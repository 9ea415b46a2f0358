//! Network attachment identity, used to tag episode-log destinations.

use std::process::Stdio;
use std::time::Duration;

/// How long an attachment lookup may take before it is treated as absent.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Reports the current network attachment (e.g. a Wi-Fi SSID).
///
/// Lookups never fail loudly: anything unexpected is `None`.
pub trait AttachmentProvider: Send + Sync {
    fn current_attachment_id(&self) -> impl Future<Output = Option<String>> + Send;
}

/// Fixed identity, typically from `--tag`.
#[derive(Debug, Clone, Default)]
pub struct StaticAttachment(pub Option<String>);

impl AttachmentProvider for StaticAttachment {
    async fn current_attachment_id(&self) -> Option<String> {
        self.0.clone()
    }
}

/// No attachment information available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAttachment;

impl AttachmentProvider for NoAttachment {
    async fn current_attachment_id(&self) -> Option<String> {
        None
    }
}

/// Current wireless network name, read from `iwgetid -r` (Linux) or
/// `netsh wlan show interfaces` (Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct WirelessAttachment;

impl AttachmentProvider for WirelessAttachment {
    async fn current_attachment_id(&self) -> Option<String> {
        let (program, args): (&str, &[&str]) = if cfg!(windows) {
            ("netsh", &["wlan", "show", "interfaces"])
        } else {
            ("iwgetid", &["-r"])
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(LOOKUP_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(_)) => return None,
            Ok(Err(e)) => {
                tracing::debug!(program, error = %e, "attachment lookup unavailable");
                return None;
            }
            Err(_) => {
                tracing::debug!(program, "attachment lookup timed out");
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if cfg!(windows) {
            parse_netsh_ssid(&stdout)
        } else {
            non_empty(stdout.trim())
        }
    }
}

/// Episode-log identity: the attachment if one is reported, else `fallback`.
pub async fn resolve_identity(provider: &impl AttachmentProvider, fallback: &str) -> String {
    match provider.current_attachment_id().await {
        Some(id) => id,
        None => fallback.to_string(),
    }
}

/// Pick the `SSID : <name>` line out of `netsh wlan show interfaces`.
pub fn parse_netsh_ssid(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        // "BSSID" shares the suffix; match the key exactly
        if key.trim().eq_ignore_ascii_case("ssid") {
            non_empty(value.trim())
        } else {
            None
        }
    })
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
