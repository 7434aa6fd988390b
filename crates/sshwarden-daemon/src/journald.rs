//! Production journal source.
//!
//! Spawns `journalctl --follow` filtered to the sshd identifier and
//! parses its NDJSON output into [`JournalEntry`] items. Malformed
//! journal JSON indicates a broken journalctl and is fatal.

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sshwarden_sensor::sshd::JournalEntry;

/// One journal entry as journalctl serializes it.
#[derive(Debug, Deserialize)]
struct RawJournalEntry {
    #[serde(rename = "MESSAGE")]
    message: serde_json::Value,
    #[serde(rename = "__REALTIME_TIMESTAMP")]
    realtime_timestamp: Option<String>,
    #[serde(rename = "_PID")]
    pid: Option<String>,
}

/// Follows the journal for one syslog identifier.
pub struct JournalSource {
    identifier: String,
}

impl JournalSource {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
        }
    }

    /// Spawn journalctl and the reader task feeding `entries_tx`. The
    /// task exits when journalctl closes its stdout or the consumer goes
    /// away.
    pub fn run(self, entries_tx: mpsc::Sender<JournalEntry>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut child = Command::new("journalctl")
                .arg("--follow")
                .arg("--lines=0")
                .arg("--output=json")
                .arg("--identifier")
                .arg(&self.identifier)
                .stdout(std::process::Stdio::piped())
                .stdin(std::process::Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .context("failed to spawn journalctl")?;

            let stdout = child
                .stdout
                .take()
                .context("journalctl has no stdout handle")?;
            info!(identifier = %self.identifier, "journal source: following journalctl");

            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .context("failed to read from journalctl")?
            {
                if line.is_empty() {
                    continue;
                }
                let raw: RawJournalEntry = serde_json::from_str(&line)
                    .with_context(|| format!("malformed journal entry: {line}"))?;

                let Some(entry) = convert_entry(raw) else {
                    continue;
                };
                if entries_tx.send(entry).await.is_err() {
                    debug!("journal source: consumer went away, stopping");
                    break;
                }
            }

            let status = child.wait().await.context("waiting for journalctl")?;
            if !status.success() {
                anyhow::bail!("journalctl exited with status {status}");
            }
            Ok(())
        })
    }
}

fn convert_entry(raw: RawJournalEntry) -> Option<JournalEntry> {
    // Non-UTF-8 messages arrive as byte arrays; sshd does not log those.
    let message = match raw.message {
        serde_json::Value::String(s) => s,
        other => {
            warn!(message = %other, "skipping non-string journal message");
            return None;
        }
    };

    let timestamp_usec = raw
        .realtime_timestamp
        .as_deref()
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);

    Some(JournalEntry {
        message,
        timestamp_usec,
        pid: raw.pid.unwrap_or_default(),
    })
}
