//! Production audit source: follows the auditd log file.
//!
//! Starts at the current end of the file (no replay of historical
//! records), polls for appended lines, and reopens the file when auditd
//! rotates or truncates it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Tails one audit log file, emitting complete lines.
pub struct AuditLogTailer {
    path: PathBuf,
}

impl AuditLogTailer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Spawn the tailer task. Runs until the consumer goes away; I/O
    /// failures on the audit log are fatal.
    pub fn run(self, lines_tx: mpsc::Sender<String>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut reader = self.open_at_end().await?;
            let mut position = reader.stream_position().await?;
            info!(path = %self.path.display(), position, "audit source: following log file");

            let mut poll = tokio::time::interval(POLL_INTERVAL);
            let mut line = String::new();

            loop {
                line.clear();
                let read = reader
                    .read_line(&mut line)
                    .await
                    .with_context(|| format!("failed to read {}", self.path.display()))?;

                if read == 0 {
                    // At EOF. Reopen if the file shrank (rotation or
                    // truncation), otherwise wait for more data.
                    let len = tokio::fs::metadata(&self.path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    if len < position {
                        debug!(path = %self.path.display(), "audit log rotated, reopening");
                        reader = self.open_at_start().await?;
                        position = 0;
                    }
                    poll.tick().await;
                    continue;
                }

                position += read as u64;
                if !line.ends_with('\n') {
                    // Partial line: auditd is still writing it. Rewind and
                    // retry on the next poll.
                    reader.seek(SeekFrom::Start(position - read as u64)).await?;
                    position -= read as u64;
                    poll.tick().await;
                    continue;
                }

                if lines_tx.send(line.trim_end().to_string()).await.is_err() {
                    debug!("audit source: consumer went away, stopping");
                    return Ok(());
                }
            }
        })
    }

    async fn open_at_end(&self) -> Result<BufReader<File>> {
        let mut file = self.open().await?;
        file.seek(SeekFrom::End(0)).await?;
        Ok(BufReader::new(file))
    }

    async fn open_at_start(&self) -> Result<BufReader<File>> {
        Ok(BufReader::new(self.open().await?))
    }

    async fn open(&self) -> Result<File> {
        File::open(&self.path)
            .await
            .with_context(|| format!("failed to open audit log {}", self.path.display()))
    }
}
