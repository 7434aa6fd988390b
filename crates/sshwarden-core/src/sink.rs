//! JSON-lines event sink.
//!
//! Drains the events channel and writes one JSON object per line to stdout
//! or a file. The audit contract requires that no accepted event is lost,
//! so every write is flushed and any I/O failure is fatal to the task.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::event::AuditEvent;

/// Where the sink writes.
#[derive(Debug, Clone)]
pub enum SinkTarget {
    Stdout,
    File(PathBuf),
}

impl SinkTarget {
    pub fn from_output(output: Option<&PathBuf>) -> Self {
        match output {
            Some(path) => Self::File(path.clone()),
            None => Self::Stdout,
        }
    }
}

/// The sink task. Consumes [`AuditEvent`]s until the channel closes.
pub struct EventSink {
    target: SinkTarget,
}

impl EventSink {
    pub fn new(target: SinkTarget) -> Self {
        Self { target }
    }

    /// Spawn the sink task.
    pub fn run(self, mut events_rx: mpsc::Receiver<AuditEvent>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut writer = open_writer(&self.target).await?;
            let mut written: u64 = 0;

            while let Some(event) = events_rx.recv().await {
                let mut line =
                    serde_json::to_vec(&event).context("failed to serialize audit event")?;
                line.push(b'\n');
                writer
                    .write_all(&line)
                    .await
                    .context("failed to write audit event")?;
                writer.flush().await.context("failed to flush event sink")?;
                written += 1;
            }

            debug!(written, "event sink drained, exiting");
            Ok(())
        })
    }
}

async fn open_writer(target: &SinkTarget) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
    match target {
        SinkTarget::Stdout => Ok(Box::new(tokio::io::stdout())),
        SinkTarget::File(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create sink directory {}", parent.display())
                })?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("failed to open event sink {}", path.display()))?;
            info!(path = %path.display(), "event sink: writing to file");
            Ok(Box::new(BufWriter::new(file)))
        }
    }
}
