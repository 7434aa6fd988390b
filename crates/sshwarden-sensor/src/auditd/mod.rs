//! Kernel audit stream integration.
//!
//! [`record`] parses single lines, [`reassembler`] groups them into
//! logical events, [`coalesce`] merges each group into a summarized event.
//! [`AuditdConsumer`] is the task that runs all three over a line stream
//! and forwards session-tagged events to the correlator.

pub mod coalesce;
pub mod record;
pub mod reassembler;
mod tables;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sshwarden_core::config::ReassemblySettings;

use coalesce::{CoalescedEvent, Coalescer, IdResolver};
use record::AuditRecord;
use reassembler::{Reassembler, ReassemblerConfig};

/// The audit pipeline task: lines in, coalesced session events out.
pub struct AuditdConsumer<R: IdResolver> {
    reassembler: Reassembler,
    coalescer: Coalescer<R>,
    maintain_interval: Duration,
}

impl<R: IdResolver + 'static> AuditdConsumer<R> {
    pub fn new(settings: &ReassemblySettings, resolver: R) -> Self {
        Self {
            reassembler: Reassembler::new(ReassemblerConfig {
                max_in_flight: settings.max_in_flight,
                event_timeout: settings.event_timeout(),
            }),
            coalescer: Coalescer::new(resolver),
            maintain_interval: settings.maintain_interval(),
        }
    }

    /// Spawn the pipeline task.
    ///
    /// A malformed audit line means the stream is corrupt and is fatal.
    /// A coalesce failure discards only the affected group. Exits after
    /// draining when the lines channel closes.
    pub fn run(
        mut self,
        mut lines_rx: mpsc::Receiver<String>,
        events_tx: mpsc::Sender<CoalescedEvent>,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.maintain_interval);

            loop {
                tokio::select! {
                    maybe_line = lines_rx.recv() => match maybe_line {
                        Some(line) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let record = record::parse_line(&line)
                                .with_context(|| format!("corrupt audit record: {line}"))?;
                            let groups = self.reassembler.push(record);
                            emit(&self.coalescer, groups, &events_tx).await?;
                        }
                        None => {
                            let groups = self.reassembler.flush_all();
                            emit(&self.coalescer, groups, &events_tx).await?;
                            break;
                        }
                    },
                    _ = tick.tick() => {
                        let groups = self.reassembler.maintain();
                        emit(&self.coalescer, groups, &events_tx).await?;
                    }
                }
            }

            if self.reassembler.lost() > 0 {
                warn!(
                    lost = self.reassembler.lost(),
                    "audit records were lost during reassembly"
                );
            }
            debug!("auditd consumer: line stream ended");
            Ok(())
        })
    }
}

async fn emit<R: IdResolver>(
    coalescer: &Coalescer<R>,
    groups: Vec<Vec<AuditRecord>>,
    events_tx: &mpsc::Sender<CoalescedEvent>,
) -> Result<()> {
    for group in groups {
        match coalescer.coalesce(&group) {
            Ok(event) => {
                // Events outside an interactive session never reach the
                // correlator.
                if event.session_id().is_none() {
                    continue;
                }
                if events_tx.send(event).await.is_err() {
                    anyhow::bail!("reassembled events channel closed");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to coalesce audit event group, discarding");
            }
        }
    }
    Ok(())
}
