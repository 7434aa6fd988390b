//! sshwarden daemon orchestration.
//!
//! [`Daemon`] wires the production sources (journalctl, audit log tailer),
//! the sensor components (sshd consumer, auditd consumer, correlation
//! engine), and the event sink together with the bounded channels of the
//! concurrency model, then supervises the tasks until a signal arrives or
//! one of them fails.

pub mod auditlog;
pub mod journald;

use anyhow::{anyhow, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

use sshwarden_core::config::WardenConfig;
use sshwarden_core::host::HostInfo;
use sshwarden_core::sink::{EventSink, SinkTarget};
use sshwarden_sensor::auditd::coalesce::NssResolver;
use sshwarden_sensor::auditd::AuditdConsumer;
use sshwarden_sensor::correlation::{CorrelationEngine, EngineConfig};
use sshwarden_sensor::sshd::SshdConsumer;

use auditlog::AuditLogTailer;
use journald::JournalSource;

/// Capacity of the reassembled-events channel.
const REASSEMBLED_CAPACITY: usize = 16;

/// The daemon: owns configuration and runs the pipeline.
pub struct Daemon {
    config: WardenConfig,
}

impl Daemon {
    pub fn new(config: WardenConfig) -> Result<Self> {
        Ok(Self { config })
    }

    /// Run until a termination signal or the first task failure.
    pub async fn run(self) -> Result<()> {
        let host = HostInfo::resolve(&self.config).context("resolving host identity")?;
        info!(
            node = %host.node_name,
            machine_id = %host.machine_id,
            "host identity resolved"
        );

        // Handoff channels. The line and login channels are rendezvous
        // points; only the sink channel buffers meaningfully.
        let (entries_tx, entries_rx) = mpsc::channel(1);
        let (audit_lines_tx, audit_lines_rx) = mpsc::channel(1);
        let (logins_tx, logins_rx) = mpsc::channel(1);
        let (reassembled_tx, reassembled_rx) = mpsc::channel(REASSEMBLED_CAPACITY);
        let (events_tx, events_rx) =
            mpsc::channel(self.config.correlation.event_channel_capacity);

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let sink = EventSink::new(SinkTarget::from_output(self.config.output.as_ref()));
        supervise(&mut tasks, "event sink", sink.run(events_rx));

        supervise(
            &mut tasks,
            "journal source",
            JournalSource::new(&self.config.journal_identifier).run(entries_tx),
        );
        supervise(
            &mut tasks,
            "sshd consumer",
            SshdConsumer::new(host).run(entries_rx, logins_tx, events_tx.clone()),
        );
        supervise(
            &mut tasks,
            "audit source",
            AuditLogTailer::new(self.config.audit_log_path.clone()).run(audit_lines_tx),
        );
        supervise(
            &mut tasks,
            "auditd consumer",
            AuditdConsumer::new(&self.config.reassembly, NssResolver)
                .run(audit_lines_rx, reassembled_tx),
        );
        supervise(
            &mut tasks,
            "correlation engine",
            CorrelationEngine::new(EngineConfig::from(&self.config.correlation), events_tx.clone())
                .run(logins_rx, reassembled_rx),
        );

        // The consumers hold their own clones; the sink must observe the
        // channel closing when they exit.
        drop(events_tx);

        let mut sigterm =
            signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    tasks.abort_all();
                    break;
                }
                _ = sigterm.recv() => {
                    info!("termination signal received, shutting down");
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => {
                        // A task finished cleanly (its input ended).
                        continue;
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "pipeline task failed, shutting down");
                        tasks.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) if e.is_cancelled() => continue,
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return Err(anyhow!("pipeline task panicked: {e}"));
                    }
                    None => {
                        info!("all pipeline tasks finished");
                        break;
                    }
                },
            }
        }

        // Drain aborted tasks; their results no longer matter.
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

/// Aborts the wrapped task when the supervising wrapper is dropped, so
/// `JoinSet::abort_all` reaches the component tasks themselves.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn supervise(tasks: &mut JoinSet<Result<()>>, name: &'static str, handle: JoinHandle<Result<()>>) {
    let abort = handle.abort_handle();
    tasks.spawn(async move {
        let _guard = AbortOnDrop(abort);
        match handle.await {
            Ok(result) => result.with_context(|| format!("{name} failed")),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(anyhow!("{name} panicked: {e}")),
        }
    });
}
