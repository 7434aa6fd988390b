//! The sshd consumer loop: journal entries in, login events out.

use anyhow::Result;
use chrono::DateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sshwarden_core::event::{
    AuditEvent, EventSource, Outcome, RemoteUserLogin, EVENT_TYPE_LOGIN,
};
use sshwarden_core::host::HostInfo;

use super::parser::{self, ParsedLogin};

/// One sshd log entry read from the system journal.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub message: String,
    /// Journal `__REALTIME_TIMESTAMP`: microseconds since the epoch.
    pub timestamp_usec: u64,
    /// The sshd pid the journal attributes the message to.
    pub pid: String,
}

/// Consumes journal entries, writes every recognized authentication message
/// to the sink as a `UserLogin` event, and forwards successful logins to
/// the correlator.
pub struct SshdConsumer {
    host: HostInfo,
}

impl SshdConsumer {
    pub fn new(host: HostInfo) -> Self {
        Self { host }
    }

    /// Spawn the consumer task. Exits when the entries channel closes.
    /// A sink or correlator channel failure is fatal.
    pub fn run(
        self,
        mut entries_rx: mpsc::Receiver<JournalEntry>,
        logins_tx: mpsc::Sender<RemoteUserLogin>,
        events_tx: mpsc::Sender<AuditEvent>,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut unmatched: u64 = 0;

            while let Some(entry) = entries_rx.recv().await {
                let Some(parsed) = parser::parse_entry(&entry.message) else {
                    unmatched += 1;
                    continue;
                };

                let outcome = parsed.outcome;
                let user_id = parsed.user_id.clone();
                let event = build_login_event(parsed, &entry, &self.host);

                if events_tx.send(event.clone()).await.is_err() {
                    anyhow::bail!("event sink channel closed while writing login event");
                }

                if outcome == Outcome::Succeeded {
                    match entry.pid.parse::<i32>() {
                        Ok(pid) => {
                            let login = RemoteUserLogin {
                                event,
                                pid,
                                cred_user_id: user_id,
                            };
                            if logins_tx.send(login).await.is_err() {
                                anyhow::bail!("logins channel closed while forwarding login");
                            }
                        }
                        Err(_) => {
                            warn!(
                                pid = %entry.pid,
                                "journal entry has a non-numeric pid, login cannot be correlated"
                            );
                        }
                    }
                }
            }

            debug!(unmatched, "sshd consumer: journal stream ended");
            Ok(())
        })
    }
}

fn build_login_event(parsed: ParsedLogin, entry: &JournalEntry, host: &HostInfo) -> AuditEvent {
    let source = match parsed.port {
        Some(port) => EventSource::ip(parsed.source, port),
        None => EventSource::ip_without_port(parsed.source),
    };

    let mut subjects = std::collections::HashMap::new();
    subjects.insert("loggedAs".to_string(), parsed.logged_as);
    subjects.insert("userID".to_string(), parsed.user_id);
    subjects.insert("pid".to_string(), entry.pid.clone());

    let mut event = AuditEvent::new(EVENT_TYPE_LOGIN, source, parsed.outcome, subjects, "sshd")
        .with_target(host.target())
        .with_extra(parsed.extra);

    if let Some(ts) = DateTime::from_timestamp_micros(entry.timestamp_usec as i64) {
        event.logged_at = ts;
    }

    event
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostInfo {
        HostInfo {
            node_name: "localhost".to_string(),
            machine_id: "foobar".to_string(),
        }
    }

    fn entry(message: &str) -> JournalEntry {
        JournalEntry {
            message: message.to_string(),
            timestamp_usec: 1_671_486_844_155_000,
            pid: "25007".to_string(),
        }
    }

    async fn run_consumer(
        entries: Vec<JournalEntry>,
    ) -> (Vec<AuditEvent>, Vec<RemoteUserLogin>) {
        let (entries_tx, entries_rx) = mpsc::channel(8);
        let (logins_tx, mut logins_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let handle = SshdConsumer::new(host()).run(entries_rx, logins_tx, events_tx);
        for e in entries {
            entries_tx.send(e).await.unwrap();
        }
        drop(entries_tx);
        handle.await.unwrap().unwrap();

        let mut events = Vec::new();
        while let Ok(e) = events_rx.try_recv() {
            events.push(e);
        }
        let mut logins = Vec::new();
        while let Ok(l) = logins_rx.try_recv() {
            logins.push(l);
        }
        (events, logins)
    }

    #[tokio::test]
    async fn successful_login_reaches_sink_and_correlator() {
        let (events, logins) = run_consumer(vec![entry(
            "Accepted publickey for alice from 10.0.0.1 port 51234 ssh2: ED25519 SHA256:abc \
             ID alice@example (serial 42) CA ssh-rsa SHA256:ca",
        )])
        .await;

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.kind, EVENT_TYPE_LOGIN);
        assert_eq!(event.outcome, Outcome::Succeeded);
        assert_eq!(event.subjects["loggedAs"], "alice");
        assert_eq!(event.subjects["userID"], "alice@example");
        assert_eq!(event.subjects["pid"], "25007");
        assert_eq!(event.target["host"], "localhost");
        assert_eq!(event.metadata.extra["serial"], "42");
        assert_eq!(
            event.logged_at.timestamp_micros(),
            1_671_486_844_155_000_i64
        );

        assert_eq!(logins.len(), 1);
        assert_eq!(logins[0].pid, 25007);
        assert_eq!(logins[0].cred_user_id, "alice@example");
    }

    #[tokio::test]
    async fn failed_login_reaches_sink_only() {
        let (events, logins) =
            run_consumer(vec![entry("Invalid user eve from 10.0.0.3 port 22000")]).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Failed);
        assert!(logins.is_empty());
    }

    #[tokio::test]
    async fn unrecognized_messages_produce_nothing() {
        let (events, logins) =
            run_consumer(vec![entry("Server listening on 0.0.0.0 port 22.")]).await;
        assert!(events.is_empty());
        assert!(logins.is_empty());
    }
}
