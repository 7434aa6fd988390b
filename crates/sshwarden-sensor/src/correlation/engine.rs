//! The correlation engine that joins logins to audit sessions.
//!
//! The engine owns two tables: `sessions`, keyed by audit session id, and
//! `pending_logins`, keyed by sshd pid. A session binding is created by
//! the audit LOGIN record; the login itself may arrive before or after
//! that record. Events seen before the binding completes are buffered and
//! drained, in order, when the login shows up. The CRED_DISP event is the
//! terminator: it is forwarded and the binding removed, exactly once per
//! bound session.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sshwarden_core::config::CorrelationSettings;
use sshwarden_core::event::{
    AuditEvent, EventMetadata, RemoteUserLogin, EVENT_TYPE_USER_ACTION,
};

use crate::auditd::coalesce::{
    CoalescedEvent, ACTION_DISPOSED_CREDENTIALS, ACTION_SESSION_LOGIN,
};

/// Configuration for the correlation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a pending login or an unbound session binding may wait
    /// for its counterpart.
    pub pending_ttl: Duration,
    /// Interval of the staleness sweep.
    pub sweep_interval: Duration,
    /// Maximum events buffered per session before its login is known.
    pub buffer_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            buffer_capacity: 10_000,
        }
    }
}

impl From<&CorrelationSettings> for EngineConfig {
    fn from(settings: &CorrelationSettings) -> Self {
        Self {
            pending_ttl: settings.pending_ttl(),
            sweep_interval: settings.sweep_interval(),
            buffer_capacity: settings.buffer_capacity,
        }
    }
}

/// Per-session state. `login` is `None` while the audit LOGIN record has
/// arrived but the journal login has not (pending-login state).
struct SessionBinding {
    pid: i32,
    login: Option<RemoteUserLogin>,
    buffer: VecDeque<CoalescedEvent>,
    created_at: Instant,
    dropped: u64,
}

/// A login waiting for its audit LOGIN record.
struct PendingLogin {
    login: RemoteUserLogin,
    seen_at: Instant,
}

/// Joins the login stream and the coalesced audit stream into the
/// enriched event stream.
pub struct CorrelationEngine {
    config: EngineConfig,
    sessions: HashMap<String, SessionBinding>,
    pending_logins: HashMap<i32, PendingLogin>,
    events_tx: mpsc::Sender<AuditEvent>,
    /// Events dropped because their session has no known login.
    dropped_unknown: u64,
}

impl CorrelationEngine {
    pub fn new(config: EngineConfig, events_tx: mpsc::Sender<AuditEvent>) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            pending_logins: HashMap::new(),
            events_tx,
            dropped_unknown: 0,
        }
    }

    /// Spawn the engine task. Consumes both upstreams until they close;
    /// a sink channel failure is fatal.
    pub fn run(
        mut self,
        mut logins_rx: mpsc::Receiver<RemoteUserLogin>,
        mut events_rx: mpsc::Receiver<CoalescedEvent>,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut sweep_timer = tokio::time::interval(self.config.sweep_interval);
            let mut logins_open = true;
            let mut events_open = true;

            while logins_open || events_open {
                tokio::select! {
                    maybe = logins_rx.recv(), if logins_open => match maybe {
                        Some(login) => self.process_login(login).await?,
                        None => logins_open = false,
                    },
                    maybe = events_rx.recv(), if events_open => match maybe {
                        Some(event) => self.process_event(event).await?,
                        None => events_open = false,
                    },
                    _ = sweep_timer.tick() => self.sweep(),
                }
            }

            debug!(
                sessions = self.sessions.len(),
                dropped = self.dropped_unknown,
                "correlation engine shut down"
            );
            Ok(())
        })
    }

    /// Handle a login from the sshd parser.
    pub async fn process_login(&mut self, login: RemoteUserLogin) -> Result<()> {
        // The audit LOGIN record may have arrived first, leaving an
        // unbound session waiting on this pid.
        let session_id = self
            .sessions
            .iter()
            .find(|(_, b)| b.login.is_none() && b.pid == login.pid)
            .map(|(id, _)| id.clone());

        match session_id {
            Some(id) => self.bind(&id, login).await,
            None => {
                if self
                    .pending_logins
                    .insert(
                        login.pid,
                        PendingLogin {
                            login,
                            seen_at: Instant::now(),
                        },
                    )
                    .is_some()
                {
                    debug!("pending login superseded by a newer login for the same pid");
                }
                Ok(())
            }
        }
    }

    /// Handle a coalesced audit event.
    pub async fn process_event(&mut self, event: CoalescedEvent) -> Result<()> {
        let Some(session_id) = event.session_id().map(str::to_string) else {
            // Upstream filters these; tolerate them anyway.
            return Ok(());
        };

        if event.summary.action == ACTION_SESSION_LOGIN {
            return self.process_session_start(session_id, event).await;
        }

        let terminator = event.summary.action == ACTION_DISPOSED_CREDENTIALS;
        let Some(binding) = self.sessions.get_mut(&session_id) else {
            // The session predates us or its login never matched.
            self.dropped_unknown += 1;
            trace!(session = %session_id, "dropping event for unknown session");
            return Ok(());
        };
        let Some(login) = binding.login.clone() else {
            Self::buffer_event(binding, event, self.config.buffer_capacity);
            return Ok(());
        };

        self.forward(&login, event).await?;
        if terminator {
            self.sessions.remove(&session_id);
            debug!(session = %session_id, "session disposed");
        }
        Ok(())
    }

    /// Handle the audit LOGIN record that creates a session.
    async fn process_session_start(
        &mut self,
        session_id: String,
        event: CoalescedEvent,
    ) -> Result<()> {
        let Some(pid) = event.sshd_pid() else {
            warn!(
                sequence = event.sequence,
                "audit login record carries no pid, dropping"
            );
            return Ok(());
        };

        match self.pending_logins.remove(&pid) {
            Some(pending) => {
                let login = pending.login;
                if self
                    .sessions
                    .insert(
                        session_id.clone(),
                        SessionBinding {
                            pid,
                            login: Some(login.clone()),
                            buffer: VecDeque::new(),
                            created_at: Instant::now(),
                            dropped: 0,
                        },
                    )
                    .is_some()
                {
                    debug!(session = %session_id, "replaced existing binding for session");
                }
                self.forward(&login, event).await
            }
            None => {
                let mut buffer = VecDeque::new();
                buffer.push_back(event);
                self.sessions.insert(
                    session_id,
                    SessionBinding {
                        pid,
                        login: None,
                        buffer,
                        created_at: Instant::now(),
                        dropped: 0,
                    },
                );
                Ok(())
            }
        }
    }

    /// Complete a pending-login binding: attach the login, drain the
    /// buffer in order, and dispose the session if its terminator was
    /// among the buffered events.
    async fn bind(&mut self, session_id: &str, login: RemoteUserLogin) -> Result<()> {
        let Some(binding) = self.sessions.get_mut(session_id) else {
            return Ok(());
        };
        binding.login = Some(login.clone());
        if binding.dropped > 0 {
            warn!(
                session = %session_id,
                dropped = binding.dropped,
                "events were dropped from the pre-binding buffer"
            );
        }
        let buffered: Vec<CoalescedEvent> = binding.buffer.drain(..).collect();

        let mut dispose = false;
        for event in buffered {
            if event.summary.action == ACTION_DISPOSED_CREDENTIALS {
                dispose = true;
            }
            self.forward(&login, event).await?;
        }

        if dispose {
            self.sessions.remove(session_id);
            debug!(session = %session_id, "session disposed while draining buffer");
        }
        Ok(())
    }

    fn buffer_event(binding: &mut SessionBinding, event: CoalescedEvent, capacity: usize) {
        if binding.buffer.len() >= capacity {
            binding.buffer.pop_front();
            binding.dropped += 1;
        }
        binding.buffer.push_back(event);
    }

    /// Evict state that has waited too long for its counterpart.
    pub fn sweep(&mut self) {
        let ttl = self.config.pending_ttl;

        let before = self.pending_logins.len();
        self.pending_logins.retain(|_, p| p.seen_at.elapsed() < ttl);
        let evicted = before - self.pending_logins.len();
        if evicted > 0 {
            debug!(evicted, "evicted stale pending logins");
        }

        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, b)| b.login.is_none() && b.created_at.elapsed() >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(binding) = self.sessions.remove(&id) {
                debug!(
                    session = %id,
                    buffered = binding.buffer.len(),
                    "disposed session that never saw its login"
                );
            }
        }
    }

    async fn forward(&self, login: &RemoteUserLogin, event: CoalescedEvent) -> Result<()> {
        let enriched = enrich(login, event);
        self.events_tx
            .send(enriched)
            .await
            .map_err(|_| anyhow!("events sink channel closed"))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_login_count(&self) -> usize {
        self.pending_logins.len()
    }

    pub fn dropped_unknown(&self) -> u64 {
        self.dropped_unknown
    }
}

/// Attach the login's identity to an audit event. The subjects come from
/// the login (`userID` from its certificate-derived identity); the
/// event's own resolved actor rides along in `metadata.extra`.
fn enrich(login: &RemoteUserLogin, event: CoalescedEvent) -> AuditEvent {
    let mut extra = HashMap::new();
    extra.insert(
        "action".to_string(),
        serde_json::Value::String(event.summary.action.clone()),
    );
    extra.insert(
        "how".to_string(),
        serde_json::Value::String(event.summary.how.clone()),
    );
    extra.insert(
        "object".to_string(),
        serde_json::to_value(&event.summary.object).unwrap_or(serde_json::Value::Null),
    );
    if let Some(actor) = &event.actor {
        extra.insert(
            "actor".to_string(),
            serde_json::Value::String(actor.clone()),
        );
    }

    let mut subjects = login.event.subjects.clone();
    subjects.insert("userID".to_string(), login.cred_user_id.clone());

    AuditEvent {
        kind: EVENT_TYPE_USER_ACTION.to_string(),
        logged_at: event.timestamp,
        source: login.event.source.clone(),
        outcome: event.outcome,
        subjects,
        component: "auditd".to_string(),
        target: login.event.target.clone(),
        metadata: EventMetadata {
            audit_id: event.sequence.to_string(),
            extra,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    use sshwarden_core::event::{
        EventSource, Outcome, EVENT_TYPE_LOGIN,
    };

    use crate::auditd::coalesce::{ObjectSummary, Summary};

    fn login(pid: i32) -> RemoteUserLogin {
        let mut subjects = StdHashMap::new();
        subjects.insert("userID".to_string(), "foo@bar.com".to_string());
        subjects.insert("loggedAs".to_string(), "user".to_string());
        subjects.insert("pid".to_string(), pid.to_string());

        let mut target = StdHashMap::new();
        target.insert("host".to_string(), "localhost".to_string());
        target.insert("machine-id".to_string(), "foobar".to_string());

        let event = AuditEvent::new(
            EVENT_TYPE_LOGIN,
            EventSource::ip("127.0.0.1", "666"),
            Outcome::Succeeded,
            subjects,
            "sshd",
        )
        .with_target(target);

        RemoteUserLogin {
            event,
            pid,
            cred_user_id: "foo@bar.com".to_string(),
        }
    }

    fn audit_event(sequence: u64, session: &str, action: &str) -> CoalescedEvent {
        audit_event_with_pid(sequence, session, action, Some(25007))
    }

    fn audit_event_with_pid(
        sequence: u64,
        session: &str,
        action: &str,
        pid: Option<i32>,
    ) -> CoalescedEvent {
        CoalescedEvent {
            sequence,
            timestamp: Utc::now(),
            session: Some(session.to_string()),
            outcome: Outcome::Succeeded,
            pid,
            actor: Some("user".to_string()),
            summary: Summary {
                action: action.to_string(),
                how: "/usr/sbin/sshd".to_string(),
                object: ObjectSummary {
                    kind: "user-session".to_string(),
                    primary: "ssh".to_string(),
                    secondary: "127.0.0.1".to_string(),
                },
            },
        }
    }

    fn engine(capacity: usize) -> (CorrelationEngine, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(300);
        let config = EngineConfig {
            buffer_capacity: capacity,
            ..EngineConfig::default()
        };
        (CorrelationEngine::new(config, tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<AuditEvent>) -> Vec<AuditEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn login_first_enriches_immediately() {
        let (mut engine, mut rx) = engine(100);

        engine.process_login(login(25007)).await.unwrap();
        assert_eq!(engine.pending_login_count(), 1);

        engine
            .process_event(audit_event(480, "4", ACTION_SESSION_LOGIN))
            .await
            .unwrap();
        assert_eq!(engine.pending_login_count(), 0);
        assert_eq!(engine.session_count(), 1);

        engine
            .process_event(audit_event(481, "4", "started-session"))
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        for event in &events {
            assert_eq!(event.kind, EVENT_TYPE_USER_ACTION);
            assert_eq!(event.subjects["userID"], "foo@bar.com");
            assert_eq!(event.subjects["pid"], "25007");
            assert_eq!(event.source.value, "127.0.0.1");
            assert_eq!(event.target["machine-id"], "foobar");
        }
        assert_eq!(events[0].metadata.audit_id, "480");
        assert_eq!(events[1].metadata.audit_id, "481");
        assert_eq!(events[1].metadata.extra["action"], "started-session");
        assert_eq!(events[1].metadata.extra["object"]["type"], "user-session");
        assert_eq!(events[1].metadata.extra["actor"], "user");
    }

    #[tokio::test]
    async fn audit_first_buffers_then_drains_in_order() {
        let (mut engine, mut rx) = engine(100);

        engine
            .process_event(audit_event(480, "4", ACTION_SESSION_LOGIN))
            .await
            .unwrap();
        engine
            .process_event(audit_event(481, "4", "started-session"))
            .await
            .unwrap();
        engine
            .process_event(audit_event(482, "4", "executed"))
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.session_count(), 1);

        engine.process_login(login(25007)).await.unwrap();

        let events = drain(&mut rx);
        let ids: Vec<&str> = events.iter().map(|e| e.metadata.audit_id.as_str()).collect();
        assert_eq!(ids, vec!["480", "481", "482"]);
        assert_eq!(events[0].subjects["loggedAs"], "user");
    }

    #[tokio::test]
    async fn disposal_is_terminal_and_exactly_once() {
        let (mut engine, mut rx) = engine(100);

        engine.process_login(login(25007)).await.unwrap();
        engine
            .process_event(audit_event(480, "4", ACTION_SESSION_LOGIN))
            .await
            .unwrap();
        engine
            .process_event(audit_event(488, "4", ACTION_DISPOSED_CREDENTIALS))
            .await
            .unwrap();
        assert_eq!(engine.session_count(), 0);

        // Nothing may be forwarded for the session after disposal.
        engine
            .process_event(audit_event(489, "4", "executed"))
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].metadata.extra["action"],
            ACTION_DISPOSED_CREDENTIALS
        );
        assert_eq!(engine.dropped_unknown(), 1);
    }

    #[tokio::test]
    async fn buffered_terminator_disposes_after_drain() {
        let (mut engine, mut rx) = engine(100);

        engine
            .process_event(audit_event(480, "4", ACTION_SESSION_LOGIN))
            .await
            .unwrap();
        engine
            .process_event(audit_event(487, "4", "ended-session"))
            .await
            .unwrap();
        engine
            .process_event(audit_event(488, "4", ACTION_DISPOSED_CREDENTIALS))
            .await
            .unwrap();

        engine.process_login(login(25007)).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2].metadata.extra["action"],
            ACTION_DISPOSED_CREDENTIALS
        );
        assert_eq!(engine.session_count(), 0);
    }

    #[tokio::test]
    async fn events_for_unknown_sessions_are_dropped() {
        let (mut engine, mut rx) = engine(100);
        engine
            .process_event(audit_event(700, "9", "executed"))
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.dropped_unknown(), 1);
        assert_eq!(engine.session_count(), 0);
    }

    #[tokio::test]
    async fn buffer_overflow_drops_oldest() {
        let (mut engine, mut rx) = engine(2);

        engine
            .process_event(audit_event(480, "4", ACTION_SESSION_LOGIN))
            .await
            .unwrap();
        // Buffer holds [480]; two more fill and overflow it.
        engine
            .process_event(audit_event(481, "4", "executed"))
            .await
            .unwrap();
        engine
            .process_event(audit_event(482, "4", "executed"))
            .await
            .unwrap();

        engine.process_login(login(25007)).await.unwrap();

        let events = drain(&mut rx);
        let ids: Vec<&str> = events.iter().map(|e| e.metadata.audit_id.as_str()).collect();
        // 480 was the oldest buffered event and was dropped.
        assert_eq!(ids, vec!["481", "482"]);
    }

    #[tokio::test]
    async fn newer_login_supersedes_pending_one() {
        let (mut engine, mut rx) = engine(100);

        let mut first = login(25007);
        first
            .event
            .subjects
            .insert("userID".to_string(), "old@example".to_string());
        first.cred_user_id = "old@example".to_string();
        engine.process_login(first).await.unwrap();
        engine.process_login(login(25007)).await.unwrap();
        assert_eq!(engine.pending_login_count(), 1);

        engine
            .process_event(audit_event(480, "4", ACTION_SESSION_LOGIN))
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(events[0].subjects["userID"], "foo@bar.com");
    }

    #[tokio::test]
    async fn sweep_evicts_stale_state() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = EngineConfig {
            pending_ttl: Duration::ZERO,
            ..EngineConfig::default()
        };
        let mut engine = CorrelationEngine::new(config, tx);

        engine.process_login(login(31999)).await.unwrap();
        engine
            .process_event(audit_event_with_pid(600, "7", ACTION_SESSION_LOGIN, Some(31000)))
            .await
            .unwrap();
        assert_eq!(engine.pending_login_count(), 1);
        assert_eq!(engine.session_count(), 1);

        engine.sweep();
        assert_eq!(engine.pending_login_count(), 0);
        assert_eq!(engine.session_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn run_loop_consumes_both_streams() {
        let (events_out_tx, mut events_out_rx) = mpsc::channel(300);
        let engine = CorrelationEngine::new(EngineConfig::default(), events_out_tx);

        let (logins_tx, logins_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(16);
        let handle = engine.run(logins_rx, events_rx);

        events_tx
            .send(audit_event(480, "4", ACTION_SESSION_LOGIN))
            .await
            .unwrap();
        logins_tx.send(login(25007)).await.unwrap();
        events_tx
            .send(audit_event(488, "4", ACTION_DISPOSED_CREDENTIALS))
            .await
            .unwrap();

        drop(logins_tx);
        drop(events_tx);
        handle.await.unwrap().unwrap();

        let mut actions = Vec::new();
        while let Ok(e) = events_out_rx.try_recv() {
            actions.push(e.metadata.extra["action"].as_str().unwrap().to_string());
        }
        assert_eq!(
            actions,
            vec!["changed-login-id-to", "disposed-credentials"]
        );
    }
}
