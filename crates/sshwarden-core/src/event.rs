//! The enriched audit-event model.
//!
//! Every record sshwarden emits -- a login observed in the journal or a
//! kernel audit event correlated to that login -- is an [`AuditEvent`].
//! The serialized field names are a wire contract consumed by downstream
//! collectors; changing them is a breaking change.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type for a login (successful or failed) parsed from the journal.
pub const EVENT_TYPE_LOGIN: &str = "UserLogin";

/// Event type for a correlated per-session audit event.
pub const EVENT_TYPE_USER_ACTION: &str = "UserAction";

/// Sentinel identity used when no certificate-derived user id is available.
pub const UNKNOWN_USER: &str = "unknown";

/// Whether the recorded operation succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Where an event originated, from the remote peer's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    /// Source address family, currently always `"IP"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The source address, or `"unknown"` when sshd did not report one.
    pub value: String,
    /// Additional source attributes (e.g. the remote port).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, serde_json::Value>>,
}

impl EventSource {
    /// An IP source with a known remote port.
    pub fn ip(value: impl Into<String>, port: impl Into<String>) -> Self {
        let mut extra = HashMap::new();
        extra.insert("port".to_string(), serde_json::Value::String(port.into()));
        Self {
            kind: "IP".to_string(),
            value: value.into(),
            extra: Some(extra),
        }
    }

    /// An IP source without port information.
    pub fn ip_without_port(value: impl Into<String>) -> Self {
        Self {
            kind: "IP".to_string(),
            value: value.into(),
            extra: None,
        }
    }
}

/// Correlation metadata attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// The auditd sequence identifier, as a decimal string. Empty for
    /// events that did not originate in the kernel audit stream.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub audit_id: String,
    /// Free-form event attributes: login extras (`alg`, `ssh_key_sum`,
    /// certificate data) or the coalesced summary (`action`, `how`,
    /// `object`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One fully formed event, ready for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// `"UserLogin"` or `"UserAction"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// When the underlying operation was logged.
    #[serde(rename = "loggedAt")]
    pub logged_at: DateTime<Utc>,
    pub source: EventSource,
    pub outcome: Outcome,
    /// Identity attributes: `userID`, `loggedAs`, `pid`.
    pub subjects: HashMap<String, String>,
    /// Subsystem that produced the event: `"sshd"` or `"auditd"`.
    pub component: String,
    /// The machine the event happened on: `host`, `machine-id`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub target: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "EventMetadata::is_empty")]
    pub metadata: EventMetadata,
}

impl EventMetadata {
    pub fn is_empty(&self) -> bool {
        self.audit_id.is_empty() && self.extra.is_empty()
    }
}

impl AuditEvent {
    pub fn new(
        kind: &str,
        source: EventSource,
        outcome: Outcome,
        subjects: HashMap<String, String>,
        component: &str,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            logged_at: Utc::now(),
            source,
            outcome,
            subjects,
            component: component.to_string(),
            target: HashMap::new(),
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_target(mut self, target: HashMap<String, String>) -> Self {
        self.target = target;
        self
    }

    /// Merge additional attributes into `metadata.extra`.
    pub fn with_extra(mut self, extra: HashMap<String, serde_json::Value>) -> Self {
        self.metadata.extra.extend(extra);
        self
    }
}

/// A successful remote login, handed from the sshd parser to the
/// correlator. The wrapped event has already been written to the sink;
/// this type only exists to bind the sshd pid and certificate identity
/// to a future audit session.
#[derive(Debug, Clone)]
pub struct RemoteUserLogin {
    /// The original `UserLogin` event, kept for enrichment.
    pub event: AuditEvent,
    /// The sshd process id reported by the journal.
    pub pid: i32,
    /// Certificate-derived user identity, or [`UNKNOWN_USER`]. Stamped
    /// as `userID` on every event enriched under this login's session.
    pub cred_user_id: String,
}
