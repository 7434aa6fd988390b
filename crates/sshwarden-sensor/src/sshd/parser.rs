//! Parser for the sshd log message shapes that describe authentication.
//!
//! Four shapes are recognized; anything else is ignored by the caller.
//! A line that matches an anchor but fails sub-extraction is a data
//! anomaly: it is logged and skipped, never fatal.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use sshwarden_core::event::{Outcome, UNKNOWN_USER};

static ACCEPTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Accepted publickey for (?P<username>\w+) from (?P<source>\S+) port (?P<port>\d+) ssh[[:alnum:]]+: (?P<alg>[\w-]+) (?P<fingerprint>\S+)",
    )
    .expect("accepted-publickey regex")
});

static CERT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ID (?P<user_id>\S+)\s+\(serial (?P<serial>\d+)\)\s+(?P<ca>.+)")
        .expect("certificate-identity regex")
});

static NOT_ALLOWED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"User (?P<username>\w+) from (?P<source>\S+) not allowed because not listed in AllowUsers")
        .expect("not-in-allowusers regex")
});

static INVALID_USER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Invalid user (?P<username>\w+) from (?P<source>\S+) port (?P<port>\d+)")
        .expect("invalid-user regex")
});

const CERT_INVALID_PREFIX: &str = "Certificate invalid: ";

/// A recognized sshd authentication message, ready to become an event.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLogin {
    pub outcome: Outcome,
    /// The unix account name, or `"unknown"`.
    pub logged_as: String,
    /// Certificate-derived user identity, or `"unknown"`.
    pub user_id: String,
    /// Source IP, or `"unknown"` when sshd did not report one.
    pub source: String,
    pub port: Option<String>,
    /// Authentication extras: `alg` / `ssh_key_sum` and optional
    /// certificate `serial` / `ca`, or `error` / `reason` on failures.
    pub extra: HashMap<String, serde_json::Value>,
}

/// Dispatch a journal message on its anchor. Returns `None` for messages
/// sshwarden does not care about, and for anchor matches whose
/// sub-extraction failed (already logged).
pub fn parse_entry(message: &str) -> Option<ParsedLogin> {
    if message.starts_with("Accepted publickey") {
        parse_accepted_publickey(message)
    } else if message.starts_with("Certificate invalid:") {
        Some(parse_certificate_invalid(message))
    } else if message.ends_with("not allowed because not listed in AllowUsers") {
        parse_not_in_allow_users(message)
    } else if message.starts_with("Invalid user") {
        parse_invalid_user(message)
    } else {
        None
    }
}

fn parse_accepted_publickey(message: &str) -> Option<ParsedLogin> {
    let Some(caps) = ACCEPTED_RE.captures(message) else {
        warn!("accepted-publickey entry has no matches for identifiers");
        return None;
    };

    let mut extra = HashMap::new();
    extra.insert("alg".to_string(), json_str(&caps["alg"]));
    extra.insert("ssh_key_sum".to_string(), json_str(&caps["fingerprint"]));

    let mut login = ParsedLogin {
        outcome: Outcome::Succeeded,
        logged_as: caps["username"].to_string(),
        user_id: UNKNOWN_USER.to_string(),
        source: caps["source"].to_string(),
        port: Some(caps["port"].to_string()),
        extra,
    };

    // A certificate identity clause may trail the base match:
    //   ... ID user@host (serial N) CA <key>
    let matched_len = caps.get(0).map(|m| m.end()).unwrap_or(message.len());
    let remainder = message[matched_len..].trim_start();
    if remainder.is_empty() {
        return Some(login);
    }

    let Some(id_caps) = CERT_ID_RE.captures(remainder) else {
        warn!("accepted-publickey entry has no matches for certificate identifiers");
        return Some(login);
    };

    login.user_id = id_caps["user_id"].to_string();
    login
        .extra
        .insert("serial".to_string(), json_str(&id_caps["serial"]));
    login.extra.insert("ca".to_string(), json_str(&id_caps["ca"]));
    Some(login)
}

fn parse_certificate_invalid(message: &str) -> ParsedLogin {
    let reason = if message.len() <= CERT_INVALID_PREFIX.len() {
        "unknown reason"
    } else {
        &message[CERT_INVALID_PREFIX.len()..]
    };

    let mut extra = HashMap::new();
    extra.insert("error".to_string(), json_str("certificate invalid"));
    extra.insert("reason".to_string(), json_str(reason));

    // sshd does not report the peer address on this path.
    ParsedLogin {
        outcome: Outcome::Failed,
        logged_as: UNKNOWN_USER.to_string(),
        user_id: UNKNOWN_USER.to_string(),
        source: UNKNOWN_USER.to_string(),
        port: Some(UNKNOWN_USER.to_string()),
        extra,
    }
}

fn parse_not_in_allow_users(message: &str) -> Option<ParsedLogin> {
    let Some(caps) = NOT_ALLOWED_RE.captures(message) else {
        warn!("not-in-allowusers entry has no matches for identifiers");
        return None;
    };

    Some(ParsedLogin {
        outcome: Outcome::Failed,
        logged_as: caps["username"].to_string(),
        user_id: UNKNOWN_USER.to_string(),
        source: caps["source"].to_string(),
        port: None,
        extra: HashMap::new(),
    })
}

fn parse_invalid_user(message: &str) -> Option<ParsedLogin> {
    let Some(caps) = INVALID_USER_RE.captures(message) else {
        warn!("invalid-user entry has no matches for identifiers");
        return None;
    };

    Some(ParsedLogin {
        outcome: Outcome::Failed,
        logged_as: caps["username"].to_string(),
        user_id: UNKNOWN_USER.to_string(),
        source: caps["source"].to_string(),
        port: Some(caps["port"].to_string()),
        extra: HashMap::new(),
    })
}

fn json_str(s: &str) -> serde_json::Value {
    serde_json::Value::String(s.to_string())
}
