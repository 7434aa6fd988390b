//! Single-line audit record parsing.
//!
//! Each line of the kernel audit stream has the shape
//! `type=SYSCALL msg=audit(1671486844.155:499): key=val key2="val 2" ...`.
//! USER_* records additionally nest a PAM payload inside `msg='...'`; its
//! keys merge into the record without overwriting the outer ones.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// The record types sshwarden distinguishes. Everything else is carried
/// as [`RecordType::Other`] with its raw name preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    CredAcq,
    CredDisp,
    CredRefr,
    Cwd,
    Eoe,
    Login,
    Path,
    Proctitle,
    Sockaddr,
    Syscall,
    UserAcct,
    UserAuth,
    UserCmd,
    UserEnd,
    UserErr,
    UserLogin,
    UserLogout,
    UserStart,
    Other,
}

impl RecordType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "CRED_ACQ" => Self::CredAcq,
            "CRED_DISP" => Self::CredDisp,
            "CRED_REFR" => Self::CredRefr,
            "CWD" => Self::Cwd,
            "EOE" => Self::Eoe,
            "LOGIN" => Self::Login,
            "PATH" => Self::Path,
            "PROCTITLE" => Self::Proctitle,
            "SOCKADDR" => Self::Sockaddr,
            "SYSCALL" => Self::Syscall,
            "USER_ACCT" => Self::UserAcct,
            "USER_AUTH" => Self::UserAuth,
            "USER_CMD" => Self::UserCmd,
            "USER_END" => Self::UserEnd,
            "USER_ERR" => Self::UserErr,
            "USER_LOGIN" => Self::UserLogin,
            "USER_LOGOUT" => Self::UserLogout,
            "USER_START" => Self::UserStart,
            _ => Self::Other,
        }
    }

    /// Whether this record type closes its event. Only EOE, the explicit
    /// end marker, terminates an event; everything else may be followed
    /// by more records for the same sequence id.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Eoe)
    }
}

/// One parsed audit record.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub rtype: RecordType,
    /// The raw `type=` value, kept for [`RecordType::Other`] records.
    pub type_name: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub fields: HashMap<String, String>,
}

impl AuditRecord {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn session(&self) -> Option<&str> {
        self.field("ses")
    }
}

/// Parse one audit log line. A line that does not carry a well-formed
/// `type=... msg=audit(ts:seq):` header indicates stream corruption and is
/// an error; the caller decides whether that is fatal.
pub fn parse_line(line: &str) -> Result<AuditRecord> {
    let mut rest = line.trim();

    // audisp-remote prefixes forwarded records with the origin node.
    if rest.starts_with("node=") {
        rest = rest
            .split_once(' ')
            .map(|(_, r)| r)
            .context("audit record ends after node= prefix")?;
    }

    let rest = rest
        .strip_prefix("type=")
        .context("audit record missing type= header")?;
    let (type_name, rest) = rest
        .split_once(' ')
        .context("audit record missing msg field")?;

    let rest = rest
        .trim_start()
        .strip_prefix("msg=audit(")
        .context("audit record missing msg=audit(...) header")?;
    let (header, payload) = rest
        .split_once("):")
        .context("unterminated audit message header")?;

    let (ts_str, seq_str) = header
        .rsplit_once(':')
        .context("audit message header missing sequence id")?;
    let sequence: u64 = seq_str
        .parse()
        .with_context(|| format!("invalid audit sequence id '{seq_str}'"))?;

    let (secs_str, msec_str) = ts_str
        .split_once('.')
        .context("audit timestamp missing millisecond part")?;
    let secs: i64 = secs_str
        .parse()
        .with_context(|| format!("invalid audit timestamp seconds '{secs_str}'"))?;
    let msec: u32 = msec_str
        .parse()
        .with_context(|| format!("invalid audit timestamp milliseconds '{msec_str}'"))?;
    let timestamp = DateTime::from_timestamp(secs, msec * 1_000_000)
        .context("audit timestamp out of range")?;

    let mut fields = HashMap::new();
    parse_kv(payload.trim(), &mut fields, true);

    Ok(AuditRecord {
        rtype: RecordType::from_name(type_name),
        type_name: type_name.to_string(),
        sequence,
        timestamp,
        fields,
    })
}

/// Parse a whitespace-separated `key=value` payload into `fields`.
///
/// When `overwrite` is false (the nested `msg='...'` payload), keys already
/// present win: the outer record's `pid`/`uid` must not be shadowed by
/// PAM's.
fn parse_kv(input: &str, fields: &mut HashMap<String, String>, overwrite: bool) {
    let mut s = input;
    loop {
        s = s.trim_start();
        if s.is_empty() {
            break;
        }

        let Some(key_end) = s.find(|c: char| c == '=' || c.is_whitespace()) else {
            break; // trailing bare token
        };
        if !s[key_end..].starts_with('=') {
            // Bare token without a value; skip it.
            s = &s[key_end..];
            continue;
        }

        let key = &s[..key_end];
        let (value, quoted, remainder) = take_value(&s[key_end + 1..]);

        if key == "msg" {
            // Nested PAM payload of USER_* records.
            parse_kv(&value, fields, false);
        } else {
            let value = if quoted { value } else { decode_value(key, value) };
            if overwrite {
                fields.insert(key.to_string(), value);
            } else {
                fields.entry(key.to_string()).or_insert(value);
            }
        }
        s = remainder;
    }
}

/// Take one value off the front of `s`, honoring single and double quotes.
/// Returns (value, was_quoted, remainder).
fn take_value(s: &str) -> (String, bool, &str) {
    match s.bytes().next() {
        Some(quote) if quote == b'"' || quote == b'\'' => {
            let body = &s[1..];
            match body.find(quote as char) {
                Some(end) => (body[..end].to_string(), true, &body[end + 1..]),
                None => (body.to_string(), true, ""),
            }
        }
        _ => {
            let end = s.find(char::is_whitespace).unwrap_or(s.len());
            (s[..end].to_string(), false, &s[end..])
        }
    }
}

/// Fields the kernel hex-encodes when the value contains unsafe bytes.
const HEX_ENCODED_FIELDS: &[&str] = &["proctitle", "cmd", "acct", "data"];

fn decode_value(key: &str, value: String) -> String {
    if HEX_ENCODED_FIELDS.contains(&key) && looks_hex(&value) {
        decode_hex(&value)
    } else {
        value
    }
}

fn looks_hex(v: &str) -> bool {
    v.len() >= 2 && v.len() % 2 == 0 && v.bytes().all(|b| b.is_ascii_hexdigit())
}

fn decode_hex(v: &str) -> String {
    let bytes: Vec<u8> = (0..v.len())
        .step_by(2)
        .filter_map(|i| u8::from_str_radix(&v[i..i + 2], 16).ok())
        // NUL separates proctitle arguments.
        .map(|b| if b == 0 { b' ' } else { b })
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
