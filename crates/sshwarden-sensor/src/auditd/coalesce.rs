//! Coalescing: merging a reassembled record group into one summarized
//! event.
//!
//! Resolution is deterministic: the same record group always yields the
//! same `{action, how, object}` summary, so golden-data tests can pin the
//! output. Numeric identities resolve through [`IdResolver`], which keeps
//! coalescing pure on systems without NSS and in tests.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use sshwarden_core::event::Outcome;

use super::record::{AuditRecord, RecordType};
use super::tables::{self, ObjectClass};

/// Coalesced action for the audit LOGIN record that creates a session.
pub const ACTION_SESSION_LOGIN: &str = "changed-login-id-to";

/// Coalesced action for CRED_DISP, the session terminator marker.
pub const ACTION_DISPOSED_CREDENTIALS: &str = "disposed-credentials";

/// The numeric form of an unset audit id/session.
const UNSET_ID: &str = "4294967295";

/// Resolves numeric user ids to symbolic names.
pub trait IdResolver: Send + Sync {
    fn user_name(&self, uid: u32) -> Option<String>;
}

/// NSS-backed resolver for production use.
pub struct NssResolver;

impl IdResolver for NssResolver {
    fn user_name(&self, uid: u32) -> Option<String> {
        nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
    }
}

/// Fixed-table resolver for tests and NSS-less systems.
#[derive(Default)]
pub struct StaticResolver {
    users: HashMap<u32, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, uid: u32, name: &str) -> Self {
        self.users.insert(uid, name.to_string());
        self
    }
}

impl IdResolver for StaticResolver {
    fn user_name(&self, uid: u32) -> Option<String> {
        self.users.get(&uid).cloned()
    }
}

/// The object an action operated on.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectSummary {
    #[serde(rename = "type")]
    pub kind: String,
    pub primary: String,
    pub secondary: String,
}

/// `{action, how, object}` -- the human-oriented digest of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub action: String,
    pub how: String,
    pub object: ObjectSummary,
}

/// One coalesced audit event, ready for correlation.
#[derive(Debug, Clone)]
pub struct CoalescedEvent {
    pub sequence: u64,
    /// Timestamp of the group's first record.
    pub timestamp: DateTime<Utc>,
    pub session: Option<String>,
    pub outcome: Outcome,
    /// The pid reported by the primary record. For LOGIN records this is
    /// the sshd pid the session binds to.
    pub pid: Option<i32>,
    /// Resolved login identity (auid) of the acting user.
    pub actor: Option<String>,
    pub summary: Summary,
}

impl CoalescedEvent {
    /// The session id, if this event belongs to an interactive session.
    /// `unset` (textual or numeric) means the event did not originate in
    /// a login session.
    pub fn session_id(&self) -> Option<&str> {
        match self.session.as_deref() {
            Some("") | Some("unset") | Some(UNSET_ID) | None => None,
            Some(s) => Some(s),
        }
    }

    /// The sshd pid an audit LOGIN record binds its session to.
    ///
    /// Kernel versions disagree on whether `pid` or `auid` carries the
    /// sshd pid here; this implementation follows the reference
    /// deployment and reads `pid`. Kept in one place so a deployment can
    /// revisit the choice.
    pub fn sshd_pid(&self) -> Option<i32> {
        self.pid
    }
}

/// Merges completed record groups into [`CoalescedEvent`]s.
pub struct Coalescer<R: IdResolver> {
    resolver: R,
}

impl<R: IdResolver> Coalescer<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub fn coalesce(&self, records: &[AuditRecord]) -> Result<CoalescedEvent> {
        let first = records.first().context("empty audit record group")?;
        let primary = records
            .iter()
            .find(|r| is_primary(r.rtype))
            .unwrap_or(first);

        let session = records
            .iter()
            .find(|r| r.rtype == RecordType::Syscall)
            .and_then(AuditRecord::session)
            .or_else(|| records.iter().find_map(AuditRecord::session))
            .map(str::to_string);

        let actor = primary
            .field("auid")
            .and_then(|raw| self.resolve_user(raw));

        Ok(CoalescedEvent {
            sequence: first.sequence,
            timestamp: first.timestamp,
            session,
            outcome: outcome_of(primary),
            pid: primary.field("pid").and_then(|p| p.parse().ok()),
            actor,
            summary: self.summarize(records, primary),
        })
    }

    fn resolve_user(&self, raw: &str) -> Option<String> {
        if raw == UNSET_ID {
            return None;
        }
        let uid: u32 = raw.parse().ok()?;
        Some(
            self.resolver
                .user_name(uid)
                .unwrap_or_else(|| raw.to_string()),
        )
    }

    fn summarize(&self, records: &[AuditRecord], primary: &AuditRecord) -> Summary {
        match primary.rtype {
            RecordType::Syscall => summarize_syscall(records, primary),
            RecordType::Login => Summary {
                action: ACTION_SESSION_LOGIN.to_string(),
                how: how_of(primary),
                object: ObjectSummary {
                    kind: "user-session".to_string(),
                    primary: primary.session().unwrap_or_default().to_string(),
                    secondary: primary
                        .field("auid")
                        .and_then(|raw| self.resolve_user(raw))
                        .unwrap_or_default(),
                },
            },
            RecordType::UserCmd => Summary {
                action: "ran-command".to_string(),
                how: how_of(primary),
                object: ObjectSummary {
                    kind: "process".to_string(),
                    primary: primary.field("cmd").unwrap_or_default().to_string(),
                    secondary: primary.field("cwd").unwrap_or_default().to_string(),
                },
            },
            rtype => match tables::record_action(rtype) {
                Some(action) => Summary {
                    action: action.to_string(),
                    how: how_of(primary),
                    object: ObjectSummary {
                        kind: "user-session".to_string(),
                        primary: primary.field("terminal").unwrap_or_default().to_string(),
                        secondary: primary
                            .field("addr")
                            .or_else(|| primary.field("hostname"))
                            .unwrap_or_default()
                            .to_string(),
                    },
                },
                // A group without a recognized primary record (e.g. a
                // partial event flushed on timeout).
                None => Summary {
                    action: primary.type_name.to_lowercase().replace('_', "-"),
                    how: how_of(primary),
                    object: ObjectSummary::default(),
                },
            },
        }
    }
}

fn is_primary(rtype: RecordType) -> bool {
    !matches!(
        rtype,
        RecordType::Cwd
            | RecordType::Path
            | RecordType::Proctitle
            | RecordType::Sockaddr
            | RecordType::Eoe
            | RecordType::Other
    )
}

fn outcome_of(primary: &AuditRecord) -> Outcome {
    if let Some(success) = primary.field("success") {
        return if success == "yes" {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        };
    }
    if let Some(res) = primary.field("res") {
        return match res {
            "success" | "yes" | "1" => Outcome::Succeeded,
            _ => Outcome::Failed,
        };
    }
    Outcome::Succeeded
}

fn how_of(record: &AuditRecord) -> String {
    record
        .field("exe")
        .or_else(|| record.field("comm"))
        .or_else(|| record.field("terminal"))
        .unwrap_or_default()
        .to_string()
}

fn summarize_syscall(records: &[AuditRecord], syscall: &AuditRecord) -> Summary {
    let name = syscall
        .field("syscall")
        .and_then(|n| n.parse::<u64>().ok())
        .and_then(tables::syscall_name);

    let how = how_of(syscall);

    let Some((action, class)) = name.and_then(tables::syscall_action) else {
        // A syscall outside the table still yields a stable summary.
        return Summary {
            action: "performed-syscall".to_string(),
            how,
            object: ObjectSummary {
                kind: "process".to_string(),
                primary: name
                    .map(str::to_string)
                    .or_else(|| syscall.field("syscall").map(str::to_string))
                    .unwrap_or_default(),
                secondary: String::new(),
            },
        };
    };

    let object = match class {
        ObjectClass::File => {
            let mut paths = records
                .iter()
                .filter(|r| r.rtype == RecordType::Path)
                .filter_map(|r| r.field("name"));
            ObjectSummary {
                kind: "file".to_string(),
                primary: paths.next().unwrap_or_default().to_string(),
                secondary: paths.next().unwrap_or_default().to_string(),
            }
        }
        ObjectClass::Socket => ObjectSummary {
            kind: "socket".to_string(),
            primary: records
                .iter()
                .find(|r| r.rtype == RecordType::Sockaddr)
                .and_then(|r| r.field("saddr"))
                .unwrap_or_default()
                .to_string(),
            secondary: String::new(),
        },
        ObjectClass::Process => ObjectSummary {
            kind: "process".to_string(),
            primary: records
                .iter()
                .find(|r| r.rtype == RecordType::Proctitle)
                .and_then(|r| r.field("proctitle"))
                .unwrap_or_default()
                .to_string(),
            secondary: String::new(),
        },
    };

    Summary {
        action: action.to_string(),
        how,
        object,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auditd::record::parse_line;

    fn coalescer() -> Coalescer<StaticResolver> {
        Coalescer::new(StaticResolver::new().with_user(1000, "user"))
    }

    fn group(lines: &[&str]) -> Vec<AuditRecord> {
        lines.iter().map(|l| parse_line(l).unwrap()).collect()
    }

    #[test]
    fn coalesces_execve_group() {
        let records = group(&[
            "type=SYSCALL msg=audit(1671486850.100:483): arch=c000003e syscall=59 success=yes \
             exit=0 ppid=25007 pid=25100 auid=1000 uid=1000 ses=4 comm=\"ls\" exe=\"/usr/bin/ls\"",
            "type=CWD msg=audit(1671486850.100:483): cwd=\"/home/user\"",
            "type=PATH msg=audit(1671486850.100:483): item=0 name=\"/usr/bin/ls\" inode=131",
            "type=PROCTITLE msg=audit(1671486850.100:483): proctitle=6C73",
        ]);

        let event = coalescer().coalesce(&records).unwrap();
        assert_eq!(event.sequence, 483);
        assert_eq!(event.session_id(), Some("4"));
        assert_eq!(event.outcome, Outcome::Succeeded);
        assert_eq!(event.actor.as_deref(), Some("user"));
        assert_eq!(event.summary.action, "executed");
        assert_eq!(event.summary.how, "/usr/bin/ls");
        assert_eq!(event.summary.object.kind, "file");
        assert_eq!(event.summary.object.primary, "/usr/bin/ls");
    }

    #[test]
    fn failed_openat_is_failed_outcome() {
        let records = group(&[
            "type=SYSCALL msg=audit(1671486850.105:484): arch=c000003e syscall=257 success=no \
             exit=-13 pid=25100 auid=1000 ses=4 comm=\"ls\" exe=\"/usr/bin/ls\"",
            "type=PATH msg=audit(1671486850.105:484): item=0 name=\"/root/secret\"",
        ]);

        let event = coalescer().coalesce(&records).unwrap();
        assert_eq!(event.outcome, Outcome::Failed);
        assert_eq!(event.summary.action, "opened-file");
        assert_eq!(event.summary.object.primary, "/root/secret");
    }

    #[test]
    fn coalesces_login_record() {
        let records = group(&[
            "type=LOGIN msg=audit(1671486844.155:480): pid=25007 uid=0 old-auid=4294967295 \
             auid=1000 tty=(none) old-ses=4294967295 ses=4 res=1",
        ]);

        let event = coalescer().coalesce(&records).unwrap();
        assert_eq!(event.summary.action, ACTION_SESSION_LOGIN);
        assert_eq!(event.sshd_pid(), Some(25007));
        assert_eq!(event.outcome, Outcome::Succeeded);
        assert_eq!(event.summary.object.kind, "user-session");
        assert_eq!(event.summary.object.primary, "4");
        assert_eq!(event.summary.object.secondary, "user");
    }

    #[test]
    fn coalesces_session_end_and_cred_disp() {
        let end = group(&[
            "type=USER_END msg=audit(1671486900.300:487): pid=25007 uid=0 auid=1000 ses=4 \
             msg='op=PAM:session_close acct=\"user\" exe=\"/usr/sbin/sshd\" hostname=127.0.0.1 \
             addr=127.0.0.1 terminal=ssh res=success'",
        ]);
        let event = coalescer().coalesce(&end).unwrap();
        assert_eq!(event.summary.action, "ended-session");
        assert_eq!(event.summary.how, "/usr/sbin/sshd");
        assert_eq!(event.summary.object.kind, "user-session");
        assert_eq!(event.summary.object.primary, "ssh");
        assert_eq!(event.summary.object.secondary, "127.0.0.1");

        let disp = group(&[
            "type=CRED_DISP msg=audit(1671486900.305:488): pid=25007 uid=0 auid=1000 ses=4 \
             msg='op=PAM:setcred acct=\"user\" exe=\"/usr/sbin/sshd\" hostname=127.0.0.1 \
             addr=127.0.0.1 terminal=ssh res=success'",
        ]);
        let event = coalescer().coalesce(&disp).unwrap();
        assert_eq!(event.summary.action, ACTION_DISPOSED_CREDENTIALS);
    }

    #[test]
    fn coalesces_user_cmd_with_decoded_command() {
        let records = group(&[
            "type=USER_CMD msg=audit(1671486860.200:486): pid=25120 uid=1000 auid=1000 ses=4 \
             msg='cwd=\"/home/user\" cmd=636174202F6574632F706173737764 exe=\"/usr/bin/sudo\" \
             terminal=pts/0 res=success'",
        ]);

        let event = coalescer().coalesce(&records).unwrap();
        assert_eq!(event.summary.action, "ran-command");
        assert_eq!(event.summary.how, "/usr/bin/sudo");
        assert_eq!(event.summary.object.kind, "process");
        assert_eq!(event.summary.object.primary, "cat /etc/passwd");
        assert_eq!(event.summary.object.secondary, "/home/user");
    }

    #[test]
    fn unset_session_is_filtered() {
        let records = group(&[
            "type=SYSCALL msg=audit(1671486850.100:490): arch=c000003e syscall=59 success=yes \
             pid=900 auid=4294967295 ses=unset comm=\"cron\" exe=\"/usr/sbin/cron\"",
        ]);
        let event = coalescer().coalesce(&records).unwrap();
        assert!(event.session_id().is_none());
        assert!(event.actor.is_none());

        let records = group(&[
            "type=SYSCALL msg=audit(1671486850.100:491): arch=c000003e syscall=59 success=yes \
             pid=901 auid=4294967295 ses=4294967295 comm=\"cron\" exe=\"/usr/sbin/cron\"",
        ]);
        assert!(coalescer().coalesce(&records).unwrap().session_id().is_none());
    }

    #[test]
    fn unknown_syscall_still_summarizes() {
        let records = group(&[
            "type=SYSCALL msg=audit(1671486850.100:492): arch=c000003e syscall=96 success=yes \
             pid=25100 auid=1000 ses=4 comm=\"date\" exe=\"/usr/bin/date\"",
        ]);
        let event = coalescer().coalesce(&records).unwrap();
        assert_eq!(event.summary.action, "performed-syscall");
        assert_eq!(event.summary.object.kind, "process");
        assert_eq!(event.summary.object.primary, "96");
    }

    #[test]
    fn unresolved_uid_falls_back_to_number() {
        let records = group(&[
            "type=LOGIN msg=audit(1671486844.155:493): pid=26000 uid=0 auid=4242 ses=9 res=1",
        ]);
        let event = coalescer().coalesce(&records).unwrap();
        assert_eq!(event.actor.as_deref(), Some("4242"));
    }

    #[test]
    fn empty_group_is_an_error() {
        assert!(coalescer().coalesce(&[]).is_err());
    }

    #[test]
    fn partial_group_without_primary_record() {
        let records = group(&[
            "type=CWD msg=audit(1671486850.100:494): cwd=\"/home/user\"",
            "type=PATH msg=audit(1671486850.100:494): item=0 name=\"/tmp/x\"",
        ]);
        let event = coalescer().coalesce(&records).unwrap();
        assert_eq!(event.summary.action, "cwd");
        assert!(event.session_id().is_none());
    }
}
