//! Static resolution tables used by the coalescer.
//!
//! The syscall table covers x86-64; numbers outside it fall back to a
//! generic action. The action vocabulary follows the audit-coalescer
//! convention so downstream consumers see familiar verbs.

use super::record::RecordType;

/// What kind of object an action operates on, used to pick the object
/// summary fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectClass {
    File,
    Socket,
    Process,
}

/// x86-64 syscall numbers, sorted by number.
const SYSCALL_NAMES: &[(u64, &str)] = &[
    (0, "read"),
    (1, "write"),
    (2, "open"),
    (3, "close"),
    (4, "stat"),
    (5, "fstat"),
    (6, "lstat"),
    (9, "mmap"),
    (16, "ioctl"),
    (17, "pread64"),
    (18, "pwrite64"),
    (19, "readv"),
    (20, "writev"),
    (21, "access"),
    (22, "pipe"),
    (32, "dup"),
    (33, "dup2"),
    (41, "socket"),
    (42, "connect"),
    (43, "accept"),
    (44, "sendto"),
    (45, "recvfrom"),
    (46, "sendmsg"),
    (47, "recvmsg"),
    (49, "bind"),
    (50, "listen"),
    (56, "clone"),
    (57, "fork"),
    (58, "vfork"),
    (59, "execve"),
    (62, "kill"),
    (76, "truncate"),
    (77, "ftruncate"),
    (78, "getdents"),
    (79, "getcwd"),
    (80, "chdir"),
    (81, "fchdir"),
    (82, "rename"),
    (83, "mkdir"),
    (84, "rmdir"),
    (85, "creat"),
    (86, "link"),
    (87, "unlink"),
    (88, "symlink"),
    (89, "readlink"),
    (90, "chmod"),
    (91, "fchmod"),
    (92, "chown"),
    (93, "fchown"),
    (94, "lchown"),
    (101, "ptrace"),
    (105, "setuid"),
    (113, "setreuid"),
    (117, "setresuid"),
    (133, "mknod"),
    (155, "pivot_root"),
    (165, "mount"),
    (166, "umount2"),
    (200, "tkill"),
    (217, "getdents64"),
    (234, "tgkill"),
    (257, "openat"),
    (258, "mkdirat"),
    (259, "mknodat"),
    (260, "fchownat"),
    (263, "unlinkat"),
    (264, "renameat"),
    (265, "linkat"),
    (266, "symlinkat"),
    (268, "fchmodat"),
    (288, "accept4"),
    (316, "renameat2"),
    (322, "execveat"),
    (437, "openat2"),
];

pub(crate) fn syscall_name(num: u64) -> Option<&'static str> {
    SYSCALL_NAMES
        .binary_search_by_key(&num, |&(n, _)| n)
        .ok()
        .map(|i| SYSCALL_NAMES[i].1)
}

/// Action verb and object class for a syscall, by name.
pub(crate) fn syscall_action(name: &str) -> Option<(&'static str, ObjectClass)> {
    use ObjectClass::*;
    let entry = match name {
        "execve" | "execveat" => ("executed", File),
        "open" | "openat" | "openat2" | "creat" => ("opened-file", File),
        "read" | "pread64" | "readv" => ("read-file", File),
        "write" | "pwrite64" | "writev" | "truncate" | "ftruncate" => ("wrote-to-file", File),
        "access" | "stat" | "lstat" | "fstat" | "readlink" | "getdents" | "getdents64" => {
            ("checked-metadata-of", File)
        }
        "unlink" | "unlinkat" | "rmdir" => ("deleted", File),
        "rename" | "renameat" | "renameat2" => ("renamed", File),
        "mkdir" | "mkdirat" => ("created-directory", File),
        "mknod" | "mknodat" => ("made-device", File),
        "chmod" | "fchmod" | "fchmodat" => ("changed-file-permissions-of", File),
        "chown" | "fchown" | "lchown" | "fchownat" => ("changed-file-ownership-of", File),
        "link" | "linkat" | "symlink" | "symlinkat" => ("linked", File),
        "chdir" | "fchdir" => ("changed-directory", File),
        "mount" => ("mounted", File),
        "umount2" | "pivot_root" => ("unmounted", File),
        "connect" => ("connected-to", Socket),
        "accept" | "accept4" => ("accepted-connection-from", Socket),
        "bind" => ("bound-socket", Socket),
        "listen" => ("listened-on", Socket),
        "sendto" | "sendmsg" => ("sent-to", Socket),
        "recvfrom" | "recvmsg" => ("received-from", Socket),
        "kill" | "tkill" | "tgkill" => ("killed-pid", Process),
        "ptrace" => ("traced", Process),
        "setuid" | "setreuid" | "setresuid" => ("changed-identity-of", Process),
        "clone" | "fork" | "vfork" => ("forked", Process),
        _ => return None,
    };
    Some(entry)
}

/// Action verb for single-record (non-syscall) event types.
pub(crate) fn record_action(rtype: RecordType) -> Option<&'static str> {
    let action = match rtype {
        RecordType::Login => "changed-login-id-to",
        RecordType::UserLogin => "logged-in",
        RecordType::UserLogout => "logged-out",
        RecordType::UserStart => "started-session",
        RecordType::UserEnd => "ended-session",
        RecordType::UserCmd => "ran-command",
        RecordType::UserAuth => "authenticated",
        RecordType::UserAcct => "was-authorized",
        RecordType::UserErr => "error",
        RecordType::CredAcq => "acquired-credentials",
        RecordType::CredDisp => "disposed-credentials",
        RecordType::CredRefr => "refreshed-credentials",
        _ => return None,
    };
    Some(action)
}
