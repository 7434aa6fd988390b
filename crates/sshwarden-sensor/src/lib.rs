//! # sshwarden-sensor
//!
//! The three core components of sshwarden:
//!
//! - [`sshd`]: parses sshd messages from the journal into structured login
//!   events.
//! - [`auditd`]: reassembles multi-record kernel audit events and coalesces
//!   them into summarized, session-tagged events.
//! - [`correlation`]: joins the two streams, binding audit sessions to the
//!   sshd logins that created them and enriching every per-session event
//!   with the authenticated remote identity.

pub mod auditd;
pub mod correlation;
pub mod sshd;
