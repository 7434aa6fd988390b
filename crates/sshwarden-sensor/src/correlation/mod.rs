//! Cross-stream correlation.
//!
//! Binds audit session identifiers to the sshd logins that created them,
//! so every per-session audit event carries the authenticated remote
//! identity.

pub mod engine;

pub use engine::{CorrelationEngine, EngineConfig};
