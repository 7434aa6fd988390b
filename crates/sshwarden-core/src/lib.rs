//! # sshwarden-core
//!
//! Core type system for sshwarden -- a session telemetry daemon that joins
//! the kernel audit stream with the journal's sshd log stream.
//!
//! This crate defines the shared types used across the sensor and daemon
//! crates: the enriched audit-event model, the remote-login handoff type,
//! daemon configuration, host identity, and the JSON-lines event sink.

pub mod config;
pub mod event;
pub mod host;
pub mod sink;
