//! Daemon configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Top-level sshwarden configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Node name reported in every event's target. Defaults to the
    /// machine's hostname when unset.
    #[serde(default)]
    pub node_name: Option<String>,

    /// Path to the machine-id file.
    #[serde(default = "default_machine_id_path")]
    pub machine_id_path: PathBuf,

    /// Path to the auditd log file to follow.
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,

    /// Journal syslog identifier to follow for login messages.
    #[serde(default = "default_journal_identifier")]
    pub journal_identifier: String,

    /// Where enriched events are written. `None` means stdout.
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Audit event reassembly settings.
    #[serde(default)]
    pub reassembly: ReassemblySettings,

    /// Correlation engine settings.
    #[serde(default)]
    pub correlation: CorrelationSettings,
}

/// Settings for the audit-record reassembler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassemblySettings {
    /// Maximum number of in-flight (incomplete) audit events.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// How long an incomplete event may wait for further records before
    /// it is flushed as-is.
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    /// Interval of the maintenance tick that flushes expired events.
    #[serde(default = "default_maintain_interval_ms")]
    pub maintain_interval_ms: u64,
}

impl ReassemblySettings {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn maintain_interval(&self) -> Duration {
        Duration::from_millis(self.maintain_interval_ms)
    }
}

/// Settings for the correlation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationSettings {
    /// How long a pending login or an unbound session may wait for its
    /// counterpart before being evicted.
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
    /// Interval of the staleness sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum audit events buffered per session before its login is known.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Capacity of the correlator-to-sink events channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl CorrelationSettings {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_machine_id_path() -> PathBuf {
    PathBuf::from("/etc/machine-id")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/var/log/audit/audit.log")
}

fn default_journal_identifier() -> String {
    "sshd".to_string()
}

fn default_max_in_flight() -> usize {
    1000
}

fn default_event_timeout_ms() -> u64 {
    2000
}

fn default_maintain_interval_ms() -> u64 {
    500
}

fn default_pending_ttl_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl Default for ReassemblySettings {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            event_timeout_ms: default_event_timeout_ms(),
            maintain_interval_ms: default_maintain_interval_ms(),
        }
    }
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            pending_ttl_secs: default_pending_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            buffer_capacity: default_buffer_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            machine_id_path: default_machine_id_path(),
            audit_log_path: default_audit_log_path(),
            journal_identifier: default_journal_identifier(),
            output: None,
            reassembly: ReassemblySettings::default(),
            correlation: CorrelationSettings::default(),
        }
    }
}

impl WardenConfig {
    /// Load configuration from a TOML file at the given path.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: WardenConfig = toml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = WardenConfig::default();
        assert_eq!(config.reassembly.max_in_flight, 1000);
        assert_eq!(config.reassembly.event_timeout(), Duration::from_secs(2));
        assert_eq!(
            config.reassembly.maintain_interval(),
            Duration::from_millis(500)
        );
        assert_eq!(config.correlation.pending_ttl(), Duration::from_secs(60));
        assert_eq!(config.correlation.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.correlation.buffer_capacity, 10_000);
        assert_eq!(config.journal_identifier, "sshd");
        assert!(config.output.is_none());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
node_name = "bastion-1"
output = "/var/log/sshwarden/events.jsonl"

[correlation]
pending_ttl_secs = 120
"#;
        let config: WardenConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node_name.as_deref(), Some("bastion-1"));
        assert_eq!(
            config.output.as_deref(),
            Some(Path::new("/var/log/sshwarden/events.jsonl"))
        );
        assert_eq!(config.correlation.pending_ttl_secs, 120);
        // Unspecified sections keep their defaults.
        assert_eq!(config.correlation.sweep_interval_secs, 30);
        assert_eq!(config.reassembly.max_in_flight, 1000);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let config: WardenConfig = toml::from_str("").unwrap();
        assert_eq!(config.audit_log_path, Path::new("/var/log/audit/audit.log"));
        assert_eq!(config.machine_id_path, Path::new("/etc/machine-id"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = WardenConfig::load(Path::new("/nonexistent/sshwarden.toml")).unwrap();
        assert_eq!(config.journal_identifier, "sshd");
    }
}
