// src/config.rs

//! Static configuration: the `[handyrep]`, `[failover]`, `[archive]`,
//! `[passwords]`, `[server_defaults]`, `[servers]`, `[extra_failover_commands]`
//! and `[plugins]` sections, loaded from TOML via the `config`
//! crate, matching the common `Config::from_file` loader pattern.

use std::collections::HashMap;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::core::errors::HandyRepError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandyRepSection {
    pub hostname: String,
    #[serde(default = "default_schema")]
    pub handyrep_schema: String,
    #[serde(default = "default_table")]
    pub handyrep_table: String,
    #[serde(default = "default_db_user")]
    pub handyrep_db_user: String,
    #[serde(default = "default_db_name")]
    pub handyrep_db_name: String,
    #[serde(default = "default_test_ssh_command")]
    pub test_ssh_command: String,
    #[serde(default = "default_template_dir")]
    pub template_dir: String,
    #[serde(default)]
    pub authentication_method: Option<String>,
    /// Plugin name dispatched on every `FAILURE`/`CRITICAL`/`STATUS_WARNING`
    /// log record; `None` disables alert push entirely (log-only).
    #[serde(default)]
    pub push_alert_method: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
}

fn default_schema() -> String {
    "handyrep".into()
}
fn default_table() -> String {
    "handyrep".into()
}
fn default_db_user() -> String {
    "handyrep".into()
}
fn default_db_name() -> String {
    "postgres".into()
}
fn default_test_ssh_command() -> String {
    "true".into()
}
fn default_template_dir() -> String {
    "/etc/handyrep/templates".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_pid_file() -> String {
    "/var/run/handyrep/handyrep.pid".into()
}
fn default_snapshot_file() -> String {
    "/var/lib/handyrep/servers.json".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailoverSection {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: std::time::Duration,
    #[serde(default = "default_poll_method")]
    pub poll_method: String,
    #[serde(default = "default_verify_frequency")]
    pub verify_frequency: u32,
    #[serde(default = "default_fail_retries")]
    pub fail_retries: u32,
    #[serde(default = "default_fail_retry_interval", with = "humantime_serde")]
    pub fail_retry_interval: std::time::Duration,
    #[serde(default = "default_recovery_retries")]
    pub recovery_retries: u32,
    #[serde(default)]
    pub restart_master: bool,
    #[serde(default)]
    pub auto_failover: bool,
    #[serde(default)]
    pub remaster: bool,
    #[serde(default = "default_selection_method")]
    pub selection_method: String,
    #[serde(default)]
    pub connection_failover: bool,
    #[serde(default = "default_connection_failover_method")]
    pub connection_failover_method: String,
    #[serde(default)]
    pub poll_connection_proxy: bool,
    #[serde(default = "default_leader_check_method")]
    pub check_hr_master_method: String,
}

fn default_poll_interval() -> std::time::Duration {
    std::time::Duration::from_secs(10)
}
fn default_poll_method() -> String {
    "pg_isready".into()
}
fn default_verify_frequency() -> u32 {
    6
}
fn default_fail_retries() -> u32 {
    3
}
fn default_fail_retry_interval() -> std::time::Duration {
    std::time::Duration::from_secs(5)
}
fn default_recovery_retries() -> u32 {
    10
}
fn default_selection_method() -> String {
    "best_replica".into()
}
fn default_connection_failover_method() -> String {
    "pgbouncer".into()
}
fn default_leader_check_method() -> String {
    "single_leader".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiveSection {
    #[serde(default)]
    pub archiving: bool,
    #[serde(default = "default_archive_script_method")]
    pub archive_script_method: String,
    #[serde(default = "default_archive_delete_method")]
    pub archive_delete_method: String,
}

fn default_archive_script_method() -> String {
    "local_archive".into()
}
fn default_archive_delete_method() -> String {
    "local_archive".into()
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            archiving: false,
            archive_script_method: default_archive_script_method(),
            archive_delete_method: default_archive_delete_method(),
        }
    }
}

/// Never exposed by `get_setting`/any serialization path reachable from the
/// Operations API — kept out of `Debug` on purpose.
#[derive(Clone, Deserialize, Default)]
pub struct PasswordsSection {
    #[serde(default)]
    pub replication_pass: Option<String>,
    #[serde(default)]
    pub handyrep_db_pass: Option<String>,
}

impl std::fmt::Debug for PasswordsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordsSection").field("replication_pass", &"<redacted>").field("handyrep_db_pass", &"<redacted>").finish()
    }
}

/// Default per-server settings, merged under file overrides and live state
/// by `merge_server_settings` in `ops.rs`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerDefaults {
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub failover_priority: Option<i32>,
    #[serde(default)]
    pub lag_limit: Option<i64>,
    #[serde(default)]
    pub restart_method: Option<String>,
    #[serde(default)]
    pub promotion_method: Option<String>,
    #[serde(default)]
    pub clone_method: Option<String>,
    #[serde(default)]
    pub recovery_template: Option<String>,
}

/// A per-server override block as found under `[servers.<name>]`. Same
/// shape as `ServerDefaults` plus the fields that make a server concrete.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerOverride {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(flatten)]
    pub defaults: ServerDefaults,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtraFailoverCommand {
    pub command: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub handyrep: HandyRepSection,
    #[serde(default)]
    pub failover: FailoverSection,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub passwords: PasswordsSection,
    #[serde(default)]
    pub server_defaults: ServerDefaults,
    #[serde(default)]
    pub servers: HashMap<String, ServerOverride>,
    #[serde(default)]
    pub extra_failover_commands: HashMap<String, ExtraFailoverCommand>,
    #[serde(default)]
    pub plugins: HashMap<String, serde_json::Value>,
    /// Set by the operator to force the static config file to win config-sync
    /// reconciliation regardless of timestamps.
    #[serde(default)]
    pub override_server_file: bool,
}

impl Default for FailoverSection {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            poll_method: default_poll_method(),
            verify_frequency: default_verify_frequency(),
            fail_retries: default_fail_retries(),
            fail_retry_interval: default_fail_retry_interval(),
            recovery_retries: default_recovery_retries(),
            restart_master: false,
            auto_failover: false,
            remaster: false,
            selection_method: default_selection_method(),
            connection_failover: false,
            connection_failover_method: default_connection_failover_method(),
            poll_connection_proxy: false,
            check_hr_master_method: default_leader_check_method(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, HandyRepError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        Ok(cfg)
    }

    /// Never returns anything under `[passwords]` through this generic
    /// accessor path; callers needing credentials use `passwords` directly.
    pub fn plugin_config(&self, plugin_name: &str) -> serde_json::Value {
        self.plugins
            .get(plugin_name)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Reads the snapshot file's raw bytes, returning `None` if it does not yet
/// exist (first run).
pub fn read_snapshot_file(path: &str) -> Result<Option<String>, HandyRepError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwords_debug_is_redacted() {
        let pw = PasswordsSection {
            replication_pass: Some("hunter2".into()),
            handyrep_db_pass: Some("hunter3".into()),
        };
        let rendered = format!("{pw:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("hunter3"));
    }
}
