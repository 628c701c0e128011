// src/core/cluster.rs

//! The in-memory cluster state: server records, the derived cluster-wide
//! status, and the bounded log ring. `status_update` is the sole mutator of
//! a server's status, per the contract in the surrounding design.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

use crate::core::errors::HandyRepError;

/// Bound on the in-memory recent-log ring (spec'd at 100 entries).
pub const LOG_RING_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Primary,
    Replica,
    Proxy,
    Other,
}

/// A server's health status. Rank ordering (`rank()`) is the sole basis for
/// "worse than" comparisons — never compare the enum names directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Unknown,
    Healthy,
    Lagged,
    Warning,
    Unavailable,
    Down,
}

impl ServerStatus {
    pub fn rank(self) -> u8 {
        match self {
            ServerStatus::Unknown => 0,
            ServerStatus::Healthy => 1,
            ServerStatus::Lagged => 2,
            ServerStatus::Warning => 3,
            ServerStatus::Unavailable => 4,
            ServerStatus::Down => 5,
        }
    }

    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 => ServerStatus::Unknown,
            1 => ServerStatus::Healthy,
            2 => ServerStatus::Lagged,
            3 => ServerStatus::Warning,
            4 => ServerStatus::Unavailable,
            _ => ServerStatus::Down,
        }
    }
}

/// A failure is a transition from rank <= 3 into {unavailable, down}.
/// Implemented as an explicit table, not rank arithmetic, to avoid
/// misclassifying a jump straight from `healthy` to `down` as a no-op.
pub fn is_server_failure(old: ServerStatus, new: ServerStatus) -> bool {
    matches!(
        old,
        ServerStatus::Healthy | ServerStatus::Lagged | ServerStatus::Warning
    ) && matches!(new, ServerStatus::Unavailable | ServerStatus::Down)
}

/// A recovery is a transition from rank >= 3 into {healthy, lagged}; `down`
/// additionally recovers into `warning` (still degraded, but no longer down).
pub fn is_server_recovery(old: ServerStatus, new: ServerStatus) -> bool {
    let into_healthy_or_lagged = matches!(
        old,
        ServerStatus::Warning | ServerStatus::Unavailable | ServerStatus::Down
    ) && matches!(new, ServerStatus::Healthy | ServerStatus::Lagged);
    let down_into_warning = old == ServerStatus::Down && new == ServerStatus::Warning;
    into_healthy_or_lagged || down_into_warning
}

/// Per-server record. One per configured node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub name: String,
    pub role: ServerRole,
    pub enabled: bool,
    pub hostname: String,
    pub port: u16,
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_key: Option<String>,
    pub status: ServerStatus,
    #[serde(default)]
    pub status_message: String,
    pub status_ts: DateTime<Utc>,
    #[serde(default = "default_failover_priority")]
    pub failover_priority: i32,
    #[serde(default = "default_lag_limit")]
    pub lag_limit: i64,
    #[serde(default)]
    pub restart_method: String,
    #[serde(default)]
    pub promotion_method: String,
    #[serde(default)]
    pub clone_method: String,
    #[serde(default)]
    pub recovery_template: String,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_failover_priority() -> i32 {
    999
}

fn default_lag_limit() -> i64 {
    16 * 1024 * 1024
}

impl ServerRecord {
    pub fn status_no(&self) -> u8 {
        self.status.rank()
    }
}

/// Aggregate cluster-wide status, derived purely from the server map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub status: ServerStatus,
    pub status_no: u8,
    pub status_ts: DateTime<Utc>,
    pub status_message: String,
    pub pid: u32,
}

/// A log record as defined by the external log-record interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub category: String,
    pub message: String,
    pub iserror: bool,
    pub alert: bool,
}

/// Outcome of a `status_update` call, used by callers (Health Pipeline,
/// Failover Orchestrator) to decide whether to dispatch an alert plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdateOutcome {
    /// Status unchanged; only `status_ts` was refreshed.
    Unchanged,
    /// Status changed but matched neither the failure nor recovery predicate.
    Changed,
    /// Status change matched the failure predicate — caller should alert.
    Failure,
    /// Status change matched the recovery predicate — log only, no alert.
    Recovery,
}

/// Snapshot-serializable document written to the on-disk file and DB row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub servers: HashMap<String, ServerRecord>,
    pub status: ClusterStatus,
}

/// The owning value for cluster state: the server map and the bounded log
/// ring. All mutation goes through `status_update` or the explicit operator
/// entry points in `ops.rs`.
#[derive(Debug)]
pub struct ClusterState {
    pub servers: HashMap<String, ServerRecord>,
    pub pid: u32,
    log_ring: VecDeque<LogRecord>,
}

impl ClusterState {
    pub fn new(pid: u32) -> Self {
        Self {
            servers: HashMap::new(),
            pid,
            log_ring: VecDeque::with_capacity(LOG_RING_CAPACITY),
        }
    }

    /// Push a log record onto the FIFO-evicting ring, and emit it as a
    /// tracing event so operators tailing the process see it too.
    pub fn log(&mut self, category: &str, message: impl Into<String>, iserror: bool, alert: bool) {
        let message = message.into();
        if iserror || alert {
            warn!(category, alert, "{message}");
        } else {
            info!(category, "{message}");
        }
        if self.log_ring.len() == LOG_RING_CAPACITY {
            self.log_ring.pop_front();
        }
        self.log_ring.push_back(LogRecord {
            ts: Utc::now(),
            category: category.to_string(),
            message,
            iserror,
            alert,
        });
    }

    pub fn recent_logs(&self) -> impl Iterator<Item = &LogRecord> {
        self.log_ring.iter()
    }

    /// The sole mutator of a server's status.
    pub fn status_update(
        &mut self,
        server: &str,
        new_status: ServerStatus,
        message: Option<String>,
    ) -> Result<StatusUpdateOutcome, HandyRepError> {
        let now = Utc::now();
        let old_status = {
            let rec = self
                .servers
                .get(server)
                .ok_or_else(|| HandyRepError::HandyRep(format!("unknown server '{server}'")))?;
            rec.status
        };

        if old_status == new_status {
            let rec = self.servers.get_mut(server).unwrap();
            rec.status_ts = now;
            if let Some(msg) = message {
                rec.status_message = msg;
            }
            return Ok(StatusUpdateOutcome::Unchanged);
        }

        self.log(
            server,
            format!("status transition: {old_status} -> {new_status}"),
            false,
            false,
        );

        let outcome = if is_server_failure(old_status, new_status) {
            self.log(
                "FAILURE",
                format!("server '{server}' failed: {old_status} -> {new_status}"),
                true,
                true,
            );
            StatusUpdateOutcome::Failure
        } else if is_server_recovery(old_status, new_status) {
            self.log(
                "RECOVERY",
                format!("server '{server}' recovered: {old_status} -> {new_status}"),
                false,
                false,
            );
            StatusUpdateOutcome::Recovery
        } else {
            StatusUpdateOutcome::Changed
        };

        let old_cluster = self.cluster_status();

        {
            let rec = self.servers.get_mut(server).unwrap();
            rec.status = new_status;
            rec.status_ts = now;
            if let Some(msg) = message {
                rec.status_message = msg;
            }
        }

        let new_cluster = self.cluster_status();
        if new_cluster.status_no > old_cluster.status_no {
            let category = if new_cluster.status == ServerStatus::Down {
                "CLUSTER_DOWN"
            } else {
                "STATUS_WARNING"
            };
            self.log(
                category,
                format!(
                    "cluster status worsened: {} -> {}",
                    old_cluster.status, new_cluster.status
                ),
                true,
                true,
            );
        } else if new_cluster.status_no < old_cluster.status_no {
            self.log(
                "RECOVERY",
                format!(
                    "cluster status improved: {} -> {}",
                    old_cluster.status, new_cluster.status
                ),
                false,
                false,
            );
        }

        Ok(outcome)
    }

    /// Pure derivation of the cluster-wide status from the server map.
    pub fn cluster_status(&self) -> ClusterStatus {
        let primaries: Vec<&ServerRecord> = self
            .servers
            .values()
            .filter(|s| s.role == ServerRole::Primary && s.enabled)
            .collect();

        let (status, message) = if primaries.len() > 1 {
            (
                ServerStatus::Down,
                "multiple enabled primaries detected".to_string(),
            )
        } else if primaries.is_empty() {
            (ServerStatus::Down, "no enabled primary".to_string())
        } else {
            let primary = primaries[0];
            if primary.status.rank() > 3 {
                (ServerStatus::Down, format!("primary '{}' is down", primary.name))
            } else if primary.status.rank() >= 2 {
                (
                    ServerStatus::Warning,
                    format!("primary '{}' is degraded", primary.name),
                )
            } else {
                let replicas: Vec<&ServerRecord> = self
                    .servers
                    .values()
                    .filter(|s| s.role == ServerRole::Replica && s.enabled)
                    .collect();
                if replicas.is_empty() || replicas.iter().any(|r| r.status.rank() > 3) {
                    (
                        ServerStatus::Warning,
                        "no healthy replica available".to_string(),
                    )
                } else {
                    (ServerStatus::Healthy, "cluster healthy".to_string())
                }
            }
        };

        ClusterStatus {
            status_no: status.rank(),
            status,
            status_ts: Utc::now(),
            status_message: message,
            pid: self.pid,
        }
    }

    pub fn to_snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            servers: self.servers.clone(),
            status: self.cluster_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_server(name: &str, role: ServerRole, enabled: bool, status: ServerStatus) -> ServerRecord {
        ServerRecord {
            name: name.to_string(),
            role,
            enabled,
            hostname: "localhost".into(),
            port: 5432,
            ssh_user: "postgres".into(),
            ssh_key: None,
            status,
            status_message: String::new(),
            status_ts: Utc::now(),
            failover_priority: 999,
            lag_limit: 16 * 1024 * 1024,
            restart_method: String::new(),
            promotion_method: String::new(),
            clone_method: String::new(),
            recovery_template: String::new(),
            extra: HashMap::new(),
        }
    }

    #[test]
    fn no_primary_is_down() {
        let mut state = ClusterState::new(1);
        state.servers.insert(
            "r1".into(),
            make_server("r1", ServerRole::Replica, true, ServerStatus::Healthy),
        );
        let cs = state.cluster_status();
        assert_eq!(cs.status, ServerStatus::Down);
    }

    #[test]
    fn two_primaries_force_down() {
        let mut state = ClusterState::new(1);
        state.servers.insert(
            "p1".into(),
            make_server("p1", ServerRole::Primary, true, ServerStatus::Healthy),
        );
        state.servers.insert(
            "p2".into(),
            make_server("p2", ServerRole::Primary, true, ServerStatus::Healthy),
        );
        assert_eq!(state.cluster_status().status, ServerStatus::Down);
    }

    #[test]
    fn healthy_cluster_with_primary_and_replica() {
        let mut state = ClusterState::new(1);
        state.servers.insert(
            "p1".into(),
            make_server("p1", ServerRole::Primary, true, ServerStatus::Healthy),
        );
        state.servers.insert(
            "r1".into(),
            make_server("r1", ServerRole::Replica, true, ServerStatus::Healthy),
        );
        assert_eq!(state.cluster_status().status, ServerStatus::Healthy);
    }

    #[test]
    fn status_update_noop_refreshes_timestamp_only() {
        let mut state = ClusterState::new(1);
        let mut rec = make_server("p1", ServerRole::Primary, true, ServerStatus::Healthy);
        rec.status_ts = Utc::now() - chrono::Duration::seconds(60);
        let old_ts = rec.status_ts;
        state.servers.insert("p1".into(), rec);

        let outcome = state
            .status_update("p1", ServerStatus::Healthy, None)
            .unwrap();
        assert_eq!(outcome, StatusUpdateOutcome::Unchanged);
        assert!(state.servers["p1"].status_ts > old_ts);
    }

    #[test]
    fn status_update_detects_failure_and_recovery() {
        let mut state = ClusterState::new(1);
        state.servers.insert(
            "r1".into(),
            make_server("r1", ServerRole::Replica, true, ServerStatus::Healthy),
        );
        let outcome = state
            .status_update("r1", ServerStatus::Down, Some("unreachable".into()))
            .unwrap();
        assert_eq!(outcome, StatusUpdateOutcome::Failure);

        let outcome = state
            .status_update("r1", ServerStatus::Healthy, None)
            .unwrap();
        assert_eq!(outcome, StatusUpdateOutcome::Recovery);
    }

    #[test]
    fn status_no_always_matches_rank() {
        let mut state = ClusterState::new(1);
        state.servers.insert(
            "r1".into(),
            make_server("r1", ServerRole::Replica, true, ServerStatus::Lagged),
        );
        assert_eq!(state.servers["r1"].status_no(), 2);
    }
}
