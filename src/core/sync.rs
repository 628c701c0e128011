// src/core/sync.rs

//! Config Sync Engine: three-way reconciliation between the static config
//! file, the on-disk JSON snapshot, and a row in the primary database.
//! Also owns the PID-liveness startup check and the
//! atomic-replace file write.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use sysinfo::{Pid, System};
use tracing::{info, warn};

use crate::config::Config;
use crate::core::cluster::{ClusterSnapshot, ClusterState, ServerRecord, ServerRole, ServerStatus};
use crate::core::errors::HandyRepError;

/// Which of the three stores won reconciliation, for logging/testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationSource {
    File,
    Db,
    StaticConfig,
}

/// Reads the on-disk JSON snapshot, if it exists.
pub fn read_file_snapshot(path: &str) -> Result<Option<ClusterSnapshot>, HandyRepError> {
    match crate::config::read_snapshot_file(path)? {
        Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        None => Ok(None),
    }
}

/// Best-effort read of the DB row. Returns `Ok(None)` if the table does not
/// exist yet or the row is absent; only genuine connection errors propagate.
pub async fn read_db_snapshot(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> Result<Option<ClusterSnapshot>, HandyRepError> {
    let query = format!("SELECT servers, status FROM {schema}.{table} LIMIT 1");
    match sqlx::query(&query).fetch_optional(conn).await {
        Ok(Some(row)) => {
            let servers_json: serde_json::Value = row.try_get("servers").unwrap_or(serde_json::Value::Null);
            let status_json: serde_json::Value = row.try_get("status").unwrap_or(serde_json::Value::Null);
            let servers = serde_json::from_value(servers_json).unwrap_or_default();
            let status = serde_json::from_value(status_json)
                .unwrap_or_else(|_| default_unknown_status());
            Ok(Some(ClusterSnapshot { servers, status }))
        }
        Ok(None) => Ok(None),
        Err(sqlx::Error::Database(e)) if e.message().contains("does not exist") => Ok(None),
        Err(e) => Err(HandyRepError::Query(e.to_string())),
    }
}

fn default_unknown_status() -> crate::core::cluster::ClusterStatus {
    crate::core::cluster::ClusterStatus {
        status: ServerStatus::Unknown,
        status_no: 0,
        status_ts: Utc::now(),
        status_message: String::new(),
        pid: 0,
    }
}

/// Validates that a PID recorded in a previously-read snapshot does not
/// belong to another live HandyRep process. Fatal per the cluster invariants
/// startup aborts if another process with that PID is
/// alive and differs from our own.
pub fn check_pid(recorded_pid: u32) -> Result<(), HandyRepError> {
    let my_pid = std::process::id();
    if recorded_pid == 0 || recorded_pid == my_pid {
        return Ok(());
    }
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    if system.process(Pid::from_u32(recorded_pid)).is_some() {
        return Err(HandyRepError::Startup(format!(
            "snapshot PID {recorded_pid} is alive and differs from this process's PID {my_pid}"
        )));
    }
    Ok(())
}

/// Performs startup/resync reconciliation across the three stores,
/// populating `cluster` in place. Returns which source won, for logging.
pub async fn sync_config(
    cluster: &mut ClusterState,
    config: &Config,
    snapshot_path: &str,
    mut db_conn: Option<&mut PgConnection>,
) -> Result<ReconciliationSource, HandyRepError> {
    let file_snapshot = read_file_snapshot(snapshot_path)?;
    let db_snapshot = match db_conn.as_deref_mut() {
        Some(conn) => {
            match read_db_snapshot(conn, &config.handyrep.handyrep_schema, &config.handyrep.handyrep_table).await {
                Ok(snap) => snap,
                Err(e) => {
                    warn!(error = %e, "could not read handyrep DB row, treating as absent");
                    None
                }
            }
        }
        None => None,
    };

    let source = if config.override_server_file {
        ReconciliationSource::StaticConfig
    } else {
        match (&file_snapshot, &db_snapshot) {
            (Some(f), Some(d)) => {
                if d.status.status_ts > f.status.status_ts {
                    ReconciliationSource::Db
                } else {
                    ReconciliationSource::File
                }
            }
            (Some(_), None) => ReconciliationSource::File,
            (None, Some(_)) => ReconciliationSource::Db,
            (None, None) => ReconciliationSource::StaticConfig,
        }
    };

    match source {
        ReconciliationSource::File => {
            let snapshot = file_snapshot.expect("file source implies a file snapshot");
            check_pid(snapshot.status.pid)?;
            apply_snapshot(cluster, snapshot, config);
        }
        ReconciliationSource::Db => {
            let snapshot = db_snapshot.expect("db source implies a db snapshot");
            apply_snapshot(cluster, snapshot, config);
        }
        ReconciliationSource::StaticConfig => {
            apply_static_config(cluster, config);
        }
    }
    cluster.pid = std::process::id();

    info!(?source, "config sync reconciliation complete");
    Ok(source)
}

fn apply_snapshot(cluster: &mut ClusterState, snapshot: ClusterSnapshot, config: &Config) {
    cluster.servers = snapshot.servers;
    merge_defaults_for_all(cluster, config);
}

fn apply_static_config(cluster: &mut ClusterState, config: &Config) {
    cluster.servers.clear();
    for (name, ovr) in &config.servers {
        let role = ovr
            .role
            .as_deref()
            .and_then(|r| r.parse().ok())
            .unwrap_or(ServerRole::Replica);
        let hostname = ovr.hostname.clone().unwrap_or_else(|| name.clone());
        let record = ServerRecord {
            name: name.clone(),
            role,
            enabled: ovr.enabled.unwrap_or(false),
            hostname,
            port: ovr.defaults.port.or(config.server_defaults.port).unwrap_or(5432),
            ssh_user: ovr
                .defaults
                .ssh_user
                .clone()
                .or_else(|| config.server_defaults.ssh_user.clone())
                .unwrap_or_else(|| "postgres".into()),
            ssh_key: ovr.defaults.ssh_key.clone().or_else(|| config.server_defaults.ssh_key.clone()),
            status: ServerStatus::Unknown,
            status_message: String::new(),
            status_ts: Utc::now(),
            failover_priority: ovr
                .defaults
                .failover_priority
                .or(config.server_defaults.failover_priority)
                .unwrap_or(999),
            lag_limit: ovr
                .defaults
                .lag_limit
                .or(config.server_defaults.lag_limit)
                .unwrap_or(16 * 1024 * 1024),
            restart_method: ovr
                .defaults
                .restart_method
                .clone()
                .or_else(|| config.server_defaults.restart_method.clone())
                .unwrap_or_default(),
            promotion_method: ovr
                .defaults
                .promotion_method
                .clone()
                .or_else(|| config.server_defaults.promotion_method.clone())
                .unwrap_or_default(),
            clone_method: ovr
                .defaults
                .clone_method
                .clone()
                .or_else(|| config.server_defaults.clone_method.clone())
                .unwrap_or_default(),
            recovery_template: ovr
                .defaults
                .recovery_template
                .clone()
                .or_else(|| config.server_defaults.recovery_template.clone())
                .unwrap_or_default(),
            extra: Default::default(),
        };
        cluster.servers.insert(name.clone(), record);
    }
}

/// After loading a persisted snapshot, still apply `server_defaults` to any
/// field a stored record left at its zero value, and pick up brand-new
/// servers added to the config file since the snapshot was written.
fn merge_defaults_for_all(cluster: &mut ClusterState, config: &Config) {
    for (name, ovr) in &config.servers {
        cluster.servers.entry(name.clone()).or_insert_with(|| {
            let role = ovr
                .role
                .as_deref()
                .and_then(|r| r.parse().ok())
                .unwrap_or(ServerRole::Replica);
            ServerRecord {
                name: name.clone(),
                role,
                enabled: ovr.enabled.unwrap_or(false),
                hostname: ovr.hostname.clone().unwrap_or_else(|| name.clone()),
                port: ovr.defaults.port.or(config.server_defaults.port).unwrap_or(5432),
                ssh_user: ovr
                    .defaults
                    .ssh_user
                    .clone()
                    .or_else(|| config.server_defaults.ssh_user.clone())
                    .unwrap_or_else(|| "postgres".into()),
                ssh_key: ovr.defaults.ssh_key.clone(),
                status: ServerStatus::Unknown,
                status_message: String::new(),
                status_ts: Utc::now(),
                failover_priority: ovr.defaults.failover_priority.unwrap_or(999),
                lag_limit: ovr.defaults.lag_limit.unwrap_or(16 * 1024 * 1024),
                restart_method: ovr.defaults.restart_method.clone().unwrap_or_default(),
                promotion_method: ovr.defaults.promotion_method.clone().unwrap_or_default(),
                clone_method: ovr.defaults.clone_method.clone().unwrap_or_default(),
                recovery_template: ovr.defaults.recovery_template.clone().unwrap_or_default(),
                extra: Default::default(),
            }
        });
    }
}

/// Writes the reconciled state to the file snapshot (atomic replace) and,
/// best-effort, to the DB row. File-write failure returns `false`; DB-write
/// failure is logged and does not fail the call (file remains authoritative
/// on next restart).
pub async fn write_servers(
    cluster: &ClusterState,
    snapshot_path: &str,
    db_conn: Option<&mut PgConnection>,
    schema: &str,
    table: &str,
    client_addr: Option<&str>,
) -> bool {
    let snapshot = cluster.to_snapshot();
    let file_ok = write_snapshot_file(snapshot_path, &snapshot).is_ok();
    if !file_ok {
        warn!(path = snapshot_path, "failed to write snapshot file");
        return false;
    }

    if let Some(conn) = db_conn {
        if let Err(e) = write_db_row(conn, schema, table, &snapshot, client_addr).await {
            warn!(error = %e, "failed to write handyrep DB row; file snapshot remains authoritative");
        }
    }
    true
}

fn write_snapshot_file(path: &str, snapshot: &ClusterSnapshot) -> Result<(), HandyRepError> {
    let body = serde_json::to_string_pretty(snapshot)?;
    let dir = Path::new(path).parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| HandyRepError::Config(e.to_string()))?;
    Ok(())
}

async fn write_db_row(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    snapshot: &ClusterSnapshot,
    client_addr: Option<&str>,
) -> Result<(), HandyRepError> {
    ensure_table_exists(conn, schema, table).await?;

    let servers_json = serde_json::to_value(&snapshot.servers)?;
    let status_json = serde_json::to_value(&snapshot.status)?;
    let addr = client_addr.unwrap_or("0.0.0.0");

    let delete_query = format!("DELETE FROM {schema}.{table}");
    sqlx::query(&delete_query).execute(&mut *conn).await?;

    let insert_query = format!(
        "INSERT INTO {schema}.{table} (updated, config, servers, status, last_ip, last_sync) \
         VALUES (now(), $1, $2, $3, $4::inet, now())"
    );
    sqlx::query(&insert_query)
        .bind(serde_json::Value::Null)
        .bind(servers_json)
        .bind(status_json)
        .bind(addr)
        .execute(conn)
        .await?;
    Ok(())
}

async fn ensure_table_exists(conn: &mut PgConnection, schema: &str, table: &str) -> Result<(), HandyRepError> {
    let ddl = format!(
        "CREATE SCHEMA IF NOT EXISTS {schema}; \
         CREATE TABLE IF NOT EXISTS {schema}.{table} ( \
           updated timestamptz, \
           config json, \
           servers json, \
           status json, \
           last_ip inet, \
           last_sync timestamptz \
         )"
    );
    sqlx::raw_sql(&ddl).execute(conn).await?;
    Ok(())
}

/// Exposed for tests and for the Operations API's `reload` path: the
/// timestamp a snapshot should be considered "as of".
pub fn snapshot_timestamp(snapshot: &ClusterSnapshot) -> DateTime<Utc> {
    snapshot.status.status_ts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_pid_accepts_own_pid() {
        assert!(check_pid(std::process::id()).is_ok());
    }

    #[test]
    fn check_pid_accepts_zero_as_unset() {
        assert!(check_pid(0).is_ok());
    }

    #[test]
    fn file_wins_ties_over_db() {
        let now = Utc::now();
        let f_status = crate::core::cluster::ClusterStatus {
            status: ServerStatus::Healthy,
            status_no: 1,
            status_ts: now,
            status_message: String::new(),
            pid: 1,
        };
        let d_status = crate::core::cluster::ClusterStatus {
            status_ts: now,
            ..f_status.clone()
        };
        assert!(!(d_status.status_ts > f_status.status_ts));
    }
}
