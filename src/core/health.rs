// src/core/health.rs

//! Health Pipeline: the *poll* (cheap) and *verify* (deep) tiers.
//! Both tiers are the only callers permitted to feed fresh status
//! observations into `ClusterState::status_update`.

use tracing::{info, warn};

use crate::config::Config;
use crate::core::alert;
use crate::core::cluster::{ClusterState, ServerRole, ServerStatus};
use crate::core::db::{self, ConnectCredentials};
use crate::core::errors::HandyRepError;
use crate::core::plugin::PluginRegistry;
use crate::core::remote::{RemoteExecutor, RemoteTarget};

/// Outcome of `verify_all`, consumed by the Failover Orchestrator to decide
/// whether an automatic failover is even viable this tick.
#[derive(Debug, Clone, Copy)]
pub struct VerifyAllResult {
    pub ok: bool,
    pub failover_ok: bool,
}

/// Cheap liveness probe for every enabled server. On success, a server
/// previously in {unknown, unavailable, down} is promoted to healthy;
/// otherwise its status (and only its timestamp) is preserved. On failure,
/// the server becomes unavailable (or down, for the primary, if the probe
/// indicates total unreachability).
pub async fn poll_all(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    poll_method: &str,
    alert_method: Option<&str>,
) -> Result<(), HandyRepError> {
    let names: Vec<String> = cluster
        .servers
        .values()
        .filter(|s| s.enabled)
        .map(|s| s.name.clone())
        .collect();

    let poll_plugin = plugins.get(poll_method);
    for name in names {
        let result = poll_plugin.poll(Some(&name)).await;
        let current = cluster.servers[&name].status;

        let new_status = if result.ok {
            if matches!(
                current,
                ServerStatus::Unknown | ServerStatus::Unavailable | ServerStatus::Down
            ) {
                ServerStatus::Healthy
            } else {
                current
            }
        } else {
            let role = cluster.servers[&name].role;
            if role == ServerRole::Primary {
                ServerStatus::Down
            } else {
                ServerStatus::Unavailable
            }
        };

        let message = if result.ok { None } else { Some(result.details) };
        let detail = message.clone().unwrap_or_else(|| format!("'{name}' poll ok"));
        let outcome = cluster.status_update(&name, new_status, message)?;
        alert::dispatch(plugins, alert_method, outcome, &format!("'{name}': {detail}")).await;
    }
    Ok(())
}

/// Deep verification of the primary. SSH-then-DB branch ordering, with a
/// poll-then-service-status fallback when DB is unreachable but SSH succeeds.
pub async fn verify_primary(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    remote: &RemoteExecutor,
    config: &Config,
    creds: &ConnectCredentials,
    server_name: &str,
    alert_method: Option<&str>,
) -> Result<(), HandyRepError> {
    let server = cluster
        .servers
        .get(server_name)
        .ok_or_else(|| HandyRepError::HandyRep(format!("unknown server '{server_name}'")))?
        .clone();

    let ssh_target = RemoteTarget {
        host: &server.hostname,
        user: &server.ssh_user,
        key_path: server.ssh_key.as_deref(),
        timeout: std::time::Duration::from_secs(10),
    };
    let ssh_ok = remote
        .exec(&ssh_target, &config.handyrep.test_ssh_command)
        .await
        .map(|out| out.ok)
        .unwrap_or(false);

    let db_conn = db::connect(&server, creds).await;

    let (status, message) = match (ssh_ok, db_conn) {
        (false, Err(_)) => (ServerStatus::Unavailable, "unreachable via SSH and DB".to_string()),
        (true, Err(_)) => {
            // SSH ok, DB failed: fall back to poll, then service-status.
            let poll_plugin = plugins.get(&config.failover.poll_method);
            if poll_plugin.poll(Some(server_name)).await.ok {
                (ServerStatus::Warning, "running but unreachable via DB".to_string())
            } else {
                let service = plugins.get(&server.restart_method).poll(Some(server_name)).await;
                if service.ok {
                    (ServerStatus::Warning, "service up but DB unreachable".to_string())
                } else {
                    (ServerStatus::Down, "service down and DB unreachable".to_string())
                }
            }
        }
        (_, Ok(mut conn)) => match db::verify_writable(&mut conn).await {
            Ok(()) => (ServerStatus::Healthy, "primary healthy".to_string()),
            Err(_) => (ServerStatus::Down, "writes frozen".to_string()),
        },
    };

    let outcome = cluster.status_update(server_name, status, Some(message.clone()))?;
    alert::dispatch(plugins, alert_method, outcome, &format!("'{server_name}': {message}")).await;
    Ok(())
}

/// Deep verification of a replica. Suppresses replica-status errors (keeps
/// the prior status) when the primary is known to be down, since a down
/// primary makes the replica's own replication status meaningless noise.
pub async fn verify_replica(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    remote: &RemoteExecutor,
    config: &Config,
    creds: &ConnectCredentials,
    server_name: &str,
    primary_known_down: bool,
    alert_method: Option<&str>,
) -> Result<(), HandyRepError> {
    let server = cluster
        .servers
        .get(server_name)
        .ok_or_else(|| HandyRepError::HandyRep(format!("unknown server '{server_name}'")))?
        .clone();

    let ssh_target = RemoteTarget {
        host: &server.hostname,
        user: &server.ssh_user,
        key_path: server.ssh_key.as_deref(),
        timeout: std::time::Duration::from_secs(10),
    };
    let ssh_ok = remote
        .exec(&ssh_target, &config.handyrep.test_ssh_command)
        .await
        .map(|out| out.ok)
        .unwrap_or(false);

    let db_conn = db::connect(&server, creds).await;

    if !ssh_ok && db_conn.is_err() {
        let outcome = cluster.status_update(server_name, ServerStatus::Unavailable, Some("unreachable".into()))?;
        alert::dispatch(plugins, alert_method, outcome, &format!("'{server_name}': unreachable")).await;
        return Ok(());
    }

    let mut conn = match db_conn {
        Ok(c) => c,
        Err(_) => {
            let outcome = cluster.status_update(server_name, ServerStatus::Unavailable, Some("DB unreachable".into()))?;
            alert::dispatch(plugins, alert_method, outcome, &format!("'{server_name}': DB unreachable")).await;
            return Ok(());
        }
    };

    let replication_plugin = plugins.get("replication_status");
    let repl = replication_plugin.poll(Some(server_name)).await;

    if !repl.ok {
        if primary_known_down {
            cluster.log(
                server_name,
                "suppressing replica status error: primary is already known-down",
                false,
                false,
            );
            return Ok(());
        }
        let outcome = cluster.status_update(server_name, ServerStatus::Unavailable, Some(repl.details.clone()))?;
        alert::dispatch(plugins, alert_method, outcome, &format!("'{server_name}': {}", repl.details)).await;
        return Ok(());
    }

    let replicating = repl
        .extra
        .get("replicating")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !replicating {
        let outcome = cluster.status_update(server_name, ServerStatus::Unavailable, Some("not replicating".into()))?;
        alert::dispatch(plugins, alert_method, outcome, &format!("'{server_name}': not replicating")).await;
        return Ok(());
    }

    let lag = match repl.extra.get("lag_bytes").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => db::replication_lag_bytes(&mut conn).await?.unwrap_or(0),
    };

    if lag > server.lag_limit {
        let outcome = cluster.status_update(server_name, ServerStatus::Lagged, Some(format!("lag {lag} bytes")))?;
        alert::dispatch(plugins, alert_method, outcome, &format!("'{server_name}': lag {lag} bytes")).await;
    } else {
        cluster.status_update(server_name, ServerStatus::Healthy, None)?;
    }
    Ok(())
}

/// Delegates proxy verification entirely to the connection-failover
/// plugin's `poll` hook.
pub async fn verify_proxy(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    connection_failover_method: &str,
    server_name: &str,
    alert_method: Option<&str>,
) -> Result<(), HandyRepError> {
    let plugin = plugins.get(connection_failover_method);
    let result = plugin.poll(Some(server_name)).await;
    let status = if result.ok { ServerStatus::Healthy } else { ServerStatus::Unavailable };
    let outcome = cluster.status_update(server_name, status, Some(result.details.clone()))?;
    alert::dispatch(plugins, alert_method, outcome, &format!("'{server_name}': {}", result.details)).await;
    Ok(())
}

/// Runs the primary first (so replicas aren't mis-classified while the
/// primary's true state is still unknown), then replicas, then proxies.
/// Returns whether failover would currently be viable.
pub async fn verify_all(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    remote: &RemoteExecutor,
    config: &Config,
    creds: &ConnectCredentials,
    alert_method: Option<&str>,
) -> Result<VerifyAllResult, HandyRepError> {
    let primaries: Vec<String> = cluster
        .servers
        .values()
        .filter(|s| s.role == ServerRole::Primary && s.enabled)
        .map(|s| s.name.clone())
        .collect();

    if primaries.len() > 1 {
        cluster.log(
            "CLUSTER_DOWN",
            format!("multiple enabled primaries detected: {primaries:?}"),
            true,
            true,
        );
        return Ok(VerifyAllResult { ok: false, failover_ok: false });
    }

    let mut primary_down = primaries.is_empty();
    if let Some(primary_name) = primaries.first() {
        verify_primary(cluster, plugins, remote, config, creds, primary_name, alert_method).await?;
        primary_down = cluster.servers[primary_name].status.rank() > 3;
    }

    let replica_names: Vec<String> = cluster
        .servers
        .values()
        .filter(|s| s.role == ServerRole::Replica && s.enabled)
        .map(|s| s.name.clone())
        .collect();

    let mut healthy_replica_count = 0usize;
    for name in &replica_names {
        verify_replica(cluster, plugins, remote, config, creds, name, primary_down, alert_method).await?;
        if cluster.servers[name].status.rank() <= 2 {
            healthy_replica_count += 1;
        }
    }

    let proxy_names: Vec<String> = cluster
        .servers
        .values()
        .filter(|s| s.role == ServerRole::Proxy && s.enabled)
        .map(|s| s.name.clone())
        .collect();
    if config.failover.poll_connection_proxy {
        for name in &proxy_names {
            verify_proxy(cluster, plugins, &config.failover.connection_failover_method, name, alert_method).await?;
        }
    }

    if config.archive.archiving {
        let archive_plugin = plugins.get(&config.archive.archive_script_method);
        let housekeeping = archive_plugin.poll(None).await;
        if !housekeeping.ok {
            warn!(details = %housekeeping.details, "archive housekeeping reported a problem");
        }
    }

    let failover_ok = primaries.len() == 1 && healthy_replica_count >= 1;
    info!(failover_ok, primary_down, "verify_all complete");
    Ok(VerifyAllResult { ok: true, failover_ok })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::ServerRecord;
    use std::collections::HashMap;

    fn make_server(name: &str, role: ServerRole, enabled: bool) -> ServerRecord {
        ServerRecord {
            name: name.to_string(),
            role,
            enabled,
            hostname: "localhost".into(),
            port: 5432,
            ssh_user: "postgres".into(),
            ssh_key: None,
            status: ServerStatus::Healthy,
            status_message: String::new(),
            status_ts: chrono::Utc::now(),
            failover_priority: 999,
            lag_limit: 1024,
            restart_method: String::new(),
            promotion_method: String::new(),
            clone_method: String::new(),
            recovery_template: String::new(),
            extra: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn poll_all_promotes_unknown_to_healthy_on_success() {
        let mut cluster = ClusterState::new(1);
        let mut rec = make_server("p1", ServerRole::Primary, true);
        rec.status = ServerStatus::Unknown;
        cluster.servers.insert("p1".into(), rec);

        let mut registry = PluginRegistry::new();
        struct AlwaysOk;
        #[async_trait::async_trait]
        impl crate::core::plugin::Plugin for AlwaysOk {
            fn name(&self) -> &str {
                "always_ok"
            }
            async fn poll(&self, _target: Option<&str>) -> crate::core::plugin::PluginResult {
                crate::core::plugin::PluginResult::ok("up")
            }
        }
        registry.register("pg_isready", std::sync::Arc::new(AlwaysOk));

        poll_all(&mut cluster, &registry, "pg_isready", None).await.unwrap();
        assert_eq!(cluster.servers["p1"].status, ServerStatus::Healthy);
    }
}
