// src/core/failover.rs

//! Failover Orchestrator: the state machine that gates and executes
//! failover. Both the tick-driven `auto_failover` and the
//! operator-driven `manual_failover` funnel through `run_failover`, varying
//! only in candidate pinning and rollback preference.

use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::alert;
use crate::core::cluster::{ClusterState, ServerRole, ServerStatus};
use crate::core::db::ConnectCredentials;
use crate::core::errors::HandyRepError;
use crate::core::metrics::FAILOVER_ATTEMPTS_TOTAL;
use crate::core::plugin::PluginRegistry;
use crate::core::remote::{RemoteExecutor, RemoteTarget};

/// Final disposition of a failover attempt, returned to the caller (tick
/// loop or Operations API) for logging/alerting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// The tick detected a live primary; no failover was attempted.
    NotNeeded,
    /// This instance is not the leader; no action taken.
    NotLeader,
    /// `auto_failover` is disabled or `failover_ok` was false.
    Aborted(String),
    /// The primary was restarted successfully instead of failing over.
    RestartedPrimary,
    /// Failover completed: old primary name, new primary name.
    Completed { old_primary: String, new_primary: String },
    /// All candidates failed promotion; rollback attempted.
    CriticalFailure(String),
}

/// Runs one failover attempt against `cluster`, starting from
/// `CHECK_LEADER`. `pinned_candidate` is `Some` only for a manual failover
/// where the operator named a specific replica.
#[allow(clippy::too_many_arguments)]
pub async fn run_failover(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    remote: &RemoteExecutor,
    config: &Config,
    creds: &ConnectCredentials,
    primary_name: &str,
    pinned_candidate: Option<&str>,
    is_manual: bool,
    alert_method: Option<&str>,
) -> Result<FailoverOutcome, HandyRepError> {
    // CHECK_LEADER
    let leader_check = plugins.get(&config.failover.check_hr_master_method).run(&[]).await;
    if !leader_check.ok {
        return Ok(FailoverOutcome::NotLeader);
    }

    let primary_rank = cluster
        .servers
        .get(primary_name)
        .ok_or_else(|| HandyRepError::HandyRep(format!("unknown server '{primary_name}'")))?
        .status
        .rank();
    if primary_rank <= 3 && !is_manual {
        return Ok(FailoverOutcome::NotNeeded);
    }

    // [restart_master enabled?]
    if config.failover.restart_master && !is_manual {
        let server = cluster.servers[primary_name].clone();
        let restart = plugins.get(&server.restart_method).run(&["restart".into()]).await;
        if restart.ok {
            cluster.status_update(primary_name, ServerStatus::Healthy, Some("restarted".into()))?;
            return Ok(FailoverOutcome::RestartedPrimary);
        }
        warn!(server = primary_name, "restart_master failed, proceeding to failover");
    }

    if !config.failover.auto_failover && !is_manual {
        return Ok(FailoverOutcome::Aborted("auto_failover disabled".into()));
    }

    FAILOVER_ATTEMPTS_TOTAL.inc();

    // SELECT_CANDIDATES
    let candidates = select_candidates(cluster, plugins, config, primary_name, pinned_candidate).await?;
    if candidates.is_empty() {
        cluster.log("FAILOVER", "no viable candidates; aborting failover without mutation", true, true);
        return Ok(FailoverOutcome::Aborted("no viable candidates".into()));
    }

    // FENCE_OLD_PRIMARY
    let fenced = fence_primary(cluster, plugins, creds, primary_name).await;
    if !fenced {
        if config.failover.connection_failover {
            let isolate_target = &candidates[0];
            rewrite_connections(cluster, plugins, config, primary_name, isolate_target).await;
            let outcome = cluster.status_update(primary_name, ServerStatus::Unavailable, Some("fence failed, isolated via connection rewrite".into()))?;
            alert::dispatch(plugins, alert_method, outcome, &format!("'{primary_name}': fence failed, isolated via connection rewrite")).await;
        } else {
            cluster.log("FAILOVER", "fence failed and connection_failover disabled; aborting", true, true);
            return Ok(FailoverOutcome::Aborted("fence failed".into()));
        }
    }

    // PROMOTE_CANDIDATE (iterate in priority order)
    let mut promoted: Option<String> = None;
    for candidate in &candidates {
        if promote_candidate(cluster, plugins, config, candidate).await? {
            promoted = Some(candidate.clone());
            break;
        }
        cluster.log("FAILOVER", format!("candidate '{candidate}' failed promotion"), true, false);
    }

    let new_primary = match promoted {
        Some(name) => name,
        None => {
            return Ok(rollback(cluster, plugins, primary_name, alert_method).await?);
        }
    };

    cluster.status_update(&new_primary, ServerStatus::Healthy, Some("promoted".into()))?;
    {
        let rec = cluster.servers.get_mut(&new_primary).unwrap();
        rec.role = ServerRole::Primary;
        rec.enabled = true;
        rec.failover_priority = 0;
    }
    {
        let old = cluster.servers.get_mut(primary_name).unwrap();
        old.role = ServerRole::Replica;
        old.enabled = false;
    }

    // [remaster enabled?]
    if config.failover.remaster {
        remaster_all_replicas(cluster, plugins, &new_primary, primary_name).await;
    }

    // REWRITE_CONNECTIONS
    let rewrite_ok = rewrite_connections(cluster, plugins, config, primary_name, &new_primary).await;
    if !rewrite_ok {
        let outcome = cluster.status_update(&new_primary, ServerStatus::Down, Some("connection rewrite failed".into()))?;
        alert::dispatch(plugins, alert_method, outcome, &format!("'{new_primary}': connection rewrite failed after promotion")).await;
        error!(new_primary, "connection rewrite failed after promotion; cluster degraded");
        return Ok(FailoverOutcome::CriticalFailure("connection rewrite failed after promotion".into()));
    }

    // RUN_POSTFAIL_HOOKS (best-effort)
    run_postfailover_hooks(cluster, plugins, config, remote, creds, &new_primary).await;

    info!(old_primary = primary_name, new_primary = %new_primary, "failover completed");
    Ok(FailoverOutcome::Completed { old_primary: primary_name.to_string(), new_primary })
}

/// Delegates to the selection plugin; the operator's pinned candidate, if
/// given, is still re-checked via `check_replica`.
async fn select_candidates(
    cluster: &ClusterState,
    plugins: &PluginRegistry,
    config: &Config,
    primary_name: &str,
    pinned_candidate: Option<&str>,
) -> Result<Vec<String>, HandyRepError> {
    if let Some(pinned) = pinned_candidate {
        return if check_replica(cluster, pinned).await {
            Ok(vec![pinned.to_string()])
        } else {
            Ok(vec![])
        };
    }

    let selection = plugins.get(&config.failover.selection_method).run(&[primary_name.to_string()]).await;
    if let Some(ordered) = selection.extra.get("candidates").and_then(|v| v.as_array()) {
        let names: Vec<String> = ordered.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        let mut viable = Vec::new();
        for name in names {
            if check_replica(cluster, &name).await {
                viable.push(name);
            }
        }
        return Ok(viable);
    }

    // Fall back to the documented default ordering: lowest failover_priority,
    // ties broken by name. No selection plugin reported actual replication
    // lag here, so lag isn't part of the tiebreak.
    let mut replicas: Vec<_> = cluster
        .servers
        .values()
        .filter(|s| s.role == ServerRole::Replica && s.enabled && s.name != primary_name)
        .collect();
    replicas.sort_by(|a, b| a.failover_priority.cmp(&b.failover_priority).then(a.name.cmp(&b.name)));
    let mut viable = Vec::new();
    for r in replicas {
        if check_replica(cluster, &r.name).await {
            viable.push(r.name.clone());
        }
    }
    Ok(viable)
}

/// Pre-promotion candidate check: service status + reachability + still a
/// replica. No lag check here — lag is only a poll/verify-tier concern.
async fn check_replica(cluster: &ClusterState, name: &str) -> bool {
    cluster
        .servers
        .get(name)
        .map(|s| s.enabled && s.role == ServerRole::Replica && s.status.rank() <= 3)
        .unwrap_or(false)
}

/// Attempts graceful shutdown of the old primary (STONITH-equivalent). If
/// service control can't confirm the stop, falls back to a DB connect probe:
/// connect failure means the node is already gone (fenced in effect);
/// connect success means the primary is reachable but refused to stop, which
/// is treated as a fence failure rather than guessed away.
async fn fence_primary(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    creds: &ConnectCredentials,
    primary_name: &str,
) -> bool {
    let server = match cluster.servers.get(primary_name) {
        Some(s) => s.clone(),
        None => return false,
    };
    let stop = plugins.get(&server.restart_method).stop(primary_name).await;
    if stop.ok {
        return true;
    }
    cluster.log("FAILOVER", format!("fence of '{primary_name}' via service control failed: {}", stop.details), true, false);

    match crate::core::db::connect(&server, creds).await {
        Err(_) => {
            cluster.log("FAILOVER", format!("'{primary_name}' unreachable via DB after failed stop; treating as already fenced"), false, false);
            true
        }
        Ok(_) => {
            cluster.log("FAILOVER", format!("'{primary_name}' still reachable via DB but would not stop; fence aborted"), true, false);
            false
        }
    }
}

/// Calls the promotion plugin, then polls with the replication-status
/// plugin (acting as `pg_is_in_recovery`) until the candidate exits
/// recovery or retries are exhausted.
async fn promote_candidate(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    config: &Config,
    candidate: &str,
) -> Result<bool, HandyRepError> {
    let server = cluster.servers[candidate].clone();
    let promotion = plugins.get(&server.promotion_method).run(&[candidate.to_string()]).await;
    if !promotion.ok {
        return Ok(false);
    }

    let poll_plugin = plugins.get("replication_status");
    for attempt in 0..config.failover.recovery_retries {
        let status = poll_plugin.poll(Some(candidate)).await;
        let still_in_recovery = status.extra.get("in_recovery").and_then(|v| v.as_bool()).unwrap_or(true);
        if status.ok && !still_in_recovery {
            return Ok(true);
        }
        tokio::time::sleep(config.failover.fail_retry_interval).await;
        let _ = attempt;
    }
    cluster.log("FAILOVER", format!("candidate '{candidate}' did not exit recovery in time"), true, false);
    Ok(false)
}

/// Reconfigures every other enabled replica to stream from `new_primary`
/// without re-cloning it. Best-effort per replica; failures are logged but
/// do not abort the overall failover (the replica simply stays stale until
/// the next `remaster` operator call or tick).
async fn remaster_all_replicas(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    new_primary: &str,
    old_primary: &str,
) {
    let replica_names: Vec<String> = cluster
        .servers
        .values()
        .filter(|s| s.role == ServerRole::Replica && s.enabled && s.name != new_primary && s.name != old_primary)
        .map(|s| s.name.clone())
        .collect();

    for name in replica_names {
        let server = cluster.servers[&name].clone();
        let remaster_plugin = plugins.get(&server.recovery_template);
        let result = remaster_plugin.recovery_line(new_primary, 5432).await;
        if !result.ok {
            cluster.log("REMASTER", format!("failed to remaster '{name}' onto '{new_primary}': {}", result.details), true, false);
        } else {
            cluster.log("REMASTER", format!("remastered '{name}' onto '{new_primary}'"), false, false);
        }
    }
}

/// Rewrites proxy routing so clients follow `new_primary`. The
/// connection-failover plugin's `run(args)` takes the new primary's
/// `[hostname, port]`, not server names — `old_primary` is only used for
/// logging here.
async fn rewrite_connections(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    config: &Config,
    old_primary: &str,
    new_primary: &str,
) -> bool {
    if !config.failover.connection_failover {
        return true;
    }
    let Some(server) = cluster.servers.get(new_primary) else {
        cluster.log("FAILOVER", format!("connection rewrite failed: unknown server '{new_primary}'"), true, true);
        return false;
    };
    let (hostname, port) = (server.hostname.clone(), server.port);

    let plugin = plugins.get(&config.failover.connection_failover_method);
    let result = plugin.run(&[hostname, port.to_string()]).await;
    if !result.ok {
        cluster.log(
            "FAILOVER",
            format!("connection rewrite from '{old_primary}' to '{new_primary}' failed: {}", result.details),
            true,
            true,
        );
    }
    result.ok
}

/// Runs `extra_failover_commands` best-effort; their failure is logged and
/// reported but does not undo the failover.
async fn run_postfailover_hooks(
    cluster: &mut ClusterState,
    _plugins: &PluginRegistry,
    config: &Config,
    remote: &RemoteExecutor,
    _creds: &ConnectCredentials,
    new_primary: &str,
) {
    for (label, command) in &config.extra_failover_commands {
        let server = match cluster.servers.get(new_primary) {
            Some(s) => s.clone(),
            None => continue,
        };
        let target = RemoteTarget {
            host: &server.hostname,
            user: &server.ssh_user,
            key_path: server.ssh_key.as_deref(),
            timeout: std::time::Duration::from_secs(30),
        };
        let full_command = if command.parameters.is_empty() {
            command.command.clone()
        } else {
            format!("{} {}", command.command, command.parameters.join(" "))
        };
        match remote.exec(&target, &full_command).await {
            Ok(out) if out.ok => {
                cluster.log("FAILOVER", format!("post-failover hook '{label}' succeeded"), false, false);
            }
            Ok(out) => {
                cluster.log("FAILOVER", format!("post-failover hook '{label}' failed: {}", out.message()), true, false);
            }
            Err(e) => {
                cluster.log("FAILOVER", format!("post-failover hook '{label}' errored: {e}"), true, false);
            }
        }
    }
}

/// Attempts to restart the original primary after an aborted/failed
/// failover. Cluster returns to `warning` if the restart succeeds, `down`
/// otherwise.
async fn rollback(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    primary_name: &str,
    alert_method: Option<&str>,
) -> Result<FailoverOutcome, HandyRepError> {
    let server = cluster.servers[primary_name].clone();
    let restart = plugins.get(&server.restart_method).run(&["restart".into()]).await;
    if restart.ok {
        cluster.status_update(primary_name, ServerStatus::Warning, Some("restarted after failed failover".into()))?;
        error!(primary_name, "all candidates failed promotion; restarted old primary");
    } else {
        let outcome = cluster.status_update(primary_name, ServerStatus::Down, Some("all candidates failed and restart failed".into()))?;
        alert::dispatch(plugins, alert_method, outcome, &format!("'{primary_name}': all candidates failed promotion, restart also failed")).await;
        error!(primary_name, "all candidates failed promotion and restart failed; cluster down");
    }
    cluster.log("FAILOVER", "CRITICAL: all candidates failed promotion", true, true);
    Ok(FailoverOutcome::CriticalFailure("all candidates failed promotion".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_replica_rejects_disabled_server() {
        let mut cluster = ClusterState::new(1);
        cluster.servers.insert(
            "r1".into(),
            crate::core::cluster::ServerRecord {
                name: "r1".into(),
                role: ServerRole::Replica,
                enabled: false,
                hostname: "h".into(),
                port: 5432,
                ssh_user: "postgres".into(),
                ssh_key: None,
                status: ServerStatus::Healthy,
                status_message: String::new(),
                status_ts: chrono::Utc::now(),
                failover_priority: 1,
                lag_limit: 1024,
                restart_method: String::new(),
                promotion_method: String::new(),
                clone_method: String::new(),
                recovery_template: String::new(),
                extra: Default::default(),
            },
        );
        assert!(!check_replica(&cluster, "r1").await);
    }
}
