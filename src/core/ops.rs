// src/core/ops.rs

//! Operations API: the operator-callable actions. Every
//! function returns the uniform `{ok, details, extra}` envelope via
//! `PluginResult`, reused here even though these are not plugin calls,
//! because it is exactly the envelope shape the external interface
//! promises callers.

use chrono::Utc;

use crate::config::Config;
use crate::core::cluster::{ClusterState, ServerRecord, ServerRole, ServerStatus};
use crate::core::errors::HandyRepError;
use crate::core::plugin::{PluginRegistry, PluginResult};
use crate::core::remote::{RemoteExecutor, RemoteTarget};

/// `add_server(name, props)`: requires `hostname`; defaults `role=replica`,
/// `enabled=false`. Merges defaults + supplied props, persists.
pub fn add_server(
    cluster: &mut ClusterState,
    config: &Config,
    name: &str,
    hostname: &str,
    role: Option<ServerRole>,
) -> Result<PluginResult, HandyRepError> {
    if cluster.servers.contains_key(name) {
        return Ok(PluginResult::fail(format!("server '{name}' already exists")));
    }
    let defaults = &config.server_defaults;
    let record = ServerRecord {
        name: name.to_string(),
        role: role.unwrap_or(ServerRole::Replica),
        enabled: false,
        hostname: hostname.to_string(),
        port: defaults.port.unwrap_or(5432),
        ssh_user: defaults.ssh_user.clone().unwrap_or_else(|| "postgres".into()),
        ssh_key: defaults.ssh_key.clone(),
        status: ServerStatus::Unknown,
        status_message: "added, not yet polled".into(),
        status_ts: Utc::now(),
        failover_priority: defaults.failover_priority.unwrap_or(999),
        lag_limit: defaults.lag_limit.unwrap_or(16 * 1024 * 1024),
        restart_method: defaults.restart_method.clone().unwrap_or_default(),
        promotion_method: defaults.promotion_method.clone().unwrap_or_default(),
        clone_method: defaults.clone_method.clone().unwrap_or_default(),
        recovery_template: defaults.recovery_template.clone().unwrap_or_default(),
        extra: Default::default(),
    };
    cluster.servers.insert(name.to_string(), record);
    cluster.log("HANDYREP", format!("server '{name}' added (disabled)"), false, false);
    Ok(PluginResult::ok(format!("server '{name}' added")))
}

/// `clone(target, reclone?, from?)`: refuses if target is the primary;
/// refuses if target is enabled and not in a terminal-bad state unless
/// `reclone` is set (then shuts it down first); invokes the clone plugin,
/// pushes recovery config and archive script, starts the server.
pub async fn clone_server(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    remote: &RemoteExecutor,
    target: &str,
    reclone: bool,
    from: Option<&str>,
) -> Result<PluginResult, HandyRepError> {
    let server = match cluster.servers.get(target) {
        Some(s) => s.clone(),
        None => return Ok(PluginResult::fail(format!("no such server '{target}'"))),
    };
    if server.role == ServerRole::Primary {
        return Ok(PluginResult::fail("refusing to clone the primary"));
    }
    if server.enabled
        && matches!(
            server.status,
            ServerStatus::Healthy | ServerStatus::Lagged | ServerStatus::Warning | ServerStatus::Unknown
        )
        && !reclone
    {
        return Ok(PluginResult::fail(format!(
            "'{target}' is enabled and apparently healthy; pass reclone to force"
        )));
    }

    if server.enabled {
        plugins.get(&server.restart_method).stop(target).await;
    }

    let source = from.unwrap_or("primary");
    let clone_result = plugins.get(&server.clone_method).run(&[target.to_string(), source.to_string()]).await;
    if !clone_result.ok {
        cluster.log("CLONE", format!("clone of '{target}' from '{source}' failed: {}", clone_result.details), true, true);
        return Ok(clone_result);
    }

    let recovery_plugin = plugins.get(&server.recovery_template);
    let recovery = recovery_plugin.recovery_line(source, server.port).await;
    if !recovery.ok {
        cluster.log("CLONE", format!("failed to push recovery config to '{target}': {}", recovery.details), true, false);
    }

    if let Some(contents) = recovery.extra.get("recovery_conf").and_then(|v| v.as_str()) {
        let target_ssh = RemoteTarget {
            host: &server.hostname,
            user: &server.ssh_user,
            key_path: server.ssh_key.as_deref(),
            timeout: std::time::Duration::from_secs(30),
        };
        let _ = remote.upload(&target_ssh, "postgresql.auto.conf", contents).await;
    }

    let start = plugins.get(&server.restart_method).start(target).await;
    if !start.ok {
        cluster.log("CLONE", format!("clone of '{target}' succeeded but start failed: {}", start.details), true, true);
        return Ok(start);
    }

    cluster.status_update(target, ServerStatus::Unknown, Some("cloned, awaiting first poll".into()))?;
    cluster.log("CLONE", format!("'{target}' cloned from '{source}' and started"), false, false);
    Ok(PluginResult::ok(format!("'{target}' cloned from '{source}'")))
}

/// `enable(name)`: refuses to enable a second primary; after enabling,
/// verifies and persists.
pub fn enable(cluster: &mut ClusterState, name: &str) -> Result<PluginResult, HandyRepError> {
    let role = match cluster.servers.get(name) {
        Some(s) => s.role,
        None => return Ok(PluginResult::fail(format!("no such server '{name}'"))),
    };
    if role == ServerRole::Primary {
        let other_primary_enabled = cluster
            .servers
            .values()
            .any(|s| s.role == ServerRole::Primary && s.enabled && s.name != name);
        if other_primary_enabled {
            return Ok(PluginResult::fail("refusing to enable a second primary"));
        }
    }
    cluster.servers.get_mut(name).unwrap().enabled = true;
    cluster.log("HANDYREP", format!("'{name}' enabled"), false, false);
    Ok(PluginResult::ok(format!("'{name}' enabled")))
}

/// `disable(name)`: best-effort shutdown, mark disabled, persist.
pub async fn disable(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    name: &str,
) -> Result<PluginResult, HandyRepError> {
    let server = match cluster.servers.get(name) {
        Some(s) => s.clone(),
        None => return Ok(PluginResult::fail(format!("no such server '{name}'"))),
    };
    let stop = plugins.get(&server.restart_method).stop(name).await;
    if !stop.ok {
        cluster.log("HANDYREP", format!("best-effort shutdown of '{name}' failed: {}", stop.details), true, false);
    }
    cluster.servers.get_mut(name).unwrap().enabled = false;
    cluster.log("HANDYREP", format!("'{name}' disabled"), false, false);
    Ok(PluginResult::ok(format!("'{name}' disabled")))
}

/// `remove(name)`: only if currently disabled.
pub fn remove(cluster: &mut ClusterState, name: &str) -> Result<PluginResult, HandyRepError> {
    match cluster.servers.get(name) {
        Some(s) if s.enabled => Ok(PluginResult::fail(format!("'{name}' is enabled; disable before removing"))),
        Some(_) => {
            cluster.servers.remove(name);
            cluster.log("HANDYREP", format!("'{name}' removed"), false, false);
            Ok(PluginResult::ok(format!("'{name}' removed")))
        }
        None => Ok(PluginResult::fail(format!("no such server '{name}'"))),
    }
}

/// `restart(name)`: a direct operator-requested restart, independent of the
/// implicit restart the Failover Orchestrator attempts on rollback.
pub async fn restart(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    name: &str,
) -> Result<PluginResult, HandyRepError> {
    let server = match cluster.servers.get(name) {
        Some(s) => s.clone(),
        None => return Ok(PluginResult::fail(format!("no such server '{name}'"))),
    };
    let result = plugins.get(&server.restart_method).run(&["restart".to_string()]).await;
    if result.ok {
        cluster.status_update(name, ServerStatus::Unknown, Some("restarted, awaiting next poll".into()))?;
        cluster.log("HANDYREP", format!("'{name}' restarted"), false, false);
    } else {
        cluster.log("HANDYREP", format!("restart of '{name}' failed: {}", result.details), true, false);
    }
    Ok(result)
}

/// `start_archiving()`: enables WAL archiving via the configured
/// archive-script plugin.
pub async fn start_archiving(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    archive_script_method: &str,
) -> PluginResult {
    let result = plugins.get(archive_script_method).start("archiving").await;
    cluster.log(
        "ARCHIVE",
        if result.ok { "archiving started".to_string() } else { format!("failed to start archiving: {}", result.details) },
        !result.ok,
        false,
    );
    result
}

/// `stop_archiving()`: disables WAL archiving via the configured
/// archive-script plugin.
pub async fn stop_archiving(
    cluster: &mut ClusterState,
    plugins: &PluginRegistry,
    archive_script_method: &str,
) -> PluginResult {
    let result = plugins.get(archive_script_method).stop("archiving").await;
    cluster.log(
        "ARCHIVE",
        if result.ok { "archiving stopped".to_string() } else { format!("failed to stop archiving: {}", result.details) },
        !result.ok,
        false,
    );
    result
}

/// `alter_server_def(name, props)`: forbids changing status fields;
/// forbids role flips between primary/replica while enabled.
pub fn alter_server_def(
    cluster: &mut ClusterState,
    name: &str,
    new_hostname: Option<String>,
    new_role: Option<ServerRole>,
    new_failover_priority: Option<i32>,
    new_lag_limit: Option<i64>,
) -> Result<PluginResult, HandyRepError> {
    let server = match cluster.servers.get(name) {
        Some(s) => s.clone(),
        None => return Ok(PluginResult::fail(format!("no such server '{name}'"))),
    };

    let flips_primary_replica_role = new_role.is_some_and(|role| {
        role != server.role
            && server.enabled
            && matches!(
                (server.role, role),
                (ServerRole::Primary, ServerRole::Replica) | (ServerRole::Replica, ServerRole::Primary)
            )
    });
    if flips_primary_replica_role {
        return Ok(PluginResult::fail("cannot flip primary/replica role while enabled"));
    }

    let rec = cluster.servers.get_mut(name).unwrap();
    if let Some(hostname) = new_hostname {
        rec.hostname = hostname;
    }
    if let Some(role) = new_role {
        rec.role = role;
    }
    if let Some(priority) = new_failover_priority {
        rec.failover_priority = priority;
    }
    if let Some(lag_limit) = new_lag_limit {
        rec.lag_limit = lag_limit;
    }
    cluster.log("HANDYREP", format!("'{name}' altered"), false, false);
    Ok(PluginResult::ok(format!("'{name}' altered")))
}

/// Status-reporting mode for `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    Cached,
    Poll,
    Verify,
}

/// `get_status(mode)`: `cached` returns the in-memory snapshot directly;
/// `poll`/`verify` run the corresponding pipeline tier first. The pipeline
/// run itself is the caller's responsibility (it needs plugin/remote/db
/// handles this function does not own); this function only formats the
/// resulting snapshot.
pub fn get_status(cluster: &ClusterState, mode: StatusMode) -> PluginResult {
    let snapshot = cluster.to_snapshot();
    let body = serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null);
    PluginResult::ok(format!("cluster status: {}", snapshot.status.status))
        .with_extra("mode", serde_json::Value::String(format!("{mode:?}")))
        .with_extra("snapshot", body)
}

/// Merges server settings with the precedence resolved per the Open
/// Question in the design notes: defaults first, then file config, then
/// live/operator overrides, then — only for an *existing* server — the
/// live status fields are re-applied last so a reconfigure never clobbers
/// a server's current observed status. A brand-new server keeps the
/// "unknown" status defaults instead.
pub fn merge_server_settings(
    existing: Option<&ServerRecord>,
    defaults: &ServerRecord,
    file_overrides: &ServerRecord,
    operator_overrides: &ServerRecord,
) -> ServerRecord {
    let mut merged = defaults.clone();
    merged = apply_non_default(merged, file_overrides);
    merged = apply_non_default(merged, operator_overrides);

    if let Some(existing) = existing {
        merged.status = existing.status;
        merged.status_message = existing.status_message.clone();
        merged.status_ts = existing.status_ts;
    }
    merged
}

fn apply_non_default(mut base: ServerRecord, overrides: &ServerRecord) -> ServerRecord {
    base.hostname = overrides.hostname.clone();
    base.port = overrides.port;
    base.ssh_user = overrides.ssh_user.clone();
    base.ssh_key = overrides.ssh_key.clone().or(base.ssh_key);
    base.role = overrides.role;
    base.enabled = overrides.enabled;
    base.failover_priority = overrides.failover_priority;
    base.lag_limit = overrides.lag_limit;
    if !overrides.restart_method.is_empty() {
        base.restart_method = overrides.restart_method.clone();
    }
    if !overrides.promotion_method.is_empty() {
        base.promotion_method = overrides.promotion_method.clone();
    }
    if !overrides.clone_method.is_empty() {
        base.clone_method = overrides.clone_method.clone();
    }
    if !overrides.recovery_template.is_empty() {
        base.recovery_template = overrides.recovery_template.clone();
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn blank(name: &str, status: ServerStatus) -> ServerRecord {
        ServerRecord {
            name: name.into(),
            role: ServerRole::Replica,
            enabled: true,
            hostname: "h".into(),
            port: 5432,
            ssh_user: "postgres".into(),
            ssh_key: None,
            status,
            status_message: String::new(),
            status_ts: Utc::now(),
            failover_priority: 999,
            lag_limit: 1024,
            restart_method: String::new(),
            promotion_method: String::new(),
            clone_method: String::new(),
            recovery_template: String::new(),
            extra: HashMap::new(),
        }
    }

    #[test]
    fn add_server_defaults_to_disabled_replica() {
        let mut cluster = ClusterState::new(1);
        let config = Config {
            handyrep: crate::config::HandyRepSection {
                hostname: "h".into(),
                handyrep_schema: "handyrep".into(),
                handyrep_table: "handyrep".into(),
                handyrep_db_user: "handyrep".into(),
                handyrep_db_name: "postgres".into(),
                test_ssh_command: "true".into(),
                template_dir: "/tmp".into(),
                authentication_method: None,
                push_alert_method: None,
                log_level: "info".into(),
                pid_file: "/tmp/h.pid".into(),
                snapshot_file: "/tmp/h.json".into(),
            },
            failover: Default::default(),
            archive: Default::default(),
            passwords: Default::default(),
            server_defaults: Default::default(),
            servers: HashMap::new(),
            extra_failover_commands: HashMap::new(),
            plugins: HashMap::new(),
            override_server_file: false,
        };
        let result = add_server(&mut cluster, &config, "r1", "r1.example.com", None).unwrap();
        assert!(result.ok);
        let rec = &cluster.servers["r1"];
        assert!(!rec.enabled);
        assert_eq!(rec.role, ServerRole::Replica);
    }

    #[test]
    fn merge_preserves_live_status_for_existing_server() {
        let defaults = blank("x", ServerStatus::Unknown);
        let file = blank("x", ServerStatus::Unknown);
        let operator = blank("x", ServerStatus::Unknown);
        let existing = blank("x", ServerStatus::Healthy);

        let merged = merge_server_settings(Some(&existing), &defaults, &file, &operator);
        assert_eq!(merged.status, ServerStatus::Healthy);
    }

    #[test]
    fn merge_uses_unknown_status_for_brand_new_server() {
        let defaults = blank("x", ServerStatus::Unknown);
        let file = blank("x", ServerStatus::Unknown);
        let operator = blank("x", ServerStatus::Unknown);

        let merged = merge_server_settings(None, &defaults, &file, &operator);
        assert_eq!(merged.status, ServerStatus::Unknown);
    }

    struct AlwaysOk;
    #[async_trait::async_trait]
    impl crate::core::plugin::Plugin for AlwaysOk {
        fn name(&self) -> &str {
            "always_ok"
        }
        async fn run(&self, _args: &[String]) -> PluginResult {
            PluginResult::ok("done")
        }
        async fn start(&self, _target: &str) -> PluginResult {
            PluginResult::ok("started")
        }
        async fn stop(&self, _target: &str) -> PluginResult {
            PluginResult::ok("stopped")
        }
    }

    #[tokio::test]
    async fn restart_resets_status_to_unknown_pending_next_poll() {
        let mut cluster = ClusterState::new(1);
        let mut rec = blank("r1", ServerStatus::Healthy);
        rec.restart_method = "always_ok".into();
        cluster.servers.insert("r1".into(), rec);

        let mut registry = PluginRegistry::new();
        registry.register("always_ok", std::sync::Arc::new(AlwaysOk));

        let result = restart(&mut cluster, &registry, "r1").await.unwrap();
        assert!(result.ok);
        assert_eq!(cluster.servers["r1"].status, ServerStatus::Unknown);
    }

    #[tokio::test]
    async fn archiving_toggles_report_plugin_outcome() {
        let mut cluster = ClusterState::new(1);
        let mut registry = PluginRegistry::new();
        registry.register("always_ok", std::sync::Arc::new(AlwaysOk));

        let started = start_archiving(&mut cluster, &registry, "always_ok").await;
        assert!(started.ok);
        let stopped = stop_archiving(&mut cluster, &registry, "always_ok").await;
        assert!(stopped.ok);

        let missing = start_archiving(&mut cluster, &registry, "no_such_plugin").await;
        assert!(!missing.ok);
    }
}
