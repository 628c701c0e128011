// src/core/controller.rs

//! The owning "controller" value: cluster state, configuration, plugin
//! registry, remote executor and DB credentials, wired together behind the
//! Tick Scheduler Contract and the alert-dispatch policy that
//! `status_update`'s outcome implies.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::core::cluster::ClusterState;
use crate::core::db::ConnectCredentials;
use crate::core::errors::HandyRepError;
use crate::core::failover::{self, FailoverOutcome};
use crate::core::health;
use crate::core::metrics;
use crate::core::plugin::PluginRegistry;
use crate::core::remote::RemoteExecutor;
use crate::core::sync;

/// Single owning value for the whole control core. No global singletons —
/// every component is reached through this struct. `remote` is `Arc`-wrapped
/// so the same single process-wide SSH lock is shared with any plugin that
/// also needs to run remote commands (e.g. `restart_pg_ctl`, `multi_pgbouncer`).
pub struct Controller {
    pub cluster: ClusterState,
    pub config: Config,
    pub plugins: PluginRegistry,
    pub remote: Arc<RemoteExecutor>,
    pub creds: ConnectCredentials,
    pub snapshot_path: String,
    pub config_path: String,
}

impl Controller {
    pub fn new(config: Config, plugins: PluginRegistry, config_path: impl Into<String>) -> Self {
        Self::with_remote(config, plugins, Arc::new(RemoteExecutor::new()), config_path)
    }

    /// Constructs with a caller-supplied remote executor, so it can be
    /// shared with plugins constructed outside the controller (see
    /// `main.rs::build_plugin_registry`).
    pub fn with_remote(
        config: Config,
        plugins: PluginRegistry,
        remote: Arc<RemoteExecutor>,
        config_path: impl Into<String>,
    ) -> Self {
        let creds = ConnectCredentials {
            dbname: config.handyrep.handyrep_db_name.clone(),
            user: config.handyrep.handyrep_db_user.clone(),
            password: config.passwords.handyrep_db_pass.clone(),
        };
        let snapshot_path = config.handyrep.snapshot_file.clone();
        Self {
            cluster: ClusterState::new(std::process::id()),
            config,
            plugins,
            remote,
            creds,
            snapshot_path,
            config_path: config_path.into(),
        }
    }

    /// Startup reconciliation: three-way config sync plus the PID-liveness
    /// check. Fatal PID conflicts propagate and should terminate the
    /// process — this is the one error path in the whole system that is
    /// fatal beyond startup's own failure.
    pub async fn startup(&mut self) -> Result<(), HandyRepError> {
        let mut db_conn = crate::core::db::connect(
            &primary_placeholder(&self.cluster),
            &self.creds,
        )
        .await
        .ok();
        sync::sync_config(&mut self.cluster, &self.config, &self.snapshot_path, db_conn.as_mut()).await?;
        info!("startup reconciliation complete");
        Ok(())
    }

    /// Operator-triggered `reload_config`: re-parses the static config file
    /// from disk, then re-runs the same three-way reconciliation used at
    /// startup so in-memory state picks up any changed server definitions
    /// or policy knobs without a process restart.
    pub async fn reload_config(&mut self) -> Result<(), HandyRepError> {
        let reloaded = Config::from_file(&self.config_path)?;
        self.creds = ConnectCredentials {
            dbname: reloaded.handyrep.handyrep_db_name.clone(),
            user: reloaded.handyrep.handyrep_db_user.clone(),
            password: reloaded.passwords.handyrep_db_pass.clone(),
        };
        self.snapshot_path = reloaded.handyrep.snapshot_file.clone();
        self.config = reloaded;

        let mut db_conn = crate::core::db::connect(&primary_placeholder(&self.cluster), &self.creds).await.ok();
        sync::sync_config(&mut self.cluster, &self.config, &self.snapshot_path, db_conn.as_mut()).await?;
        self.cluster.log("HANDYREP", "configuration reloaded", false, false);
        Ok(())
    }

    fn primary_name(&self) -> Option<String> {
        self.cluster
            .servers
            .values()
            .find(|s| s.role == crate::core::cluster::ServerRole::Primary)
            .map(|s| s.name.clone())
    }

    /// The tick entry point consumed by the external scheduler. Policy: on
    /// cycle 1, verify; otherwise poll. On success, advance cycle modulo
    /// `verify_frequency`; on failure, force next cycle = 1.
    pub async fn tick(&mut self, cycle_num: u32) -> (u64, u32) {
        let result = if cycle_num <= 1 {
            self.run_verify_cycle().await
        } else {
            self.run_poll_cycle().await
        };

        let interval = self.config.failover.poll_interval.as_secs();
        match result {
            Ok(()) => {
                let next_cycle = (cycle_num % self.config.failover.verify_frequency.max(1)) + 1;
                (interval, next_cycle)
            }
            Err(e) => {
                error!(error = %e, "tick failed; forcing next cycle to verify");
                (interval, 1)
            }
        }
    }

    async fn run_poll_cycle(&mut self) -> Result<(), HandyRepError> {
        let alert_method = self.config.handyrep.push_alert_method.clone();
        health::poll_all(&mut self.cluster, &self.plugins, &self.config.failover.poll_method, alert_method.as_deref()).await?;
        self.persist().await;
        self.maybe_failover().await?;
        Ok(())
    }

    async fn run_verify_cycle(&mut self) -> Result<(), HandyRepError> {
        let alert_method = self.config.handyrep.push_alert_method.clone();
        let verify_result = health::verify_all(
            &mut self.cluster,
            &self.plugins,
            &self.remote,
            &self.config,
            &self.creds,
            alert_method.as_deref(),
        )
        .await?;
        self.persist().await;

        if !verify_result.ok {
            return Ok(());
        }
        self.maybe_failover().await?;
        Ok(())
    }

    async fn maybe_failover(&mut self) -> Result<(), HandyRepError> {
        let Some(primary_name) = self.primary_name() else {
            return Ok(());
        };
        let primary_rank = self.cluster.servers[&primary_name].status.rank();
        if primary_rank <= 3 {
            return Ok(());
        }

        let outcome = failover::run_failover(
            &mut self.cluster,
            &self.plugins,
            &self.remote,
            &self.config,
            &self.creds,
            &primary_name,
            None,
            false,
            self.config.handyrep.push_alert_method.as_deref(),
        )
        .await?;

        metrics::IS_LEADER.set(if matches!(outcome, FailoverOutcome::NotLeader) { 0 } else { 1 });

        match &outcome {
            FailoverOutcome::Completed { old_primary, new_primary } => {
                info!(old_primary, new_primary, "auto-failover completed");
            }
            FailoverOutcome::CriticalFailure(reason) => {
                error!(reason, "auto-failover critically failed");
            }
            other => {
                info!(?other, "auto-failover tick produced no promotion");
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Runs a manual, operator-initiated failover, optionally pinned to a
    /// specific candidate. Differs from the tick-driven path only in
    /// candidate pinning and in preferring rollback on abort.
    pub async fn manual_failover(&mut self, pinned_candidate: Option<&str>) -> Result<FailoverOutcome, HandyRepError> {
        let Some(primary_name) = self.primary_name() else {
            return Err(HandyRepError::User("no primary configured".into()));
        };
        let outcome = failover::run_failover(
            &mut self.cluster,
            &self.plugins,
            &self.remote,
            &self.config,
            &self.creds,
            &primary_name,
            pinned_candidate,
            true,
            self.config.handyrep.push_alert_method.as_deref(),
        )
        .await?;
        self.persist().await;
        Ok(outcome)
    }

    async fn persist(&mut self) {
        self.update_metrics();
        let mut db_conn = crate::core::db::connect(&primary_placeholder(&self.cluster), &self.creds).await.ok();
        sync::write_servers(
            &self.cluster,
            &self.snapshot_path,
            db_conn.as_mut(),
            &self.config.handyrep.handyrep_schema,
            &self.config.handyrep.handyrep_table,
            None,
        )
        .await;
    }

    /// Refreshes the Prometheus gauges from the current in-memory state.
    /// Called after every pipeline run, right before persisting, so the
    /// exposed metrics never lag the snapshot on disk.
    fn update_metrics(&self) {
        let cluster_status = self.cluster.cluster_status();
        metrics::CLUSTER_STATUS_RANK.set(cluster_status.status_no as i64);
        for server in self.cluster.servers.values() {
            metrics::set_server_status_rank(&server.name, server.status.rank());
        }
    }
}

/// The primary/best server to connect through for config-sync DB I/O. Since
/// `db::connect` needs a `ServerRecord`, and config-sync runs before a
/// primary may even be known, this builds a minimal stand-in using the
/// `[handyrep]` section's own notion of the daemon's home host when no
/// primary is yet known in-memory.
fn primary_placeholder(cluster: &ClusterState) -> crate::core::cluster::ServerRecord {
    cluster
        .servers
        .values()
        .find(|s| s.role == crate::core::cluster::ServerRole::Primary && s.enabled)
        .cloned()
        .unwrap_or_else(|| crate::core::cluster::ServerRecord {
            name: "handyrep-db".into(),
            role: crate::core::cluster::ServerRole::Other,
            enabled: false,
            hostname: "localhost".into(),
            port: 5432,
            ssh_user: String::new(),
            ssh_key: None,
            status: crate::core::cluster::ServerStatus::Unknown,
            status_message: String::new(),
            status_ts: chrono::Utc::now(),
            failover_priority: 999,
            lag_limit: 0,
            restart_method: String::new(),
            promotion_method: String::new(),
            clone_method: String::new(),
            recovery_template: String::new(),
            extra: Default::default(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config() -> Config {
        Config {
            handyrep: crate::config::HandyRepSection {
                hostname: "localhost".into(),
                handyrep_schema: "handyrep".into(),
                handyrep_table: "handyrep".into(),
                handyrep_db_user: "handyrep".into(),
                handyrep_db_name: "postgres".into(),
                test_ssh_command: "true".into(),
                template_dir: "/tmp".into(),
                authentication_method: None,
                push_alert_method: None,
                log_level: "info".into(),
                pid_file: "/tmp/handyrep.pid".into(),
                snapshot_file: "/tmp/handyrep-test-snapshot.json".into(),
            },
            failover: crate::config::FailoverSection {
                verify_frequency: 3,
                ..Default::default()
            },
            archive: Default::default(),
            passwords: Default::default(),
            server_defaults: Default::default(),
            servers: HashMap::new(),
            extra_failover_commands: HashMap::new(),
            plugins: HashMap::new(),
            override_server_file: false,
        }
    }

    #[tokio::test]
    async fn tick_cycle_wraps_modulo_verify_frequency() {
        let mut controller = Controller::new(test_config(), PluginRegistry::new(), "handyrep.toml");
        let (_, next) = controller.tick(3).await;
        assert_eq!(next, 1);
    }

    #[tokio::test]
    async fn reload_config_propagates_missing_file_as_config_error() {
        let mut controller = Controller::new(test_config(), PluginRegistry::new(), "/no/such/handyrep.toml");
        let result = controller.reload_config().await;
        assert!(result.is_err());
    }
}
