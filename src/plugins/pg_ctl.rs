// src/plugins/pg_ctl.rs

//! Service-control plugin driving PostgreSQL's own `pg_ctl` over SSH.
//! Grounded on `original_source/handyrep/plugins/restart_pg_ctl.py`:
//! `run(servername, runmode)` dispatches to start/stop/restart/reload/status
//! via shell commands; `test()` verifies the plugin is configured.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::plugin::{Plugin, PluginResult};
use crate::core::remote::{RemoteExecutor, RemoteTarget};

/// The connection details a plugin needs to reach a server, refreshed by
/// the controller from `ClusterState`/`Config` ahead of each tick. Plugins
/// hold only this read-only derived view, never the live mutable cluster
/// state, so they cannot bypass `status_update`.
#[derive(Debug, Clone)]
pub struct ServerConnInfo {
    pub hostname: String,
    pub ssh_user: String,
    pub ssh_key: Option<String>,
    pub pgdata: String,
}

pub type ServerDirectory = Arc<RwLock<HashMap<String, ServerConnInfo>>>;

pub struct PgCtlPlugin {
    remote: Arc<RemoteExecutor>,
    directory: ServerDirectory,
    pg_ctl_bin: String,
}

impl PgCtlPlugin {
    pub fn new(remote: Arc<RemoteExecutor>, directory: ServerDirectory, pg_ctl_bin: impl Into<String>) -> Self {
        Self {
            remote,
            directory,
            pg_ctl_bin: pg_ctl_bin.into(),
        }
    }

    fn get_pg_ctl_cmd(&self, pgdata: &str, runmode: &str) -> String {
        format!("{} -D {} -m fast {} 2>&1", self.pg_ctl_bin, pgdata, runmode)
    }

    async fn dispatch(&self, servername: &str, runmode: &str) -> PluginResult {
        let info = {
            let directory = self.directory.read().await;
            match directory.get(servername) {
                Some(info) => info.clone(),
                None => return PluginResult::fail(format!("'{servername}' is not a known server")),
            }
        };
        let target = RemoteTarget {
            host: &info.hostname,
            user: &info.ssh_user,
            key_path: info.ssh_key.as_deref(),
            timeout: std::time::Duration::from_secs(30),
        };
        let command = self.get_pg_ctl_cmd(&info.pgdata, runmode);
        match self.remote.exec(&target, &command).await {
            Ok(out) if out.ok => PluginResult::ok(format!("pg_ctl {runmode} succeeded on '{servername}'")),
            Ok(out) => PluginResult::fail(format!("pg_ctl {runmode} failed on '{servername}': {}", out.message())),
            Err(e) => PluginResult::fail(format!("pg_ctl {runmode} errored on '{servername}': {e}")),
        }
    }
}

#[async_trait]
impl Plugin for PgCtlPlugin {
    fn name(&self) -> &str {
        "restart_pg_ctl"
    }

    async fn run(&self, args: &[String]) -> PluginResult {
        let Some(servername) = args.first() else {
            return PluginResult::fail("restart_pg_ctl.run requires a server name");
        };
        let runmode = args.get(1).map(String::as_str).unwrap_or("restart");
        self.dispatch(servername, runmode).await
    }

    async fn start(&self, target: &str) -> PluginResult {
        self.dispatch(target, "start").await
    }

    async fn stop(&self, target: &str) -> PluginResult {
        self.dispatch(target, "stop").await
    }

    async fn poll(&self, target: Option<&str>) -> PluginResult {
        match target {
            Some(servername) => self.dispatch(servername, "status").await,
            None => PluginResult::fail("restart_pg_ctl.poll requires a target server"),
        }
    }

    async fn test(&self) -> PluginResult {
        if self.pg_ctl_bin.is_empty() {
            return PluginResult::fail("restart_pg_ctl is not configured with a binary path");
        }
        if self.directory.read().await.is_empty() {
            return PluginResult::fail("no servers known to restart_pg_ctl");
        }
        PluginResult::ok("restart_pg_ctl setup is correct")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_uses_fast_shutdown_mode() {
        let plugin = PgCtlPlugin::new(
            Arc::new(RemoteExecutor::new()),
            Arc::new(RwLock::new(HashMap::new())),
            "/usr/lib/postgresql/16/bin/pg_ctl",
        );
        let cmd = plugin.get_pg_ctl_cmd("/var/lib/postgresql/16/main", "restart");
        assert!(cmd.contains("-m fast"));
        assert!(cmd.contains("restart"));
    }
}
