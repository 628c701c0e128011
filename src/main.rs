// src/main.rs

//! The main entry point for the `handyrepd` daemon. Owns the tick loop that
//! drives the control core, and the only process-terminating exit path:
//! a PID conflict detected during startup reconciliation.

use std::env;

use anyhow::{Context, Result};
use handyrep_core::config::Config;
use handyrep_core::core::metrics;
use handyrep_core::core::plugin::PluginRegistry;
use handyrep_core::Controller;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("handyrepd version {VERSION}");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).compact().with_ansi(true).init();

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("handyrep.toml");

    let config = Config::from_file(config_path).with_context(|| format!("loading configuration from \"{config_path}\""))?;

    let remote = std::sync::Arc::new(handyrep_core::core::remote::RemoteExecutor::new());
    let registry = build_plugin_registry(&config, remote.clone());

    let mut controller = Controller::with_remote(config, registry, remote, config_path);

    if let Err(e) = controller.startup().await {
        error!("startup reconciliation failed: {e}");
        std::process::exit(1);
    }

    info!("handyrepd {VERSION} started, entering tick loop");

    let mut cycle = 1u32;
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut shutdown = signal_stream()?;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let (next_interval_secs, next_cycle) = controller.tick(cycle).await;
                cycle = next_cycle;
                interval = tokio::time::interval(std::time::Duration::from_secs(next_interval_secs.max(1)));
                interval.tick().await; // consume the immediate first tick of the new interval
                metrics::SECONDS_SINCE_LAST_SUCCESSFUL_TICK.set(0.0);
            }
            _ = shutdown.recv() => {
                info!("shutdown signal received, exiting tick loop");
                break;
            }
        }
    }

    Ok(())
}

fn build_plugin_registry(config: &Config, remote: std::sync::Arc<handyrep_core::core::remote::RemoteExecutor>) -> PluginRegistry {
    use handyrep_core::plugins::auth_local::LocalAuthPlugin;
    use handyrep_core::plugins::pg_ctl::{PgCtlPlugin, ServerConnInfo};
    use handyrep_core::plugins::pgbouncer::{BouncerInfo, PgBouncerPlugin};
    use handyrep_core::plugins::webhook_alert::WebhookAlertPlugin;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    let mut registry = PluginRegistry::new();

    let users: HashMap<String, String> = config
        .plugin_config("auth_local")
        .get("users")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    registry.register("auth_local", Arc::new(LocalAuthPlugin::new(users)));

    let pg_ctl_directory: HashMap<String, ServerConnInfo> = config
        .servers
        .iter()
        .filter_map(|(name, ovr)| {
            let hostname = ovr.hostname.clone()?;
            Some((
                name.clone(),
                ServerConnInfo {
                    hostname,
                    ssh_user: ovr.defaults.ssh_user.clone().unwrap_or_else(|| "postgres".into()),
                    ssh_key: ovr.defaults.ssh_key.clone(),
                    pgdata: config
                        .plugin_config("restart_pg_ctl")
                        .get("pgdata")
                        .and_then(|v| v.as_str())
                        .unwrap_or("/var/lib/postgresql/data")
                        .to_string(),
                },
            ))
        })
        .collect();
    let pg_ctl_bin = config
        .plugin_config("restart_pg_ctl")
        .get("pg_ctl_bin")
        .and_then(|v| v.as_str())
        .unwrap_or("/usr/lib/postgresql/16/bin/pg_ctl")
        .to_string();
    registry.register(
        "restart_pg_ctl",
        Arc::new(PgCtlPlugin::new(remote.clone(), Arc::new(RwLock::new(pg_ctl_directory)), pg_ctl_bin)),
    );

    let bouncer_directory: HashMap<String, BouncerInfo> = config
        .servers
        .iter()
        .filter(|(_, ovr)| ovr.role.as_deref() == Some("proxy"))
        .filter_map(|(name, ovr)| {
            let hostname = ovr.hostname.clone()?;
            Some((
                name.clone(),
                BouncerInfo {
                    hostname,
                    ssh_user: ovr.defaults.ssh_user.clone().unwrap_or_else(|| "postgres".into()),
                    ssh_key: ovr.defaults.ssh_key.clone(),
                    listen_port: ovr.defaults.port.unwrap_or(6432),
                    enabled: ovr.enabled.unwrap_or(false),
                },
            ))
        })
        .collect();
    let bouncer_config = config.plugin_config("pgbouncer");
    let config_location = bouncer_config.get("config_location").and_then(|v| v.as_str()).unwrap_or("/etc/pgbouncer/pgbouncer.ini").to_string();
    let pgbouncer_bin = bouncer_config.get("pgbouncer_bin").and_then(|v| v.as_str()).unwrap_or("/usr/sbin/pgbouncer").to_string();
    let databases: Vec<String> = bouncer_config
        .get("databases")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    registry.register(
        "pgbouncer",
        Arc::new(PgBouncerPlugin::new(remote, Arc::new(RwLock::new(bouncer_directory)), config_location, pgbouncer_bin, databases)),
    );

    if let Some(webhook_url) = config.plugin_config("webhook_alert").get("url").and_then(|v| v.as_str()) {
        registry.register("webhook_alert", Arc::new(WebhookAlertPlugin::new(webhook_url)));
    }

    registry
}

fn signal_stream() -> Result<tokio::sync::mpsc::Receiver<()>> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        let _ = tx.send(()).await;
    });
    Ok(rx)
}
