// src/core/metrics.rs

//! Defines and registers Prometheus metrics for cluster-health monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the daemon's lifetime.

use lazy_static::lazy_static;
use prometheus::{Gauge, GaugeVec, IntGauge, Opts, TextEncoder, register_gauge, register_gauge_vec, register_int_gauge};

lazy_static! {
    /// Status rank (0..5) of the cluster-wide aggregate status.
    pub static ref CLUSTER_STATUS_RANK: IntGauge =
        register_int_gauge!("handyrep_cluster_status_rank", "Cluster-wide status rank (0=unknown..5=down).").unwrap();

    /// Status rank (0..5) per server, labeled by server name.
    pub static ref SERVER_STATUS_RANK: GaugeVec =
        register_gauge_vec!(
            Opts::new("handyrep_server_status_rank", "Per-server status rank (0=unknown..5=down)."),
            &["server"]
        ).unwrap();

    /// Seconds elapsed since the last tick that completed without error.
    pub static ref SECONDS_SINCE_LAST_SUCCESSFUL_TICK: Gauge =
        register_gauge!("handyrep_seconds_since_last_successful_tick", "Seconds since the last tick completed without error.").unwrap();

    /// Total number of failovers this process has executed (successful or aborted).
    pub static ref FAILOVER_ATTEMPTS_TOTAL: IntGauge =
        register_int_gauge!("handyrep_failover_attempts_total", "Number of failover attempts since daemon start.").unwrap();

    /// 1 if this instance currently believes it is the acting leader, else 0.
    pub static ref IS_LEADER: IntGauge =
        register_int_gauge!("handyrep_is_leader", "Whether this instance is currently the acting HandyRep leader.").unwrap();
}

/// Sets the per-server gauge, creating the label series on first use.
pub fn set_server_status_rank(server: &str, rank: u8) {
    SERVER_STATUS_RANK.with_label_values(&[server]).set(rank as f64);
}

/// Renders all registered metrics in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
