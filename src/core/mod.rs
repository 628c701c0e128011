// src/core/mod.rs

//! The central module containing the core control-plane logic: cluster
//! state, the health pipeline, the failover orchestrator, the config sync
//! engine, the plugin registry, and their supporting I/O clients.

pub mod alert;
pub mod cluster;
pub mod controller;
pub mod db;
pub mod errors;
pub mod failover;
pub mod health;
pub mod metrics;
pub mod ops;
pub mod plugin;
pub mod remote;
pub mod sync;

pub use cluster::ClusterState;
pub use controller::Controller;
pub use errors::HandyRepError;
