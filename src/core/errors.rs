// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum HandyRepError {
    /// Fatal startup condition: PID conflict, missing required config, unreadable snapshot.
    #[error("STARTUP: {0}")]
    Startup(String),

    /// Configuration inconsistency: two primaries, no primary, bad plugin name, invalid section.
    #[error("CONFIG: {0}")]
    Config(String),

    /// Could not establish a database connection.
    #[error("DBCONN: {0}")]
    DbConn(String),

    /// A connection was established but a query against it failed.
    #[error("QUERY: {0}")]
    Query(String),

    /// Failure within the core control logic itself (invariant violation, bad state transition).
    #[error("HANDYREP: {0}")]
    HandyRep(String),

    /// Remote-executor (SSH) failure: unreachable host, auth failure, non-zero exit.
    #[error("SSH: {0}")]
    Ssh(String),

    /// Bad input from an operator-facing call (Operations API).
    #[error("USER: {0}")]
    User(String),

    /// A plugin reported failure, or the named plugin does not exist / failed to load.
    #[error("PLUGIN: {0}")]
    Plugin(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl HandyRepError {
    /// The error-kind tag used in log records and alert payloads.
    pub fn category(&self) -> &'static str {
        match self {
            HandyRepError::Startup(_) => "STARTUP",
            HandyRepError::Config(_) => "CONFIG",
            HandyRepError::DbConn(_) => "DBCONN",
            HandyRepError::Query(_) => "QUERY",
            HandyRepError::HandyRep(_) => "HANDYREP",
            HandyRepError::Ssh(_) => "SSH",
            HandyRepError::User(_) => "USER",
            HandyRepError::Plugin(_) => "PLUGIN",
            HandyRepError::Io(_) => "STARTUP",
        }
    }
}

impl From<std::io::Error> for HandyRepError {
    fn from(e: std::io::Error) -> Self {
        HandyRepError::Io(Arc::new(e))
    }
}

impl From<sqlx::Error> for HandyRepError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => HandyRepError::DbConn(e.to_string()),
            other => HandyRepError::Query(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandyRepError {
    fn from(e: serde_json::Error) -> Self {
        HandyRepError::Config(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<config::ConfigError> for HandyRepError {
    fn from(e: config::ConfigError) -> Self {
        HandyRepError::Config(e.to_string())
    }
}

impl From<openssh::Error> for HandyRepError {
    fn from(e: openssh::Error) -> Self {
        HandyRepError::Ssh(e.to_string())
    }
}
