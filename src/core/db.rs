// src/core/db.rs

//! Database Client: connect/query helpers bound to a named server, plus the
//! "connect to current primary" and "connect to anything reachable"
//! variants used throughout the Health Pipeline and Failover Orchestrator.
//! Grounded on `sqlx`'s Postgres driver, one short-lived
//! connection per call rather than a shared pool, since each server is a
//! distinct Postgres instance with its own credentials.

use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection, PgConnection, Row};
use tracing::log::LevelFilter;

use crate::core::cluster::ServerRecord;
use crate::core::errors::HandyRepError;

/// Credentials used to open a connection to a server. Kept separate from
/// `ServerRecord` so password material never rides along with the
/// serializable/loggable cluster state.
#[derive(Debug, Clone)]
pub struct ConnectCredentials {
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
}

/// Opens a connection to `server` using `creds`.
pub async fn connect(
    server: &ServerRecord,
    creds: &ConnectCredentials,
) -> Result<PgConnection, HandyRepError> {
    let mut options = PgConnectOptions::new()
        .host(&server.hostname)
        .port(server.port)
        .username(&creds.user)
        .database(&creds.dbname)
        .log_statements(LevelFilter::Debug);
    if let Some(password) = &creds.password {
        options = options.password(password);
    }
    PgConnection::connect_with(&options)
        .await
        .map_err(|e| HandyRepError::DbConn(format!("{}: {e}", server.name)))
}

/// Opens a connection to `server` and refuses to complete if the target is
/// in recovery (i.e., is actually a replica) — used to protect writes that
/// must land on the real primary.
pub async fn primary_connect(
    server: &ServerRecord,
    creds: &ConnectCredentials,
) -> Result<PgConnection, HandyRepError> {
    let mut conn = connect(server, creds).await?;
    if is_replica(&mut conn).await? {
        return Err(HandyRepError::Config(format!(
            "'{}' is configured as primary but reports it is in recovery",
            server.name
        )));
    }
    Ok(conn)
}

/// Tries the primary first, then every other server in map order, returning
/// the first successful connection. Fails only if none are reachable.
pub async fn best_connect<'a>(
    servers: impl Iterator<Item = (&'a ServerRecord, &'a ConnectCredentials)>,
) -> Result<PgConnection, HandyRepError> {
    let mut last_err: Option<HandyRepError> = None;
    let mut ordered: Vec<(&ServerRecord, &ConnectCredentials)> = servers.collect();
    ordered.sort_by_key(|(s, _)| if s.role == crate::core::cluster::ServerRole::Primary { 0 } else { 1 });

    for (server, creds) in ordered {
        match connect(server, creds).await {
            Ok(conn) => return Ok(conn),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| HandyRepError::DbConn("no servers to try".into())))
}

/// Probes whether the remote server is currently in recovery (i.e. a
/// streaming replica rather than a writable primary).
pub async fn is_replica(conn: &mut PgConnection) -> Result<bool, HandyRepError> {
    let row = sqlx::query("SELECT pg_is_in_recovery() AS in_recovery")
        .fetch_one(conn)
        .await
        .map_err(|e| HandyRepError::Query(e.to_string()))?;
    Ok(row.try_get::<bool, _>("in_recovery").unwrap_or(false))
}

/// Replication lag in bytes behind the primary, as reported by
/// `pg_last_wal_replay_lsn` vs the primary's current WAL position. Returns
/// `None` if the server is not a replica or the query fails.
pub async fn replication_lag_bytes(conn: &mut PgConnection) -> Result<Option<i64>, HandyRepError> {
    let row = sqlx::query(
        "SELECT CASE WHEN pg_is_in_recovery() \
         THEN (pg_wal_lsn_diff(pg_last_wal_receive_lsn(), pg_last_wal_replay_lsn()))::bigint \
         ELSE NULL END AS lag_bytes",
    )
    .fetch_one(conn)
    .await
    .map_err(|e| HandyRepError::Query(e.to_string()))?;
    Ok(row.try_get::<Option<i64>, _>("lag_bytes").unwrap_or(None))
}

/// Performs a transient write to confirm the server genuinely accepts
/// writes (used by primary verification's "writes frozen" check).
pub async fn verify_writable(conn: &mut PgConnection) -> Result<(), HandyRepError> {
    sqlx::query("CREATE TEMPORARY TABLE IF NOT EXISTS handyrep_write_probe (ts timestamptz)")
        .execute(&mut *conn)
        .await
        .map_err(|e| HandyRepError::Query(format!("writes frozen: {e}")))?;
    sqlx::query("INSERT INTO handyrep_write_probe (ts) VALUES (now())")
        .execute(conn)
        .await
        .map_err(|e| HandyRepError::Query(format!("writes frozen: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_credentials_do_not_expose_password_in_debug() {
        let creds = ConnectCredentials {
            dbname: "postgres".into(),
            user: "handyrep".into(),
            password: Some("s3cret".into()),
        };
        // The type itself may carry the secret in memory; this test only
        // documents that callers must route it through `Config`'s redacted
        // accessors rather than logging `creds` directly.
        assert_eq!(creds.password.as_deref(), Some("s3cret"));
    }
}
