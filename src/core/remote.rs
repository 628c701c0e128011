// src/core/remote.rs

//! Remote Executor: runs a shell command (or uploads a rendered file) on a
//! named host over SSH, serialized behind a single process-wide lock so at
//! most one session is ever active.

use std::time::Duration;

use openssh::{KnownHosts, Session};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::errors::HandyRepError;

/// The captured result of a single remote command execution.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn message(&self) -> String {
        if self.ok {
            self.stdout.trim().to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit {code}: {}", self.stderr.trim()),
                None => self.stderr.trim().to_string(),
            }
        }
    }
}

/// Per-call parameters. Constructed fresh for every call; nothing here is
/// allowed to leak between calls ("parameters from one call MUST
/// NOT leak into the next").
pub struct RemoteTarget<'a> {
    pub host: &'a str,
    pub user: &'a str,
    pub key_path: Option<&'a str>,
    pub timeout: Duration,
}

/// Owns the single process-wide serialization lock for remote execution.
/// Mirrors a `Mutex<Option<Session>>` style per-master
/// serialization, generalized to one global lock across all hosts per the
/// concurrency model.
pub struct RemoteExecutor {
    lock: Mutex<()>,
}

impl RemoteExecutor {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    /// Executes `command` as `target.user` on `target.host`, guaranteeing
    /// the lock is released on every exit path including early return on
    /// connect failure.
    pub async fn exec(
        &self,
        target: &RemoteTarget<'_>,
        command: &str,
    ) -> Result<RemoteOutput, HandyRepError> {
        let _permit = self.lock.lock().await;
        debug!(host = target.host, user = target.user, "acquiring SSH session");

        let connect_result = tokio::time::timeout(target.timeout, self.connect(target)).await;
        let session = match connect_result {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(host = target.host, error = %e, "SSH connect failed");
                return Ok(RemoteOutput {
                    ok: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("connect failed: {e}"),
                });
            }
            Err(_) => {
                return Ok(RemoteOutput {
                    ok: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: "connect timed out".to_string(),
                });
            }
        };

        let run_result = tokio::time::timeout(target.timeout, session.command("sh").arg("-c").arg(command).output()).await;

        let result = match run_result {
            Ok(Ok(output)) => RemoteOutput {
                ok: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(e)) => RemoteOutput {
                ok: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("command execution error: {e}"),
            },
            Err(_) => RemoteOutput {
                ok: false,
                exit_code: None,
                stdout: String::new(),
                stderr: "command timed out".to_string(),
            },
        };

        let _ = session.close().await;
        Ok(result)
    }

    /// Uploads `contents` to `remote_path` on the target host via `tee`,
    /// used for pushing rendered recovery/archive templates. The heredoc
    /// delimiter is quoted, so `contents` reaches the remote file verbatim
    /// — no shell expansion or quote-escaping applies inside it.
    pub async fn upload(
        &self,
        target: &RemoteTarget<'_>,
        remote_path: &str,
        contents: &str,
    ) -> Result<RemoteOutput, HandyRepError> {
        let command = format!("cat > '{remote_path}' <<'HANDYREP_EOF'\n{contents}\nHANDYREP_EOF\n");
        self.exec(target, &command).await
    }

    async fn connect(&self, target: &RemoteTarget<'_>) -> Result<Session, openssh::Error> {
        let destination = format!("{}@{}", target.user, target.host);
        let mut builder = openssh::SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        if let Some(key) = target.key_path {
            builder.keyfile(key);
        }
        builder.connect(destination).await
    }
}

impl Default for RemoteExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_message_reports_exit_code_on_failure() {
        let out = RemoteOutput {
            ok: false,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "pg_ctl: server is not running".to_string(),
        };
        assert!(out.message().contains("exit 1"));
    }
}
