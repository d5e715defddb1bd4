//! Worker process supervisor: spawn, exit monitoring, bounded teardown.
//!
//! The worker's stdin/stdout become the two protocol channels; stderr is
//! inherited so worker diagnostics reach the driver's terminal.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::BridgeError;

/// Lifecycle: `NotStarted -> Running -> {Closed, Aborted, Crashed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Closed,
    Aborted,
    Crashed,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("worker executable not found: {path}")]
    NotFound { path: PathBuf },

    #[error("failed to spawn worker: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker spawned without a piped {stream}")]
    MissingStream { stream: &'static str },
}

/// Extension point for spawn strategies (wrappers, interpreters, test stubs).
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawns a worker executable directly, with optional arguments and
/// environment variables to inherit.
pub struct ExecSpawner {
    path: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ExecSpawner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&self.path);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SpawnError::NotFound {
                    path: self.path.clone(),
                }
            } else {
                SpawnError::Io(e)
            }
        })
    }
}

pub struct WorkerSupervisor {
    child: Child,
    state: WorkerState,
    exit: Option<ExitStatus>,
}

impl WorkerSupervisor {
    /// Spawns the worker and hands back its stdin (down channel write end)
    /// and stdout (up channel read end).
    pub fn start(
        spawner: &dyn WorkerSpawner,
    ) -> Result<(Self, ChildStdin, ChildStdout), SpawnError> {
        let mut child = spawner.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or(SpawnError::MissingStream { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingStream { stream: "stdout" })?;
        tracing::debug!(pid = child.id(), "Worker spawned");
        Ok((
            Self {
                child,
                state: WorkerState::Running,
                exit: None,
            },
            stdin,
            stdout,
        ))
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Exit status, once reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Fails with `WorkerTerminated` if the child exited before a
    /// `CLOSE`/`ABORT` was issued, transitioning to `Crashed`.
    pub fn ensure_running(&mut self) -> Result<(), BridgeError> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::error!(%status, "Worker exited unexpectedly");
                self.state = WorkerState::Crashed;
                self.exit = Some(status);
                Err(BridgeError::WorkerTerminated {
                    status: Some(status),
                })
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reaps the worker after a graceful `CLOSE`, killing it if it outlives
    /// the grace period.
    pub async fn wait_close(&mut self, grace: Duration) -> Result<ExitStatus, BridgeError> {
        let status = self.reap(grace).await?;
        self.state = WorkerState::Closed;
        tracing::debug!(%status, "Worker closed");
        Ok(status)
    }

    /// Reaps the worker during an abort. Never fails: an unresponsive worker
    /// is force-killed, and reap errors are logged since the session is
    /// already being torn down.
    pub async fn wait_abort(&mut self, grace: Duration) -> Option<ExitStatus> {
        let status = match self.reap(grace).await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reap worker during abort");
                None
            }
        };
        self.state = WorkerState::Aborted;
        status
    }

    async fn reap(&mut self, grace: Duration) -> Result<ExitStatus, BridgeError> {
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    grace_millis = grace.as_millis() as u64,
                    "Worker did not exit within grace period, killing"
                );
                if let Err(e) = self.child.start_kill() {
                    // Already-exited children report InvalidInput here.
                    tracing::debug!(error = %e, "start_kill failed");
                }
                self.child.wait().await?
            }
        };
        self.exit = Some(status);
        Ok(status)
    }
}
