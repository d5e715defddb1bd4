//! One driver/worker pairing: process handle, down channel, up channel.
//!
//! Flow:
//! 1. Spawn the worker subprocess; stdin becomes the down channel, stdout
//!    the up channel.
//! 2. A background task drains the up channel concurrently with down-channel
//!    writes, so a worker producing output while the driver is still pushing
//!    input cannot deadlock on full pipe buffers.
//! 3. `close()` emits `CLOSE` and reaps the exit status; `abort()` tears
//!    down best-effort and never fails on an already-dead worker.
//!
//! A fatal receiver error (malformed frame, out-of-range progress) triggers
//! exactly one internal abort and surfaces on the next operation.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;

use crate::error::BridgeError;
use crate::receiver::{UpHandler, UpReceiver};
use crate::sender::DownSender;
use crate::supervisor::{ExecSpawner, WorkerSpawner, WorkerState, WorkerSupervisor};

pub struct SessionConfig {
    spawner: Arc<dyn WorkerSpawner>,
    close_grace: Duration,
    abort_grace: Duration,
}

impl SessionConfig {
    pub fn new(worker: impl Into<PathBuf>) -> Self {
        Self::from_spawner(Arc::new(ExecSpawner::new(worker)))
    }

    /// Builds a config around a custom spawn strategy instead of a plain
    /// executable path.
    pub fn from_spawner(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            close_grace: Duration::from_secs(10),
            abort_grace: Duration::from_secs(2),
        }
    }

    /// How long `close()` waits for the worker to exit before killing it.
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// How long `abort()` waits before escalating to a forced kill.
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }
}

pub struct Session {
    sender: Option<DownSender<ChildStdin>>,
    supervisor: WorkerSupervisor,
    receiver: Option<JoinHandle<Result<(), BridgeError>>>,
    close_grace: Duration,
    abort_grace: Duration,
}

impl Session {
    /// Spawns the worker and starts draining its up channel.
    pub async fn spawn<H: UpHandler>(
        config: SessionConfig,
        handler: Arc<H>,
    ) -> Result<Self, BridgeError> {
        let (supervisor, stdin, stdout) = WorkerSupervisor::start(config.spawner.as_ref())?;
        let sender = DownSender::new(stdin);
        let receiver = UpReceiver::new(stdout, handler);
        let receiver = tokio::spawn(receiver.run());
        Ok(Self {
            sender: Some(sender),
            supervisor,
            receiver: Some(receiver),
            close_grace: config.close_grace,
            abort_grace: config.abort_grace,
        })
    }

    pub fn worker_state(&self) -> WorkerState {
        self.supervisor.state()
    }

    fn sender_mut(&mut self) -> Result<&mut DownSender<ChildStdin>, BridgeError> {
        self.sender
            .as_mut()
            .ok_or_else(|| BridgeError::violation("session is already closed"))
    }

    pub async fn start(&mut self) -> Result<(), BridgeError> {
        self.preflight().await?;
        self.sender_mut()?.start().await
    }

    pub async fn set_job_conf(&mut self, conf: &HashMap<String, String>) -> Result<(), BridgeError> {
        self.preflight().await?;
        self.sender_mut()?.set_job_conf(conf).await
    }

    pub async fn set_input_types(
        &mut self,
        key_type: &str,
        value_type: &str,
    ) -> Result<(), BridgeError> {
        self.preflight().await?;
        self.sender_mut()?.set_input_types(key_type, value_type).await
    }

    pub async fn run_map(
        &mut self,
        input_split: impl Into<Bytes>,
        num_reduces: i32,
        piped_input: bool,
    ) -> Result<(), BridgeError> {
        self.preflight().await?;
        let input_split = input_split.into();
        self.sender_mut()?
            .run_map(input_split, num_reduces, piped_input)
            .await
    }

    pub async fn map_item(
        &mut self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<(), BridgeError> {
        self.preflight().await?;
        let (key, value) = (key.into(), value.into());
        self.sender_mut()?.map_item(key, value).await
    }

    pub async fn run_reduce(
        &mut self,
        num_reduces: i32,
        piped_output: bool,
    ) -> Result<(), BridgeError> {
        self.preflight().await?;
        self.sender_mut()?.run_reduce(num_reduces, piped_output).await
    }

    pub async fn reduce_key(&mut self, key: impl Into<Bytes>) -> Result<(), BridgeError> {
        self.preflight().await?;
        let key = key.into();
        self.sender_mut()?.reduce_key(key).await
    }

    pub async fn reduce_value(&mut self, value: impl Into<Bytes>) -> Result<(), BridgeError> {
        self.preflight().await?;
        let value = value.into();
        self.sender_mut()?.reduce_value(value).await
    }

    /// Graceful teardown: emits `CLOSE`, waits for the worker to exit, and
    /// drains the up channel to completion. A non-zero exit after a clean
    /// close is reported as `WorkerFailedGraceful`.
    pub async fn close(mut self) -> Result<ExitStatus, BridgeError> {
        self.check_receiver().await?;
        match self.sender.as_mut() {
            Some(sender) => {
                if let Err(e) = sender.close().await {
                    self.abort_inner().await;
                    return Err(e);
                }
            }
            None => return Err(BridgeError::violation("session is already closed")),
        }
        // Drop the write end so workers that key off stdin EOF also exit.
        self.sender = None;
        let status = match self.supervisor.wait_close(self.close_grace).await {
            Ok(status) => status,
            Err(e) => {
                self.abort_inner().await;
                return Err(e);
            }
        };
        // The worker closed its stdout on exit; let the receiver finish
        // dispatching whatever was still buffered.
        if let Some(handle) = self.receiver.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(join) => return Err(BridgeError::Io(io::Error::other(join))),
            }
        }
        if !status.success() {
            return Err(BridgeError::WorkerFailedGraceful {
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(status)
    }

    /// Error teardown: best-effort `ABORT` notification, bounded wait, then
    /// forced termination. Safe to call from a failure handler mid-session;
    /// never fails if the worker already exited.
    pub async fn abort(mut self) -> Option<ExitStatus> {
        self.abort_inner().await;
        self.supervisor.exit_status()
    }

    async fn abort_inner(&mut self) {
        if self.supervisor.state() == WorkerState::Running {
            if let Some(mut sender) = self.sender.take() {
                sender.abort().await;
            }
            self.supervisor.wait_abort(self.abort_grace).await;
        }
        self.sender = None;
        if let Some(handle) = self.receiver.take() {
            handle.abort();
        }
    }

    /// Validates the session before a down-channel write: surfaces a fatal
    /// receiver error (aborting exactly once), then checks the worker is
    /// still alive so a crashed worker fails operations instead of letting
    /// them block against a dead pipe.
    async fn preflight(&mut self) -> Result<(), BridgeError> {
        self.check_receiver().await?;
        match self.supervisor.state() {
            WorkerState::Running => self.supervisor.ensure_running(),
            WorkerState::Crashed => Err(BridgeError::WorkerTerminated {
                status: self.supervisor.exit_status(),
            }),
            _ => Err(BridgeError::violation("session is already closed")),
        }
    }

    async fn check_receiver(&mut self) -> Result<(), BridgeError> {
        let finished = self
            .receiver
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false);
        if !finished {
            return Ok(());
        }
        if let Some(handle) = self.receiver.take() {
            match handle.await {
                // Clean EOF: the worker closed stdout. If that was a crash,
                // the supervisor check right after will say so.
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "Up-protocol receiver failed, aborting session");
                    self.abort_inner().await;
                    return Err(err);
                }
                Err(join) => {
                    self.abort_inner().await;
                    return Err(BridgeError::Io(io::Error::other(join)));
                }
            }
        }
        Ok(())
    }
}
