//! Worker-side runtime - runs inside the spawned subprocess.
//!
//! Reads down-protocol messages from stdin and emits up-protocol messages on
//! stdout, enforcing the same ordering invariants as the driver. User task
//! logic plugs in through [`TaskHandler`]; emissions go through a
//! [`TaskContext`] backed by an mpsc channel and a forwarder task, so a task
//! handler never blocks on the stdout pipe directly.
//!
//! Logs must go to stderr: stdout is the protocol channel.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{DownCodec, UpCodec};
use crate::error::BridgeError;
use crate::protocol::{DownMessage, PROTOCOL_VERSION, UpMessage};

/// Handle for emitting up-protocol messages from task logic.
///
/// Clone-cheap; messages are queued and written asynchronously in send
/// order.
#[derive(Clone)]
pub struct TaskContext {
    tx: mpsc::UnboundedSender<UpMessage>,
    next_counter: Arc<Mutex<i32>>,
}

impl TaskContext {
    fn new(tx: mpsc::UnboundedSender<UpMessage>) -> Self {
        Self {
            tx,
            next_counter: Arc::new(Mutex::new(0)),
        }
    }

    fn send(&self, msg: UpMessage) -> Result<(), BridgeError> {
        self.tx.send(msg).map_err(|_| {
            BridgeError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "up channel closed",
            ))
        })
    }

    pub fn output(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<(), BridgeError> {
        self.send(UpMessage::Output {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn partitioned_output(
        &self,
        partition: i32,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<(), BridgeError> {
        self.send(UpMessage::PartitionedOutput {
            partition,
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn status(&self, message: impl Into<String>) -> Result<(), BridgeError> {
        self.send(UpMessage::Status {
            message: message.into(),
        })
    }

    pub fn progress(&self, fraction: f64) -> Result<(), BridgeError> {
        self.send(UpMessage::Progress { fraction })
    }

    /// Registers a counter and returns its id.
    ///
    /// The wire message carries no id; the driver allocates sequentially in
    /// the order messages arrive, and this mirrors the same sequence so both
    /// sides agree without an acknowledgement round-trip. Allocating the id
    /// and enqueueing the message is one critical section: two concurrent
    /// registrations must not reach the channel in the opposite order of
    /// their ids.
    pub fn register_counter(
        &self,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<i32, BridgeError> {
        let mut next = match self.next_counter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.send(UpMessage::RegisterCounter {
            group: group.into(),
            name: name.into(),
        })?;
        let id = *next;
        *next += 1;
        Ok(id)
    }

    pub fn increment_counter(&self, id: i32, amount: i32) -> Result<(), BridgeError> {
        self.send(UpMessage::IncrementCounter { id, amount })
    }

    fn done(&self) -> Result<(), BridgeError> {
        self.send(UpMessage::Done)
    }
}

/// User map/reduce logic invoked by the worker runtime.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Map phase is starting. Register counters and inspect the job
    /// configuration here.
    async fn run_map(
        &self,
        ctx: &TaskContext,
        conf: &HashMap<String, String>,
        input_split: Bytes,
        num_reduces: i32,
    ) -> Result<(), BridgeError> {
        let _ = (ctx, conf, input_split, num_reduces);
        Ok(())
    }

    async fn map_item(
        &self,
        ctx: &TaskContext,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), BridgeError>;

    async fn run_reduce(
        &self,
        ctx: &TaskContext,
        conf: &HashMap<String, String>,
        num_reduces: i32,
    ) -> Result<(), BridgeError> {
        let _ = (ctx, conf, num_reduces);
        Ok(())
    }

    /// Called once per `REDUCE_VALUE`, with the key from the most recent
    /// `REDUCE_KEY`.
    async fn reduce(
        &self,
        ctx: &TaskContext,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), BridgeError>;
}

/// Run the worker over its standard streams.
pub async fn run_worker<H: TaskHandler>(handler: Arc<H>) -> Result<(), BridgeError> {
    run_task(handler, stdin(), stdout()).await
}

/// Run the worker over explicit channels. Split out of [`run_worker`] so
/// tests can drive it over in-memory duplex streams.
pub async fn run_task<H, R, W>(handler: Arc<H>, reader: R, writer: W) -> Result<(), BridgeError>
where
    H: TaskHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut frames_in = FramedRead::new(reader, DownCodec);
    let mut frames_out = FramedWrite::new(writer, UpCodec);

    let (tx, mut rx) = mpsc::unbounded_channel::<UpMessage>();
    let forwarder = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = frames_out.send(msg).await {
                tracing::warn!(error = %e, "Failed to forward up-protocol message");
                break;
            }
        }
    });

    let ctx = TaskContext::new(tx);
    let result = worker_loop(handler.as_ref(), &mut frames_in, &ctx).await;

    // Dropping the context closes the channel so the forwarder drains the
    // queue (including a trailing DONE) and exits.
    drop(ctx);
    if let Err(e) = forwarder.await {
        tracing::warn!(error = %e, "Up-channel forwarder task failed");
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    Awaiting,
    Ready,
    Map,
    Reduce,
}

async fn worker_loop<H: TaskHandler, R: AsyncRead + Unpin>(
    handler: &H,
    frames: &mut FramedRead<R, DownCodec>,
    ctx: &TaskContext,
) -> Result<(), BridgeError> {
    let mut phase = WorkerPhase::Awaiting;
    let mut conf: HashMap<String, String> = HashMap::new();
    let mut reduce_key: Option<Bytes> = None;

    while let Some(msg) = frames.next().await {
        let msg = msg?;
        tracing::trace!(opcode = msg.opcode(), "Worker received message");
        match msg {
            DownMessage::Start { version } => {
                if phase != WorkerPhase::Awaiting {
                    return Err(BridgeError::violation("duplicate START"));
                }
                if version != PROTOCOL_VERSION {
                    return Err(BridgeError::violation(format!(
                        "unsupported protocol version {version}"
                    )));
                }
                phase = WorkerPhase::Ready;
            }
            _ if phase == WorkerPhase::Awaiting => {
                return Err(BridgeError::violation(
                    "down-protocol message before START",
                ));
            }
            DownMessage::SetJobConf { pairs } => {
                // Duplicate keys overwrite.
                for (key, value) in pairs {
                    conf.insert(key, value);
                }
            }
            DownMessage::SetInputTypes {
                key_type,
                value_type,
            } => {
                tracing::debug!(key_type, value_type, "Input types set");
            }
            DownMessage::RunMap {
                input_split,
                num_reduces,
                piped_input: _,
            } => {
                handler.run_map(ctx, &conf, input_split, num_reduces).await?;
                phase = WorkerPhase::Map;
            }
            DownMessage::MapItem { key, value } => {
                if phase != WorkerPhase::Map {
                    return Err(BridgeError::violation("MAP_ITEM outside a map phase"));
                }
                handler.map_item(ctx, key, value).await?;
            }
            DownMessage::RunReduce {
                num_reduces,
                piped_output: _,
            } => {
                handler.run_reduce(ctx, &conf, num_reduces).await?;
                phase = WorkerPhase::Reduce;
                reduce_key = None;
            }
            DownMessage::ReduceKey { key } => {
                if phase != WorkerPhase::Reduce {
                    return Err(BridgeError::violation("REDUCE_KEY outside a reduce phase"));
                }
                reduce_key = Some(key);
            }
            DownMessage::ReduceValue { value } => {
                if phase != WorkerPhase::Reduce {
                    return Err(BridgeError::violation(
                        "REDUCE_VALUE outside a reduce phase",
                    ));
                }
                let key = reduce_key
                    .clone()
                    .ok_or_else(|| BridgeError::violation("REDUCE_VALUE before any REDUCE_KEY"))?;
                handler.reduce(ctx, key, value).await?;
            }
            DownMessage::Close => {
                tracing::debug!("Close received, emitting DONE");
                ctx.done()?;
                return Ok(());
            }
            DownMessage::Abort => {
                tracing::warn!("Abort received, exiting without DONE");
                return Ok(());
            }
        }
    }

    Err(BridgeError::violation(
        "down channel closed without CLOSE/ABORT",
    ))
}
