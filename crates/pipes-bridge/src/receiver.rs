//! Up-protocol receiver: drains worker messages and dispatches to a handler.
//!
//! Purely reactive - one message fully consumed per dispatch cycle. Decode
//! failures and out-of-range values are fatal and returned to the session
//! owner, which aborts. An increment for an unregistered counter id is
//! reported and the session continues.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::codec::UpCodec;
use crate::error::BridgeError;
use crate::protocol::UpMessage;

/// Handler for dispatched up-protocol events.
///
/// All methods default to no-ops so result collectors only override what
/// they consume. Implementations share themselves via `Arc`, so mutable
/// state lives behind interior mutability (a mutex or channel sender).
#[async_trait]
pub trait UpHandler: Send + Sync + 'static {
    async fn output(&self, key: Bytes, value: Bytes) {
        let _ = (key, value);
    }

    async fn partitioned_output(&self, partition: i32, key: Bytes, value: Bytes) {
        let _ = (partition, key, value);
    }

    async fn status(&self, message: String) {
        let _ = message;
    }

    async fn progress(&self, fraction: f64) {
        let _ = fraction;
    }

    async fn done(&self) {}

    async fn counter_registered(&self, id: i32, group: String, name: String) {
        let _ = (id, group, name);
    }

    async fn counter_incremented(&self, id: i32, amount: i32) {
        let _ = (id, amount);
    }
}

/// Driver-owned counter id space.
///
/// Ids are allocated sequentially from zero in registration order and stay
/// valid for the whole session. Registering the same (group, name) twice
/// yields two distinct ids - registration is not deduplicated.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    next_id: i32,
    counters: HashMap<i32, (String, String)>,
    totals: HashMap<i32, i64>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, group: &str, name: &str) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        self.counters
            .insert(id, (group.to_string(), name.to_string()));
        self.totals.insert(id, 0);
        id
    }

    pub fn increment(&mut self, id: i32, amount: i32) -> Result<i64, BridgeError> {
        match self.totals.get_mut(&id) {
            Some(total) => {
                *total += i64::from(amount);
                Ok(*total)
            }
            None => Err(BridgeError::UnknownCounter { id }),
        }
    }

    pub fn lookup(&self, id: i32) -> Option<(&str, &str)> {
        self.counters
            .get(&id)
            .map(|(group, name)| (group.as_str(), name.as_str()))
    }

    pub fn total(&self, id: i32) -> Option<i64> {
        self.totals.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

pub struct UpReceiver<R, H> {
    frames: FramedRead<R, UpCodec>,
    handler: Arc<H>,
    counters: CounterRegistry,
}

impl<R: AsyncRead + Unpin, H: UpHandler> UpReceiver<R, H> {
    pub fn new(reader: R, handler: Arc<H>) -> Self {
        Self {
            frames: FramedRead::new(reader, UpCodec),
            handler,
            counters: CounterRegistry::new(),
        }
    }

    /// Drains the up channel until EOF or a fatal error.
    ///
    /// A fatal return means the session owner must abort; a clean EOF is the
    /// worker closing its stdout on exit.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        while let Some(msg) = self.frames.next().await {
            match self.dispatch(msg?).await {
                Ok(()) => {}
                Err(BridgeError::UnknownCounter { id }) => {
                    tracing::warn!(id, "Increment for unregistered counter, ignoring");
                }
                Err(fatal) => return Err(fatal),
            }
        }
        tracing::debug!("Up channel closed");
        Ok(())
    }

    /// Dispatches one decoded message to exactly one handler call.
    pub async fn dispatch(&mut self, msg: UpMessage) -> Result<(), BridgeError> {
        tracing::trace!(opcode = msg.opcode(), "Dispatching up-protocol message");
        match msg {
            UpMessage::Output { key, value } => self.handler.output(key, value).await,
            UpMessage::PartitionedOutput {
                partition,
                key,
                value,
            } => {
                self.handler
                    .partitioned_output(partition, key, value)
                    .await
            }
            UpMessage::Status { message } => self.handler.status(message).await,
            UpMessage::Progress { fraction } => {
                if !(0.0..=1.0).contains(&fraction) {
                    return Err(BridgeError::violation(format!(
                        "progress fraction {fraction} outside [0.0, 1.0]"
                    )));
                }
                self.handler.progress(fraction).await;
            }
            UpMessage::Done => {
                tracing::debug!("Worker task phase done");
                self.handler.done().await;
            }
            UpMessage::RegisterCounter { group, name } => {
                let id = self.counters.register(&group, &name);
                tracing::debug!(id, group, name, "Counter registered");
                self.handler.counter_registered(id, group, name).await;
            }
            UpMessage::IncrementCounter { id, amount } => {
                self.counters.increment(id, amount)?;
                self.handler.counter_incremented(id, amount).await;
            }
        }
        Ok(())
    }

    pub fn counters(&self) -> &CounterRegistry {
        &self.counters
    }
}
