//! Down-protocol sender: serializes driver actions onto the worker's stdin.
//!
//! Every operation validates the session phase before touching the channel,
//! so an out-of-order call fails with `ProtocolViolation` and writes nothing.
//! Sends flush through to the OS pipe; a full pipe buffer blocks the caller
//! until the worker drains it.

use std::collections::HashMap;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use crate::codec::DownCodec;
use crate::error::BridgeError;
use crate::protocol::{DownMessage, PROTOCOL_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Map,
    Reduce { key_seen: bool },
    Finished,
}

pub struct DownSender<W> {
    frames: FramedWrite<W, DownCodec>,
    phase: Phase,
}

impl<W: AsyncWrite + Unpin> DownSender<W> {
    pub fn new(writer: W) -> Self {
        Self {
            frames: FramedWrite::new(writer, DownCodec),
            phase: Phase::Created,
        }
    }

    /// True once `CLOSE` or `ABORT` has been issued.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    fn ensure_open(&self, what: &str) -> Result<(), BridgeError> {
        match self.phase {
            Phase::Created => Err(BridgeError::violation(format!("{what} before START"))),
            Phase::Finished => Err(BridgeError::violation(format!("{what} after CLOSE/ABORT"))),
            _ => Ok(()),
        }
    }

    async fn send(&mut self, msg: DownMessage) -> Result<(), BridgeError> {
        tracing::trace!(opcode = msg.opcode(), "Sending down-protocol message");
        self.frames
            .send(msg)
            .await
            .map_err(BridgeError::for_channel_write)
    }

    /// Must be the first message of the session. Carries the protocol
    /// version so the worker can refuse a mismatched driver.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        if self.phase != Phase::Created {
            return Err(BridgeError::violation(
                "START must be the first message of a session",
            ));
        }
        self.send(DownMessage::Start {
            version: PROTOCOL_VERSION,
        })
        .await?;
        self.phase = Phase::Started;
        Ok(())
    }

    pub async fn set_job_conf(&mut self, conf: &HashMap<String, String>) -> Result<(), BridgeError> {
        self.ensure_open("SET_JOB_CONF")?;
        let pairs = conf
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>();
        self.send(DownMessage::SetJobConf { pairs }).await
    }

    pub async fn set_input_types(
        &mut self,
        key_type: &str,
        value_type: &str,
    ) -> Result<(), BridgeError> {
        self.ensure_open("SET_INPUT_TYPES")?;
        self.send(DownMessage::SetInputTypes {
            key_type: key_type.to_string(),
            value_type: value_type.to_string(),
        })
        .await
    }

    pub async fn run_map(
        &mut self,
        input_split: impl Into<Bytes>,
        num_reduces: i32,
        piped_input: bool,
    ) -> Result<(), BridgeError> {
        self.ensure_open("RUN_MAP")?;
        self.send(DownMessage::RunMap {
            input_split: input_split.into(),
            num_reduces,
            piped_input,
        })
        .await?;
        self.phase = Phase::Map;
        Ok(())
    }

    pub async fn map_item(
        &mut self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<(), BridgeError> {
        if self.phase != Phase::Map {
            return Err(BridgeError::violation("MAP_ITEM outside a map phase"));
        }
        self.send(DownMessage::MapItem {
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    pub async fn run_reduce(
        &mut self,
        num_reduces: i32,
        piped_output: bool,
    ) -> Result<(), BridgeError> {
        self.ensure_open("RUN_REDUCE")?;
        self.send(DownMessage::RunReduce {
            num_reduces,
            piped_output,
        })
        .await?;
        self.phase = Phase::Reduce { key_seen: false };
        Ok(())
    }

    pub async fn reduce_key(&mut self, key: impl Into<Bytes>) -> Result<(), BridgeError> {
        if !matches!(self.phase, Phase::Reduce { .. }) {
            return Err(BridgeError::violation("REDUCE_KEY outside a reduce phase"));
        }
        self.send(DownMessage::ReduceKey { key: key.into() }).await?;
        self.phase = Phase::Reduce { key_seen: true };
        Ok(())
    }

    pub async fn reduce_value(&mut self, value: impl Into<Bytes>) -> Result<(), BridgeError> {
        match self.phase {
            Phase::Reduce { key_seen: true } => {}
            Phase::Reduce { key_seen: false } => {
                return Err(BridgeError::violation("REDUCE_VALUE before any REDUCE_KEY"));
            }
            _ => {
                return Err(BridgeError::violation(
                    "REDUCE_VALUE outside a reduce phase",
                ));
            }
        }
        self.send(DownMessage::ReduceValue {
            value: value.into(),
        })
        .await
    }

    /// Emits `CLOSE` and seals the channel. The caller is expected to wait
    /// for process exit afterwards.
    pub async fn close(&mut self) -> Result<(), BridgeError> {
        self.ensure_open("CLOSE")?;
        self.send(DownMessage::Close).await?;
        self.phase = Phase::Finished;
        Ok(())
    }

    /// Best-effort `ABORT`: the worker may already be gone, so a failed
    /// write is logged and swallowed. The channel is sealed either way.
    pub async fn abort(&mut self) {
        let was_open = self.ensure_open("ABORT").is_ok();
        self.phase = Phase::Finished;
        if !was_open {
            return;
        }
        if let Err(e) = self.send(DownMessage::Abort).await {
            tracing::warn!(error = %e, "Failed to deliver ABORT to worker (already torn down?)");
        }
    }
}
