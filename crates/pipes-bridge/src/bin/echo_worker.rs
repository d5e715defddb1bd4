//! Minimal worker that echoes every record back as output.
//!
//! Used by the integration tests as the subprocess half of the bridge, and
//! as a worked example of the worker side. Counts records in a registered
//! counter and reports full progress after each item.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use pipes_bridge::{BridgeError, TaskContext, TaskHandler, run_worker};
use tracing_subscriber::EnvFilter;

struct EchoTask {
    records: AtomicI32,
}

impl EchoTask {
    fn new() -> Self {
        Self {
            records: AtomicI32::new(-1),
        }
    }
}

#[async_trait]
impl TaskHandler for EchoTask {
    async fn run_map(
        &self,
        ctx: &TaskContext,
        _conf: &HashMap<String, String>,
        _input_split: Bytes,
        _num_reduces: i32,
    ) -> Result<(), BridgeError> {
        ctx.status("echo: map phase")?;
        let id = ctx.register_counter("echo", "records")?;
        self.records.store(id, Ordering::Relaxed);
        Ok(())
    }

    async fn map_item(
        &self,
        ctx: &TaskContext,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), BridgeError> {
        ctx.output(key, value)?;
        ctx.increment_counter(self.records.load(Ordering::Relaxed), 1)?;
        ctx.progress(1.0)
    }

    async fn run_reduce(
        &self,
        ctx: &TaskContext,
        _conf: &HashMap<String, String>,
        _num_reduces: i32,
    ) -> Result<(), BridgeError> {
        ctx.status("echo: reduce phase")
    }

    async fn reduce(
        &self,
        ctx: &TaskContext,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), BridgeError> {
        ctx.output(key, value)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the up protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    run_worker(Arc::new(EchoTask::new())).await?;
    Ok(())
}
