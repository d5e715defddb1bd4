//! pipes-bridge: framed binary protocol bridge between a MapReduce driver
//! and its worker subprocess.
//!
//! The driver spawns a worker executable, pushes job configuration and input
//! records over the worker's stdin (the down protocol), and concurrently
//! drains computed output, progress, and counters from its stdout (the up
//! protocol). Messages are opcode-tagged binary frames; see [`protocol`].
//!
//! Driver side: [`Session`] owns the process handle and both channels.
//! Worker side: [`run_worker`] plus a [`TaskHandler`] implementation.

pub mod codec;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod supervisor;
pub mod wire;
pub mod worker;

mod error;

pub use error::BridgeError;
pub use protocol::{DownMessage, PROTOCOL_VERSION, UpMessage};
pub use receiver::{CounterRegistry, UpHandler, UpReceiver};
pub use sender::DownSender;
pub use session::{Session, SessionConfig};
pub use supervisor::{ExecSpawner, SpawnError, WorkerSpawner, WorkerState, WorkerSupervisor};
pub use worker::{TaskContext, TaskHandler, run_task, run_worker};
