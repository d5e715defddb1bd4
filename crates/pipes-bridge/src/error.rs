//! Error kinds shared across the bridge.

use std::io;
use std::process::ExitStatus;

use crate::supervisor::SpawnError;
use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Unparseable frame: truncated message, unknown opcode, or malformed
    /// field. Fatal to the session.
    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    /// Message sent or received outside the allowed state sequence. Fatal.
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// Increment referencing an id no `REGISTER_COUNTER` ever produced.
    /// Reported to the caller; the session continues.
    #[error("increment for unregistered counter id {id}")]
    UnknownCounter { id: i32 },

    /// The worker exited before `CLOSE`/`ABORT` was issued.
    #[error("worker terminated unexpectedly")]
    WorkerTerminated { status: Option<ExitStatus> },

    /// Non-zero exit after a graceful close. Reported, not retried.
    #[error("worker exited with code {code} after graceful close")]
    WorkerFailedGraceful { code: i32 },

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("channel i/o: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Reinterprets a failed channel write: a broken pipe means the peer
    /// process is gone, which callers should see as `WorkerTerminated`
    /// rather than a bare i/o error.
    pub(crate) fn for_channel_write(self) -> Self {
        match self {
            Self::Io(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::WriteZero
                ) =>
            {
                Self::WorkerTerminated { status: None }
            }
            other => other,
        }
    }
}

impl From<WireError> for BridgeError {
    fn from(err: WireError) -> Self {
        match err {
            // Streaming decoders translate Incomplete into "wait for more
            // bytes" before this conversion; hitting it here means the
            // stream ended inside a frame.
            WireError::Incomplete => Self::malformed("truncated frame"),
            WireError::Malformed(reason) => Self::Malformed { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_write_maps_to_worker_terminated() {
        let err = BridgeError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "epipe"));
        assert!(matches!(
            err.for_channel_write(),
            BridgeError::WorkerTerminated { status: None }
        ));
    }

    #[test]
    fn other_io_errors_pass_through() {
        let err = BridgeError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(matches!(err.for_channel_write(), BridgeError::Io(_)));
    }
}
