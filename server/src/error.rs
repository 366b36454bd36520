//! Error taxonomy for the hosting session.
//!
//! Per-connection failures (protocol violations, handshake rejections,
//! transport errors) are converted into a disconnect of that one session.
//! Storage errors on best-effort bookkeeping are logged and skipped inline.
//! Only `Fatal` reaches the orchestrator and ends the hosting session for
//! supervised restart.

use shared::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Oversized or malformed frame; the offending connection is aborted.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Duplicate identity, not whitelisted, banned, version mismatch.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Read or write failure; the session is marked unhealthy and torn
    /// down by the next reconciliation pass.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Query failure on non-critical bookkeeping; never crashes the drain
    /// loop.
    #[error("storage error: {0}")]
    Storage(String),

    /// Environment or programmer error; ends the hosting session.
    #[error("fatal server error: {0}")]
    Fatal(String),
}

impl From<CodecError> for ServerError {
    fn from(err: CodecError) -> Self {
        ServerError::ProtocolViolation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_become_protocol_violations() {
        let err: ServerError = CodecError::NegativeLength(-5).into();
        assert!(matches!(err, ServerError::ProtocolViolation(_)));
        assert!(err.to_string().contains("protocol violation"));
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: ServerError = io.into();
        assert!(matches!(err, ServerError::Transport(_)));
    }
}
