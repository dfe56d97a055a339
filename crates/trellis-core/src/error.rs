//! Core errors.

use thiserror::Error;

/// Errors surfaced by the session layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The transport write failed; fatal for the session.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The session has begun closing; writes are no-ops.
    #[error("session is closing")]
    Closing,

    /// No live session with the given id.
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// Envelope could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] trellis_protocol::ProtocolError),
}
