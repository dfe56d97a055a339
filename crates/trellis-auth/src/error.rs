//! Credential subsystem errors.

use thiserror::Error;

/// Errors produced while issuing or validating credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The signing method or signature does not match the server key.
    #[error("invalid token signature")]
    InvalidSignature,

    /// The token is bound to a different session than the one presenting it.
    #[error("token session id does not match presenting session")]
    SessionMismatch,

    /// The token's expiration is in the past.
    #[error("token has expired")]
    Expired,

    /// The token could not be parsed at all.
    #[error("malformed token")]
    Malformed,

    /// The authentication exchange failed. Deliberately carries no detail
    /// about which check rejected the attempt.
    #[error("not authenticated")]
    Denied,

    /// Signing or parsing machinery failed; logged, never surfaced in detail.
    #[error("internal credential error: {0}")]
    Internal(String),
}
