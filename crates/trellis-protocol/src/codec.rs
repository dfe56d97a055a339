//! JSON codec for envelopes.
//!
//! The gateway speaks one text frame per envelope. Decoding enforces a size
//! ceiling before touching the parser so an abusive peer cannot make the
//! server buffer arbitrary input.

use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum accepted envelope size (64 KiB).
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds the maximum size.
    #[error("envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// JSON encoding/decoding error.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope to its wire representation.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    Ok(text)
}

/// Decode an envelope from a wire frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or is not a valid envelope.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    let envelope = serde_json::from_str(text)?;
    Ok(envelope)
}
