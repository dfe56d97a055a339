//! The fixed error-payload taxonomy exposed to callers.
//!
//! Failures visible outside the gateway collapse into one of five shapes,
//! each mirroring an HTTP status code. The REST surface returns these as
//! bodies; the websocket path carries them in the envelope `error` field.

use serde::{Deserialize, Serialize};

/// The caller-visible error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiError {
    /// The requested resource does not exist.
    NotFound,
    /// The operation is recognized but not available.
    NotImplemented,
    /// The request was malformed or incomplete.
    BadRequest,
    /// An internal failure the caller gets no detail about.
    Internal,
    /// Missing or rejected credentials.
    Unauthorized,
}

impl ApiError {
    /// The mirrored HTTP status code.
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            ApiError::NotFound => 404,
            ApiError::NotImplemented => 501,
            ApiError::BadRequest => 400,
            ApiError::Internal => 500,
            ApiError::Unauthorized => 401,
        }
    }

    /// The fixed message for this category.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            ApiError::NotFound => "Not Found",
            ApiError::NotImplemented => "Not Implemented",
            ApiError::BadRequest => "Bad Request",
            ApiError::Internal => "Internal Server Error",
            ApiError::Unauthorized => "Unauthorized",
        }
    }

    /// The small fixed JSON shape for this category.
    #[must_use]
    pub fn payload(self) -> ErrorPayload {
        ErrorPayload {
            error: self.message().to_string(),
            status: self.status(),
        }
    }

    /// The payload rendered as a JSON string, suitable for the envelope
    /// `error` field.
    #[must_use]
    pub fn as_json(self) -> String {
        // The shape is fixed and always serializes.
        serde_json::to_string(&self.payload()).unwrap_or_default()
    }
}

/// Wire shape of an [`ApiError`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Human-readable category message.
    pub error: String,
    /// Mirrored HTTP status code.
    pub status: u16,
}
