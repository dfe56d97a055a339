//! The envelope: the one message shape exchanged over a persistent connection.
//!
//! Envelopes are value objects constructed fresh per message. Every field is
//! optional on the wire; a request only becomes dispatchable once it carries
//! both `route` and `type`. Responses always leave the server with
//! `sessionID` and `timestamp` stamped by the session's send path.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current time in milliseconds since the Unix epoch, as stamped on
/// outbound envelopes.
#[must_use]
pub fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Credentials presented during the auth exchange.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Principal identifier.
    pub id: String,
    /// Plaintext password, verified against the stored hash server-side.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never let a password reach the logs.
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A single message on the wire, request or response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Top-level feature namespace the message belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    /// Action within the route.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,

    /// Free-form qualifier interpreted by the route's handler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    /// Secondary qualifier (e.g. the auth exchange outcome).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_component: Option<String>,

    /// Stamped by the server on every outbound message. Inbound values are
    /// only trusted when they match the sending session.
    #[serde(rename = "sessionID", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Server stamp, milliseconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Payload on success; absent when `error` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Failure marker; presence signals the request did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Present only on the credential presentation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Credentials>,

    /// Signed credential, attached on approval and echoed on requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Replacement credential on a server-initiated refresh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Absolute expiry of the attached token, milliseconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_till: Option<i64>,

    /// Privilege flag bound at authentication time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,

    /// Tenant tag, resolved server-side from the connection. Never on the wire.
    #[serde(skip)]
    pub vhost: Option<String>,
}

impl Envelope {
    /// Create a bare request for the given route and type.
    #[must_use]
    pub fn request(route: impl Into<String>, msg_type: impl Into<String>) -> Self {
        Self {
            route: Some(route.into()),
            msg_type: Some(msg_type.into()),
            ..Self::default()
        }
    }

    /// Create a response shell echoing the request's routing fields.
    ///
    /// Handlers fill in `data`, `error`, or the auth fields; the session's
    /// send path stamps `sessionID` and `timestamp`.
    #[must_use]
    pub fn reply_to(request: &Envelope) -> Self {
        Self {
            route: request.route.clone(),
            msg_type: request.msg_type.clone(),
            component: request.component.clone(),
            sub_component: request.sub_component.clone(),
            ..Self::default()
        }
    }

    /// Attach a component qualifier.
    #[must_use]
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Attach a subcomponent qualifier.
    #[must_use]
    pub fn with_sub_component(mut self, sub_component: impl Into<String>) -> Self {
        self.sub_component = Some(sub_component.into());
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Mark the envelope as failed. Clears any payload.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.data = None;
        self
    }

    /// The (`route`, `type`) pair, if the envelope is dispatchable.
    #[must_use]
    pub fn routing(&self) -> Option<(&str, &str)> {
        match (self.route.as_deref(), self.msg_type.as_deref()) {
            (Some(route), Some(msg_type)) => Some((route, msg_type)),
            _ => None,
        }
    }

    /// The credential to validate: the refresh token when present,
    /// otherwise the access token.
    #[must_use]
    pub fn presented_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().or(self.token.as_deref())
    }

    /// Whether the envelope carries any credential.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.token.is_some() || self.refresh_token.is_some()
    }
}
