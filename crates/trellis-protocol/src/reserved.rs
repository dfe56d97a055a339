//! Reserved routing vocabulary.
//!
//! The `client-management` route is owned by the gateway itself; everything
//! else is claimed by feature packages at startup.

/// Route handled internally by the gateway.
pub const CLIENT_ROUTE: &str = "client-management";

/// Reserved `type` values under [`CLIENT_ROUTE`].
pub mod types {
    /// Pushed by the server the moment the channel is ready.
    pub const INITIALIZE: &str = "initialize";
    /// The authentication exchange.
    pub const AUTH: &str = "auth";
    /// Fetch a named HTML fragment scoped to the session's vhost.
    pub const GET_PAGELET: &str = "getPagelet";
    /// Liveness probe; deliberately does not count as activity.
    pub const KEEPALIVE: &str = "keepalive";
}

/// Subcomponents of the auth exchange.
pub mod auth {
    /// Client-initiated credential presentation.
    pub const AUTHENTICATE: &str = "authenticate";
    /// Credentials accepted; the response carries the token.
    pub const APPROVED: &str = "approved";
    /// Credentials rejected; no detail beyond this marker.
    pub const DENIED: &str = "denied";
    /// Server-initiated proactive token refresh.
    pub const REFRESH: &str = "refresh";
}
