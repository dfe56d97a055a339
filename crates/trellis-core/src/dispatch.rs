//! Message dispatch: the two-level (`route`, `type`) demultiplexer.
//!
//! Feature packages register a handler per route at startup; the reserved
//! `client-management` route is handled here (auth, pagelet fetch,
//! keepalive). Token validation gates every non-auth, non-keepalive request
//! that presents a credential, and the proactive refresh check rides along
//! on that validation rather than on a timer.
//!
//! Each inbound envelope is processed on its own task, so responses to a
//! burst of requests from one peer may complete out of request order. That
//! is a deliberate property of the gateway, not a defect; per-session write
//! ordering is still total (see [`crate::session`]).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use trellis_auth::{AuditSink, AuthError, Claims, TokenAuthority, UserDirectory};
use trellis_protocol::{reserved, ApiError, Envelope};

use crate::registry::SessionRegistry;
use crate::session::Session;

/// Protocol label used for login audit records.
const AUDIT_PROTOCOL: &str = "WebSocket";

/// A feature package's entry point for one route.
#[async_trait::async_trait]
pub trait RouteHandler: Send + Sync {
    /// Handle `request`, filling in `response`. The response shell already
    /// echoes the request's routing fields; stamping and the actual write
    /// happen after this returns.
    async fn handle(&self, request: &Envelope, response: &mut Envelope);
}

/// Routes envelopes to handlers and owns the reserved client-management
/// behavior.
pub struct Dispatcher {
    routes: DashMap<String, Arc<dyn RouteHandler>>,
    registry: Arc<SessionRegistry>,
    authority: Arc<TokenAuthority>,
    directory: Arc<dyn UserDirectory>,
    audit: Arc<dyn AuditSink>,
    /// Tenant web roots for pagelet fetch, keyed by vhost.
    webroots: HashMap<String, PathBuf>,
}

impl Dispatcher {
    /// Create a dispatcher with no feature routes registered yet.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        authority: Arc<TokenAuthority>,
        directory: Arc<dyn UserDirectory>,
        audit: Arc<dyn AuditSink>,
        webroots: HashMap<String, PathBuf>,
    ) -> Self {
        Self {
            routes: DashMap::new(),
            registry,
            authority,
            directory,
            audit,
            webroots,
        }
    }

    /// Register a feature package's handler for `route`.
    ///
    /// Intended to run once at startup, before traffic begins. The reserved
    /// client-management route cannot be taken over.
    pub fn register_route(&self, route: impl Into<String>, handler: Arc<dyn RouteHandler>) {
        let route = route.into();
        if route == reserved::CLIENT_ROUTE {
            tracing::error!(%route, "refusing to register over the reserved route");
            return;
        }
        tracing::debug!(%route, "registering route handler");
        if self.routes.insert(route.clone(), handler).is_some() {
            tracing::warn!(%route, "route handler replaced");
        }
    }

    /// Process one inbound envelope for `session`. This is the body of the
    /// per-message unit of work the connection handler spawns.
    pub async fn dispatch(&self, session: &Arc<Session>, mut request: Envelope) {
        let Some((route, msg_type)) = request
            .routing()
            .map(|(r, t)| (r.to_string(), t.to_string()))
        else {
            // Not dispatchable at all; treat as a protocol violation.
            tracing::warn!(session = %session.id(), "envelope missing route/type, closing");
            self.registry.close_session(session.id()).await;
            return;
        };

        // Stamp server-derived context for downstream handlers. The values
        // on the inbound envelope are never trusted; a handler that wants to
        // broadcast around the originator reads the stamped session id.
        request.session_id = Some(session.id().to_string());
        request.vhost = Some(session.vhost().to_string());
        request.is_admin = Some(session.is_admin());

        // Only the reserved pairs are exempt from the token gate; a feature
        // route reusing the "keepalive" type name gets no special treatment.
        let is_auth = route == reserved::CLIENT_ROUTE && msg_type == reserved::types::AUTH;
        let is_keepalive =
            route == reserved::CLIENT_ROUTE && msg_type == reserved::types::KEEPALIVE;

        if !is_auth && !is_keepalive && request.has_token() {
            if let Err(e) = self.verify_token(session, &request).await {
                tracing::warn!(session = %session.id(), error = %e, "token rejected");
                self.deny_and_close(session).await;
                return;
            }
        }

        // Keepalive deliberately never counts as activity, so a client that
        // only keepalives still ages out in the reaper's eyes.
        if is_keepalive {
            tracing::trace!(session = %session.id(), "keepalive received");
        } else {
            session.touch();
        }

        if route == reserved::CLIENT_ROUTE {
            self.handle_client_route(session, &request, &msg_type).await;
            return;
        }

        let handler = self.routes.get(&route).map(|e| Arc::clone(e.value()));
        match handler {
            Some(handler) => {
                let mut response = Envelope::reply_to(&request);
                handler.handle(&request, &mut response).await;
                self.send_or_close(session, response).await;
            }
            None => {
                // Unknown route is recoverable; the connection stays open.
                let message = format!("requested route: {route} is not found");
                tracing::error!(session = %session.id(), %message);
                let response = Envelope::reply_to(&request).with_error(message);
                self.send_or_close(session, response).await;
            }
        }
    }

    /// The reserved client-management route, dispatched on `type`.
    async fn handle_client_route(&self, session: &Arc<Session>, request: &Envelope, msg_type: &str) {
        match msg_type {
            reserved::types::AUTH => self.handle_auth(session, request).await,
            reserved::types::GET_PAGELET => {
                let mut response = Envelope::reply_to(request);
                self.get_pagelet(session, request, &mut response).await;
                self.send_or_close(session, response).await;
            }
            reserved::types::KEEPALIVE => {
                self.send_or_close(session, Envelope::reply_to(request)).await;
            }
            other => {
                // Unknown reserved type: component-scoped error, stay open.
                let message = format!("type {other} not implemented");
                tracing::error!(session = %session.id(), %message);
                let response = Envelope::reply_to(request).with_error(message);
                self.send_or_close(session, response).await;
            }
        }
    }

    /// The authentication exchange. One attempt per connection: a failure
    /// is answered with a generic denial and the connection is closed, so
    /// credential enumeration cannot persist on a single channel.
    async fn handle_auth(&self, session: &Arc<Session>, request: &Envelope) {
        let attempted_user = request.authentication.as_ref().map(|c| c.id.clone());

        match self.authenticate(session, request).await {
            Ok((token, valid_till, is_admin)) => {
                let mut response =
                    Envelope::reply_to(request).with_sub_component(reserved::auth::APPROVED);
                response.token = Some(token);
                response.valid_till = Some(valid_till);
                response.is_admin = Some(is_admin);

                if let Some(user) = attempted_user {
                    self.record_login(user, true);
                }
                self.send_or_close(session, response).await;
            }
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "authentication failed");
                if let Some(user) = attempted_user {
                    self.record_login(user, false);
                }

                // Generic denial: never reveal which check rejected it.
                let response = Envelope::reply_to(request)
                    .with_sub_component(reserved::auth::DENIED)
                    .with_error(AuthError::Denied.to_string());
                if let Err(send_err) = session.send(response).await {
                    tracing::warn!(session = %session.id(), error = %send_err, "denial not delivered");
                }
                self.registry.close_session(session.id()).await;
            }
        }
    }

    /// Run the credential checks in order and bind the principal on success.
    /// Returns the issued token, its expiry, and the privilege flag.
    async fn authenticate(
        &self,
        session: &Arc<Session>,
        request: &Envelope,
    ) -> Result<(String, i64, bool), AuthError> {
        let sub_component = request.sub_component.as_deref().unwrap_or_default();
        if !sub_component.eq_ignore_ascii_case(reserved::auth::AUTHENTICATE) {
            return Err(AuthError::Denied);
        }

        let credentials = request.authentication.as_ref().ok_or(AuthError::Denied)?;
        let principal = self
            .directory
            .authenticate(&credentials.id, &credentials.password, session.vhost())
            .await?;

        let issued = self.authority.issue(&principal.username, session.id())?;
        session.bind_principal(&principal.username, principal.is_admin, &issued.token);

        Ok((issued.token, issued.valid_till, principal.is_admin))
    }

    /// Validate the presented token against this session and, as a side
    /// effect, push a replacement token if it is inside the refresh window.
    async fn verify_token(&self, session: &Arc<Session>, request: &Envelope) -> Result<(), AuthError> {
        let token = request.presented_token().ok_or(AuthError::Malformed)?;
        let claims = self.authority.validate(token, session.id())?;

        if self.authority.needs_refresh(&claims) {
            self.push_refresh(session, &claims).await;
        }
        Ok(())
    }

    /// Server-initiated refresh: the client is never expected to ask.
    async fn push_refresh(&self, session: &Arc<Session>, claims: &Claims) {
        let issued = match self.authority.issue(&claims.username, session.id()) {
            Ok(issued) => issued,
            Err(e) => {
                tracing::error!(session = %session.id(), error = %e, "token refresh signing failed");
                return;
            }
        };

        session.replace_token(&issued.token);

        let mut refresh = Envelope::request(reserved::CLIENT_ROUTE, reserved::types::AUTH)
            .with_sub_component(reserved::auth::REFRESH);
        refresh.refresh_token = Some(issued.token);
        refresh.valid_till = Some(issued.valid_till);

        tracing::debug!(session = %session.id(), user = %claims.username, "pushing token refresh");
        self.send_or_close(session, refresh).await;
    }

    /// Read a named pagelet restricted to the session's tenant web root.
    async fn get_pagelet(&self, session: &Arc<Session>, request: &Envelope, response: &mut Envelope) {
        response.error = Some(ApiError::NotFound.as_json());

        let Some(component) = request.component.as_deref() else {
            return;
        };

        // Admin-only fragments stay admin-only.
        if component.eq_ignore_ascii_case("admin") && !session.is_admin() {
            tracing::error!(
                session = %session.id(),
                "non-admin attempted to fetch the admin pagelet"
            );
            return;
        }

        // Names map straight to files; anything that could leave the
        // pagelets directory is refused outright.
        if !component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            tracing::warn!(session = %session.id(), %component, "rejecting pagelet name");
            return;
        }

        let Some(webroot) = self.webroots.get(session.vhost()) else {
            return;
        };

        let path = webroot.join("pagelets").join(format!("{component}.html"));
        if let Ok(body) = tokio::fs::read_to_string(&path).await {
            response.data = Some(serde_json::Value::String(body));
            response.error = None;
        }
    }

    /// Deny the request and tear the session down. Used when a presented
    /// token fails validation on a non-auth request.
    async fn deny_and_close(&self, session: &Arc<Session>) {
        let denial = Envelope::request(reserved::CLIENT_ROUTE, reserved::types::AUTH)
            .with_sub_component(reserved::auth::DENIED)
            .with_error(ApiError::Unauthorized.as_json());
        if let Err(e) = session.send(denial).await {
            tracing::debug!(session = %session.id(), error = %e, "denial not delivered");
        }
        self.registry.close_session(session.id()).await;
    }

    /// Send a response; a failed write is fatal for the session.
    async fn send_or_close(&self, session: &Arc<Session>, response: Envelope) {
        match session.send(response).await {
            Ok(()) => {}
            Err(crate::error::CoreError::Closing) => {
                // In-flight work finishing against a closing session is
                // expected during shutdown; nothing to do.
                tracing::trace!(session = %session.id(), "dropped write to closing session");
            }
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "write failed, closing session");
                self.registry.close_session(session.id()).await;
            }
        }
    }

    /// Record a login attempt off the response path.
    fn record_login(&self, user: String, success: bool) {
        let audit = Arc::clone(&self.audit);
        tokio::spawn(async move {
            audit.record_login(&user, AUDIT_PROTOCOL, success);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CaptureSink;
    use trellis_auth::{ApiUser, InMemoryDirectory, TokenAuthority, TracingAudit};
    use trellis_protocol::Credentials;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl RouteHandler for EchoHandler {
        async fn handle(&self, request: &Envelope, response: &mut Envelope) {
            response.data = request.data.clone();
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        dispatcher: Dispatcher,
        authority: Arc<TokenAuthority>,
    }

    fn fixture() -> Fixture {
        fixture_with_webroots(HashMap::new())
    }

    fn fixture_with_webroots(webroots: HashMap<String, PathBuf>) -> Fixture {
        let registry = Arc::new(SessionRegistry::default());
        let authority = Arc::new(TokenAuthority::new("test-secret"));

        let users = HashMap::from([
            (
                "user1".to_string(),
                ApiUser {
                    password_hash: InMemoryDirectory::hash_password("p").unwrap(),
                    active: true,
                    admin: false,
                    vhosts: vec!["localhost".to_string()],
                },
            ),
            (
                "admin1".to_string(),
                ApiUser {
                    password_hash: InMemoryDirectory::hash_password("p").unwrap(),
                    active: true,
                    admin: true,
                    vhosts: vec!["localhost".to_string()],
                },
            ),
        ]);

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&authority),
            Arc::new(InMemoryDirectory::new(users)),
            Arc::new(TracingAudit::new()),
            webroots,
        );

        Fixture {
            registry,
            dispatcher,
            authority,
        }
    }

    fn connect(fixture: &Fixture) -> (Arc<Session>, CaptureSink) {
        let capture = CaptureSink::new();
        let session = fixture
            .registry
            .create("localhost", "127.0.0.1:1234", capture.boxed());
        (session, capture)
    }

    fn auth_request(id: &str, password: &str) -> Envelope {
        let mut request = Envelope::request(reserved::CLIENT_ROUTE, reserved::types::AUTH)
            .with_sub_component(reserved::auth::AUTHENTICATE);
        request.authentication = Some(Credentials {
            id: id.to_string(),
            password: password.to_string(),
        });
        request
    }

    #[tokio::test]
    async fn test_valid_credentials_are_approved() {
        let fixture = fixture();
        let (session, capture) = connect(&fixture);

        fixture.dispatcher.dispatch(&session, auth_request("user1", "p")).await;

        let sent = capture.take();
        assert_eq!(sent.len(), 1);
        let approved = &sent[0];
        assert_eq!(
            approved.sub_component.as_deref(),
            Some(reserved::auth::APPROVED)
        );
        assert!(approved.token.is_some());
        assert!(approved.valid_till.is_some());
        assert_eq!(approved.is_admin, Some(false));
        assert!(approved.error.is_none());

        assert_eq!(session.user().as_deref(), Some("user1"));
        assert!(fixture.registry.get(session.id()).is_some(), "stays open");
    }

    #[tokio::test]
    async fn test_bad_password_is_denied_then_closed() {
        let fixture = fixture();
        let (session, capture) = connect(&fixture);

        fixture
            .dispatcher
            .dispatch(&session, auth_request("user1", "wrong"))
            .await;

        let sent = capture.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sub_component.as_deref(), Some(reserved::auth::DENIED));
        assert_eq!(sent[0].error.as_deref(), Some("not authenticated"));
        assert!(sent[0].token.is_none());

        assert!(capture.closed(), "connection closed after denial");
        assert!(fixture.registry.get(session.id()).is_none());
    }

    #[tokio::test]
    async fn test_unknown_route_is_recoverable() {
        let fixture = fixture();
        let (session, capture) = connect(&fixture);

        fixture
            .dispatcher
            .dispatch(&session, Envelope::request("nope", "anything"))
            .await;

        let sent = capture.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].error.as_deref(),
            Some("requested route: nope is not found")
        );
        assert!(!capture.closed(), "unknown route must not close");
        assert!(fixture.registry.get(session.id()).is_some());
    }

    #[tokio::test]
    async fn test_registered_route_receives_request() {
        let fixture = fixture();
        fixture
            .dispatcher
            .register_route("seeds", Arc::new(EchoHandler));
        let (session, capture) = connect(&fixture);

        let request = Envelope::request("seeds", "getInventory")
            .with_data(serde_json::json!({"q": 1}));
        fixture.dispatcher.dispatch(&session, request).await;

        let sent = capture.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].route.as_deref(), Some("seeds"));
        assert_eq!(sent[0].data, Some(serde_json::json!({"q": 1})));
    }

    struct BroadcastHandler {
        registry: Arc<SessionRegistry>,
    }

    #[async_trait::async_trait]
    impl RouteHandler for BroadcastHandler {
        async fn handle(&self, request: &Envelope, response: &mut Envelope) {
            let notice = Envelope::request("seeds", "inventoryChanged");
            self.registry
                .notify_all(request.session_id.as_deref(), &notice)
                .await;
            response.data = Some(serde_json::json!({"purchased": true}));
        }
    }

    #[tokio::test]
    async fn test_handler_broadcast_skips_originator_but_answers_it() {
        let fixture = fixture();
        fixture.dispatcher.register_route(
            "seeds",
            Arc::new(BroadcastHandler {
                registry: Arc::clone(&fixture.registry),
            }),
        );
        let (session_a, capture_a) = connect(&fixture);
        let (_session_b, capture_b) = connect(&fixture);

        fixture
            .dispatcher
            .dispatch(&session_a, Envelope::request("seeds", "purchase"))
            .await;

        let to_a = capture_a.take();
        assert_eq!(to_a.len(), 1, "originator gets only its direct response");
        assert_eq!(to_a[0].data, Some(serde_json::json!({"purchased": true})));

        let to_b = capture_b.take();
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].msg_type.as_deref(), Some("inventoryChanged"));
    }

    struct ContextHandler;

    #[async_trait::async_trait]
    impl RouteHandler for ContextHandler {
        async fn handle(&self, request: &Envelope, response: &mut Envelope) {
            response.data = Some(serde_json::json!({
                "sessionID": request.session_id,
                "vhost": request.vhost,
                "isAdmin": request.is_admin,
            }));
        }
    }

    #[tokio::test]
    async fn test_handler_sees_stamped_context_not_client_claims() {
        let fixture = fixture();
        fixture
            .dispatcher
            .register_route("seeds", Arc::new(ContextHandler));
        let (session, capture) = connect(&fixture);

        let mut request = Envelope::request("seeds", "getInventory");
        request.session_id = Some("spoofed".to_string());
        request.is_admin = Some(true);
        fixture.dispatcher.dispatch(&session, request).await;

        let sent = capture.take();
        let seen = sent[0].data.as_ref().expect("context payload");
        assert_eq!(seen["sessionID"], session.id());
        assert_eq!(seen["vhost"], "localhost");
        assert_eq!(seen["isAdmin"], false);
    }

    #[tokio::test]
    async fn test_reserved_route_cannot_be_replaced() {
        let fixture = fixture();
        fixture
            .dispatcher
            .register_route(reserved::CLIENT_ROUTE, Arc::new(EchoHandler));
        let (session, capture) = connect(&fixture);

        // Keepalive still answered by the built-in handler.
        fixture
            .dispatcher
            .dispatch(
                &session,
                Envelope::request(reserved::CLIENT_ROUTE, reserved::types::KEEPALIVE),
            )
            .await;
        assert_eq!(capture.take().len(), 1);
    }

    #[tokio::test]
    async fn test_keepalive_does_not_advance_last_activity() {
        let fixture = fixture();
        let (session, _capture) = connect(&fixture);
        session.set_last_activity_millis(1);

        fixture
            .dispatcher
            .dispatch(
                &session,
                Envelope::request(reserved::CLIENT_ROUTE, reserved::types::KEEPALIVE),
            )
            .await;
        assert_eq!(session.last_activity_millis(), 1, "keepalive is not activity");

        fixture
            .dispatcher
            .dispatch(&session, Envelope::request("nope", "anything"))
            .await;
        assert!(session.last_activity_millis() > 1, "real traffic is activity");
    }

    #[tokio::test]
    async fn test_keepalive_type_on_feature_route_is_not_exempt() {
        let fixture = fixture();
        fixture
            .dispatcher
            .register_route("seeds", Arc::new(EchoHandler));
        let (session, capture) = connect(&fixture);
        session.set_last_activity_millis(1);

        // A forged token does not slip past the gate by borrowing the
        // reserved type name on a feature route.
        let foreign = fixture.authority.issue("user1", "other-session").unwrap();
        let mut request = Envelope::request("seeds", "keepalive");
        request.token = Some(foreign.token);

        fixture.dispatcher.dispatch(&session, request).await;

        let sent = capture.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sub_component.as_deref(), Some(reserved::auth::DENIED));
        assert!(capture.closed());
        assert!(fixture.registry.get(session.id()).is_none());
    }

    #[tokio::test]
    async fn test_keepalive_type_on_feature_route_counts_as_activity() {
        let fixture = fixture();
        fixture
            .dispatcher
            .register_route("seeds", Arc::new(EchoHandler));
        let (session, capture) = connect(&fixture);
        session.set_last_activity_millis(1);

        fixture
            .dispatcher
            .dispatch(&session, Envelope::request("seeds", "keepalive"))
            .await;

        assert!(session.last_activity_millis() > 1);
        assert_eq!(capture.take().len(), 1, "dispatched like any feature request");
    }

    #[tokio::test]
    async fn test_missing_routing_closes_session() {
        let fixture = fixture();
        let (session, capture) = connect(&fixture);

        fixture.dispatcher.dispatch(&session, Envelope::default()).await;

        assert!(capture.closed());
        assert!(fixture.registry.get(session.id()).is_none());
    }

    #[tokio::test]
    async fn test_foreign_session_token_is_denied_and_closed() {
        let fixture = fixture();
        let (session, capture) = connect(&fixture);

        // Validly signed, but bound to some other session.
        let foreign = fixture.authority.issue("user1", "other-session").unwrap();
        let mut request = Envelope::request("seeds", "getInventory");
        request.token = Some(foreign.token);

        fixture.dispatcher.dispatch(&session, request).await;

        let sent = capture.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sub_component.as_deref(), Some(reserved::auth::DENIED));
        assert!(capture.closed());
        assert!(fixture.registry.get(session.id()).is_none());
    }

    #[tokio::test]
    async fn test_expired_token_is_denied_and_closed() {
        let fixture = fixture();
        let (session, capture) = connect(&fixture);

        let expired = TokenAuthority::with_windows("test-secret", -60, 900)
            .issue("user1", session.id())
            .unwrap();
        let mut request = Envelope::request("seeds", "getInventory");
        request.token = Some(expired.token);

        fixture.dispatcher.dispatch(&session, request).await;

        assert!(capture.closed());
        assert!(fixture.registry.get(session.id()).is_none());
    }

    #[tokio::test]
    async fn test_fresh_token_does_not_trigger_refresh() {
        let fixture = fixture();
        fixture
            .dispatcher
            .register_route("seeds", Arc::new(EchoHandler));
        let (session, capture) = connect(&fixture);

        let issued = fixture.authority.issue("user1", session.id()).unwrap();
        let mut request = Envelope::request("seeds", "getInventory");
        request.token = Some(issued.token);

        fixture.dispatcher.dispatch(&session, request).await;

        let sent = capture.take();
        assert_eq!(sent.len(), 1, "only the route response, no refresh push");
        assert!(sent[0].refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_near_expiry_token_triggers_refresh_push() {
        let fixture = fixture();
        fixture
            .dispatcher
            .register_route("seeds", Arc::new(EchoHandler));
        let (session, capture) = connect(&fixture);

        // Valid for one minute: inside the 15 minute refresh window.
        let near_expiry = TokenAuthority::with_windows("test-secret", 60, 900)
            .issue("user1", session.id())
            .unwrap();
        let mut request = Envelope::request("seeds", "getInventory");
        request.token = Some(near_expiry.token);

        fixture.dispatcher.dispatch(&session, request).await;

        let sent = capture.take();
        assert_eq!(sent.len(), 2, "refresh push plus the route response");

        let refresh = sent
            .iter()
            .find(|e| e.sub_component.as_deref() == Some(reserved::auth::REFRESH))
            .expect("refresh envelope");
        let new_token = refresh.refresh_token.as_deref().expect("refresh token");

        // The replacement is bound to this session and good for a while.
        let claims = fixture.authority.validate(new_token, session.id()).unwrap();
        assert_eq!(claims.username, "user1");
        assert!(!fixture.authority.needs_refresh(&claims));
        assert_eq!(session.issued_token().as_deref(), Some(new_token));
    }

    #[tokio::test]
    async fn test_get_pagelet_reads_tenant_fragment() {
        let webroot = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(webroot.path().join("pagelets")).unwrap();
        std::fs::write(webroot.path().join("pagelets/seeds.html"), "<div>seeds</div>").unwrap();

        let fixture = fixture_with_webroots(HashMap::from([(
            "localhost".to_string(),
            webroot.path().to_path_buf(),
        )]));
        let (session, capture) = connect(&fixture);

        let request = Envelope::request(reserved::CLIENT_ROUTE, reserved::types::GET_PAGELET)
            .with_component("seeds");
        fixture.dispatcher.dispatch(&session, request).await;

        let sent = capture.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].data,
            Some(serde_json::Value::String("<div>seeds</div>".to_string()))
        );
        assert!(sent[0].error.is_none());
    }

    #[tokio::test]
    async fn test_get_pagelet_missing_fragment_is_not_found() {
        let webroot = tempfile::tempdir().unwrap();
        let fixture = fixture_with_webroots(HashMap::from([(
            "localhost".to_string(),
            webroot.path().to_path_buf(),
        )]));
        let (session, capture) = connect(&fixture);

        let request = Envelope::request(reserved::CLIENT_ROUTE, reserved::types::GET_PAGELET)
            .with_component("missing");
        fixture.dispatcher.dispatch(&session, request).await;

        let sent = capture.take();
        assert_eq!(sent[0].error.as_deref(), Some(ApiError::NotFound.as_json().as_str()));
        assert!(!capture.closed());
    }

    #[tokio::test]
    async fn test_get_pagelet_admin_requires_admin() {
        let webroot = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(webroot.path().join("pagelets")).unwrap();
        std::fs::write(webroot.path().join("pagelets/admin.html"), "<div>admin</div>").unwrap();

        let fixture = fixture_with_webroots(HashMap::from([(
            "localhost".to_string(),
            webroot.path().to_path_buf(),
        )]));

        // Anonymous session: refused.
        let (session, capture) = connect(&fixture);
        let request = Envelope::request(reserved::CLIENT_ROUTE, reserved::types::GET_PAGELET)
            .with_component("admin");
        fixture.dispatcher.dispatch(&session, request.clone()).await;
        assert!(capture.take()[0].error.is_some());

        // Admin session: allowed.
        let (admin_session, admin_capture) = connect(&fixture);
        fixture
            .dispatcher
            .dispatch(&admin_session, auth_request("admin1", "p"))
            .await;
        admin_capture.take();
        fixture.dispatcher.dispatch(&admin_session, request).await;
        let sent = admin_capture.take();
        assert_eq!(
            sent[0].data,
            Some(serde_json::Value::String("<div>admin</div>".to_string()))
        );
    }

    #[tokio::test]
    async fn test_get_pagelet_rejects_traversal_names() {
        let webroot = tempfile::tempdir().unwrap();
        let fixture = fixture_with_webroots(HashMap::from([(
            "localhost".to_string(),
            webroot.path().to_path_buf(),
        )]));
        let (session, capture) = connect(&fixture);

        let request = Envelope::request(reserved::CLIENT_ROUTE, reserved::types::GET_PAGELET)
            .with_component("../../etc/passwd");
        fixture.dispatcher.dispatch(&session, request).await;

        assert!(capture.take()[0].error.is_some());
    }

    #[tokio::test]
    async fn test_unknown_reserved_type_is_component_scoped_error() {
        let fixture = fixture();
        let (session, capture) = connect(&fixture);

        fixture
            .dispatcher
            .dispatch(
                &session,
                Envelope::request(reserved::CLIENT_ROUTE, "selfDestruct"),
            )
            .await;

        let sent = capture.take();
        assert_eq!(sent[0].error.as_deref(), Some("type selfDestruct not implemented"));
        assert!(!capture.closed());
    }
}
