//! Token issuing and validation.
//!
//! Tokens are HS256-signed JWTs carrying a [`Claims`] payload. Validation is
//! purely computational; the refresh decision is a side effect of normal
//! request validation rather than a timer, so sessions that go quiet never
//! get refreshed.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::claims::Claims;
use crate::error::AuthError;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Default proactive refresh window before expiry.
pub const DEFAULT_REFRESH_WINDOW_SECS: i64 = 900;

/// A freshly signed token and its absolute expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The serialized, signed token.
    pub token: String,
    /// Absolute expiry, milliseconds since the Unix epoch.
    pub valid_till: i64,
    /// The claims that were signed.
    pub claims: Claims,
}

/// Issues and validates session-bound tokens with a server-held symmetric key.
pub struct TokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
    refresh_window: Duration,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("token_ttl", &self.token_ttl)
            .field("refresh_window", &self.refresh_window)
            .finish()
    }
}

impl TokenAuthority {
    /// Create an authority with the default 1 h lifetime and 15 min
    /// refresh window.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self::with_windows(secret, DEFAULT_TOKEN_TTL_SECS, DEFAULT_REFRESH_WINDOW_SECS)
    }

    /// Create an authority with explicit lifetime and refresh window.
    #[must_use]
    pub fn with_windows(secret: &str, ttl_secs: i64, refresh_window_secs: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 5; // clock skew
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            token_ttl: Duration::seconds(ttl_secs),
            refresh_window: Duration::seconds(refresh_window_secs),
        }
    }

    /// Sign a new claim for the given principal bound to the given session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Internal`] if signing fails.
    pub fn issue(&self, username: &str, session_id: &str) -> Result<IssuedToken, AuthError> {
        let claims = Claims {
            username: username.to_string(),
            session_id: session_id.to_string(),
            exp: (Utc::now() + self.token_ttl).timestamp(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("failed to sign token: {e}")))?;

        Ok(IssuedToken {
            token,
            valid_till: claims.valid_till_millis(),
            claims,
        })
    }

    /// Parse and verify a token presented by `expected_session_id`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidSignature`] - wrong signing method or signature
    /// - [`AuthError::Expired`] - expiration in the past
    /// - [`AuthError::SessionMismatch`] - claim bound to a different session
    /// - [`AuthError::Malformed`] - not parseable as a token at all
    pub fn validate(&self, token: &str, expected_session_id: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthError::InvalidSignature
                }
                _ => AuthError::Malformed,
            }
        })?;

        if data.claims.session_id != expected_session_id {
            tracing::warn!(
                presented_by = %expected_session_id,
                bound_to = %data.claims.session_id,
                "token presented by the wrong session"
            );
            return Err(AuthError::SessionMismatch);
        }

        Ok(data.claims)
    }

    /// Whether the claim is inside the proactive refresh window.
    #[must_use]
    pub fn needs_refresh(&self, claims: &Claims) -> bool {
        claims.exp < (Utc::now() + self.refresh_window).timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new("test-secret")
    }

    #[test]
    fn test_issue_and_validate_roundtrip() {
        let authority = authority();
        let issued = authority.issue("user1", "sess-1").unwrap();

        let claims = authority.validate(&issued.token, "sess-1").unwrap();
        assert_eq!(claims.username, "user1");
        assert_eq!(claims.session_id, "sess-1");
        assert_eq!(claims.valid_till_millis(), issued.valid_till);
    }

    #[test]
    fn test_validate_rejects_session_mismatch() {
        let authority = authority();
        let issued = authority.issue("user1", "sess-1").unwrap();

        assert!(matches!(
            authority.validate(&issued.token, "sess-2"),
            Err(AuthError::SessionMismatch)
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_key() {
        let issued = TokenAuthority::new("secret-a")
            .issue("user1", "sess-1")
            .unwrap();

        assert!(matches!(
            TokenAuthority::new("secret-b").validate(&issued.token, "sess-1"),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_validate_rejects_expired_token() {
        // Negative TTL puts the expiration well past the leeway.
        let expired = TokenAuthority::with_windows("test-secret", -60, 900);
        let issued = expired.issue("user1", "sess-1").unwrap();

        assert!(matches!(
            authority().validate(&issued.token, "sess-1"),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert!(matches!(
            authority().validate("not-a-token", "sess-1"),
            Err(AuthError::Malformed)
        ));
    }

    #[test]
    fn test_refresh_window_boundary() {
        let authority = authority();

        // A full-lifetime token (1 h) is outside the 15 min window.
        let fresh = authority.issue("user1", "sess-1").unwrap();
        assert!(!authority.needs_refresh(&fresh.claims));

        // A token with less than 15 min left is inside it.
        let near_expiry = TokenAuthority::with_windows("test-secret", 60, 900)
            .issue("user1", "sess-1")
            .unwrap();
        assert!(authority.needs_refresh(&near_expiry.claims));
    }
}
