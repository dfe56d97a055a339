//! Principal lookup and password verification.
//!
//! User storage is an external collaborator; the gateway only ever talks to
//! the [`UserDirectory`] seam. The bundled [`InMemoryDirectory`] is loaded
//! from configuration and verifies Argon2id hashes.
//!
//! Every failure collapses to [`AuthError::Denied`] at the boundary - which
//! check rejected the attempt is logged, never revealed to the caller.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::AuthError;

/// The authenticated principal handed back to the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Principal identifier.
    pub username: String,
    /// Privilege flag, bound to the session atomically with the username.
    pub is_admin: bool,
}

/// Where principals live. Implementations must not block the dispatch path
/// on anything slower than a lookup.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Verify `password` for `id` under tenant `vhost`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Denied`] for every rejection - unknown user,
    /// inactive user, tenant not authorized, or password mismatch.
    async fn authenticate(
        &self,
        id: &str,
        password: &str,
        vhost: &str,
    ) -> Result<Principal, AuthError>;
}

/// One configured principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUser {
    /// Argon2id hash of the password.
    pub password_hash: String,
    /// Inactive users are rejected before any other check.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Admin privilege flag.
    #[serde(default)]
    pub admin: bool,
    /// Tenants this user may authenticate against.
    #[serde(default)]
    pub vhosts: Vec<String>,
}

fn default_active() -> bool {
    true
}

/// Directory backed by the process configuration.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: HashMap<String, ApiUser>,
}

impl InMemoryDirectory {
    /// Build a directory from configured users.
    #[must_use]
    pub fn new(users: HashMap<String, ApiUser>) -> Self {
        Self { users }
    }

    /// Hash a password for storage. Used by provisioning, not the hot path.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Internal`] if hashing fails.
    pub fn hash_password(password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::Internal(format!("password hashing failed: {e}")))
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn authenticate(
        &self,
        id: &str,
        password: &str,
        vhost: &str,
    ) -> Result<Principal, AuthError> {
        let Some(user) = self.users.get(id) else {
            tracing::warn!(user = %id, "login attempt for unknown user");
            return Err(AuthError::Denied);
        };

        if !user.active {
            tracing::warn!(user = %id, "login attempt for inactive user");
            return Err(AuthError::Denied);
        }

        if !user.vhosts.iter().any(|v| v.eq_ignore_ascii_case(vhost)) {
            tracing::warn!(user = %id, %vhost, "user not authorized for vhost");
            return Err(AuthError::Denied);
        }

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| AuthError::Internal(format!("bad stored hash for {id}: {e}")))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(Principal {
                username: id.to_string(),
                is_admin: user.admin,
            }),
            Err(argon2::password_hash::Error::Password) => {
                tracing::warn!(user = %id, "bad password attempt");
                Err(AuthError::Denied)
            }
            Err(e) => Err(AuthError::Internal(format!(
                "password verification failed: {e}"
            ))),
        }
    }
}
