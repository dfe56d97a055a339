//! The claim payload embedded in every issued token.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Signed claim bound to one principal and one session.
///
/// Claims are replaced wholesale on refresh, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Authenticated principal identifier.
    pub username: String,
    /// Session this token belongs to. A token presented by any other
    /// session is invalid regardless of its signature.
    #[serde(rename = "sessionID")]
    pub session_id: String,
    /// Expiration, seconds since the Unix epoch.
    pub exp: i64,
}

impl Claims {
    /// The expiration in milliseconds, as carried in the envelope
    /// `validTill` field.
    #[must_use]
    pub fn valid_till_millis(&self) -> i64 {
        self.exp * 1000
    }

    /// Remaining lifetime in seconds, zero if already expired.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.exp - Utc::now().timestamp()).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_wire_field_names() {
        let claims = Claims {
            username: "user1".to_string(),
            session_id: "sess-1".to_string(),
            exp: 42,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["username"], "user1");
        assert_eq!(json["sessionID"], "sess-1");
        assert_eq!(json["exp"], 42);
    }

    #[test]
    fn test_remaining_secs_floors_at_zero() {
        let claims = Claims {
            username: "user1".to_string(),
            session_id: "sess-1".to_string(),
            exp: 0,
        };
        assert_eq!(claims.remaining_secs(), 0);
    }
}
