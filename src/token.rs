//! Access token records

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

use crate::identity::Identity;
use crate::scope::Scope;

/// An issued access token, in its persisted layout
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// The opaque token value; unique across all tokens
    pub token: String,

    /// ID of the client the token was issued to
    pub client_id: String,

    /// Subject the token acts on behalf of
    pub identity: Identity,

    /// Granted scope, persisted comma-joined
    pub scope: Scope,

    /// When the token was created
    pub created_at: OffsetDateTime,

    /// When the token expires; `None` never expires
    pub expires_at: Option<OffsetDateTime>,

    /// When the token was revoked; set at most once
    pub revoked_at: Option<OffsetDateTime>,

    /// Last day the token was seen in use
    pub last_access: Option<OffsetDateTime>,
}

impl AccessToken {
    /// Create a fresh, never used token record
    #[must_use]
    pub const fn new(
        token: String,
        client_id: String,
        identity: Identity,
        scope: Scope,
        created_at: OffsetDateTime,
        expires_at: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            token,
            client_id,
            identity,
            scope,
            created_at,
            expires_at,
            revoked_at: None,
            last_access: None,
        }
    }

    /// Not revoked. Expiry does not affect this.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    /// Has been revoked
    #[must_use]
    pub const fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Expired at `instant`; tokens without an expiry never expire
    #[must_use]
    pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < instant)
    }

    /// Seconds of lifetime left at `instant`, `None` for non-expiring tokens
    #[must_use]
    pub fn expires_in_at(&self, instant: OffsetDateTime) -> Option<i64> {
        self.expires_at
            .map(|expires_at| (expires_at - instant).whole_seconds().max(0))
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("identity", &self.identity)
            .field("scope", &self.scope)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("revoked_at", &self.revoked_at)
            .field("last_access", &self.last_access)
            .finish()
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// Revocation state a query can be restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    /// Not revoked
    Active,
    /// Revoked
    Revoked,
}

impl TokenState {
    /// Whether `token` is in this state
    #[must_use]
    pub const fn matches(self, token: &AccessToken) -> bool {
        match self {
            Self::Active => token.is_active(),
            Self::Revoked => token.is_revoked(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{ScopeResolver, ScopeSpec};
    use time::macros::datetime;
    use time::Duration;

    fn sample(expires_at: Option<OffsetDateTime>) -> AccessToken {
        AccessToken::new(
            "tok_123".to_string(),
            "client123".to_string(),
            Identity::try_from("user123").unwrap(),
            ScopeResolver::normalize(&ScopeSpec::from("read")).unwrap(),
            datetime!(2024-01-01 00:00 UTC),
            expires_at,
        )
    }

    #[test]
    fn test_active_and_expired_are_independent() {
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut token = sample(Some(now - Duration::hours(1)));

        assert!(token.is_active());
        assert!(token.is_expired_at(now));

        token.revoked_at = Some(now);
        assert!(!token.is_active());
        assert!(TokenState::Revoked.matches(&token));
        assert!(!TokenState::Active.matches(&token));
    }

    #[test]
    fn test_never_expiring_token() {
        let token = sample(None);
        assert!(!token.is_expired_at(datetime!(9999-12-31 23:59 UTC)));
        assert_eq!(token.expires_in_at(datetime!(2030-01-01 00:00 UTC)), None);
    }

    #[test]
    fn test_expiry_boundary() {
        let expires_at = datetime!(2024-06-01 12:00 UTC);
        let token = sample(Some(expires_at));
        assert!(!token.is_expired_at(expires_at));
        assert!(token.is_expired_at(expires_at + Duration::seconds(1)));
        assert_eq!(token.expires_in_at(expires_at - Duration::minutes(2)), Some(120));
        assert_eq!(token.expires_in_at(expires_at + Duration::minutes(2)), Some(0));
    }

    #[test]
    fn test_debug_redacts_value() {
        let token = sample(None);
        let debug = format!("{token:?}");
        assert!(!debug.contains("tok_123"));
        assert_eq!(token.to_string(), "tok_123");
    }

    #[test]
    fn test_persisted_layout() {
        let token = sample(None);
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["scope"], "read");
        assert_eq!(json["identity"], "user123");
        assert!(json["revoked_at"].is_null());

        let back: AccessToken = serde_json::from_value(json).unwrap();
        assert_eq!(back, token);
    }
}
