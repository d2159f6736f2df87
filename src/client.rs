//! Client records as seen by the token lifecycle

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::{whole_second, Clock, SystemClock};
use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeResolver, ScopeSpec};

/// A registered client application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Unique identifier for the client
    pub id: String,

    /// Name of the client application
    pub name: String,

    /// Scope this client may grant
    pub scope: Scope,

    /// Number of tokens issued to this client
    pub tokens_granted: u64,

    /// Number of this client's tokens that were revoked
    pub tokens_revoked: u64,

    /// When the client was created
    pub created_at: OffsetDateTime,
}

impl Client {
    /// Create a client with zeroed counters
    #[must_use]
    pub const fn new(id: String, name: String, scope: Scope, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            name,
            scope,
            tokens_granted: 0,
            tokens_revoked: 0,
            created_at,
        }
    }

    /// Start building a client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }
}

/// The two per-client counters maintained by the token lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCounter {
    /// `tokens_granted`
    TokensGranted,
    /// `tokens_revoked`
    TokensRevoked,
}

impl ClientCounter {
    pub(crate) fn increment(self, client: &mut Client) {
        let counter = match self {
            Self::TokensGranted => &mut client.tokens_granted,
            Self::TokensRevoked => &mut client.tokens_revoked,
        };
        *counter = counter.saturating_add(1);
    }
}

/// Builder for client records
#[derive(Debug, Default)]
pub struct ClientBuilder {
    id: Option<String>,
    name: Option<String>,
    scope: Option<ScopeSpec>,
    created_at: Option<OffsetDateTime>,
}

impl ClientBuilder {
    /// Use a fixed client ID instead of a generated one
    #[must_use]
    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Set the client name
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set the scope the client may grant
    #[must_use]
    pub fn scope(mut self, scope: impl Into<ScopeSpec>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the creation instant instead of reading it from a clock
    #[must_use]
    pub const fn created_at(mut self, at: OffsetDateTime) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Build the client, stamped by the wall clock
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] without a name and [`Error::InvalidScope`]
    /// if the permitted scope is malformed.
    pub fn build(self) -> Result<Client> {
        self.build_with(&SystemClock)
    }

    /// Build the client, stamped by `clock` unless a creation instant was set
    ///
    /// # Errors
    ///
    /// See [`ClientBuilder::build`].
    pub fn build_with(self, clock: &dyn Clock) -> Result<Client> {
        let name = self
            .name
            .ok_or_else(|| Error::Config("Client name is required".into()))?;
        let scope = self
            .scope
            .as_ref()
            .map(ScopeResolver::normalize)
            .transpose()?
            .unwrap_or_default();

        let created_at = self.created_at.unwrap_or_else(|| whole_second(clock.now()));

        Ok(Client::new(self.id.unwrap_or_else(|| nanoid!()), name, scope, created_at))
    }
}
