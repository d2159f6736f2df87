//! Token issuance with reuse of outstanding tokens
//!
//! [`TokenIssuer::get_token_for`] first looks for an active token with the
//! same identity, client and scope and only mints a new one on a miss. The
//! search and the create are separate store calls: two concurrent callers
//! can both miss and both create. That duplicate is accepted; issuance is
//! never serialized behind a lock.

use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

use crate::client::{Client, ClientCounter};
use crate::config::{whole_second, TokenConfig};
use crate::crypto::fingerprint;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::logging::{Auditor, Event, TokenOperation};
use crate::scope::{Scope, ScopeResolver, ScopeSpec};
use crate::storage::{Mutation, TokenQuery, TokenStore};
use crate::token::AccessToken;

/// Mints access tokens, reusing outstanding ones where possible
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    store: Arc<dyn TokenStore>,
    config: TokenConfig,
    auditor: Auditor,
}

impl TokenIssuer {
    /// Create an issuer over `store`
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, config: TokenConfig) -> Self {
        Self {
            store,
            config,
            auditor: Auditor::default(),
        }
    }

    pub(crate) fn with_auditor(mut self, auditor: Auditor) -> Self {
        self.auditor = auditor;
        self
    }

    /// The issuance settings
    #[must_use]
    pub const fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Get an access token, creating a new one if necessary.
    ///
    /// Without `expires_at` the token expires `default_expiry` from now.
    /// An outstanding active token for the same identity, client and scope
    /// set is handed back instead of a new one when:
    ///
    /// - the requested expiry is within the default window and the
    ///   candidate lives at least as long (or never expires), or
    /// - the requested expiry is beyond the default window, in which case
    ///   any matching active token qualifies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an identity that is neither a
    /// string nor an integer, or is the empty string, and
    /// [`Error::InvalidScope`] for a malformed scope, both before touching
    /// the store. Store failures propagate; see
    /// [`TokenIssuer::create_token_for`].
    pub async fn get_token_for<I>(
        &self,
        identity: I,
        client: &Client,
        scope: impl Into<ScopeSpec>,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<AccessToken>
    where
        I: TryInto<Identity, Error = Error>,
    {
        let identity = identity.try_into()?;
        let scope = ScopeResolver::normalize(&scope.into())?.intersect(&client.scope);

        let now = self.config.now();
        let default_expires_at = now.saturating_add(self.config.default_expiry);
        let expires_at = expires_at.map_or(default_expires_at, whole_second);

        let mut query = TokenQuery::new()
            .identity(&identity)
            .client(&client.id)
            .scope(&scope)
            .active()
            .page(0, 1);
        if expires_at <= default_expires_at {
            query.outlives = Some(expires_at);
        }

        if let Some(existing) = self.store.query(&query).await?.into_iter().next() {
            self.audit(TokenOperation::Reused, &existing).await;
            return Ok(existing);
        }

        debug!(
            client_id = %client.id,
            identity = %identity,
            scope = %scope,
            "No reusable token, creating one"
        );
        self.mint(client, identity, scope, Some(expires_at)).await
    }

    /// Create a new access token.
    ///
    /// The scope is restricted leniently: a missing or malformed request
    /// yields a token with empty scope rather than an error. `expires_at`
    /// of `None` creates a token that never expires. The record is inserted
    /// and the client's `tokens_granted` counter bumped in one commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a bad or empty identity and
    /// [`Error::PersistenceConflict`] if the generated value already exists.
    /// A conflict leaves neither the token nor the counter written; retrying
    /// draws a fresh value.
    pub async fn create_token_for<I>(
        &self,
        client: &Client,
        scope: Option<&ScopeSpec>,
        identity: I,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<AccessToken>
    where
        I: TryInto<Identity, Error = Error>,
    {
        let identity = identity.try_into()?;
        let scope = ScopeResolver::restrict(scope, &client.scope);
        self.mint(client, identity, scope, expires_at).await
    }

    async fn mint(
        &self,
        client: &Client,
        identity: Identity,
        scope: Scope,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<AccessToken> {
        let token = AccessToken::new(
            self.config.generator.generate()?,
            client.id.clone(),
            identity,
            scope,
            self.config.now(),
            expires_at.map(whole_second),
        );

        let commit = self
            .store
            .commit(vec![
                Mutation::InsertToken(token.clone()),
                Mutation::IncrementCounter {
                    client_id: client.id.clone(),
                    counter: ClientCounter::TokensGranted,
                },
            ])
            .await;

        if let Err(e) = commit {
            if e.is_retryable() {
                self.auditor
                    .emit(Event::Conflict {
                        client_id: client.id.clone(),
                        details: e.to_string(),
                    })
                    .await;
            }
            return Err(e);
        }

        self.audit(TokenOperation::Issued, &token).await;
        Ok(token)
    }

    async fn audit(&self, operation: TokenOperation, token: &AccessToken) {
        self.auditor
            .emit(Event::Token {
                operation,
                fingerprint: fingerprint(&token.token),
                client_id: token.client_id.clone(),
                identity: token.identity.to_string(),
            })
            .await;
    }
}
