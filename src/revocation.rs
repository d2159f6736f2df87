//! Token revocation

use std::sync::Arc;
use tracing::debug;

use crate::client::ClientCounter;
use crate::config::TokenConfig;
use crate::crypto::fingerprint;
use crate::error::{Error, Result};
use crate::logging::{Auditor, Event, TokenOperation};
use crate::storage::{Mutation, TokenStore};
use crate::token::AccessToken;

/// Marks tokens revoked and keeps the issuing client's tally
#[derive(Debug, Clone)]
pub struct RevocationManager {
    store: Arc<dyn TokenStore>,
    config: TokenConfig,
    auditor: Auditor,
}

impl RevocationManager {
    /// Create a manager over `store`
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

    /// Revoke the token with value `token`.
    ///
    /// Sets `revoked_at` to now and increments the owning client's
    /// `tokens_revoked` counter in the same commit. Revoking a token that is
    /// already revoked changes nothing and succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no token has this value.
    pub async fn revoke(&self, token: &str) -> Result<AccessToken> {
        let mut record = self
            .store
            .find_token(token)
            .await?
            .ok_or_else(|| Error::NotFound(format!("token #{}", fingerprint(token))))?;

        if record.is_revoked() {
            debug!(token = %fingerprint(token), "Token already revoked");
            return Ok(record);
        }

        let at = self.config.now();
        let commit = self
            .store
            .commit(vec![
                Mutation::RevokeToken {
                    token: record.token.clone(),
                    at,
                },
                Mutation::IncrementCounter {
                    client_id: record.client_id.clone(),
                    counter: ClientCounter::TokensRevoked,
                },
            ])
            .await;

        match commit {
            Ok(()) => record.revoked_at = Some(at),
            // Lost a race with another revoker; the winner counted it
            Err(Error::AlreadyRevoked(_)) => {
                debug!(token = %fingerprint(token), "Token revoked concurrently");
                return self
                    .store
                    .find_token(token)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("token #{}", fingerprint(token))));
            }
            Err(e) => return Err(e),
        }

        self.auditor
            .emit(Event::Token {
                operation: TokenOperation::Revoked,
                fingerprint: fingerprint(&record.token),
                client_id: record.client_id.clone(),
                identity: record.identity.to_string(),
            })
            .await;
        Ok(record)
    }
}
