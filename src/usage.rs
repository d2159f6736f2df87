//! Last-access bookkeeping, coalesced to one write per UTC day

use std::sync::Arc;
use time::{OffsetDateTime, Time, UtcOffset};
use tracing::debug;

use crate::config::TokenConfig;
use crate::crypto::fingerprint;
use crate::error::{Error, Result};
use crate::logging::{Auditor, Event, TokenOperation};
use crate::storage::{Mutation, TokenStore};

/// Records when tokens were last presented
#[derive(Debug, Clone)]
pub struct UsageTracker {
    store: Arc<dyn TokenStore>,
    config: TokenConfig,
    auditor: Auditor,
}

impl UsageTracker {
    /// Create a tracker over `store`
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

    /// Note that `token` was used.
    ///
    /// `last_access` is written only when it is unset or predates the start
    /// of the current UTC day; later calls on the same day do nothing. The
    /// token's state is not consulted, so revoked and expired tokens are
    /// recorded too.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no token has this value.
    pub async fn touch(&self, token: &str) -> Result<()> {
        let record = self
            .store
            .find_token(token)
            .await?
            .ok_or_else(|| Error::NotFound(format!("token #{}", fingerprint(token))))?;

        let now = self.config.now();
        let stale_before = start_of_day(now);
        if record.last_access.is_some_and(|last| last >= stale_before) {
            debug!(token = %fingerprint(token), "Usage already recorded today");
            return Ok(());
        }

        self.store
            .commit(vec![Mutation::TouchToken {
                token: record.token.clone(),
                at: now,
                stale_before,
            }])
            .await?;

        self.auditor
            .emit(Event::Token {
                operation: TokenOperation::Touched,
                fingerprint: fingerprint(&record.token),
                client_id: record.client_id,
                identity: record.identity.to_string(),
            })
            .await;
        Ok(())
    }
}

fn start_of_day(instant: OffsetDateTime) -> OffsetDateTime {
    instant.to_offset(UtcOffset::UTC).replace_time(Time::MIDNIGHT)
}
