//! Read-only views over the token collection

use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::config::TokenConfig;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::storage::{TokenQuery, TokenStore};
use crate::token::AccessToken;

/// Page size used when none is given
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Trailing window used by [`ReportingService::historical`] when none is given
pub const DEFAULT_HISTORY_DAYS: u32 = 60;

/// Offset and limit for paginated listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Number of records to skip
    pub offset: usize,
    /// Maximum number of records to return
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Conditions for [`ReportingService::count`]; all set conditions must hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountFilter {
    /// Only tokens created within this many trailing days
    pub days: Option<u32>,
    /// Only revoked tokens; when unset tokens in any state are counted
    pub revoked: bool,
    /// Only tokens issued to this client
    pub client_id: Option<String>,
}

impl CountFilter {
    /// Count everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the trailing `days`
    #[must_use]
    pub const fn days(mut self, days: u32) -> Self {
        self.days = Some(days);
        self
    }

    /// Restrict to revoked tokens
    #[must_use]
    pub const fn revoked(mut self) -> Self {
        self.revoked = true;
        self
    }

    /// Restrict to one client
    #[must_use]
    pub fn client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }
}

/// Conditions for [`ReportingService::historical`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    /// Trailing window in days, [`DEFAULT_HISTORY_DAYS`] when unset
    pub days: Option<u32>,
    /// Only tokens issued to this client
    pub client_id: Option<String>,
}

impl HistoryFilter {
    /// The default window over every client
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a trailing window of `days`
    #[must_use]
    pub const fn days(mut self, days: u32) -> Self {
        self.days = Some(days);
        self
    }

    /// Restrict to one client
    #[must_use]
    pub fn client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }
}

/// Lookups, listings and aggregate counts
///
/// Nothing here filters on state unless asked to: revoked and expired
/// tokens stay visible for audit.
#[derive(Debug, Clone)]
pub struct ReportingService {
    store: Arc<dyn TokenStore>,
    config: TokenConfig,
}

impl ReportingService {
    /// Create a reporting view over `store`
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, config: TokenConfig) -> Self {
        Self { store, config }
    }

    /// Exact lookup by token value, in any state
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<AccessToken>> {
        self.store.find_token(token).await
    }

    /// Exact lookup that hides revoked tokens
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    pub async fn find_active_by_token(&self, token: &str) -> Result<Option<AccessToken>> {
        Ok(self
            .find_by_token(token)
            .await?
            .filter(AccessToken::is_active))
    }

    /// Every token issued for `identity`, in creation order
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an identity that is neither a
    /// string nor an integer, or is the empty string.
    pub async fn find_by_identity<I>(&self, identity: I) -> Result<Vec<AccessToken>>
    where
        I: TryInto<Identity, Error = Error>,
    {
        let identity = identity.try_into()?;
        self.store.query(&TokenQuery::new().identity(&identity)).await
    }

    /// One page of a client's tokens in creation order
    ///
    /// An unknown client yields an empty page.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    pub async fn for_client(&self, client_id: &str, page: Page) -> Result<Vec<AccessToken>> {
        if self.store.find_client(client_id).await?.is_none() {
            return Ok(Vec::new());
        }
        self.store
            .query(&TokenQuery::new().client(client_id).page(page.offset, page.limit))
            .await
    }

    /// Number of tokens satisfying `filter`
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    pub async fn count(&self, filter: &CountFilter) -> Result<u64> {
        let mut query = TokenQuery::new();
        if let Some(days) = filter.days {
            let now = self.config.now();
            query.created_from = Some(days_before(now, days));
            query.created_until = Some(now);
        }
        if filter.revoked {
            query = query.revoked();
        }
        query.client_id.clone_from(&filter.client_id);

        self.store.count(&query).await
    }

    /// Tokens created within the trailing window, in creation order
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    pub async fn historical(&self, filter: &HistoryFilter) -> Result<Vec<AccessToken>> {
        let days = filter.days.unwrap_or(DEFAULT_HISTORY_DAYS);
        let query = TokenQuery {
            created_after: Some(days_before(self.config.now(), days)),
            client_id: filter.client_id.clone(),
            ..TokenQuery::default()
        };
        self.store.query(&query).await
    }
}

fn days_before(instant: OffsetDateTime, days: u32) -> OffsetDateTime {
    instant.saturating_sub(Duration::days(i64::from(days)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::ManualClock;
    use crate::issuer::TokenIssuer;
    use crate::revocation::RevocationManager;
    use crate::storage::MemoryTokenStore;
    use pretty_assertions::assert_eq;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    struct Fixture {
        reporting: ReportingService,
        revocation: RevocationManager,
        tokens: Vec<AccessToken>,
    }

    /// Tokens for clients A and B created 0, 10, 29, 31 and 90 days ago
    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryTokenStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let config = TokenConfig::new().with_clock(clock.clone());
        let issuer = TokenIssuer::new(store.clone(), config.clone());

        let a = Client::builder().id("A").name("Client A").scope("read").build().unwrap();
        let b = Client::builder().id("B").name("Client B").scope("read").build().unwrap();
        store.register_client(a.clone()).await.unwrap();
        store.register_client(b.clone()).await.unwrap();

        let mut tokens = Vec::new();
        for (days_ago, client, identity) in [
            (90, &a, "user1"),
            (31, &b, "user2"),
            (29, &a, "user1"),
            (10, &b, "user1"),
            (0, &a, "user2"),
        ] {
            clock.set(NOW - Duration::days(days_ago));
            tokens.push(
                issuer
                    .create_token_for(client, None, identity, None)
                    .await
                    .unwrap(),
            );
        }
        clock.set(NOW);

        Fixture {
            reporting: ReportingService::new(store.clone(), config.clone()),
            revocation: RevocationManager::new(store, config),
            tokens,
        }
    }

    #[tokio::test]
    async fn test_lookup_is_unfiltered_by_default() {
        let f = fixture().await;
        let token = &f.tokens[0].token;
        f.revocation.revoke(token).await.unwrap();

        let found = f.reporting.find_by_token(token).await.unwrap().unwrap();
        assert!(found.is_revoked());
        assert!(f.reporting.find_active_by_token(token).await.unwrap().is_none());
        assert!(f.reporting.find_by_token("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_identity_includes_every_state() {
        let f = fixture().await;
        f.revocation.revoke(&f.tokens[2].token).await.unwrap();

        let found = f.reporting.find_by_identity("user1").await.unwrap();
        let values: Vec<_> = found.iter().map(|t| t.token.clone()).collect();
        assert_eq!(
            values,
            vec![f.tokens[0].token.clone(), f.tokens[2].token.clone(), f.tokens[3].token.clone()]
        );
        assert!(f.reporting.find_by_identity("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_for_client_paginates_in_creation_order() {
        let f = fixture().await;

        let all = f.reporting.for_client("A", Page::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let second = f
            .reporting
            .for_client("A", Page { offset: 1, limit: 1 })
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].token, f.tokens[2].token);

        assert!(f.reporting.for_client("ghost", Page::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_count_trailing_days() {
        let f = fixture().await;
        assert_eq!(f.reporting.count(&CountFilter::new()).await.unwrap(), 5);
        assert_eq!(f.reporting.count(&CountFilter::new().days(30)).await.unwrap(), 3);
        assert_eq!(f.reporting.count(&CountFilter::new().days(0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_revoked_and_combined() {
        let f = fixture().await;
        assert_eq!(f.reporting.count(&CountFilter::new().revoked()).await.unwrap(), 0);

        f.revocation.revoke(&f.tokens[1].token).await.unwrap();
        f.revocation.revoke(&f.tokens[3].token).await.unwrap();
        f.revocation.revoke(&f.tokens[4].token).await.unwrap();

        assert_eq!(f.reporting.count(&CountFilter::new().revoked()).await.unwrap(), 3);
        let filter = CountFilter::new().revoked().days(30).client("B");
        assert_eq!(f.reporting.count(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_historical_window() {
        let f = fixture().await;

        let default_window = f.reporting.historical(&HistoryFilter::new()).await.unwrap();
        assert_eq!(default_window.len(), 4);

        let recent_b = f
            .reporting
            .historical(&HistoryFilter::new().days(30).client("B"))
            .await
            .unwrap();
        assert_eq!(recent_b.len(), 1);
        assert_eq!(recent_b[0].token, f.tokens[3].token);

        // The lower bound is exclusive
        let edge = f.reporting.historical(&HistoryFilter::new().days(10)).await.unwrap();
        assert_eq!(edge.len(), 1);
    }
}
