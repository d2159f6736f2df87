//! tokenwarden - Access-token lifecycle for OAuth2 authorization servers
//!
//! This library covers what happens to an access token between the grant
//! flow and its retirement: minting it with a scope restricted to what the
//! client may ask for, handing back an outstanding token instead of a
//! redundant one, revoking it, noting when it was last used, and reporting
//! on the whole collection. Grant flows, HTTP routing and storage engines
//! stay outside; storage is reached through the [`TokenStore`] trait.
//!
//! # Quick Start
//!
//! ```ignore
//! use tokenwarden::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let warden = TokenWarden::new()
//!         .persist_to("./tokens.json")
//!         .init()
//!         .await?;
//!
//!     let client = warden
//!         .register_client(Client::builder().name("Mobile App").scope("read write"))
//!         .await?;
//!
//!     let token = warden
//!         .issuer()
//!         .get_token_for("user-42", &client, "read", None)
//!         .await?;
//!     warden.usage().touch(&token.token).await?;
//!     warden.revocation().revoke(&token.token).await?;
//!     warden.save().await?;
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(unreachable_pub)]
#![deny(unused_crate_dependencies)]
#![deny(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::arithmetic_side_effects)]
#![deny(clippy::float_arithmetic)]

#[cfg(not(feature = "persistence"))]
use sha2 as _;
#[cfg(test)]
use {
    pretty_assertions as _,
    tempfile as _,
    test_log as _,
    tokio_test as _,
    tracing_test as _,
};

mod client;
mod config;
mod crypto;
mod error;
mod identity;
mod issuer;
mod logging;
mod reporting;
mod revocation;
mod scope;
mod storage;
mod token;
mod usage;

pub use crate::client::{Client, ClientBuilder, ClientCounter};
pub use crate::config::{Clock, ManualClock, SystemClock, TokenConfig, DEFAULT_EXPIRY};
pub use crate::crypto::{SecureTokenGenerator, TokenGenerator, DEFAULT_TOKEN_LENGTH};
pub use crate::error::{Error, Result};
pub use crate::identity::Identity;
pub use crate::issuer::TokenIssuer;
pub use crate::logging::{init_tracing, Event, TokenOperation};
#[cfg(feature = "logging")]
pub use crate::logging::{AuditLog, LogConfig};
pub use crate::reporting::{
    CountFilter, HistoryFilter, Page, ReportingService, DEFAULT_HISTORY_DAYS, DEFAULT_PAGE_LIMIT,
};
pub use crate::revocation::RevocationManager;
pub use crate::scope::{Scope, ScopeResolver, ScopeSpec};
pub use crate::storage::{MemoryTokenStore, Mutation, TokenQuery, TokenStore};
pub use crate::token::{AccessToken, TokenState};
pub use crate::usage::UsageTracker;

use crate::logging::Auditor;

use std::sync::Arc;
use time::Duration;
use tracing::info;

#[cfg(feature = "persistence")]
use std::path::{Path, PathBuf};

/// The token lifecycle services wired to one store and one configuration
#[derive(Debug, Clone)]
pub struct TokenWarden {
    store: Arc<dyn TokenStore>,
    config: TokenConfig,
    issuer: TokenIssuer,
    revocation: RevocationManager,
    usage: UsageTracker,
    reporting: ReportingService,
    #[cfg(feature = "persistence")]
    snapshot: Option<MemoryTokenStore>,
}

/// Builder for configuring [`TokenWarden`]
#[derive(Debug, Default)]
pub struct TokenWardenBuilder {
    default_expiry: Option<Duration>,
    token_length: Option<usize>,
    generator: Option<Arc<dyn TokenGenerator>>,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn TokenStore>>,
    #[cfg(feature = "persistence")]
    storage_path: Option<PathBuf>,
    #[cfg(feature = "logging")]
    log_config: Option<LogConfig>,
}

impl TokenWardenBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lifetime of tokens requested without an expiry
    #[must_use]
    pub const fn default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = Some(expiry);
        self
    }

    /// Set the number of random bytes per token value
    #[must_use]
    pub const fn token_length(mut self, length: usize) -> Self {
        self.token_length = Some(length);
        self
    }

    /// Use a custom token value source
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn TokenGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Use a custom time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use an externally provided store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Keep tokens in a [`MemoryTokenStore`] backed by a snapshot at `path`
    #[cfg(feature = "persistence")]
    #[must_use]
    pub fn persist_to(mut self, path: impl AsRef<Path>) -> Self {
        self.storage_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Append token events to an audit log
    #[cfg(feature = "logging")]
    #[must_use]
    pub fn with_audit_log(mut self, config: LogConfig) -> Self {
        self.log_config = Some(config);
        self
    }

    /// Initialize the [`TokenWarden`] instance
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for contradictory or invalid settings,
    /// [`Error::Crypto`] for a token length below 16 bytes and
    /// [`Error::Storage`] if an existing snapshot cannot be loaded.
    pub async fn init(self) -> Result<TokenWarden> {
        let mut config = TokenConfig::new();
        if let Some(expiry) = self.default_expiry {
            config = config.with_default_expiry(expiry);
        }
        match (self.generator, self.token_length) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "token_length has no effect with a custom generator".into(),
                ));
            }
            (Some(generator), None) => config = config.with_generator(generator),
            (None, Some(length)) => {
                config = config.with_generator(Arc::new(SecureTokenGenerator::new(length)?));
            }
            (None, None) => {}
        }
        if let Some(clock) = self.clock {
            config = config.with_clock(clock);
        }
        config.validate()?;

        #[cfg(feature = "persistence")]
        let (store, snapshot) = match (self.store, self.storage_path) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "persist_to cannot be combined with an external store".into(),
                ));
            }
            (Some(store), None) => (store, None),
            (None, Some(path)) => {
                let snapshot = MemoryTokenStore::open(&path).await?;
                let store: Arc<dyn TokenStore> = Arc::new(snapshot.clone());
                (store, Some(snapshot))
            }
            (None, None) => (Arc::new(MemoryTokenStore::new()) as Arc<dyn TokenStore>, None),
        };
        #[cfg(not(feature = "persistence"))]
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryTokenStore::new()) as Arc<dyn TokenStore>);

        #[cfg(feature = "logging")]
        let auditor = match self.log_config {
            Some(log_config) => Auditor::with_sink(Arc::new(AuditLog::new(log_config)?)),
            None => Auditor::default(),
        };
        #[cfg(not(feature = "logging"))]
        let auditor = Auditor::default();

        info!(
            default_expiry = %config.default_expiry,
            "Token lifecycle services initialized"
        );

        Ok(TokenWarden {
            issuer: TokenIssuer::new(store.clone(), config.clone()).with_auditor(auditor.clone()),
            revocation: RevocationManager::new(store.clone(), config.clone())
                .with_auditor(auditor.clone()),
            usage: UsageTracker::new(store.clone(), config.clone()).with_auditor(auditor),
            reporting: ReportingService::new(store.clone(), config.clone()),
            store,
            config,
            #[cfg(feature = "persistence")]
            snapshot,
        })
    }
}

impl TokenWarden {
    /// Start configuring a new instance
    #[allow(clippy::new_ret_no_self)]
    #[must_use]
    pub fn new() -> TokenWardenBuilder {
        TokenWardenBuilder::new()
    }

    /// Get the store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Get the active configuration
    #[must_use]
    pub const fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Build a client stamped by the configured clock and add it to the store
    ///
    /// # Errors
    ///
    /// Returns the builder's validation errors and store failures.
    pub async fn register_client(&self, client: ClientBuilder) -> Result<Client> {
        let client = client.build_with(self.config.clock.as_ref())?;
        self.store.register_client(client.clone()).await?;
        Ok(client)
    }

    /// Get the issuer
    #[must_use]
    pub const fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Get the revocation manager
    #[must_use]
    pub const fn revocation(&self) -> &RevocationManager {
        &self.revocation
    }

    /// Get the usage tracker
    #[must_use]
    pub const fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Get the reporting service
    #[must_use]
    pub const fn reporting(&self) -> &ReportingService {
        &self.reporting
    }

    /// Write the snapshot configured with
    /// [`TokenWardenBuilder::persist_to`]
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no snapshot path was configured and
    /// [`Error::Storage`] if writing fails.
    #[cfg(feature = "persistence")]
    pub async fn save(&self) -> Result<()> {
        match &self.snapshot {
            Some(snapshot) => snapshot.save().await,
            None => Err(Error::Config("No snapshot path configured".into())),
        }
    }
}

/// Prelude module containing commonly used types and traits
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::error::{Error, Result};
    pub use crate::identity::Identity;
    pub use crate::reporting::{CountFilter, HistoryFilter, Page};
    pub use crate::scope::{Scope, ScopeSpec};
    pub use crate::storage::TokenStore;
    pub use crate::token::AccessToken;
    pub use crate::TokenWarden;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use tokio_test::{assert_err, assert_ok};

    async fn registered(warden: &TokenWarden) -> Client {
        let builder = Client::builder().id("web").name("Web").scope("read write");
        assert_ok!(warden.register_client(builder).await)
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_through_facade() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let warden = assert_ok!(
            TokenWarden::new()
                .default_expiry(Duration::minutes(30))
                .with_clock(clock.clone())
                .init()
                .await
        );
        let client = registered(&warden).await;
        assert_eq!(client.created_at, datetime!(2024-05-01 12:00 UTC));

        let token = assert_ok!(
            warden
                .issuer()
                .get_token_for("alice", &client, "read", None)
                .await
        );
        assert_eq!(token.expires_at, Some(datetime!(2024-05-01 12:30 UTC)));

        assert_ok!(warden.usage().touch(&token.token).await);
        assert_ok!(warden.revocation().revoke(&token.token).await);

        let counts = assert_ok!(warden.reporting().count(&CountFilter::new().revoked()).await);
        assert_eq!(counts, 1);
        let client = assert_ok!(warden.store().find_client("web").await).unwrap();
        assert_eq!((client.tokens_granted, client.tokens_revoked), (1, 1));
    }

    #[test_log::test(tokio::test)]
    async fn test_invalid_settings_are_rejected() {
        assert_err!(TokenWarden::new().default_expiry(Duration::ZERO).init().await);
        assert_err!(TokenWarden::new().token_length(4).init().await);
        assert_err!(
            TokenWarden::new()
                .token_length(32)
                .with_generator(Arc::new(SecureTokenGenerator::default()))
                .init()
                .await
        );
    }

    #[cfg(feature = "persistence")]
    #[test_log::test(tokio::test)]
    async fn test_snapshot_survives_restart() {
        let dir = assert_ok!(tempfile::tempdir());
        let path = dir.path().join("tokens.json");

        let warden = assert_ok!(TokenWarden::new().persist_to(&path).init().await);
        let client = registered(&warden).await;
        let token = assert_ok!(
            warden
                .issuer()
                .get_token_for(7_u64, &client, ["write"], None)
                .await
        );
        assert_ok!(warden.save().await);

        let restarted = assert_ok!(TokenWarden::new().persist_to(&path).init().await);
        let found = assert_ok!(restarted.reporting().find_by_identity("7").await);
        assert_eq!(found, vec![token]);

        let store_only = assert_ok!(TokenWarden::new().init().await);
        assert_err!(store_only.save().await);
        assert_err!(
            TokenWarden::new()
                .persist_to(&path)
                .with_store(Arc::new(MemoryTokenStore::new()))
                .init()
                .await
        );
    }

    #[cfg(feature = "logging")]
    #[test_log::test(tokio::test)]
    async fn test_audit_log_records_lifecycle() {
        let dir = assert_ok!(tempfile::tempdir());
        let path = dir.path().join("audit.log");
        let warden = assert_ok!(
            TokenWarden::new()
                .with_audit_log(LogConfig {
                    path: path.clone(),
                    ..LogConfig::default()
                })
                .init()
                .await
        );
        let client = registered(&warden).await;

        let token = assert_ok!(warden.issuer().get_token_for("bob", &client, "read", None).await);
        assert_ok!(warden.issuer().get_token_for("bob", &client, "read", None).await);
        assert_ok!(warden.revocation().revoke(&token.token).await);

        let contents = assert_ok!(std::fs::read_to_string(&path));
        let operations: Vec<String> = contents
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|entry| entry["event"]["operation"].as_str().map(String::from))
            .collect();
        assert_eq!(operations, vec!["issued", "reused", "revoked"]);
        assert!(!contents.contains(&token.token));
    }
}
