//! Token store interface and the in-memory reference store
//!
//! The lifecycle services never mutate records directly. Every write goes
//! through [`TokenStore::commit`] as a batch of [`Mutation`]s that the store
//! applies all-or-nothing, which is what keeps "insert token + bump counter"
//! and "revoke + bump counter" atomic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::debug;

use crate::client::{Client, ClientCounter};
use crate::crypto::fingerprint;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::scope::Scope;
use crate::token::{AccessToken, TokenState};

#[cfg(feature = "persistence")]
use {
    sha2::{Digest, Sha256},
    std::path::{Path, PathBuf},
    tracing::info,
};

/// Filter over the token collection
///
/// Unset fields do not constrain. Results come back ordered by creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenQuery {
    /// Only tokens for this identity
    pub identity: Option<Identity>,
    /// Only tokens issued to this client
    pub client_id: Option<String>,
    /// Only tokens granting exactly these names, in any order
    pub scope: Option<Scope>,
    /// Only active or only revoked tokens
    pub state: Option<TokenState>,
    /// Created at or after this instant
    pub created_from: Option<OffsetDateTime>,
    /// Created strictly after this instant
    pub created_after: Option<OffsetDateTime>,
    /// Created at or before this instant
    pub created_until: Option<OffsetDateTime>,
    /// Never expiring, or expiring at or after this instant
    pub outlives: Option<OffsetDateTime>,
    /// Number of matches to skip
    pub offset: usize,
    /// Maximum number of matches to return
    pub limit: Option<usize>,
}

impl TokenQuery {
    /// Query matching every token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one identity
    #[must_use]
    pub fn identity(mut self, identity: &Identity) -> Self {
        self.identity = Some(identity.clone());
        self
    }

    /// Restrict to one client
    #[must_use]
    pub fn client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    /// Restrict to tokens granting exactly `scope`
    #[must_use]
    pub fn scope(mut self, scope: &Scope) -> Self {
        self.scope = Some(scope.clone());
        self
    }

    /// Restrict to active tokens
    #[must_use]
    pub const fn active(mut self) -> Self {
        self.state = Some(TokenState::Active);
        self
    }

    /// Restrict to revoked tokens
    #[must_use]
    pub const fn revoked(mut self) -> Self {
        self.state = Some(TokenState::Revoked);
        self
    }

    /// Paginate
    #[must_use]
    pub const fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Whether `token` passes every filter (pagination aside)
    #[must_use]
    pub fn matches(&self, token: &AccessToken) -> bool {
        self.identity.as_ref().map_or(true, |i| &token.identity == i)
            && self.client_id.as_ref().map_or(true, |c| &token.client_id == c)
            && self.scope.as_ref().map_or(true, |s| token.scope.same_names(s))
            && self.state.map_or(true, |state| state.matches(token))
            && self.created_from.map_or(true, |t| token.created_at >= t)
            && self.created_after.map_or(true, |t| token.created_at > t)
            && self.created_until.map_or(true, |t| token.created_at <= t)
            && self
                .outlives
                .map_or(true, |t| token.expires_at.map_or(true, |e| e >= t))
    }
}

/// One step of an atomic commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert a new token; its value must not exist yet
    InsertToken(AccessToken),
    /// Add one to a client counter
    IncrementCounter {
        /// Client to update
        client_id: String,
        /// Counter to bump
        counter: ClientCounter,
    },
    /// Set `revoked_at`; fails with [`Error::AlreadyRevoked`] if already set
    RevokeToken {
        /// Token value
        token: String,
        /// Revocation instant
        at: OffsetDateTime,
    },
    /// Set `last_access` unless it is already at or after `stale_before`
    TouchToken {
        /// Token value
        token: String,
        /// Access instant
        at: OffsetDateTime,
        /// Older values get replaced
        stale_before: OffsetDateTime,
    },
}

/// Transactional collection of clients and access tokens
#[async_trait]
pub trait TokenStore: Send + Sync + fmt::Debug {
    /// Look up a client by ID
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_client(&self, client_id: &str) -> Result<Option<Client>>;

    /// Add or replace a client record
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn register_client(&self, client: Client) -> Result<()>;

    /// Exact lookup by token value, in any state
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_token(&self, token: &str) -> Result<Option<AccessToken>>;

    /// Tokens matching `query`, ordered by creation
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn query(&self, query: &TokenQuery) -> Result<Vec<AccessToken>>;

    /// Number of tokens matching `query`, ignoring pagination
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn count(&self, query: &TokenQuery) -> Result<u64>;

    /// Apply every mutation, or none of them
    ///
    /// # Errors
    ///
    /// Returns [`Error::PersistenceConflict`] on a duplicate token value,
    /// [`Error::AlreadyRevoked`] when revoking twice and [`Error::NotFound`]
    /// for unknown tokens or clients. Nothing is written in any of these
    /// cases.
    async fn commit(&self, mutations: Vec<Mutation>) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    clients: BTreeMap<String, Client>,
    tokens: Vec<AccessToken>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl StoreState {
    #[cfg(feature = "persistence")]
    fn reindex(&mut self) {
        self.index = self
            .tokens
            .iter()
            .enumerate()
            .map(|(position, token)| (token.token.clone(), position))
            .collect();
    }

    fn token(&self, value: &str) -> Option<&AccessToken> {
        self.index.get(value).and_then(|&i| self.tokens.get(i))
    }

    fn matching<'a>(&'a self, query: &'a TokenQuery) -> impl Iterator<Item = &'a AccessToken> {
        self.tokens.iter().filter(move |token| query.matches(token))
    }
}

/// Copy-on-write view of the state used while validating a commit
struct Staged<'a> {
    base: &'a StoreState,
    tokens: HashMap<String, AccessToken>,
    inserted: Vec<String>,
    clients: HashMap<String, Client>,
}

impl<'a> Staged<'a> {
    fn new(base: &'a StoreState) -> Self {
        Self {
            base,
            tokens: HashMap::new(),
            inserted: Vec::new(),
            clients: HashMap::new(),
        }
    }

    fn token_mut(&mut self, value: &str) -> Result<&mut AccessToken> {
        if !self.tokens.contains_key(value) {
            let existing = self
                .base
                .token(value)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("token {}", redact(value))))?;
            self.tokens.insert(value.to_string(), existing);
        }
        self.tokens
            .get_mut(value)
            .ok_or_else(|| Error::NotFound(format!("token {}", redact(value))))
    }

    fn client_mut(&mut self, client_id: &str) -> Result<&mut Client> {
        if !self.clients.contains_key(client_id) {
            let existing = self
                .base
                .clients
                .get(client_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("client {client_id}")))?;
            self.clients.insert(client_id.to_string(), existing);
        }
        self.clients
            .get_mut(client_id)
            .ok_or_else(|| Error::NotFound(format!("client {client_id}")))
    }

    fn apply(&mut self, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::InsertToken(token) => {
                if self.base.token(&token.token).is_some() || self.tokens.contains_key(&token.token) {
                    return Err(Error::PersistenceConflict(format!(
                        "token {} already exists",
                        redact(&token.token)
                    )));
                }
                self.inserted.push(token.token.clone());
                self.tokens.insert(token.token.clone(), token);
            }
            Mutation::IncrementCounter { client_id, counter } => {
                counter.increment(self.client_mut(&client_id)?);
            }
            Mutation::RevokeToken { token, at } => {
                let record = self.token_mut(&token)?;
                if record.revoked_at.is_some() {
                    return Err(Error::AlreadyRevoked(redact(&token)));
                }
                record.revoked_at = Some(at);
            }
            Mutation::TouchToken {
                token,
                at,
                stale_before,
            } => {
                let record = self.token_mut(&token)?;
                if record.last_access.map_or(true, |last| last < stale_before) {
                    record.last_access = Some(at);
                }
            }
        }
        Ok(())
    }

    /// Split into (updated existing tokens, new tokens in order, updated clients)
    fn finish(mut self) -> (Vec<AccessToken>, Vec<AccessToken>, Vec<Client>) {
        let inserted: Vec<AccessToken> = self
            .inserted
            .iter()
            .filter_map(|value| self.tokens.remove(value))
            .collect();
        let updated = self.tokens.into_values().collect();
        (updated, inserted, self.clients.into_values().collect())
    }
}

fn redact(token: &str) -> String {
    format!("#{}", fingerprint(token))
}

/// Snapshot file contents
#[cfg(feature = "persistence")]
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    state: StoreState,
    saved_at: OffsetDateTime,
    checksum: String,
}

#[cfg(feature = "persistence")]
impl Snapshot {
    fn digest(state: &StoreState, saved_at: OffsetDateTime) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(state)?);
        hasher.update(saved_at.unix_timestamp().to_le_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// In-memory [`TokenStore`]
///
/// Clones share the same underlying state. With the `persistence` feature
/// the state can be written to and read back from a checksummed JSON
/// snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    state: Arc<RwLock<StoreState>>,
    #[cfg(feature = "persistence")]
    path: Option<Arc<Path>>,
}

impl MemoryTokenStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens held, in any state
    pub async fn len(&self) -> usize {
        self.state.read().await.tokens.len()
    }

    /// Whether the store holds no tokens
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.tokens.is_empty()
    }
}

#[cfg(feature = "persistence")]
impl MemoryTokenStore {
    /// Create an empty store that saves to `path`
    #[must_use]
    pub fn persist_to(path: &Path) -> Self {
        Self {
            state: Arc::default(),
            path: Some(Arc::from(path)),
        }
    }

    /// Open the snapshot at `path`, starting empty if it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the snapshot exists but cannot be read
    /// or fails its checksum.
    pub async fn open(path: &Path) -> Result<Self> {
        let store = Self::persist_to(path);
        if tokio::fs::try_exists(path).await? {
            store.load().await?;
        }
        Ok(store)
    }

    /// Snapshot location, if any
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.path.as_deref().map(Path::to_path_buf)
    }

    /// Write the current state to the snapshot file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] without a snapshot path and
    /// [`Error::Storage`] if writing fails.
    pub async fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| Error::Config("No snapshot path configured".into()))?;

        let json = {
            let state = self.state.read().await;
            let saved_at = OffsetDateTime::now_utc();
            let snapshot = Snapshot {
                checksum: Snapshot::digest(&state, saved_at)?,
                state: state.clone(),
                saved_at,
            };
            serde_json::to_vec(&snapshot)
                .map_err(|e| Error::Storage(format!("Failed to serialize state: {e}")))?
        };

        // Use atomic write pattern
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, json)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write state file: {e}")))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to save state file: {e}")))?;

        info!(path = %path.display(), "State saved to file");
        Ok(())
    }

    /// Replace the current state with the snapshot file's contents
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] without a snapshot path and
    /// [`Error::Storage`] if the file cannot be read, parsed or verified.
    pub async fn load(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| Error::Config("No snapshot path configured".into()))?;

        let json = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read state file: {e}")))?;
        let snapshot: Snapshot = serde_json::from_slice(&json)
            .map_err(|e| Error::Storage(format!("Failed to deserialize state: {e}")))?;

        if Snapshot::digest(&snapshot.state, snapshot.saved_at)? != snapshot.checksum {
            return Err(Error::Storage("State file checksum mismatch".into()));
        }

        let mut loaded = snapshot.state;
        loaded.reindex();
        *self.state.write().await = loaded;

        info!(path = %path.display(), "State loaded from file");
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn find_client(&self, client_id: &str) -> Result<Option<Client>> {
        let state = self.state.read().await;
        Ok(state.clients.get(client_id).cloned())
    }

    async fn register_client(&self, client: Client) -> Result<()> {
        let mut state = self.state.write().await;
        state.clients.insert(client.id.clone(), client);
        Ok(())
    }

    async fn find_token(&self, token: &str) -> Result<Option<AccessToken>> {
        let state = self.state.read().await;
        Ok(state.token(token).cloned())
    }

    async fn query(&self, query: &TokenQuery) -> Result<Vec<AccessToken>> {
        let state = self.state.read().await;
        let mut matches: Vec<&AccessToken> = state.matching(query).collect();
        matches.sort_by_key(|token| token.created_at);

        Ok(matches
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn count(&self, query: &TokenQuery) -> Result<u64> {
        let state = self.state.read().await;
        let count = state.matching(query).count();
        u64::try_from(count).map_err(|e| Error::Storage(format!("Count overflow: {e}")))
    }

    async fn commit(&self, mutations: Vec<Mutation>) -> Result<()> {
        let mut state = self.state.write().await;
        let steps = mutations.len();

        let (updated, inserted, clients) = {
            let mut staged = Staged::new(&state);
            for mutation in mutations {
                staged.apply(mutation)?;
            }
            staged.finish()
        };

        let state = &mut *state;
        for token in updated {
            let position = state.index.get(&token.token).copied();
            if let Some(slot) = position.and_then(|i| state.tokens.get_mut(i)) {
                *slot = token;
            }
        }
        for token in inserted {
            let position = state.tokens.len();
            state.index.insert(token.token.clone(), position);
            state.tokens.push(token);
        }
        for client in clients {
            state.clients.insert(client.id.clone(), client);
        }

        debug!(steps, "Commit applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn token(value: &str, identity: &str, client_id: &str, created_at: OffsetDateTime) -> AccessToken {
        AccessToken::new(
            value.to_string(),
            client_id.to_string(),
            Identity::try_from(identity).unwrap(),
            Scope::from_canonical("read,write"),
            created_at,
            Some(created_at + Duration::hours(1)),
        )
    }

    async fn store_with_client() -> MemoryTokenStore {
        let store = MemoryTokenStore::new();
        let client = Client::builder().id("c1").name("Test").scope("read write").build().unwrap();
        store.register_client(client).await.unwrap();
        store
    }

    fn insert(value: &str, created_at: OffsetDateTime) -> Vec<Mutation> {
        vec![
            Mutation::InsertToken(token(value, "user1", "c1", created_at)),
            Mutation::IncrementCounter {
                client_id: "c1".into(),
                counter: ClientCounter::TokensGranted,
            },
        ]
    }

    #[tokio::test]
    async fn test_commit_inserts_and_counts() {
        let store = store_with_client().await;
        store.commit(insert("tok_a", T0)).await.unwrap();

        assert!(store.find_token("tok_a").await.unwrap().is_some());
        assert_eq!(store.find_client("c1").await.unwrap().unwrap().tokens_granted, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rolls_back_everything() {
        let store = store_with_client().await;
        store.commit(insert("tok_a", T0)).await.unwrap();

        let err = store.commit(insert("tok_a", T0)).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceConflict(_)));
        assert_eq!(store.find_client("c1").await.unwrap().unwrap().tokens_granted, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_client_rolls_back_insert() {
        let store = MemoryTokenStore::new();
        let err = store.commit(insert("tok_a", T0)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_revoke_twice_is_rejected_without_side_effects() {
        let store = store_with_client().await;
        store.commit(insert("tok_a", T0)).await.unwrap();

        let revoke = |at| {
            vec![
                Mutation::RevokeToken { token: "tok_a".into(), at },
                Mutation::IncrementCounter {
                    client_id: "c1".into(),
                    counter: ClientCounter::TokensRevoked,
                },
            ]
        };
        store.commit(revoke(T0)).await.unwrap();
        let err = store.commit(revoke(T0 + Duration::hours(1))).await.unwrap_err();

        assert!(matches!(err, Error::AlreadyRevoked(_)));
        let record = store.find_token("tok_a").await.unwrap().unwrap();
        assert_eq!(record.revoked_at, Some(T0));
        assert_eq!(store.find_client("c1").await.unwrap().unwrap().tokens_revoked, 1);
    }

    #[tokio::test]
    async fn test_revoke_rolls_back_when_counter_fails() {
        let store = store_with_client().await;
        store.commit(insert("tok_a", T0)).await.unwrap();

        let err = store
            .commit(vec![
                Mutation::RevokeToken {
                    token: "tok_a".into(),
                    at: T0,
                },
                Mutation::IncrementCounter {
                    client_id: "ghost".into(),
                    counter: ClientCounter::TokensRevoked,
                },
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(store.find_token("tok_a").await.unwrap().unwrap().revoked_at, None);
        assert_eq!(store.count(&TokenQuery::new().revoked()).await.unwrap(), 0);
        assert_eq!(store.find_client("c1").await.unwrap().unwrap().tokens_revoked, 0);
    }

    #[tokio::test]
    async fn test_touch_only_replaces_stale_values() {
        let store = store_with_client().await;
        store.commit(insert("tok_a", T0)).await.unwrap();

        let touch = |at, stale_before| Mutation::TouchToken {
            token: "tok_a".into(),
            at,
            stale_before,
        };
        store.commit(vec![touch(T0, T0)]).await.unwrap();
        store
            .commit(vec![touch(T0 + Duration::minutes(5), T0)])
            .await
            .unwrap();
        assert_eq!(store.find_token("tok_a").await.unwrap().unwrap().last_access, Some(T0));

        let later = T0 + Duration::days(1);
        store.commit(vec![touch(later, later)]).await.unwrap();
        assert_eq!(store.find_token("tok_a").await.unwrap().unwrap().last_access, Some(later));
    }

    #[tokio::test]
    async fn test_query_filters_and_paginates_in_creation_order() {
        let store = store_with_client().await;
        for (i, value) in ["tok_c", "tok_a", "tok_b"].iter().enumerate() {
            let created = T0 - Duration::days(i64::try_from(i).unwrap());
            store.commit(insert(value, created)).await.unwrap();
        }

        let all = store.query(&TokenQuery::new().client("c1")).await.unwrap();
        let order: Vec<_> = all.iter().map(|t| t.token.as_str()).collect();
        assert_eq!(order, vec!["tok_b", "tok_a", "tok_c"]);

        let page = store.query(&TokenQuery::new().page(1, 1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].token, "tok_a");

        let recent = TokenQuery {
            created_after: Some(T0 - Duration::days(1)),
            ..TokenQuery::default()
        };
        assert_eq!(store.count(&recent).await.unwrap(), 1);
        assert_eq!(store.count(&TokenQuery::new().revoked()).await.unwrap(), 0);
        assert_eq!(store.count(&TokenQuery::new().active()).await.unwrap(), 3);
    }

    #[test]
    fn test_outlives_filter() {
        let mut record = token("tok_a", "user1", "c1", T0);
        let expires_at = T0 + Duration::hours(1);
        let query = |t| TokenQuery {
            outlives: Some(t),
            ..TokenQuery::default()
        };

        assert!(query(expires_at).matches(&record));
        assert!(!query(expires_at + Duration::seconds(1)).matches(&record));

        record.expires_at = None;
        assert!(query(datetime!(9999-01-01 00:00 UTC)).matches(&record));
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = MemoryTokenStore::persist_to(&path);
        let client = Client::builder().id("c1").name("Test").scope("read").build().unwrap();
        store.register_client(client).await.unwrap();
        store.commit(insert("tok_a", T0)).await.unwrap();
        store.save().await.unwrap();

        let reopened = MemoryTokenStore::open(&path).await.unwrap();
        let record = reopened.find_token("tok_a").await.unwrap().unwrap();
        assert_eq!(record, token("tok_a", "user1", "c1", T0));
        assert_eq!(reopened.find_client("c1").await.unwrap().unwrap().tokens_granted, 1);
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn test_tampered_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = store_with_client().await;
        let store = MemoryTokenStore {
            path: Some(Arc::from(path.as_path())),
            ..store
        };
        store.commit(insert("tok_a", T0)).await.unwrap();
        store.save().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, raw.replace("user1", "user2")).unwrap();

        let err = MemoryTokenStore::open(&path).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryTokenStore::open(&dir.path().join("absent.json")).await.unwrap();
        assert!(store.is_empty().await);
        assert!(store.path().is_some());
    }

    #[tokio::test]
    async fn test_save_without_path_fails() {
        #[cfg(feature = "persistence")]
        assert!(matches!(MemoryTokenStore::new().save().await, Err(Error::Config(_))));
        assert!(MemoryTokenStore::new().is_empty().await);
    }
}
