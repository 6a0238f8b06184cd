//! Continuation token cache.
//!
//! Raw store continuation tokens can be large, are tied to the store version
//! and are not meant for clients. The cache hands out short opaque ids in
//! their place and is the single point where cursor expiry and capacity are
//! enforced.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ContinuationCacheConfig;
use crate::error::{SearchError, StoreError, StoreResult};

/// Maps opaque cursor ids to raw store continuation tokens.
///
/// Implementations must never hand out the same id twice while it is live,
/// and must fail [`resolve`](Self::resolve) with
/// [`SearchError::InvalidCursor`] for ids they did not issue or no longer
/// hold, rather than returning a stale or default token.
#[async_trait]
pub trait ContinuationTokenCache: Send + Sync + Debug {
    /// Stores a raw token and returns a fresh opaque id for it.
    async fn save(&self, raw_token: &str) -> StoreResult<String>;

    /// Returns the raw token behind an opaque id.
    async fn resolve(&self, opaque_id: &str) -> StoreResult<String>;

    /// Drops an opaque id. Unknown ids are ignored.
    async fn invalidate(&self, opaque_id: &str) -> StoreResult<()>;
}

#[derive(Debug)]
struct CacheEntry {
    raw_token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    // Insertion order, oldest first. May hold ids that were already removed.
    order: VecDeque<String>,
}

impl CacheState {
    fn purge_expired(&mut self, now: Instant) {
        while let Some(id) = self.order.front() {
            match self.entries.get(id) {
                Some(entry) if entry.expires_at > now => break,
                Some(_) => {
                    self.entries.remove(id);
                    self.order.pop_front();
                }
                None => {
                    self.order.pop_front();
                }
            }
        }
    }

    fn evict_oldest(&mut self) {
        while let Some(id) = self.order.pop_front() {
            if self.entries.remove(&id).is_some() {
                tracing::debug!(cursor = %id, "evicted continuation token");
                return;
            }
        }
    }
}

/// Process-local [`ContinuationTokenCache`] with expiry and bounded capacity.
///
/// Cursors do not survive a process restart.
#[derive(Debug)]
pub struct InMemoryContinuationTokenCache {
    config: ContinuationCacheConfig,
    state: Mutex<CacheState>,
}

impl Default for InMemoryContinuationTokenCache {
    fn default() -> Self {
        Self::new(ContinuationCacheConfig::default())
    }
}

impl InMemoryContinuationTokenCache {
    /// Creates an empty cache.
    pub fn new(config: ContinuationCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Number of live entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    fn new_id() -> String {
        URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
    }
}

fn invalid_cursor(opaque_id: &str) -> StoreError {
    StoreError::Search(SearchError::InvalidCursor {
        cursor: opaque_id.to_string(),
    })
}

#[async_trait]
impl ContinuationTokenCache for InMemoryContinuationTokenCache {
    async fn save(&self, raw_token: &str) -> StoreResult<String> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_expired(now);

        while state.entries.len() >= self.config.max_entries.max(1) {
            state.evict_oldest();
        }

        let mut id = Self::new_id();
        while state.entries.contains_key(&id) {
            id = Self::new_id();
        }

        state.entries.insert(
            id.clone(),
            CacheEntry {
                raw_token: raw_token.to_string(),
                expires_at: now + self.config.ttl,
            },
        );
        state.order.push_back(id.clone());

        Ok(id)
    }

    async fn resolve(&self, opaque_id: &str) -> StoreResult<String> {
        let now = Instant::now();
        let mut state = self.state.lock();

        match state.entries.get(opaque_id) {
            Some(entry) if entry.expires_at > now => Ok(entry.raw_token.clone()),
            Some(_) => {
                state.entries.remove(opaque_id);
                Err(invalid_cursor(opaque_id))
            }
            None => Err(invalid_cursor(opaque_id)),
        }
    }

    async fn invalidate(&self, opaque_id: &str) -> StoreResult<()> {
        self.state.lock().entries.remove(opaque_id);
        Ok(())
    }
}
