use std::collections::HashMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::{Cache, CacheBuilder};
use moka::policy::EvictionPolicy;
use moka::Expiry;
use tracing::debug;

use crate::schema::Json;

pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cannot (de)serialize cached value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value store the cache decorator and the lock coordinator talk to.
///
/// No cross-key atomicity is assumed.
#[async_trait]
pub trait CacheBackend: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<Option<Json>, CacheError>;

    /// Store a value; `None` means the backend's default lifetime
    async fn set(&self, key: &str, value: Json, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn delete_multiple(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Values of the keys that are present
    async fn get_multiple(&self, keys: &[String]) -> Result<HashMap<String, Json>, CacheError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Json,
    ttl: Option<Duration>,
}

struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process backend on a capacity-bounded `moka` cache with per-entry lifetimes
#[derive(Debug, Clone)]
pub struct MemoryCache {
    cache: Cache<String, CacheEntry>,
    default_ttl: Option<Duration>,
}

impl MemoryCache {
    pub fn new(capacity: u64, default_ttl: Option<Duration>) -> Self {
        let cache = CacheBuilder::new(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .build();

        Self { cache, default_ttl }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, None)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Json>, CacheError> {
        Ok(self.cache.get(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: Json, ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = ttl.or(self.default_ttl);
        debug!("Caching {key} (ttl {ttl:?})");
        self.cache
            .insert(key.to_string(), CacheEntry { value, ttl })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}
