use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::entity::{Entity, Tracked};
use crate::error::Result;
use crate::schema::{Json, Row};
use crate::table::{Condition, Key, OrderBy, Persistence, Table, TableConfig};

use super::backend::CacheBackend;
use super::key::{build_key, KeyKind};

/// Cache keys a write to `entity` makes stale.
///
/// There is no automatic derivation: each cached table enumerates every cached
/// query a mutation can affect, including the keys built from the entity's old
/// values (see [`Tracked::old_value`]) when an indexed field changed.
pub trait InvalidationHook<E: Entity>: Send + Sync {
    fn keys(&self, table: &CachedTable<E>, entity: &Tracked<E>) -> Vec<String>;
}

impl<E, F> InvalidationHook<E> for F
where
    E: Entity,
    F: Fn(&CachedTable<E>, &Tracked<E>) -> Vec<String> + Send + Sync,
{
    fn keys(&self, table: &CachedTable<E>, entity: &Tracked<E>) -> Vec<String> {
        self(table, entity)
    }
}

/// Read-through cache around a [`Table`], invalidating on every write
#[derive(Clone)]
pub struct CachedTable<E: Entity> {
    table: Table<E>,
    cache: Arc<dyn CacheBackend>,
    hook: Arc<dyn InvalidationHook<E>>,
    version: u32,
    ttl: Option<Duration>,
}

impl<E: Entity> Debug for CachedTable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedTable")
            .field("table", &self.table)
            .field("cache", &self.cache)
            .field("version", &self.version)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<E: Entity> CachedTable<E> {
    pub fn new(
        table: Table<E>,
        cache: Arc<dyn CacheBackend>,
        hook: impl InvalidationHook<E> + 'static,
    ) -> Self {
        Self {
            table,
            cache,
            hook: Arc::new(hook),
            version: 1,
            ttl: None,
        }
    }

    /// Bump to orphan every key written under a previous layout of the cached data
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Lifetime of entries stored without an explicit one
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn table(&self) -> &Table<E> {
        &self.table
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    pub fn build_key(&self, kind: KeyKind, parts: &[Json]) -> String {
        let config = self.table.config();
        build_key(
            &config.connection_name,
            &config.table_name,
            self.version,
            kind,
            parts,
        )
    }

    fn canonical(&self, condition: &Condition) -> Json {
        Json::Object(condition.canonical(self.table.schema()))
    }

    /// Key of a point lookup
    pub fn one_key(&self, condition: &Condition) -> String {
        if condition.is_empty() {
            self.build_key(KeyKind::One, &[Json::from("one")])
        } else {
            self.build_key(KeyKind::One, &[self.canonical(condition)])
        }
    }

    pub fn pk_key(&self, key: impl Into<Key>) -> Result<String> {
        Ok(self.one_key(&self.table.key_condition(key)?))
    }

    /// Point key of the stored row `entity` was loaded from
    pub fn entity_key(&self, entity: &Tracked<E>) -> Result<String> {
        Ok(self.one_key(&self.table.pk_condition(entity)?))
    }

    pub fn list_key(&self, condition: &Condition, order_by: &OrderBy, limit: Option<u64>) -> String {
        self.build_key(
            KeyKind::List,
            &[
                self.canonical(condition),
                order_by.to_json(),
                limit.map_or(Json::Null, Json::from),
            ],
        )
    }

    pub fn count_key(&self, condition: &Condition) -> String {
        self.build_key(KeyKind::Count, &[self.canonical(condition)])
    }

    /// Read-through primitive: a hit is returned as is, a miss is computed and
    /// stored unless it is `None`. Cache failures only cost the cache.
    pub async fn get_cached<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl: Option<Duration>,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>>> + Send,
    {
        match self.cache.get(key).await {
            Ok(Some(cached)) => match serde_json::from_value(cached) {
                Ok(value) => {
                    debug!("Cache hit for {key}");
                    return Ok(Some(value));
                }
                Err(error) => warn!("Ignoring undecodable cache entry {key}: {error}"),
            },
            Ok(None) => debug!("Cache miss for {key}"),
            Err(error) => warn!("Cache read of {key} failed: {error}"),
        }

        let value = compute().await?;
        if let Some(value) = &value {
            match serde_json::to_value(value) {
                Ok(json) => {
                    if let Err(error) = self.cache.set(key, json, ttl.or(self.ttl)).await {
                        warn!("Cache write of {key} failed: {error}");
                    }
                }
                Err(error) => warn!("Cannot cache value for {key}: {error}"),
            }
        }
        Ok(value)
    }

    pub async fn find_by_pk_cached(
        &self,
        key: impl Into<Key>,
        ttl: Option<Duration>,
    ) -> Result<Option<Tracked<E>>> {
        let condition = self.table.key_condition(key)?;
        self.find_one_cached(&condition, ttl).await
    }

    pub async fn find_one_cached(
        &self,
        condition: &Condition,
        ttl: Option<Duration>,
    ) -> Result<Option<Tracked<E>>> {
        let key = self.one_key(condition);
        let row: Option<Row> = self
            .get_cached(&key, || self.table.find_one_row(condition), ttl)
            .await?;
        Ok(row.and_then(|row| self.table.hydrate_row(&row)))
    }

    pub async fn find_all_cached(
        &self,
        condition: &Condition,
        order_by: &OrderBy,
        limit: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<Vec<Tracked<E>>> {
        let key = self.list_key(condition, order_by, limit);
        let rows: Option<Vec<Row>> = self
            .get_cached(
                &key,
                || async move {
                    let rows = self.table.find_rows(condition, order_by, limit, None).await?;
                    Ok(Some(rows))
                },
                ttl,
            )
            .await?;
        Ok(self.table.create_entities(rows.unwrap_or_default()))
    }

    pub async fn count_all_cached(
        &self,
        condition: &Condition,
        ttl: Option<Duration>,
    ) -> Result<i64> {
        let key = self.count_key(condition);
        let count: Option<i64> = self
            .get_cached(
                &key,
                || async move { Ok(Some(self.table.count_all(condition).await?)) },
                ttl,
            )
            .await?;
        Ok(count.unwrap_or(0))
    }

    /// Point lookups for many single-column keys: one bulk cache read, then the
    /// regular cached path for whatever it missed. Cached hits come first in the
    /// result, which is otherwise unordered.
    pub async fn find_multi_cached<I, V>(
        &self,
        ids: I,
        ttl: Option<Duration>,
    ) -> Result<Vec<Tracked<E>>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Json>,
    {
        let mut lookups = vec![];
        for id in ids {
            let condition = self.table.key_condition(Key::Single(id.into()))?;
            lookups.push((self.one_key(&condition), condition));
        }

        let keys: Vec<String> = lookups.iter().map(|(key, _)| key.clone()).collect();
        let mut cached = match self.cache.get_multiple(&keys).await {
            Ok(found) => found,
            Err(error) => {
                warn!("Bulk cache read failed: {error}");
                Default::default()
            }
        };

        let mut entities = vec![];
        let mut missing = vec![];
        for (key, condition) in lookups {
            let hit = cached
                .remove(&key)
                .and_then(|json| serde_json::from_value::<Row>(json).ok())
                .and_then(|row| self.table.hydrate_row(&row));
            match hit {
                Some(entity) => entities.push(entity),
                None => missing.push(condition),
            }
        }

        debug!(
            "Multi-get on {}: {} cached, {} missing",
            self.table.config().table_name,
            entities.len(),
            missing.len()
        );
        for condition in missing {
            if let Some(entity) = self.find_one_cached(&condition, ttl).await? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Best-effort removal of cached entries
    pub async fn clear_cache(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        debug!("Invalidating {}", keys.join(", "));
        if let Err(error) = self.cache.delete_multiple(keys).await {
            warn!("Cache invalidation failed: {error}");
        }
    }

    fn invalidation_keys<'a>(&self, entities: impl IntoIterator<Item = &'a Tracked<E>>) -> Vec<String> {
        entities
            .into_iter()
            .flat_map(|entity| self.hook.keys(self, entity))
            .unique()
            .collect()
    }

    pub async fn save(&self, entity: &mut Tracked<E>) -> Result<()> {
        self.clear_cache(&self.invalidation_keys([&*entity])).await;
        self.table.save(entity).await
    }

    pub async fn delete(&self, entity: &mut Tracked<E>) -> Result<()> {
        self.clear_cache(&self.invalidation_keys([&*entity])).await;
        self.table.delete(entity).await
    }

    /// Keys of the whole batch are purged once, before the batch transaction
    pub async fn save_many(&self, entities: &mut [Tracked<E>]) -> Result<()> {
        self.clear_cache(&self.invalidation_keys(entities.iter())).await;
        self.table.save_many(entities).await
    }

    pub async fn delete_many(&self, entities: &mut [Tracked<E>]) -> Result<()> {
        self.clear_cache(&self.invalidation_keys(entities.iter())).await;
        self.table.delete_many(entities).await
    }
}

#[async_trait]
impl<E: Entity> Persistence<E> for CachedTable<E> {
    fn config(&self) -> &TableConfig {
        self.table.config()
    }

    fn connection(&self) -> &Arc<dyn Connection> {
        self.table.connection()
    }

    async fn save(&self, entity: &mut Tracked<E>) -> Result<()> {
        CachedTable::save(self, entity).await
    }

    async fn delete(&self, entity: &mut Tracked<E>) -> Result<()> {
        CachedTable::delete(self, entity).await
    }
}
