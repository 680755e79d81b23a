use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheBackend, CachedTable, InvalidationHook};
use crate::connection::ConnectionRegistry;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::schema::{SchemaError, SchemaRegistry};
use crate::table::Table;
use crate::transaction::{CombinedTransaction, DEFAULT_LOCK_TTL};

/// Composition root: owns the schema and connection registries and the optional
/// cache backend, and hands out tables and transactions wired to them.
#[derive(Debug)]
pub struct PersistenceContext {
    pub schemas: SchemaRegistry,
    pub connections: ConnectionRegistry,
    pub cache: Option<Arc<dyn CacheBackend>>,
    pub lock_ttl: Duration,
}

impl Default for PersistenceContext {
    fn default() -> Self {
        Self::new(ConnectionRegistry::new(), None)
    }
}

impl PersistenceContext {
    pub fn new(connections: ConnectionRegistry, cache: Option<Arc<dyn CacheBackend>>) -> Self {
        Self {
            schemas: SchemaRegistry::new(),
            connections,
            cache,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    /// Table engine for `E` on the connection its definition names
    pub fn table<E: Entity>(&self) -> Result<Table<E>> {
        let schema = self.schemas.schema::<E>()?;
        let Some(database) = &schema.database else {
            return Err(SchemaError::NotATable {
                entity: schema.entity.clone(),
            }
            .into());
        };

        let connection = self.connections.get(database)?;
        Table::new(schema, connection)
    }

    pub fn cached_table<E: Entity>(
        &self,
        hook: impl InvalidationHook<E> + 'static,
    ) -> Result<CachedTable<E>> {
        let cache = self.cache.clone().ok_or(Error::CacheNotConfigured)?;
        Ok(CachedTable::new(self.table::<E>()?, cache, hook))
    }

    pub fn transaction(&self) -> CombinedTransaction {
        CombinedTransaction::new(self.lock_ttl)
    }
}
