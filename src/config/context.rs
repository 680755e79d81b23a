use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::{CacheBackend, MemoryCache};
use crate::connection::{Connection, ConnectionRegistry, SqliteConnection};
use crate::context::PersistenceContext;
use crate::error::Result;

use super::schema;

async fn build_connection(
    name: &str,
    config: &schema::Connection,
) -> Result<Arc<dyn Connection>> {
    let max_connections = config.max_connections();
    let connection = if config.read_only {
        SqliteConnection::try_new_read_only(
            name,
            &config.dsn,
            config.journal_mode,
            max_connections,
        )
        .await
    } else {
        SqliteConnection::try_new(name, &config.dsn, config.journal_mode, max_connections).await
    }
    .map_err(SqliteConnection::interpret_error)?;

    info!(
        "Opened connection {name:?} ({} connection(s){})",
        max_connections,
        if config.read_only { ", read-only" } else { "" }
    );
    Ok(Arc::new(connection))
}

pub fn build_cache(config: &schema::Cache) -> Option<Arc<dyn CacheBackend>> {
    match config {
        schema::Cache::Memory(schema::MemoryCache {
            capacity,
            default_ttl_secs,
        }) => Some(Arc::new(MemoryCache::new(
            *capacity,
            default_ttl_secs.map(Duration::from_secs),
        ))),
        schema::Cache::None => None,
    }
}

pub async fn build_context(cfg: schema::PetrelConfig) -> Result<PersistenceContext> {
    let connections = ConnectionRegistry::new();
    for (name, connection) in &cfg.connections {
        connections.register(build_connection(name, connection).await?);
    }

    Ok(PersistenceContext::new(connections, build_cache(&cfg.cache))
        .with_lock_ttl(Duration::from_secs(cfg.lock.default_ttl_secs)))
}
