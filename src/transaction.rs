//! Unit of work spanning several tables and connections, with an optional
//! pessimistic lock held in the cache backend.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{lock_key, CacheBackend};
use crate::connection::Connection;
use crate::entity::{Entity, Tracked};
use crate::error::{Error, Result};
use crate::schema::Json;
use crate::table::Persistence;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct HeldLock {
    cache: Arc<dyn CacheBackend>,
    key: String,
}

/// Writes routed through one coordinator commit or roll back together.
///
/// A native transaction is opened on a table's connection the first time a write
/// targets it; any failing write rolls back every open transaction and releases
/// the lock. Once committed or rolled back the coordinator refuses further work.
#[derive(Debug)]
pub struct CombinedTransaction {
    // In the order they were opened
    transactions: Vec<Arc<dyn Connection>>,
    lock: Option<HeldLock>,
    finished: bool,
    default_lock_ttl: Duration,
}

impl Default for CombinedTransaction {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

impl CombinedTransaction {
    pub fn new(default_lock_ttl: Duration) -> Self {
        Self {
            transactions: vec![],
            lock: None,
            finished: false,
            default_lock_ttl,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Names of the connections with an open transaction
    pub fn connections(&self) -> Vec<&str> {
        self.transactions.iter().map(|c| c.name()).collect()
    }

    pub fn lock_key(&self) -> Option<&str> {
        self.lock.as_ref().map(|lock| lock.key.as_str())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.finished {
            return Err(Error::TransactionFinished);
        }
        Ok(())
    }

    async fn enlist(&mut self, connection: &Arc<dyn Connection>) -> Result<()> {
        if self
            .transactions
            .iter()
            .any(|open| open.name() == connection.name())
        {
            return Ok(());
        }

        debug!("Opening transaction on {}", connection.name());
        connection.begin().await?;
        self.transactions.push(connection.clone());
        Ok(())
    }

    /// Roll everything back and wrap `error` with the connection it happened on
    async fn abort(&mut self, target: &str, error: Error) -> Error {
        self.rollback_all().await;
        Error::Transaction {
            target: target.to_string(),
            source: Box::new(error),
        }
    }

    pub async fn save<E, P>(&mut self, table: &P, entity: &mut Tracked<E>) -> Result<()>
    where
        E: Entity,
        P: Persistence<E> + ?Sized,
    {
        self.write(table, entity, false).await
    }

    pub async fn delete<E, P>(&mut self, table: &P, entity: &mut Tracked<E>) -> Result<()>
    where
        E: Entity,
        P: Persistence<E> + ?Sized,
    {
        self.write(table, entity, true).await
    }

    pub async fn save_many<E, P>(&mut self, table: &P, entities: &mut [Tracked<E>]) -> Result<()>
    where
        E: Entity,
        P: Persistence<E> + ?Sized,
    {
        for entity in entities.iter_mut() {
            self.write(table, entity, false).await?;
        }
        Ok(())
    }

    pub async fn delete_many<E, P>(
        &mut self,
        table: &P,
        entities: &mut [Tracked<E>],
    ) -> Result<()>
    where
        E: Entity,
        P: Persistence<E> + ?Sized,
    {
        for entity in entities.iter_mut() {
            self.write(table, entity, true).await?;
        }
        Ok(())
    }

    async fn write<E, P>(&mut self, table: &P, entity: &mut Tracked<E>, delete: bool) -> Result<()>
    where
        E: Entity,
        P: Persistence<E> + ?Sized,
    {
        self.ensure_active()?;

        let connection = table.connection();
        let target = connection.name().to_string();
        if let Err(error) = self.enlist(connection).await {
            return Err(self.abort(&target, error).await);
        }

        let result = if delete {
            table.delete(entity).await
        } else {
            table.save(entity).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) => Err(self.abort(&target, error).await),
        }
    }

    /// Take an exclusive lock before writing. Fails if anyone holds the same key
    /// or the cache backend cannot be reached.
    pub async fn lock(
        &mut self,
        cache: Arc<dyn CacheBackend>,
        parts: &[Json],
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.ensure_active()?;

        let key = lock_key(parts);
        if let Some(held) = &self.lock {
            return Err(Error::LockAcquisition {
                key,
                reason: format!("transaction already holds {:?}", held.key),
            });
        }

        let unavailable = |key: &str, error: &dyn std::fmt::Display| Error::LockAcquisition {
            key: key.to_string(),
            reason: format!("lock backend unavailable: {error}"),
        };

        // Read-then-write; the backend offers no set-if-absent
        match cache.get(&key).await {
            Ok(Some(_)) => {
                return Err(Error::LockAcquisition {
                    key,
                    reason: "already held".to_string(),
                })
            }
            Ok(None) => {}
            Err(error) => return Err(unavailable(&key, &error)),
        }

        let ttl = ttl.unwrap_or(self.default_lock_ttl);
        if let Err(error) = cache.set(&key, Json::Bool(true), Some(ttl)).await {
            return Err(unavailable(&key, &error));
        }

        debug!("Acquired lock {key} for {ttl:?}");
        self.lock = Some(HeldLock { cache, key });
        Ok(())
    }

    /// Drop the lock; expiry covers a failed delete
    pub async fn release_lock(&mut self) {
        if let Some(HeldLock { cache, key }) = self.lock.take() {
            match cache.delete(&key).await {
                Ok(()) => debug!("Released lock {key}"),
                Err(error) => warn!("Failed releasing lock {key}: {error}"),
            }
        }
    }

    /// Commit every open transaction in the order it was opened. If one commit
    /// fails the remaining transactions are rolled back.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;

        while !self.transactions.is_empty() {
            let connection = self.transactions.remove(0);
            if let Err(error) = connection.commit().await {
                let target = connection.name().to_string();
                return Err(self.abort(&target, error.into()).await);
            }
            info!("Committed transaction on {}", connection.name());
        }

        self.release_lock().await;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.rollback_all().await;
        Ok(())
    }

    async fn rollback_all(&mut self) {
        for connection in self.transactions.drain(..) {
            match connection.rollback().await {
                Ok(()) => info!("Rolled back transaction on {}", connection.name()),
                Err(error) => warn!("Failed rolling back {}: {error}", connection.name()),
            }
        }
        self.release_lock().await;
        self.finished = true;
    }
}

impl Drop for CombinedTransaction {
    fn drop(&mut self) {
        if !self.finished && (!self.transactions.is_empty() || self.lock.is_some()) {
            warn!(
                "Dropping unfinished transaction on [{}]; commit or roll it back explicitly",
                self.connections().join(", ")
            );
        }
    }
}
