//! Entity persistence on relational tables: typed schemas, change tracking,
//! optimistic locking and soft deletes, a read-through cache decorator and a
//! transaction coordinator spanning connections.

pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod entity;
pub mod error;
pub mod schema;
pub mod table;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testutils;

pub use cache::{CacheBackend, CachedTable, InvalidationHook, MemoryCache};
pub use connection::{Connection, ConnectionRegistry, SqliteConnection};
pub use context::PersistenceContext;
pub use entity::{Entity, HydrationError, Tracked};
pub use error::{Error, Result};
pub use schema::{EntityDef, FieldDef, Schema, SchemaRegistry, Value, Values};
pub use table::{Condition, Key, OrderBy, Persistence, Table};
pub use transaction::CombinedTransaction;
