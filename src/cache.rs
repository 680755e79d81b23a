//! Read-through caching in front of tables, plus the key scheme shared with
//! the lock coordinator.

pub mod backend;
pub mod key;
pub mod table;

pub use backend::{CacheBackend, CacheError, MemoryCache, DEFAULT_CACHE_CAPACITY};
pub use key::{build_key, lock_key, KeyKind};
pub use table::{CachedTable, InvalidationHook};
