use crate::cache::CacheError;
use crate::connection::Error as ConnectionError;
use crate::entity::HydrationError;
use crate::schema::{CastError, SchemaError};

/// Crate-level error type. Every public operation of the table engine, the cache
/// decorator and the transaction coordinator returns this, so callers can use `?`
/// across layers and still match on the specific failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Cast(#[from] CastError),

    #[error(transparent)]
    Hydration(#[from] HydrationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Concurrent modification of {table:?}: row version {version} is no longer current")]
    ConcurrencyConflict { table: String, version: i64 },

    #[error("Failed acquiring lock {key:?}: {reason}")]
    LockAcquisition { key: String, reason: String },

    #[error("Transaction on {target:?} rolled back: {source}")]
    Transaction {
        target: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Invalid primary key for table {table:?}: {reason}")]
    InvalidPrimaryKey { table: String, reason: String },

    #[error("Database did not report a generated id for table {table:?}")]
    MissingInsertId { table: String },

    #[error("Connection {name:?} is not registered")]
    UnknownConnection { name: String },

    #[error("No cache backend configured")]
    CacheNotConfigured,

    // Cache errors only surface where they are fatal (lock acquisition paths);
    // everywhere else they are logged and swallowed
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
