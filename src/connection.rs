//! SQL execution backend: the [`Connection`] trait, its `sqlx` SQLite
//! implementation and the named connection registry.

pub mod interface;
pub mod registry;
pub mod sqlite;
pub mod statement;

pub use interface::{Connection, Error, ExecuteResult, Result};
pub use registry::ConnectionRegistry;
pub use sqlite::SqliteConnection;
pub use statement::Statement;
