use std::fmt::Debug;

use async_trait::async_trait;

use crate::schema::Row;

use super::statement::Statement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Wrapper for conversion of database-specific error codes into actual errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unique constraint violated: {0}")]
    UniqueConstraintViolation(sqlx::Error),

    #[error("Foreign key constraint violated: {0}")]
    FKConstraintViolation(sqlx::Error),

    #[error("Invalid transaction state on {connection:?}: {reason}")]
    TransactionState { connection: String, reason: String },

    // All other errors
    #[error(transparent)]
    SqlxError(sqlx::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Parameterized SQL execution with transaction control.
///
/// A connection holds at most one open transaction; `begin` while one is open
/// nests it (savepoints), and while a transaction is open every statement runs
/// inside it.
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    /// Name the connection is registered under
    fn name(&self) -> &str;

    async fn fetch_all(&self, statement: &Statement) -> Result<Vec<Row>>;

    async fn fetch_optional(&self, statement: &Statement) -> Result<Option<Row>> {
        Ok(self.fetch_all(statement).await?.into_iter().next())
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecuteResult>;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn transaction_depth(&self) -> usize;
}
