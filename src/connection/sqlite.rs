use std::fmt::{self, Debug};
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{query::Query, Column as _, Pool, Row as _, Sqlite, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::schema::{Json, Row};

use super::interface::{Connection, Error, ExecuteResult, Result};
use super::statement::Statement;

#[derive(Default)]
struct TransactionState {
    // Pinned pool connection every statement goes through while a transaction is open
    connection: Option<PoolConnection<Sqlite>>,
    depth: usize,
}

pub struct SqliteConnection {
    name: String,
    pub executor: Pool<Sqlite>,
    state: Mutex<TransactionState>,
}

impl Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("name", &self.name)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

fn is_memory_dsn(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

impl SqliteConnection {
    pub async fn try_new(
        name: impl Into<String>,
        dsn: &str,
        journal_mode: SqliteJournalMode,
        max_connections: u32,
    ) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(journal_mode);

        Self::connect(name.into(), dsn, options, max_connections).await
    }

    ///
    /// Create a new `SqliteConnection` in read-only mode: assumes the
    /// database already exists. Intended for replicas that only serve reads.
    pub async fn try_new_read_only(
        name: impl Into<String>,
        dsn: &str,
        journal_mode: SqliteJournalMode,
        max_connections: u32,
    ) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .read_only(true)
            .journal_mode(journal_mode);

        Self::connect(name.into(), dsn, options, max_connections).await
    }

    async fn connect(
        name: String,
        dsn: &str,
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> std::result::Result<Self, sqlx::Error> {
        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections.max(1));
        if is_memory_dsn(dsn) {
            // Every connection to :memory: is a separate database, so keep exactly one alive
            pool_options = pool_options
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        Ok(Self {
            name,
            executor: pool,
            state: Mutex::new(TransactionState::default()),
        })
    }

    pub fn interpret_error(error: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.sqlite.org/rescode.html
            let message = d.message();

            // sqlx doesn't surface the extended errcode for FK violations,
            // so fall back to matching on the message.
            if message.contains("FOREIGN KEY constraint failed") {
                return Error::FKConstraintViolation(error);
            }
            if message.contains("UNIQUE constraint failed") {
                return Error::UniqueConstraintViolation(error);
            }
        }
        Error::SqlxError(error)
    }

    fn transaction_error(&self, reason: &str) -> Error {
        Error::TransactionState {
            connection: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    async fn run_on(connection: &mut PoolConnection<Sqlite>, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .execute(&mut **connection)
            .await
            .map(|_| ())
            .map_err(Self::interpret_error)
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Json],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Json::Null => query.bind(None::<i64>),
            Json::Bool(b) => query.bind(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Json::String(s) => query.bind(s.as_str()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Result<Row> {
    let mut decoded = Row::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index).map_err(Error::SqlxError)?;

        let value = if raw.is_null() {
            Json::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Json::from(
                    row.try_get_unchecked::<i64, _>(index)
                        .map_err(Error::SqlxError)?,
                ),
                "REAL" => Json::from(
                    row.try_get_unchecked::<f64, _>(index)
                        .map_err(Error::SqlxError)?,
                ),
                "BLOB" => Json::from(hex::encode(
                    row.try_get_unchecked::<Vec<u8>, _>(index)
                        .map_err(Error::SqlxError)?,
                )),
                _ => Json::from(
                    row.try_get_unchecked::<String, _>(index)
                        .map_err(Error::SqlxError)?,
                ),
            }
        };
        decoded.insert(column.name().to_string(), value);
    }
    Ok(decoded)
}

#[async_trait]
impl Connection for SqliteConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_all(&self, statement: &Statement) -> Result<Vec<Row>> {
        debug!(connection = %self.name, params = ?statement.params, "{}", statement.sql);
        let query = bind_params(sqlx::query(&statement.sql), &statement.params);

        let mut state = self.state.lock().await;
        let rows = match state.connection.as_mut() {
            Some(connection) => query.fetch_all(&mut **connection).await,
            None => {
                drop(state);
                query.fetch_all(&self.executor).await
            }
        }
        .map_err(Self::interpret_error)?;

        rows.iter().map(decode_row).collect()
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecuteResult> {
        debug!(connection = %self.name, params = ?statement.params, "{}", statement.sql);
        let query = bind_params(sqlx::query(&statement.sql), &statement.params);

        let mut state = self.state.lock().await;
        let result = match state.connection.as_mut() {
            Some(connection) => query.execute(&mut **connection).await,
            None => {
                drop(state);
                query.execute(&self.executor).await
            }
        }
        .map_err(Self::interpret_error)?;

        Ok(ExecuteResult {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_rowid()),
        })
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connection.is_none() {
            let connection = self
                .executor
                .acquire()
                .await
                .map_err(Self::interpret_error)?;
            state.connection = Some(connection);
        }

        let sql = match state.depth {
            0 => "BEGIN".to_string(),
            n => format!("SAVEPOINT petrel_sp_{n}"),
        };
        debug!(connection = %self.name, "{sql}");
        if let Some(connection) = state.connection.as_mut() {
            Self::run_on(connection, &sql).await?;
        }
        state.depth += 1;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.depth == 0 {
            return Err(self.transaction_error("commit without an open transaction"));
        }
        state.depth -= 1;

        let depth = state.depth;
        let Some(connection) = state.connection.as_mut() else {
            return Err(self.transaction_error("transaction lost its connection"));
        };

        if depth > 0 {
            let sql = format!("RELEASE SAVEPOINT petrel_sp_{depth}");
            debug!(connection = %self.name, "{sql}");
            return Self::run_on(connection, &sql).await;
        }

        debug!(connection = %self.name, "COMMIT");
        let result = Self::run_on(connection, "COMMIT").await;
        if result.is_err() {
            // Leave the pooled connection clean, the commit error is returned
            if let Err(rollback_error) = Self::run_on(connection, "ROLLBACK").await {
                warn!(connection = %self.name, "Failed rolling back after COMMIT: {rollback_error}");
            }
        }
        state.connection = None;
        result
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.depth == 0 {
            return Err(self.transaction_error("rollback without an open transaction"));
        }
        state.depth -= 1;

        let depth = state.depth;
        let Some(connection) = state.connection.as_mut() else {
            return Err(self.transaction_error("transaction lost its connection"));
        };

        if depth > 0 {
            debug!(connection = %self.name, "ROLLBACK TO SAVEPOINT petrel_sp_{depth}");
            Self::run_on(connection, &format!("ROLLBACK TO SAVEPOINT petrel_sp_{depth}")).await?;
            return Self::run_on(connection, &format!("RELEASE SAVEPOINT petrel_sp_{depth}")).await;
        }

        debug!(connection = %self.name, "ROLLBACK");
        let result = Self::run_on(connection, "ROLLBACK").await;
        state.connection = None;
        result
    }

    async fn transaction_depth(&self) -> usize {
        self.state.lock().await.depth
    }
}
