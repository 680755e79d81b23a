//! Table persistence engine: CRUD for one entity type against one table.

pub mod condition;
pub mod config;

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

pub use condition::{Condition, Direction, Filter, Operator, OrderBy};
pub use config::TableConfig;

use crate::connection::{Connection, Statement};
use crate::entity::{Entity, HydrationError, Tracked};
use crate::error::{Error, Result};
use crate::schema::{Json, Row, Schema, Value, DELETED_AT, VERSION};

/// Primary key value for lookups
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Single(Json),
    /// Column -> value for every primary key column
    Composite(Row),
}

impl From<Json> for Key {
    fn from(value: Json) -> Self {
        Key::Single(value)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Single(value.into())
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Single(value.into())
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Single(value.into())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Single(value.into())
    }
}

impl From<Row> for Key {
    fn from(value: Row) -> Self {
        Key::Composite(value)
    }
}

/// Write side of a table, shared by the plain engine and its cached decorator so
/// the transaction coordinator can drive either.
#[async_trait]
pub trait Persistence<E: Entity>: Send + Sync + Debug {
    fn config(&self) -> &TableConfig;

    fn connection(&self) -> &Arc<dyn Connection>;

    async fn save(&self, entity: &mut Tracked<E>) -> Result<()>;

    async fn delete(&self, entity: &mut Tracked<E>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Table<E: Entity> {
    config: TableConfig,
    schema: Arc<Schema>,
    connection: Arc<dyn Connection>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Table<E> {
    pub fn new(schema: Arc<Schema>, connection: Arc<dyn Connection>) -> Result<Self> {
        let config = TableConfig::from_schema(&schema)?;
        Ok(Self {
            config,
            schema,
            connection,
            _entity: PhantomData,
        })
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Wrap a freshly constructed entity; it stays new until saved
    pub fn track(&self, entity: E) -> Tracked<E> {
        Tracked::new(self.schema.clone(), entity)
    }

    pub async fn save(&self, entity: &mut Tracked<E>) -> Result<()> {
        if entity.is_new() {
            return self.insert(entity).await;
        }

        let mut changed = entity.changed_columns();
        if changed.is_empty() {
            debug!(table = %self.config.table_name, "Nothing changed, skipping update");
            return Ok(());
        }

        let condition = self.update_condition(entity)?;
        if !self.config.optimistic_lock {
            self.connection
                .execute(&self.update_statement(&changed, &condition))
                .await?;
            entity.reset_changed_columns();
            return Ok(());
        }

        // The counter only moves through the conditional increment below
        changed.shift_remove(VERSION);
        let version = entity
            .old_value(VERSION)
            .as_i64()
            .ok_or_else(|| HydrationError::InvalidValue {
                column: VERSION.to_string(),
                reason: "persisted entity has no version".to_string(),
            })?;

        self.connection.begin().await?;
        if let Err(error) = self.versioned_update(&changed, &condition, version).await {
            if let Err(rollback_error) = self.connection.rollback().await {
                warn!("Failed rolling back {}: {rollback_error}", self.config.table_name);
            }
            return Err(error);
        }
        self.connection.commit().await?;

        entity.assign(VERSION, Value::Integer(version + 1))?;
        entity.reset_changed_columns();
        Ok(())
    }

    async fn insert(&self, entity: &mut Tracked<E>) -> Result<()> {
        let row = entity.to_row();

        let mut statement = Statement::new("INSERT INTO ");
        statement.push_identifier(&self.config.table_name);
        if row.is_empty() {
            statement.push(" DEFAULT VALUES");
        } else {
            statement
                .push(" (")
                .push_separated(row.keys(), ", ", |s, column| {
                    s.push_identifier(column);
                })
                .push(") VALUES (")
                .push_separated(row.values(), ", ", |s, value| {
                    s.push_bind(value.clone());
                })
                .push(")");
        }

        let result = self.connection.execute(&statement).await?;
        match &self.config.auto_increment {
            Some(column) => {
                let id = result
                    .last_insert_id
                    .ok_or_else(|| Error::MissingInsertId {
                        table: self.config.table_name.clone(),
                    })?;
                let mut row = row;
                row.insert(column.clone(), Json::from(id));
                *entity = Tracked::from_row(self.schema.clone(), &row)?;
            }
            None => entity.reset_changed_columns(),
        }
        Ok(())
    }

    async fn versioned_update(
        &self,
        changed: &Row,
        condition: &Condition,
        version: i64,
    ) -> Result<()> {
        // Bump the counter first: the data update may rewrite columns the
        // condition matches on (the deletion marker, a changed key)
        let mut statement = Statement::new("UPDATE ");
        statement
            .push_identifier(&self.config.table_name)
            .push(" SET ")
            .push_identifier(VERSION)
            .push(" = ")
            .push_identifier(VERSION)
            .push(" + 1 WHERE ");
        condition.clone().eq(VERSION, version).push_to(&mut statement);

        let result = self.connection.execute(&statement).await?;
        if result.rows_affected == 0 {
            return Err(Error::ConcurrencyConflict {
                table: self.config.table_name.clone(),
                version,
            });
        }

        if !changed.is_empty() {
            self.connection
                .execute(&self.update_statement(changed, condition))
                .await?;
        }
        Ok(())
    }

    fn update_statement(&self, changed: &Row, condition: &Condition) -> Statement {
        let mut statement = Statement::new("UPDATE ");
        statement
            .push_identifier(&self.config.table_name)
            .push(" SET ")
            .push_separated(changed, ", ", |s, (column, value)| {
                s.push_identifier(column).push(" = ").push_bind(value.clone());
            })
            .push(" WHERE ");
        condition.push_to(&mut statement);
        statement
    }

    /// Primary key of the persisted row, scoped to live rows when it was live
    fn update_condition(&self, entity: &Tracked<E>) -> Result<Condition> {
        let condition = self.pk_condition(entity)?;
        if self.config.soft_delete && entity.old_value(DELETED_AT).is_null() {
            return Ok(condition.is_null(DELETED_AT));
        }
        Ok(condition)
    }

    /// Equality on the primary key columns, taken from the snapshot when the
    /// entity is persisted (so a changed key still addresses the stored row)
    pub fn pk_condition(&self, entity: &Tracked<E>) -> Result<Condition> {
        let row = match entity.snapshot() {
            Some(snapshot) => snapshot.clone(),
            None => entity.to_row(),
        };

        self.config
            .primary_keys
            .iter()
            .try_fold(Condition::new(), |condition, column| {
                match row.get(column) {
                    Some(value) if !value.is_null() => Ok(condition.eq(column.clone(), value.clone())),
                    _ => Err(Error::InvalidPrimaryKey {
                        table: self.config.table_name.clone(),
                        reason: format!("column {column:?} has no value"),
                    }),
                }
            })
    }

    pub async fn delete(&self, entity: &mut Tracked<E>) -> Result<()> {
        if self.config.soft_delete {
            let previous = entity
                .entity()
                .values()
                .remove(DELETED_AT)
                .unwrap_or(Value::Null);
            entity.assign(DELETED_AT, Value::DateTime(Utc::now()))?;
            if let Err(error) = self.save(entity).await {
                entity.assign(DELETED_AT, previous)?;
                return Err(error);
            }
            return Ok(());
        }

        let condition = self.pk_condition(entity)?;
        let mut statement = Statement::new("DELETE FROM ");
        statement
            .push_identifier(&self.config.table_name)
            .push(" WHERE ");
        condition.push_to(&mut statement);

        self.connection.execute(&statement).await?;
        Ok(())
    }

    /// Save every entity in one transaction; on failure nothing is written and
    /// the entities are restored to their state before the call
    pub async fn save_many(&self, entities: &mut [Tracked<E>]) -> Result<()> {
        self.batch(entities, false).await
    }

    pub async fn delete_many(&self, entities: &mut [Tracked<E>]) -> Result<()> {
        self.batch(entities, true).await
    }

    async fn batch(&self, entities: &mut [Tracked<E>], delete: bool) -> Result<()> {
        let backup = entities.to_vec();

        self.connection.begin().await?;
        for entity in entities.iter_mut() {
            let result = if delete {
                self.delete(entity).await
            } else {
                self.save(entity).await
            };

            if let Err(error) = result {
                if let Err(rollback_error) = self.connection.rollback().await {
                    warn!("Failed rolling back {}: {rollback_error}", self.config.table_name);
                }
                entities.clone_from_slice(&backup);
                return Err(error);
            }
        }

        if let Err(error) = self.connection.commit().await {
            entities.clone_from_slice(&backup);
            return Err(error.into());
        }
        Ok(())
    }

    /// Hide soft-deleted rows unless the caller filters on the marker themselves
    fn scoped(&self, condition: &Condition) -> Condition {
        if self.config.soft_delete && !condition.constrains(DELETED_AT) {
            condition.clone().is_null(DELETED_AT)
        } else {
            condition.clone()
        }
    }

    fn select(
        &self,
        columns: &str,
        condition: &Condition,
        order_by: Option<&OrderBy>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Statement {
        let condition = self.scoped(condition);

        let mut statement = Statement::new(format!("SELECT {columns} FROM "));
        statement.push_identifier(&self.config.table_name);
        if !condition.is_empty() {
            statement.push(" WHERE ");
            condition.push_to(&mut statement);
        }
        if let Some(order_by) = order_by.filter(|o| !o.is_empty()) {
            statement.push(" ORDER BY ");
            order_by.push_to(&mut statement);
        }
        match (limit, offset) {
            (Some(limit), _) => {
                statement.push(format!(" LIMIT {limit}"));
            }
            // SQLite needs a LIMIT before an OFFSET
            (None, Some(_)) => {
                statement.push(" LIMIT -1");
            }
            (None, None) => {}
        }
        if let Some(offset) = offset {
            statement.push(format!(" OFFSET {offset}"));
        }
        statement
    }

    pub fn key_condition(&self, key: impl Into<Key>) -> Result<Condition> {
        let invalid = |reason: String| Error::InvalidPrimaryKey {
            table: self.config.table_name.clone(),
            reason,
        };

        match key.into() {
            Key::Single(value) => match self.config.primary_keys.as_slice() {
                [column] => Ok(Condition::new().eq(column.clone(), value)),
                columns => Err(invalid(format!(
                    "expected values for {} key columns",
                    columns.len()
                ))),
            },
            Key::Composite(row) => {
                self.config
                    .primary_keys
                    .iter()
                    .try_fold(Condition::new(), |condition, column| match row.get(column) {
                        Some(value) => Ok(condition.eq(column.clone(), value.clone())),
                        None => Err(invalid(format!("missing value for {column:?}"))),
                    })
            }
        }
    }

    pub async fn find_by_pk(&self, key: impl Into<Key>) -> Result<Option<Tracked<E>>> {
        let condition = self.key_condition(key)?;
        self.find_one(&condition).await
    }

    pub async fn find_one(&self, condition: &Condition) -> Result<Option<Tracked<E>>> {
        let row = self.find_one_row(condition).await?;
        Ok(row.and_then(|row| self.hydrate_row(&row)))
    }

    /// Raw storage row of the first match
    pub async fn find_one_row(&self, condition: &Condition) -> Result<Option<Row>> {
        let statement = self.select("*", condition, None, Some(1), None);
        Ok(self.connection.fetch_optional(&statement).await?)
    }

    pub async fn find_all(
        &self,
        condition: &Condition,
        order_by: &OrderBy,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Tracked<E>>> {
        let rows = self.find_rows(condition, order_by, limit, offset).await?;
        Ok(self.create_entities(rows))
    }

    /// Raw storage rows of every match
    pub async fn find_rows(
        &self,
        condition: &Condition,
        order_by: &OrderBy,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Row>> {
        let statement = self.select("*", condition, Some(order_by), limit, offset);
        Ok(self.connection.fetch_all(&statement).await?)
    }

    pub async fn count_all(&self, condition: &Condition) -> Result<i64> {
        let statement = self.select("COUNT(*) AS \"count\"", condition, None, None, None);
        let row = self.connection.fetch_optional(&statement).await?;
        Ok(row
            .and_then(|row| row.get("count").and_then(Json::as_i64))
            .unwrap_or(0))
    }

    /// Fetch several rows of a single-column primary key through one `IN` query
    pub async fn find_multi<I, V>(&self, keys: I) -> Result<Vec<Tracked<E>>>
    where
        I: IntoIterator<Item = V> + Send,
        V: Into<Json>,
    {
        let [column] = self.config.primary_keys.as_slice() else {
            return Err(Error::InvalidPrimaryKey {
                table: self.config.table_name.clone(),
                reason: "multi-key lookups need a single-column primary key".to_string(),
            });
        };

        let condition = Condition::new().any_of(column.clone(), keys);
        self.find_all(&condition, &OrderBy::new(), None, None).await
    }

    /// Build a persisted entity from raw data; malformed data yields `None`
    pub fn create_entity(&self, data: &Json) -> Option<Tracked<E>> {
        match Tracked::from_json(self.schema.clone(), data) {
            Ok(entity) => Some(entity),
            Err(error) => {
                warn!("Skipping malformed {} data: {error}", self.config.entity);
                None
            }
        }
    }

    /// Forgiving counterpart of [`Tracked::from_row`]
    pub fn hydrate_row(&self, row: &Row) -> Option<Tracked<E>> {
        match Tracked::from_row(self.schema.clone(), row) {
            Ok(entity) => Some(entity),
            Err(error) => {
                warn!("Skipping malformed {} row: {error}", self.config.entity);
                None
            }
        }
    }

    /// Build persisted entities from raw rows, leaving out the malformed ones
    pub fn create_entities(&self, rows: Vec<Row>) -> Vec<Tracked<E>> {
        rows.iter()
            .filter_map(|row| self.hydrate_row(row))
            .collect()
    }
}

#[async_trait]
impl<E: Entity> Persistence<E> for Table<E> {
    fn config(&self) -> &TableConfig {
        &self.config
    }

    fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    async fn save(&self, entity: &mut Tracked<E>) -> Result<()> {
        Table::save(self, entity).await
    }

    async fn delete(&self, entity: &mut Tracked<E>) -> Result<()> {
        Table::delete(self, entity).await
    }
}
