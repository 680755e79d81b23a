use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::SqliteJournalMode;

use crate::cache::{CacheBackend, CacheError};
use crate::connection::{Connection, ExecuteResult, Result, SqliteConnection, Statement};
use crate::entity::{Entity, HydrationError};
use crate::schema::{
    Castable, EntityDef, EnumCase, EnumColumn, FieldDef, FromValue, Json, Row, SchemaRegistry,
    Value, Values,
};

fn field<T: FromValue>(column: &str, value: Value) -> std::result::Result<T, HydrationError> {
    T::from_value(value).map_err(|reason| HydrationError::InvalidValue {
        column: column.to_string(),
        reason,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Option<i64>,
    pub name: String,
    pub age: Option<i64>,
    pub email: Option<String>,
}

impl User {
    pub fn new(name: &str, age: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            age,
            email: None,
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }
}

impl Entity for User {
    fn definition() -> EntityDef {
        EntityDef::new("User")
            .stored_in("sqlite", "users")
            .field(FieldDef::integer("id").auto_increment())
            .field(FieldDef::string("name").constructor())
            .field(FieldDef::integer("age").nullable())
            .field(FieldDef::string("email").nullable())
    }

    fn construct(values: &mut Values) -> std::result::Result<Self, HydrationError> {
        Ok(Self::new(&values.take::<String>("name")?, None))
    }

    fn assign(&mut self, column: &str, value: Value) -> std::result::Result<(), HydrationError> {
        match column {
            "id" => self.id = field(column, value)?,
            "age" => self.age = field(column, value)?,
            "email" => self.email = field(column, value)?,
            _ => {
                return Err(HydrationError::UnknownColumn {
                    column: column.to_string(),
                })
            }
        }
        Ok(())
    }

    fn values(&self) -> Values {
        Values::new()
            .with("id", self.id)
            .with("name", self.name.as_str())
            .with("age", self.age)
            .with("email", self.email.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub version: i64,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Article {
    pub fn new(id: i64, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            version: 1,
            deleted_at: None,
        }
    }
}

impl Entity for Article {
    fn definition() -> EntityDef {
        EntityDef::new("Article")
            .stored_in("sqlite", "articles")
            .soft_delete()
            .optimistic_lock()
            .field(FieldDef::integer("id").primary_key().constructor())
            .field(FieldDef::string("title").constructor())
            .field(FieldDef::integer("version").default_value(1))
            .field(FieldDef::datetime("deleted_at").nullable())
    }

    fn construct(values: &mut Values) -> std::result::Result<Self, HydrationError> {
        Ok(Self::new(
            values.take("id")?,
            &values.take::<String>("title")?,
        ))
    }

    fn assign(&mut self, column: &str, value: Value) -> std::result::Result<(), HydrationError> {
        match column {
            "version" => self.version = field(column, value)?,
            "deleted_at" => self.deleted_at = field(column, value)?,
            _ => {
                return Err(HydrationError::UnknownColumn {
                    column: column.to_string(),
                })
            }
        }
        Ok(())
    }

    fn values(&self) -> Values {
        Values::new()
            .with("id", self.id)
            .with("title", self.title.as_str())
            .with("version", self.version)
            .with("deleted_at", self.deleted_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub user_id: i64,
    pub post_id: i64,
    pub message: String,
}

impl Post {
    pub fn new(user_id: i64, post_id: i64, message: &str) -> Self {
        Self {
            user_id,
            post_id,
            message: message.to_string(),
        }
    }
}

impl Entity for Post {
    fn definition() -> EntityDef {
        EntityDef::new("Post")
            .stored_in("sqlite", "TestComposite")
            .field(FieldDef::integer("user_id").primary_key().constructor())
            .field(FieldDef::integer("post_id").primary_key().constructor())
            .field(FieldDef::string("message").constructor())
    }

    fn construct(values: &mut Values) -> std::result::Result<Self, HydrationError> {
        Ok(Self::new(
            values.take("user_id")?,
            values.take("post_id")?,
            &values.take::<String>("message")?,
        ))
    }

    fn values(&self) -> Values {
        Values::new()
            .with("user_id", self.user_id)
            .with("post_id", self.post_id)
            .with("message", self.message.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Active,
    Banned,
}

impl EnumColumn for Status {
    const TYPE_NAME: &'static str = "Status";
    const CASES: &'static [EnumCase] = &[EnumCase::int("Active", 1), EnumCase::int("Banned", 2)];

    fn case_name(&self) -> &'static str {
        match self {
            Status::Active => "Active",
            Status::Banned => "Banned",
        }
    }

    fn from_case_name(name: &str) -> Option<Self> {
        match name {
            "Active" => Some(Status::Active),
            "Banned" => Some(Status::Banned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Celsius(pub f64);

impl Castable for Celsius {
    const TYPE_NAME: &'static str = "Celsius";

    fn cast(raw: &Json) -> std::result::Result<Self, String> {
        raw.as_f64()
            .map(Celsius)
            .ok_or_else(|| format!("{raw} is not a temperature"))
    }

    fn uncast(&self) -> Json {
        Json::from(self.0)
    }
}

/// Nested entity, never stored on its own
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub city: String,
    pub zip: Option<String>,
}

impl Entity for Address {
    fn definition() -> EntityDef {
        EntityDef::new("Address")
            .field(FieldDef::string("city").constructor())
            .field(FieldDef::string("zip").nullable())
    }

    fn construct(values: &mut Values) -> std::result::Result<Self, HydrationError> {
        Ok(Self {
            city: values.take("city")?,
            zip: None,
        })
    }

    fn assign(&mut self, column: &str, value: Value) -> std::result::Result<(), HydrationError> {
        match column {
            "zip" => self.zip = field(column, value)?,
            _ => {
                return Err(HydrationError::UnknownColumn {
                    column: column.to_string(),
                })
            }
        }
        Ok(())
    }

    fn values(&self) -> Values {
        Values::new()
            .with("city", self.city.as_str())
            .with("zip", self.zip.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub id: i64,
    pub status: Status,
    pub temperature: Celsius,
    pub location: Option<Address>,
}

impl Entity for Reading {
    fn definition() -> EntityDef {
        EntityDef::new("Reading")
            .stored_in("sqlite", "readings")
            .field(FieldDef::integer("id").primary_key().constructor())
            .field(FieldDef::class("status", "Status").constructor())
            .field(FieldDef::class("temperature", "Celsius").constructor())
            .field(FieldDef::class("location", "Address").nullable().constructor())
    }

    fn construct(values: &mut Values) -> std::result::Result<Self, HydrationError> {
        Ok(Self {
            id: values.take("id")?,
            status: values.take_enum("status")?,
            temperature: values.take_custom("temperature")?,
            location: values.take_optional_entity("location")?,
        })
    }

    fn values(&self) -> Values {
        let location = match &self.location {
            Some(address) => Value::Entity(address.values()),
            None => Value::Null,
        };
        Values::new()
            .with("id", self.id)
            .with("status", Value::from_enum(&self.status))
            .with("temperature", Value::custom(self.temperature.clone()))
            .with("location", location)
    }
}

/// Refers to itself, which schemas cannot express
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub parent: Option<Box<Node>>,
}

impl Entity for Node {
    fn definition() -> EntityDef {
        EntityDef::new("Node")
            .field(FieldDef::integer("id").primary_key().constructor())
            .field(FieldDef::class("parent", "Node").nullable().constructor())
    }

    fn construct(values: &mut Values) -> std::result::Result<Self, HydrationError> {
        Ok(Self {
            id: values.take("id")?,
            parent: values.take_optional_entity::<Node>("parent")?.map(Box::new),
        })
    }

    fn values(&self) -> Values {
        let parent = match &self.parent {
            Some(parent) => Value::Entity(parent.values()),
            None => Value::Null,
        };
        Values::new().with("id", self.id).with("parent", parent)
    }
}

pub fn reading_registry() -> SchemaRegistry {
    let registry = SchemaRegistry::new();
    registry
        .register_enum::<Status>()
        .register_castable::<Celsius>()
        .register_entity::<Address>();
    registry
}

const FIXTURE_TABLES: &[&str] = &[
    r#"CREATE TABLE users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        age INTEGER,
        email TEXT UNIQUE
    )"#,
    r#"CREATE TABLE articles (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        deleted_at TEXT
    )"#,
    r#"CREATE TABLE "TestComposite" (
        user_id INTEGER NOT NULL,
        post_id INTEGER NOT NULL,
        message TEXT NOT NULL,
        PRIMARY KEY (user_id, post_id)
    )"#,
    r#"CREATE TABLE readings (
        id INTEGER PRIMARY KEY,
        status INTEGER NOT NULL,
        temperature REAL NOT NULL,
        location TEXT
    )"#,
];

/// Fresh in-memory database named "sqlite" with every fixture table created
pub async fn sqlite_connection() -> Arc<dyn Connection> {
    let connection =
        SqliteConnection::try_new("sqlite", "sqlite::memory:", SqliteJournalMode::Wal, 1)
            .await
            .unwrap();
    for sql in FIXTURE_TABLES {
        connection.execute(&Statement::new(*sql)).await.unwrap();
    }
    Arc::new(connection)
}

/// Connection spy recording every write statement
#[derive(Debug)]
pub struct CountingConnection {
    inner: Arc<dyn Connection>,
    writes: AtomicUsize,
    statements: Mutex<Vec<String>>,
}

impl CountingConnection {
    pub fn new(inner: Arc<dyn Connection>) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
            statements: Mutex::new(vec![]),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }
}

#[async_trait]
impl Connection for CountingConnection {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_all(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.inner.fetch_all(statement).await
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecuteResult> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.statements.lock().push(statement.sql.clone());
        self.inner.execute(statement).await
    }

    async fn begin(&self) -> Result<()> {
        self.inner.begin().await
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.rollback().await
    }

    async fn transaction_depth(&self) -> usize {
        self.inner.transaction_depth().await
    }
}

/// Cache backend that is always down
#[derive(Debug)]
pub struct FailingCache;

fn unavailable<T>() -> std::result::Result<T, CacheError> {
    Err(CacheError::Unavailable {
        reason: "connection refused".to_string(),
    })
}

#[async_trait]
impl CacheBackend for FailingCache {
    async fn get(&self, _key: &str) -> std::result::Result<Option<Json>, CacheError> {
        unavailable()
    }

    async fn set(
        &self,
        _key: &str,
        _value: Json,
        _ttl: Option<Duration>,
    ) -> std::result::Result<(), CacheError> {
        unavailable()
    }

    async fn delete(&self, _key: &str) -> std::result::Result<(), CacheError> {
        unavailable()
    }
}
