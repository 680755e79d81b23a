use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::sqlite::SqliteJournalMode;

use petrel::connection::Statement;
use petrel::entity::HydrationError;
use petrel::{
    CacheBackend, Condition, Connection, ConnectionRegistry, EntityDef, Error, FieldDef, MemoryCache,
    PersistenceContext, SqliteConnection, Value, Values,
};

use crate::testutils::{sqlite_connection, User};

/// Entity living on a second database
#[derive(Debug, Clone, PartialEq)]
struct AuditEntry {
    id: Option<i64>,
    message: String,
}

impl AuditEntry {
    fn new(message: &str) -> Self {
        Self {
            id: None,
            message: message.to_string(),
        }
    }
}

impl petrel::Entity for AuditEntry {
    fn definition() -> EntityDef {
        EntityDef::new("AuditEntry")
            .stored_in("audit", "entries")
            .field(FieldDef::integer("id").auto_increment())
            .field(FieldDef::string("message").constructor())
    }

    fn construct(values: &mut Values) -> Result<Self, HydrationError> {
        Ok(Self::new(&values.take::<String>("message")?))
    }

    fn assign(&mut self, column: &str, value: Value) -> Result<(), HydrationError> {
        match (column, value) {
            ("id", Value::Integer(id)) => self.id = Some(id),
            (column, _) => {
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
            .with("message", self.message.as_str())
    }
}

async fn two_database_context() -> PersistenceContext {
    let audit =
        SqliteConnection::try_new("audit", "sqlite::memory:", SqliteJournalMode::Wal, 1)
            .await
            .unwrap();
    audit
        .execute(&Statement::new(
            "CREATE TABLE entries (id INTEGER PRIMARY KEY AUTOINCREMENT, message TEXT NOT NULL)",
        ))
        .await
        .unwrap();

    let connections = ConnectionRegistry::new();
    connections.register(sqlite_connection().await);
    connections.register(Arc::new(audit));
    PersistenceContext::new(connections, Some(Arc::new(MemoryCache::default())))
        .with_lock_ttl(Duration::from_secs(5))
}

#[tokio::test]
async fn test_commit_spans_connections() {
    let context = two_database_context().await;
    let users = context.table::<User>().unwrap();
    let entries = context.table::<AuditEntry>().unwrap();

    let mut tx = context.transaction();
    let mut ann = users.track(User::new("ann", None));
    tx.save(&users, &mut ann).await.unwrap();
    tx.save(&entries, &mut entries.track(AuditEntry::new("created ann")))
        .await
        .unwrap();
    assert_eq!(tx.connections(), vec!["sqlite", "audit"]);

    ann.age = Some(30);
    tx.save(&users, &mut ann).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(users.find_by_pk(1).await.unwrap().unwrap().age, Some(30));
    assert_eq!(entries.count_all(&Condition::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_failure_rolls_back_every_connection() {
    let context = two_database_context().await;
    let users = context.table::<User>().unwrap();
    let entries = context.table::<AuditEntry>().unwrap();

    users
        .save(&mut users.track(User::new("ann", None).with_email("a@example.com")))
        .await
        .unwrap();

    let mut tx = context.transaction();
    tx.save(&entries, &mut entries.track(AuditEntry::new("about to fail")))
        .await
        .unwrap();
    let error = tx
        .save(
            &users,
            &mut users.track(User::new("copy", None).with_email("a@example.com")),
        )
        .await
        .unwrap_err();

    match error {
        Error::Transaction { target, source } => {
            assert_eq!(target, "sqlite");
            assert!(matches!(*source, Error::Connection(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(entries.count_all(&Condition::new()).await.unwrap(), 0);
    assert_eq!(users.count_all(&Condition::new()).await.unwrap(), 1);
    assert_eq!(entries.connection().transaction_depth().await, 0);
}

#[tokio::test]
async fn test_cached_tables_join_transactions() {
    let context = two_database_context().await;
    let users = context
        .cached_table::<User>(|table: &petrel::CachedTable<User>, _: &petrel::Tracked<User>| {
            vec![table.count_key(&Condition::new())]
        })
        .unwrap();

    assert_eq!(users.count_all_cached(&Condition::new(), None).await.unwrap(), 0);

    let mut tx = context.transaction();
    let mut batch = vec![
        users.table().track(User::new("ann", None)),
        users.table().track(User::new("bob", None)),
    ];
    tx.save_many(&users, &mut batch).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(users.count_all_cached(&Condition::new(), None).await.unwrap(), 2);
}

#[tokio::test]
async fn test_lock_excludes_second_transaction() {
    let context = two_database_context().await;
    let cache = context.cache.clone().unwrap();
    let users = context.table::<User>().unwrap();
    let parts = [json!("user"), json!("ann")];

    let mut first = context.transaction();
    first.lock(cache.clone(), &parts, None).await.unwrap();

    let mut second = context.transaction();
    let error = second.lock(cache.clone(), &parts, None).await.unwrap_err();
    assert!(matches!(error, Error::LockAcquisition { .. }));
    second.rollback().await.unwrap();

    first
        .save(&users, &mut users.track(User::new("ann", None)))
        .await
        .unwrap();
    first.commit().await.unwrap();
    assert!(cache.get("petrel.lock.user_ann").await.unwrap().is_none());

    let mut third = context.transaction();
    third
        .lock(cache, &parts, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    third.rollback().await.unwrap();
}
