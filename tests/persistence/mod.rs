use std::sync::Arc;

use rstest::rstest;
use tempfile::TempDir;

use petrel::config::context::build_context;
use petrel::config::schema::load_config_from_string;
use petrel::connection::Statement;
use petrel::{Condition, ConnectionRegistry, Error, OrderBy, PersistenceContext};

use crate::test_context;
use crate::testutils::{sqlite_connection, Article, CountingConnection, User};

#[tokio::test]
async fn test_soft_deleted_rows_stay_retrievable_by_key() {
    let (context, _) = test_context().await;
    let articles = context.table::<Article>().unwrap();

    for (id, title) in [(1, "one"), (2, "two"), (3, "three")] {
        articles
            .save(&mut articles.track(Article::new(id, title)))
            .await
            .unwrap();
    }

    let mut two = articles.find_by_pk(2).await.unwrap().unwrap();
    articles.delete(&mut two).await.unwrap();
    assert!(two.is_deleted());

    let live = articles
        .find_all(&Condition::new(), &OrderBy::new().asc("id"), None, None)
        .await
        .unwrap();
    assert_eq!(
        live.iter().map(|a| a.id).collect::<Vec<_>>(),
        vec![1, 3]
    );
    assert_eq!(articles.count_all(&Condition::new()).await.unwrap(), 2);

    let raw = articles
        .find_one(&Condition::new().eq("id", 2).not_null("deleted_at"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw.title, "two");
    assert!(raw.is_deleted());
}

#[tokio::test]
async fn test_conflicting_writers_exactly_one_wins() {
    let (context, _) = test_context().await;
    let articles = context.table::<Article>().unwrap();
    articles
        .save(&mut articles.track(Article::new(1, "draft")))
        .await
        .unwrap();

    let mut copies = vec![
        articles.find_by_pk(1).await.unwrap().unwrap(),
        articles.find_by_pk(1).await.unwrap().unwrap(),
    ];

    let mut outcomes = vec![];
    for (i, copy) in copies.iter_mut().enumerate() {
        copy.title = format!("edit {i}");
        outcomes.push(articles.save(copy).await);
    }

    assert!(outcomes[0].is_ok());
    assert!(matches!(
        outcomes[1],
        Err(Error::ConcurrencyConflict { version: 1, .. })
    ));

    // A fresh read can retry
    let mut fresh = articles.find_by_pk(1).await.unwrap().unwrap();
    assert_eq!(fresh.title, "edit 0");
    fresh.title = "edit 1".to_string();
    articles.save(&mut fresh).await.unwrap();
    assert_eq!(fresh.version(), Some(3));
}

#[rstest]
#[case::unchanged(None, 1)]
#[case::changed(Some(40), 2)]
#[tokio::test]
async fn test_save_writes_only_when_changed(#[case] age: Option<i64>, #[case] writes: usize) {
    let spy = Arc::new(CountingConnection::new(sqlite_connection().await));
    let connections = ConnectionRegistry::new();
    connections.register(spy.clone());
    let users = PersistenceContext::new(connections, None)
        .table::<User>()
        .unwrap();

    let mut ann = users.track(User::new("ann", Some(31)));
    users.save(&mut ann).await.unwrap();

    if let Some(age) = age {
        ann.age = Some(age);
        users.save(&mut ann).await.unwrap();
    }
    users.save(&mut ann).await.unwrap();
    users.save(&mut ann).await.unwrap();

    assert_eq!(spy.writes(), writes);
    let stored = users.find_by_pk(1).await.unwrap().unwrap();
    assert_eq!(stored.age, age.or(Some(31)));
}

#[tokio::test]
async fn test_context_from_config_with_read_only_replica() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("petrel.sqlite");
    let config = load_config_from_string(
        &format!(
            r#"
[connections.sqlite]
dsn = "sqlite://{path}"
journal_mode = "delete"

[connections.sqlite_replica]
dsn = "sqlite://{path}"
journal_mode = "delete"
read_only = true

[cache]
type = "none"
"#,
            path = path.display()
        ),
        false,
    )
    .unwrap();
    let context = build_context(config).await.unwrap();

    let writer = context.connections.get("sqlite").unwrap();
    writer
        .execute(&Statement::new(
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, \
             age INTEGER, email TEXT UNIQUE)",
        ))
        .await
        .unwrap();

    let users = context.table::<User>().unwrap();
    users
        .save(&mut users.track(User::new("ann", None).with_email("a@example.com")))
        .await
        .unwrap();

    let replica = context.connections.get("sqlite_replica").unwrap();
    let rows = replica
        .fetch_all(&Statement::new("SELECT name, email FROM users"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["email"], "a@example.com");

    let error = replica
        .execute(&Statement::new("DELETE FROM users"))
        .await
        .unwrap_err();
    assert!(matches!(error, petrel::connection::Error::SqlxError(_)));
    assert!(matches!(
        context.cached_table::<User>(|_: &petrel::CachedTable<User>, _: &petrel::Tracked<User>| {
            Vec::<String>::new()
        })
        .unwrap_err(),
        Error::CacheNotConfigured
    ));
}
