use assert_unordered::assert_eq_unordered;
use serde_json::json;
use sha1::{Digest, Sha1};

use petrel::cache::{CacheBackend, KeyKind};
use petrel::schema::Json;
use petrel::{CachedTable, Condition, OrderBy, Tracked};

use crate::test_context;
use crate::testutils::{Post, User};

/// Keys of every query filtering users by age, for both the stored and the
/// current age, plus the row itself
fn user_keys(table: &CachedTable<User>, user: &Tracked<User>) -> Vec<String> {
    let mut keys = vec![];
    for age in [user.old_value("age"), Json::from(user.age)] {
        let by_age = Condition::new().eq("age", age);
        keys.push(table.count_key(&by_age));
        keys.push(table.list_key(&by_age, &OrderBy::new().asc("name"), None));
    }
    keys.extend(table.entity_key(user));
    keys
}

fn no_keys(_: &CachedTable<Post>, _: &Tracked<Post>) -> Vec<String> {
    vec![]
}

#[tokio::test]
async fn test_changed_field_invalidates_old_and_new_keys() {
    let (context, cache) = test_context().await;
    let users = context.cached_table::<User>(user_keys).unwrap();

    let mut ann = users.table().track(User::new("ann", Some(31)));
    users.save(&mut ann).await.unwrap();

    let at = |age: i64| Condition::new().eq("age", age);
    let by_name = OrderBy::new().asc("name");

    assert_eq!(users.count_all_cached(&at(31), None).await.unwrap(), 1);
    assert_eq!(users.count_all_cached(&at(32), None).await.unwrap(), 0);
    assert_eq!(
        users.find_all_cached(&at(31), &by_name, None, None).await.unwrap().len(),
        1
    );
    for key in [
        users.count_key(&at(31)),
        users.count_key(&at(32)),
        users.list_key(&at(31), &by_name, None),
    ] {
        assert!(cache.get(&key).await.unwrap().is_some(), "{key} is cached");
    }

    ann.age = Some(32);
    users.save(&mut ann).await.unwrap();

    for key in [
        users.count_key(&at(31)),
        users.count_key(&at(32)),
        users.list_key(&at(31), &by_name, None),
    ] {
        assert!(cache.get(&key).await.unwrap().is_none(), "{key} is invalidated");
    }
    assert_eq!(users.count_all_cached(&at(31), None).await.unwrap(), 0);
    assert_eq!(users.count_all_cached(&at(32), None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_invalidates_point_key() {
    let (context, cache) = test_context().await;
    let users = context.cached_table::<User>(user_keys).unwrap();

    let mut ann = users.table().track(User::new("ann", None));
    users.save(&mut ann).await.unwrap();
    assert!(users.find_by_pk_cached(1, None).await.unwrap().is_some());

    let key = users.pk_key(1).unwrap();
    assert_eq!(key, users.entity_key(&ann).unwrap());
    assert!(cache.get(&key).await.unwrap().is_some());

    users.delete(&mut ann).await.unwrap();
    assert!(cache.get(&key).await.unwrap().is_none());
    assert!(users.find_by_pk_cached(1, None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_batch_purges_union_of_keys() {
    let (context, cache) = test_context().await;
    let users = context.cached_table::<User>(user_keys).unwrap();

    let mut batch = vec![
        users.table().track(User::new("ann", Some(20))),
        users.table().track(User::new("bob", Some(30))),
    ];
    users.save_many(&mut batch).await.unwrap();

    let at = |age: i64| Condition::new().eq("age", age);
    assert_eq!(users.count_all_cached(&at(20), None).await.unwrap(), 1);
    assert_eq!(users.count_all_cached(&at(30), None).await.unwrap(), 1);

    users.delete_many(&mut batch).await.unwrap();
    assert!(cache.get(&users.count_key(&at(20))).await.unwrap().is_none());
    assert!(cache.get(&users.count_key(&at(30))).await.unwrap().is_none());
    assert_eq!(users.count_all_cached(&at(20), None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_composite_and_long_keys() {
    let (context, _) = test_context().await;
    let posts = context.cached_table::<Post>(no_keys).unwrap();

    let key = Condition::new().eq("post_id", 456).eq("user_id", 123);
    assert_eq!(
        posts.one_key(&key),
        "sqlite.TestComposite.v1.o.user_id_123_post_id_456"
    );

    let long = "x".repeat(80);
    let full = format!("sqlite.TestComposite.v1.c.message_{long}");
    assert_eq!(
        posts.count_key(&Condition::new().eq("message", long.as_str())),
        hex::encode(Sha1::digest(full.as_bytes()))
    );
    assert_eq!(
        posts.build_key(KeyKind::Count, &[json!({"message": long.as_str()})]),
        posts.count_key(&Condition::new().eq("message", long.as_str()))
    );
}

#[tokio::test]
async fn test_multi_get_mixes_hits_and_misses() {
    let (context, cache) = test_context().await;
    let posts = context.cached_table::<Post>(no_keys).unwrap();
    let users = context.cached_table::<User>(user_keys).unwrap();

    for name in ["ann", "bob", "cat", "dan"] {
        users
            .save(&mut users.table().track(User::new(name, None)))
            .await
            .unwrap();
    }
    users.find_by_pk_cached(2, None).await.unwrap();
    users.find_by_pk_cached(4, None).await.unwrap();

    let found = users.find_multi_cached([4, 3, 2, 1, 99], None).await.unwrap();
    assert_eq_unordered!(
        found.iter().map(|user| user.name.clone()).collect::<Vec<_>>(),
        vec![
            "ann".to_string(),
            "bob".to_string(),
            "cat".to_string(),
            "dan".to_string()
        ]
    );
    for id in [1, 2, 3, 4] {
        assert!(cache.get(&users.pk_key(id).unwrap()).await.unwrap().is_some());
    }
    assert!(cache.get(&users.pk_key(99).unwrap()).await.unwrap().is_none());

    // Composite keys cannot go through a multi-get
    assert!(posts.find_multi_cached([1], None).await.is_err());
}
