use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use wxkf_gateway::contacts::{Contact, Gender};
use wxkf_gateway::messages::{MessageKind, NormalizedMessage};
use wxkf_gateway::store::{
    self, db_kind_from_url, rewrite_sql, DbKind, CURSOR_PROPERTY_KEY,
};

async fn memory_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    // A single connection keeps every query on the same in-memory database.
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    store::init_store(&pool, DbKind::Sqlite).await.unwrap();
    pool
}

fn sample_message(id: &str) -> NormalizedMessage {
    NormalizedMessage {
        id: id.to_string(),
        talker_id: "user-1".to_string(),
        listener_id: "kf-1".to_string(),
        timestamp_ms: 1_710_000_000_000,
        kind: MessageKind::Text,
        text: Some("hello".to_string()),
        media_id: None,
        media_oss_url: None,
        filename: None,
        location: None,
        link: None,
        mini_program: None,
        contact_id: None,
    }
}

#[test]
fn test_db_kind_from_url() {
    assert_eq!(db_kind_from_url("sqlite::memory:"), DbKind::Sqlite);
    assert_eq!(db_kind_from_url("SQLite://state.db"), DbKind::Sqlite);
    assert_eq!(db_kind_from_url("postgres://localhost/db"), DbKind::Postgres);
    assert_eq!(db_kind_from_url("postgresql://localhost/db"), DbKind::Postgres);
}

#[test]
fn test_rewrite_sql_postgres_numbering() {
    let sql = "INSERT INTO properties (key, value, updated_at) VALUES (?, ?, ?)";
    assert_eq!(
        rewrite_sql(sql, DbKind::Postgres).as_ref(),
        "INSERT INTO properties (key, value, updated_at) VALUES ($1, $2, $3)"
    );
    assert_eq!(rewrite_sql(sql, DbKind::Sqlite).as_ref(), sql);
}

#[tokio::test]
async fn test_message_dedup_by_id() {
    let pool = memory_pool().await;

    assert!(!store::message_exists(&pool, DbKind::Sqlite, "m-1").await.unwrap());
    store::upsert_message(&pool, DbKind::Sqlite, &sample_message("m-1"))
        .await
        .unwrap();
    assert!(store::message_exists(&pool, DbKind::Sqlite, "m-1").await.unwrap());

    // Replaying the same id keeps a single row.
    store::upsert_message(&pool, DbKind::Sqlite, &sample_message("m-1"))
        .await
        .unwrap();
    assert_eq!(store::count_messages(&pool, DbKind::Sqlite).await.unwrap(), 1);
}

#[tokio::test]
async fn test_message_round_trip() {
    let pool = memory_pool().await;
    let mut message = sample_message("m-2");
    message.media_id = Some("MEDIA9".to_string());
    message.kind = MessageKind::Image;
    message.text = None;
    store::upsert_message(&pool, DbKind::Sqlite, &message).await.unwrap();

    let loaded = store::get_message(&pool, DbKind::Sqlite, "m-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.kind, MessageKind::Image);
    assert_eq!(loaded.media_id.as_deref(), Some("MEDIA9"));
    assert_eq!(loaded.talker_id, "user-1");

    assert!(store::get_message(&pool, DbKind::Sqlite, "missing")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_message_update_attaches_media_url() {
    let pool = memory_pool().await;
    let mut message = sample_message("m-3");
    store::upsert_message(&pool, DbKind::Sqlite, &message).await.unwrap();

    message.media_oss_url = Some("https://oss.example.com/m-3".to_string());
    message.filename = Some("photo.jpg".to_string());
    store::upsert_message(&pool, DbKind::Sqlite, &message).await.unwrap();

    let loaded = store::get_message(&pool, DbKind::Sqlite, "m-3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        loaded.media_oss_url.as_deref(),
        Some("https://oss.example.com/m-3")
    );
    assert_eq!(store::count_messages(&pool, DbKind::Sqlite).await.unwrap(), 1);
}

#[tokio::test]
async fn test_cursor_property_round_trip() {
    let pool = memory_pool().await;

    assert!(!store::has_property(&pool, DbKind::Sqlite, CURSOR_PROPERTY_KEY)
        .await
        .unwrap());
    store::set_property(&pool, DbKind::Sqlite, CURSOR_PROPERTY_KEY, "CURSOR-1")
        .await
        .unwrap();
    assert_eq!(
        store::get_property(&pool, DbKind::Sqlite, CURSOR_PROPERTY_KEY)
            .await
            .unwrap()
            .as_deref(),
        Some("CURSOR-1")
    );

    // Overwrites in place.
    store::set_property(&pool, DbKind::Sqlite, CURSOR_PROPERTY_KEY, "CURSOR-2")
        .await
        .unwrap();
    assert_eq!(
        store::get_property(&pool, DbKind::Sqlite, CURSOR_PROPERTY_KEY)
            .await
            .unwrap()
            .as_deref(),
        Some("CURSOR-2")
    );
}

#[tokio::test]
async fn test_contact_round_trip() {
    let pool = memory_pool().await;
    let contact = Contact {
        id: "wm-contact-1".to_string(),
        name: "Ada".to_string(),
        avatar: "https://example.com/a.png".to_string(),
        gender: Gender::Female,
        union_id: None,
    };
    store::upsert_contact(&pool, DbKind::Sqlite, &contact).await.unwrap();

    let loaded = store::get_contact(&pool, DbKind::Sqlite, "wm-contact-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.name, "Ada");
    assert_eq!(loaded.gender, Gender::Female);

    assert!(store::get_contact(&pool, DbKind::Sqlite, "nope")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_media_cache_hit_and_miss() {
    let pool = memory_pool().await;

    assert!(store::get_cached_media(&pool, DbKind::Sqlite, "hash-1")
        .await
        .unwrap()
        .is_none());

    store::put_cached_media(&pool, DbKind::Sqlite, "hash-1", "MEDIA-1", "image")
        .await
        .unwrap();
    let entry = store::get_cached_media(&pool, DbKind::Sqlite, "hash-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.media_id, "MEDIA-1");
    assert_eq!(entry.media_type, "image");

    // A re-upload refreshes the entry.
    store::put_cached_media(&pool, DbKind::Sqlite, "hash-1", "MEDIA-2", "image")
        .await
        .unwrap();
    let entry = store::get_cached_media(&pool, DbKind::Sqlite, "hash-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.media_id, "MEDIA-2");
}
