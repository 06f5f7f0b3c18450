use crate::contacts::Contact;
use crate::error::GatewayError;
use crate::messages::NormalizedMessage;
use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};
use std::borrow::Cow;

/// Property key holding the persisted sync cursor.
pub const CURSOR_PROPERTY_KEY: &str = "messageSeq";

/// Cached media ids become unusable on the vendor side after three days.
pub const MEDIA_EXPIRE_SECONDS: i64 = 3 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaCacheEntry {
    pub content_hash: String,
    pub media_id: String,
    pub media_type: String,
    pub uploaded_at: DateTime<Utc>,
}

fn now_i64() -> i64 {
    Utc::now().timestamp()
}

fn json_store_err(err: serde_json::Error) -> GatewayError {
    GatewayError::Store(format!("record serialization failed: {err}"))
}

pub async fn init_store(pool: &AnyPool, kind: DbKind) -> Result<(), GatewayError> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp_ms)"#,
        r#"CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS properties (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS media_cache (
            content_hash TEXT PRIMARY KEY,
            media_id TEXT NOT NULL,
            media_type TEXT NOT NULL,
            uploaded_at INTEGER NOT NULL
        )"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

pub async fn message_exists(pool: &AnyPool, kind: DbKind, id: &str) -> Result<bool, GatewayError> {
    let sql = rewrite_sql("SELECT 1 FROM messages WHERE id = ? LIMIT 1", kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    Ok(row.is_some())
}

/// Insert-or-replace keyed by message id; replaying a page the vendor already
/// delivered rewrites the same row instead of duplicating it.
pub async fn upsert_message(
    pool: &AnyPool,
    kind: DbKind,
    message: &NormalizedMessage,
) -> Result<(), GatewayError> {
    let payload = serde_json::to_string(message).map_err(json_store_err)?;
    let sql = rewrite_sql(
        r#"INSERT INTO messages (id, payload, timestamp_ms, created_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
               payload=excluded.payload,
               timestamp_ms=excluded.timestamp_ms"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&message.id)
        .bind(payload)
        .bind(message.timestamp_ms)
        .bind(now_i64())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_message(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<NormalizedMessage>, GatewayError> {
    let sql = rewrite_sql("SELECT payload FROM messages WHERE id = ?", kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => {
            let payload: String = row.try_get("payload")?;
            let message = serde_json::from_str(&payload).map_err(json_store_err)?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}

pub async fn count_messages(pool: &AnyPool, kind: DbKind) -> Result<i64, GatewayError> {
    let sql = rewrite_sql("SELECT COUNT(1) AS n FROM messages", kind);
    let row = sqlx::query(sql.as_ref()).fetch_one(pool).await?;
    Ok(row.try_get::<i64, _>("n")?)
}

pub async fn upsert_contact(
    pool: &AnyPool,
    kind: DbKind,
    contact: &Contact,
) -> Result<(), GatewayError> {
    let payload = serde_json::to_string(contact).map_err(json_store_err)?;
    let sql = rewrite_sql(
        r#"INSERT INTO contacts (id, payload, updated_at)
           VALUES (?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
               payload=excluded.payload,
               updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&contact.id)
        .bind(payload)
        .bind(now_i64())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_contact(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<Contact>, GatewayError> {
    let sql = rewrite_sql("SELECT payload FROM contacts WHERE id = ?", kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => {
            let payload: String = row.try_get("payload")?;
            let contact = serde_json::from_str(&payload).map_err(json_store_err)?;
            Ok(Some(contact))
        }
        None => Ok(None),
    }
}

pub async fn set_property(
    pool: &AnyPool,
    kind: DbKind,
    key: &str,
    value: &str,
) -> Result<(), GatewayError> {
    let sql = rewrite_sql(
        r#"INSERT INTO properties (key, value, updated_at)
           VALUES (?, ?, ?)
           ON CONFLICT(key) DO UPDATE SET
               value=excluded.value,
               updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(key)
        .bind(value)
        .bind(now_i64())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_property(
    pool: &AnyPool,
    kind: DbKind,
    key: &str,
) -> Result<Option<String>, GatewayError> {
    let sql = rewrite_sql("SELECT value FROM properties WHERE key = ?", kind);
    let row = sqlx::query(sql.as_ref()).bind(key).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(row.try_get("value")?)),
        None => Ok(None),
    }
}

pub async fn has_property(pool: &AnyPool, kind: DbKind, key: &str) -> Result<bool, GatewayError> {
    Ok(get_property(pool, kind, key).await?.is_some())
}

/// Returns the cached media id for a content hash, skipping entries past the
/// vendor's validity window.
pub async fn get_cached_media(
    pool: &AnyPool,
    kind: DbKind,
    content_hash: &str,
) -> Result<Option<MediaCacheEntry>, GatewayError> {
    let sql = rewrite_sql(
        "SELECT content_hash, media_id, media_type, uploaded_at FROM media_cache WHERE content_hash = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(content_hash)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let uploaded_at: i64 = row.try_get("uploaded_at")?;
    if now_i64() - uploaded_at >= MEDIA_EXPIRE_SECONDS {
        return Ok(None);
    }

    Ok(Some(MediaCacheEntry {
        content_hash: row.try_get("content_hash")?,
        media_id: row.try_get("media_id")?,
        media_type: row.try_get("media_type")?,
        uploaded_at: chrono::TimeZone::timestamp_opt(&Utc, uploaded_at, 0)
            .single()
            .unwrap_or_else(Utc::now),
    }))
}

pub async fn put_cached_media(
    pool: &AnyPool,
    kind: DbKind,
    content_hash: &str,
    media_id: &str,
    media_type: &str,
) -> Result<(), GatewayError> {
    let sql = rewrite_sql(
        r#"INSERT INTO media_cache (content_hash, media_id, media_type, uploaded_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(content_hash) DO UPDATE SET
               media_id=excluded.media_id,
               media_type=excluded.media_type,
               uploaded_at=excluded.uploaded_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(content_hash)
        .bind(media_id)
        .bind(media_type)
        .bind(now_i64())
        .execute(pool)
        .await?;
    Ok(())
}
