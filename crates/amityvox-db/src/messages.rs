use crate::{DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::error::DatabaseError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: i64,
    pub channel_id: i64,
    pub author_id: i64,
    pub content: Option<String>,
    pub message_type: i16,
    pub flags: i32,
    pub edited_at: Option<DateTime<Utc>>,
    pub pinned: bool,
    pub reference_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub nonce: Option<String>,
    pub e2ee_header: Option<String>,
}

pub async fn create_message(
    pool: &DbPool,
    id: i64,
    channel_id: i64,
    author_id: i64,
    content: &str,
    message_type: i16,
    reference_id: Option<i64>,
) -> Result<MessageRow, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(
        "INSERT INTO messages (id, channel_id, author_id, content, message_type, reference_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         RETURNING id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header"
    )
    .bind(id)
    .bind(channel_id)
    .bind(author_id)
    .bind(content)
    .bind(message_type)
    .bind(reference_id)
    .fetch_one(pool)
    .await?;

    // Update last_message_id on the channel
    let _ = sqlx::query("UPDATE channels SET last_message_id = ?1 WHERE id = ?2")
        .bind(id)
        .bind(channel_id)
        .execute(pool)
        .await;

    Ok(row)
}

pub async fn get_message(pool: &DbPool, id: i64) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(
        "SELECT id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header
         FROM messages WHERE id = ?1"
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_channel_messages(
    pool: &DbPool,
    channel_id: i64,
    before: Option<i64>,
    after: Option<i64>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = match (before, after) {
        (Some(before_id), _) => {
            sqlx::query_as::<_, MessageRow>(
                "SELECT id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header
                 FROM messages WHERE channel_id = ?1 AND id < ?2 ORDER BY id DESC LIMIT ?3"
            )
            .bind(channel_id)
            .bind(before_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (None, Some(after_id)) => {
            sqlx::query_as::<_, MessageRow>(
                "SELECT id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header
                 FROM messages WHERE channel_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3"
            )
            .bind(channel_id)
            .bind(after_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (None, None) => {
            sqlx::query_as::<_, MessageRow>(
                "SELECT id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header
                 FROM messages WHERE channel_id = ?1 ORDER BY id DESC LIMIT ?2"
            )
            .bind(channel_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

pub async fn update_message(
    pool: &DbPool,
    id: i64,
    content: &str,
) -> Result<MessageRow, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(
        "UPDATE messages SET content = ?2, edited_at = datetime('now')
         WHERE id = ?1
         RETURNING id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header"
    )
    .bind(id)
    .bind(content)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn delete_message(pool: &DbPool, id: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM messages WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_pinned_messages(
    pool: &DbPool,
    channel_id: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header
         FROM messages WHERE channel_id = ?1 AND pinned = TRUE ORDER BY id ASC"
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn pin_message(pool: &DbPool, id: i64) -> Result<(), DbError> {
    sqlx::query("UPDATE messages SET pinned = TRUE WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn unpin_message(pool: &DbPool, id: i64) -> Result<(), DbError> {
    sqlx::query("UPDATE messages SET pinned = FALSE WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn bulk_delete_messages(pool: &DbPool, ids: &[i64]) -> Result<u64, DbError> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!("DELETE FROM messages WHERE id IN ({})", placeholders.join(", "));
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let result = query.execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn count_messages(pool: &DbPool) -> Result<i64, DbError> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Looks up the message already persisted for a `(channel_id, nonce)` pair,
/// if any. Used to resolve the losing side of a concurrent
/// [`create_message_with_meta`] retry to the winning row instead of an
/// error (spec §8 "Nonce dedup").
pub async fn get_message_by_channel_nonce(
    pool: &DbPool,
    channel_id: i64,
    nonce: &str,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(
        "SELECT id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header
         FROM messages WHERE channel_id = ?1 AND nonce = ?2",
    )
    .bind(channel_id)
    .bind(nonce)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Insert a message carrying the full metadata set (moderation flags, dedup
/// nonce, DM E2EE header) produced by [`crate::message::create_message_with_options`]-style callers.
///
/// Idempotent on `(channel_id, nonce)`: a concurrent retry that loses the
/// race against `idx_messages_channel_id_nonce` returns the winning row
/// rather than propagating the unique-violation error, so the caller always
/// gets back a message instead of a conflict it has to handle itself.
pub async fn create_message_with_meta(
    pool: &DbPool,
    id: i64,
    channel_id: i64,
    author_id: i64,
    content: &str,
    message_type: i16,
    reference_id: Option<i64>,
    flags: i32,
    nonce: Option<&str>,
    e2ee_header: Option<&str>,
) -> Result<MessageRow, DbError> {
    let inserted = sqlx::query_as::<_, MessageRow>(
        "INSERT INTO messages (id, channel_id, author_id, content, message_type, reference_id, flags, nonce, e2ee_header)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         RETURNING id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header"
    )
    .bind(id)
    .bind(channel_id)
    .bind(author_id)
    .bind(content)
    .bind(message_type)
    .bind(reference_id)
    .bind(flags)
    .bind(nonce)
    .bind(e2ee_header)
    .fetch_one(pool)
    .await;

    let row = match inserted {
        Ok(row) => row,
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            match nonce {
                Some(nonce) => get_message_by_channel_nonce(pool, channel_id, nonce)
                    .await?
                    .ok_or(DbError::NotFound)?,
                None => return Err(DbError::Sqlx(sqlx::Error::Database(db_err))),
            }
        }
        Err(e) => return Err(e.into()),
    };

    let _ = sqlx::query("UPDATE channels SET last_message_id = ?1 WHERE id = ?2")
        .bind(id)
        .bind(channel_id)
        .execute(pool)
        .await;

    Ok(row)
}

/// Update content/nonce/flags, but only if `user_id` is the author or owns the
/// space the channel belongs to. Returns `None` if no row matched either
/// predicate, letting the caller distinguish "not found" from "not yours".
pub async fn update_message_authorized_with_meta(
    pool: &DbPool,
    message_id: i64,
    channel_id: i64,
    user_id: i64,
    content: &str,
    nonce: Option<&str>,
    flags: i32,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(
        "UPDATE messages SET content = ?4, nonce = ?5, flags = ?6, edited_at = datetime('now')
         WHERE id = ?1 AND channel_id = ?2
           AND (
             author_id = ?3
             OR channel_id IN (
               SELECT c.id FROM channels c JOIN guilds g ON g.id = c.guild_id WHERE g.owner_id = ?3
             )
           )
         RETURNING id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header"
    )
    .bind(message_id)
    .bind(channel_id)
    .bind(user_id)
    .bind(content)
    .bind(nonce)
    .bind(flags)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Delete, but only if `user_id` is the author or owns the space. Returns
/// whether a row was actually removed.
pub async fn delete_message_authorized(
    pool: &DbPool,
    message_id: i64,
    channel_id: i64,
    user_id: i64,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "DELETE FROM messages
         WHERE id = ?1 AND channel_id = ?2
           AND (
             author_id = ?3
             OR channel_id IN (
               SELECT c.id FROM channels c JOIN guilds g ON g.id = c.guild_id WHERE g.owner_id = ?3
             )
           )"
    )
    .bind(message_id)
    .bind(channel_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Oldest-first page of message ids created before `older_than`, used by the
/// retention sweep in amityvox-server to batch deletes.
pub async fn get_message_ids_older_than(
    pool: &DbPool,
    older_than: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT id FROM messages WHERE created_at < ?1 ORDER BY id ASC LIMIT ?2")
            .bind(older_than)
            .bind(limit)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Unconditional batch delete by id, used by the retention sweep after rows
/// have already been selected via [`get_message_ids_older_than`].
pub async fn delete_messages_by_ids(pool: &DbPool, ids: &[i64]) -> Result<u64, DbError> {
    bulk_delete_messages(pool, ids).await
}

pub async fn search_messages(
    pool: &DbPool,
    channel_id: i64,
    query: &str,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let pattern = format!("%{}%", query);
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, channel_id, author_id, content, message_type, flags, edited_at, pinned, reference_id, created_at, nonce, e2ee_header
         FROM messages
         WHERE channel_id = ?1 AND content LIKE ?2
         ORDER BY id DESC
         LIMIT ?3"
    )
    .bind(channel_id)
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
