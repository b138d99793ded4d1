use crate::{DbError, DbPool};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttachmentRow {
    pub id: i64,
    pub message_id: Option<i64>,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: i32,
    pub url: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub uploader_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

const ATTACHMENT_COLUMNS: &str = "id, message_id, filename, content_type, size, url, width, height, uploader_id, channel_id, expires_at, content_hash, created_at";

#[allow(clippy::too_many_arguments)]
pub async fn create_attachment(
    pool: &DbPool,
    id: i64,
    message_id: Option<i64>,
    filename: &str,
    content_type: Option<&str>,
    size: i32,
    url: &str,
    width: Option<i32>,
    height: Option<i32>,
    uploader_id: Option<i64>,
    channel_id: Option<i64>,
    expires_at: Option<DateTime<Utc>>,
    content_hash: Option<&str>,
) -> Result<AttachmentRow, DbError> {
    let row = sqlx::query_as::<_, AttachmentRow>(&format!(
        "INSERT INTO attachments (id, message_id, filename, content_type, size, url, width, height, uploader_id, channel_id, expires_at, content_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         RETURNING {ATTACHMENT_COLUMNS}"
    ))
    .bind(id)
    .bind(message_id)
    .bind(filename)
    .bind(content_type)
    .bind(size)
    .bind(url)
    .bind(width)
    .bind(height)
    .bind(uploader_id)
    .bind(channel_id)
    .bind(expires_at)
    .bind(content_hash)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_attachment(pool: &DbPool, id: i64) -> Result<Option<AttachmentRow>, DbError> {
    let row = sqlx::query_as::<_, AttachmentRow>(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn delete_attachment(pool: &DbPool, id: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM attachments WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_message_attachments(
    pool: &DbPool,
    message_id: i64,
) -> Result<Vec<AttachmentRow>, DbError> {
    let rows = sqlx::query_as::<_, AttachmentRow>(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message_id = ?1"
    ))
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Batch-load attachments belonging to any of `message_ids`, used by the
/// message retention sweep so it can remove their backing blobs before the
/// messages themselves are deleted.
pub async fn get_attachments_for_message_ids(
    pool: &DbPool,
    message_ids: &[i64],
    limit: i64,
) -> Result<Vec<AttachmentRow>, DbError> {
    if message_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{i}")).collect();
    let limit_param = message_ids.len() + 1;
    let sql = format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message_id IN ({}) LIMIT ?{limit_param}",
        placeholders.join(", ")
    );
    let mut query = sqlx::query_as::<_, AttachmentRow>(&sql);
    for id in message_ids {
        query = query.bind(id);
    }
    query = query.bind(limit);
    let rows = query.fetch_all(pool).await?;
    Ok(rows)
}

pub async fn attach_to_message(pool: &DbPool, id: i64, message_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE attachments
         SET message_id = ?2
         WHERE id = ?1 AND message_id IS NULL",
    )
    .bind(id)
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Pending (never attached to a message) uploads whose `expires_at` has
/// passed, swept periodically so abandoned uploads don't accumulate in
/// storage.
pub async fn get_expired_pending_attachments(
    pool: &DbPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<AttachmentRow>, DbError> {
    let rows = sqlx::query_as::<_, AttachmentRow>(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments
         WHERE message_id IS NULL AND expires_at IS NOT NULL AND expires_at < ?1
         ORDER BY id ASC LIMIT ?2"
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Pending uploads older than `older_than` regardless of `expires_at`, used
/// as a backstop by the retention sweep for rows the TTL-based cleanup
/// missed (e.g. because the server was down past their expiry window).
pub async fn get_unlinked_attachments_older_than(
    pool: &DbPool,
    older_than: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<AttachmentRow>, DbError> {
    let rows = sqlx::query_as::<_, AttachmentRow>(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments
         WHERE message_id IS NULL AND created_at < ?1
         ORDER BY id ASC LIMIT ?2"
    ))
    .bind(older_than)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
