use crate::{DbError, DbPool};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditLogEntryRow {
    pub id: i64,
    pub guild_id: i64,
    pub user_id: i64,
    pub action_type: i16,
    pub target_id: Option<i64>,
    pub reason: Option<String>,
    pub changes: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

pub async fn create_entry(
    pool: &DbPool,
    id: i64,
    guild_id: i64,
    user_id: i64,
    action_type: i16,
    target_id: Option<i64>,
    reason: Option<&str>,
    changes: Option<&serde_json::Value>,
) -> Result<AuditLogEntryRow, DbError> {
    let row = sqlx::query_as::<_, AuditLogEntryRow>(
        "INSERT INTO audit_log_entries (id, guild_id, user_id, action_type, target_id, reason, changes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING id, guild_id, user_id, action_type, target_id, reason, changes, created_at"
    )
    .bind(id)
    .bind(guild_id)
    .bind(user_id)
    .bind(action_type)
    .bind(target_id)
    .bind(reason)
    .bind(changes)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Delete up to `limit` entries older than `older_than`, oldest first. Called
/// in a loop by the retention sweep until it returns fewer than `limit`.
pub async fn purge_entries_older_than(
    pool: &DbPool,
    older_than: DateTime<Utc>,
    limit: i64,
) -> Result<u64, DbError> {
    let ids: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM audit_log_entries WHERE created_at < ?1 ORDER BY id ASC LIMIT ?2",
    )
    .bind(older_than)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "DELETE FROM audit_log_entries WHERE id IN ({})",
        placeholders.join(", ")
    );
    let mut query = sqlx::query(&sql);
    for (id,) in &ids {
        query = query.bind(id);
    }
    let result = query.execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn get_guild_entries(
    pool: &DbPool,
    guild_id: i64,
    action_type: Option<i16>,
    user_id: Option<i64>,
    before: Option<i64>,
    limit: i64,
) -> Result<Vec<AuditLogEntryRow>, DbError> {
    let rows = match (action_type, user_id, before) {
        (None, None, None) => {
            sqlx::query_as::<_, AuditLogEntryRow>(
                "SELECT id, guild_id, user_id, action_type, target_id, reason, changes, created_at
                 FROM audit_log_entries WHERE guild_id = ?1
                 ORDER BY id DESC LIMIT ?2"
            )
            .bind(guild_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (Some(at), None, None) => {
            sqlx::query_as::<_, AuditLogEntryRow>(
                "SELECT id, guild_id, user_id, action_type, target_id, reason, changes, created_at
                 FROM audit_log_entries WHERE guild_id = ?1 AND action_type = ?2
                 ORDER BY id DESC LIMIT ?3"
            )
            .bind(guild_id)
            .bind(at)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (None, Some(uid), None) => {
            sqlx::query_as::<_, AuditLogEntryRow>(
                "SELECT id, guild_id, user_id, action_type, target_id, reason, changes, created_at
                 FROM audit_log_entries WHERE guild_id = ?1 AND user_id = ?2
                 ORDER BY id DESC LIMIT ?3"
            )
            .bind(guild_id)
            .bind(uid)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (None, None, Some(b)) => {
            sqlx::query_as::<_, AuditLogEntryRow>(
                "SELECT id, guild_id, user_id, action_type, target_id, reason, changes, created_at
                 FROM audit_log_entries WHERE guild_id = ?1 AND id < ?2
                 ORDER BY id DESC LIMIT ?3"
            )
            .bind(guild_id)
            .bind(b)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (Some(at), Some(uid), None) => {
            sqlx::query_as::<_, AuditLogEntryRow>(
                "SELECT id, guild_id, user_id, action_type, target_id, reason, changes, created_at
                 FROM audit_log_entries WHERE guild_id = ?1 AND action_type = ?2 AND user_id = ?3
                 ORDER BY id DESC LIMIT ?4"
            )
            .bind(guild_id)
            .bind(at)
            .bind(uid)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (Some(at), None, Some(b)) => {
            sqlx::query_as::<_, AuditLogEntryRow>(
                "SELECT id, guild_id, user_id, action_type, target_id, reason, changes, created_at
                 FROM audit_log_entries WHERE guild_id = ?1 AND action_type = ?2 AND id < ?3
                 ORDER BY id DESC LIMIT ?4"
            )
            .bind(guild_id)
            .bind(at)
            .bind(b)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (None, Some(uid), Some(b)) => {
            sqlx::query_as::<_, AuditLogEntryRow>(
                "SELECT id, guild_id, user_id, action_type, target_id, reason, changes, created_at
                 FROM audit_log_entries WHERE guild_id = ?1 AND user_id = ?2 AND id < ?3
                 ORDER BY id DESC LIMIT ?4"
            )
            .bind(guild_id)
            .bind(uid)
            .bind(b)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        (Some(at), Some(uid), Some(b)) => {
            sqlx::query_as::<_, AuditLogEntryRow>(
                "SELECT id, guild_id, user_id, action_type, target_id, reason, changes, created_at
                 FROM audit_log_entries WHERE guild_id = ?1 AND action_type = ?2 AND user_id = ?3 AND id < ?4
                 ORDER BY id DESC LIMIT ?5"
            )
            .bind(guild_id)
            .bind(at)
            .bind(uid)
            .bind(b)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows)
}
