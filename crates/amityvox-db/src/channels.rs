use crate::{DbError, DbPool};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChannelRow {
    pub id: i64,
    pub guild_id: Option<i64>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub channel_type: i16,
    pub position: i32,
    pub parent_id: Option<i64>,
    pub nsfw: bool,
    pub rate_limit_per_user: i32,
    pub bitrate: Option<i32>,
    pub user_limit: Option<i32>,
    pub last_message_id: Option<i64>,
    /// JSON array of role ids gating visibility of this channel, or `NULL`
    /// for no restriction. Stored as text rather than a join table since it
    /// is a small, rarely-updated set; use [`parse_required_role_ids`] /
    /// [`serialize_required_role_ids`] rather than touching the column
    /// directly.
    pub required_role_ids: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChannelRow {
    /// `None` for DM/group channels, which have no guild (spec §3 "Channel").
    pub fn guild_id(&self) -> Option<i64> {
        self.guild_id
    }

    pub fn is_thread(&self) -> bool {
        self.parent_id.is_some()
    }
}

const CHANNEL_COLUMNS: &str = "id, guild_id, name, topic, channel_type, position, parent_id, nsfw, \
     rate_limit_per_user, bitrate, user_limit, last_message_id, required_role_ids, created_at";

/// Decode the `required_role_ids` column into role ids. An absent or
/// unparseable value is treated as "no restriction" rather than an error —
/// this column only narrows visibility, so fail-open on decode would be the
/// dangerous default, and fail-closed on a NULL (the common case) would
/// make every channel invisible. Callers that need fail-closed behavior
/// apply it in the permission path, not here.
pub fn parse_required_role_ids(raw: &Option<String>) -> Vec<i64> {
    match raw {
        Some(s) if !s.trim().is_empty() => serde_json::from_str(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub fn serialize_required_role_ids(role_ids: &[i64]) -> String {
    serde_json::to_string(role_ids).unwrap_or_else(|_| "[]".to_string())
}

#[allow(clippy::too_many_arguments)]
pub async fn create_channel(
    pool: &DbPool,
    id: i64,
    guild_id: i64,
    name: &str,
    channel_type: i16,
    position: i32,
    parent_id: Option<i64>,
    required_role_ids: Option<&str>,
) -> Result<ChannelRow, DbError> {
    let row = sqlx::query_as::<_, ChannelRow>(&format!(
        "INSERT INTO channels (id, guild_id, name, channel_type, position, parent_id, required_role_ids)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING {CHANNEL_COLUMNS}"
    ))
    .bind(id)
    .bind(guild_id)
    .bind(name)
    .bind(channel_type)
    .bind(position)
    .bind(parent_id)
    .bind(required_role_ids)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_channel(pool: &DbPool, id: i64) -> Result<Option<ChannelRow>, DbError> {
    let row = sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_guild_channels(pool: &DbPool, guild_id: i64) -> Result<Vec<ChannelRow>, DbError> {
    let rows = sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels WHERE guild_id = ?1 ORDER BY position"
    ))
    .bind(guild_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn update_channel(
    pool: &DbPool,
    id: i64,
    name: Option<&str>,
    topic: Option<&str>,
    required_role_ids: Option<&str>,
) -> Result<ChannelRow, DbError> {
    let row = sqlx::query_as::<_, ChannelRow>(&format!(
        "UPDATE channels SET
            name = COALESCE(?2, name),
            topic = COALESCE(?3, topic),
            required_role_ids = COALESCE(?4, required_role_ids),
            updated_at = datetime('now')
         WHERE id = ?1
         RETURNING {CHANNEL_COLUMNS}"
    ))
    .bind(id)
    .bind(name)
    .bind(topic)
    .bind(required_role_ids)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn delete_channel(pool: &DbPool, id: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM channels WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_channels(pool: &DbPool) -> Result<i64, DbError> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM channels")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Batch reposition (and optionally reparent) channels within a guild.
/// `parent_id` per entry is `None` to leave the column untouched, `Some(None)`
/// to clear it, `Some(Some(id))` to set it — distinguishing "no change" from
/// "clear" the way [`update_channel`]'s `COALESCE` columns do for a single
/// value at a time.
pub async fn update_channel_positions(
    pool: &DbPool,
    guild_id: i64,
    updates: &[(i64, i32, Option<Option<i64>>)],
) -> Result<Vec<ChannelRow>, DbError> {
    let mut changed = Vec::with_capacity(updates.len());
    for (channel_id, position, parent_id) in updates {
        let row = match parent_id {
            Some(new_parent) => {
                sqlx::query_as::<_, ChannelRow>(&format!(
                    "UPDATE channels SET position = ?2, parent_id = ?3, updated_at = datetime('now')
                     WHERE id = ?1 AND guild_id = ?4
                     RETURNING {CHANNEL_COLUMNS}"
                ))
                .bind(channel_id)
                .bind(position)
                .bind(new_parent)
                .bind(guild_id)
                .fetch_optional(pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ChannelRow>(&format!(
                    "UPDATE channels SET position = ?2, updated_at = datetime('now')
                     WHERE id = ?1 AND guild_id = ?3
                     RETURNING {CHANNEL_COLUMNS}"
                ))
                .bind(channel_id)
                .bind(position)
                .bind(guild_id)
                .fetch_optional(pool)
                .await?
            }
        };
        if let Some(row) = row {
            changed.push(row);
        }
    }
    Ok(changed)
}

pub async fn reorder_channels(
    pool: &DbPool,
    updates: &[(i64, i32)],
) -> Result<(), DbError> {
    for (channel_id, position) in updates {
        sqlx::query("UPDATE channels SET position = ?2, updated_at = datetime('now') WHERE id = ?1")
            .bind(channel_id)
            .bind(position)
            .execute(pool)
            .await?;
    }
    Ok(())
}
