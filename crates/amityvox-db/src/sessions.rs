use crate::{DbError, DbPool};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub user_id: i64,
    pub refresh_token_hash: String,
    pub jti: String,
    pub pub_key: Option<String>,
    pub device_id: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
}

const SELECT_COLS: &str = "id, user_id, refresh_token_hash, jti, pub_key, device_id, user_agent, \
     ip_address, issued_at, last_seen_at, expires_at, revoked_at, revoked_reason";

#[allow(clippy::too_many_arguments)]
pub async fn create_session(
    pool: &DbPool,
    id: &str,
    user_id: i64,
    refresh_token_hash: &str,
    jti: &str,
    pub_key: Option<&str>,
    device_id: Option<&str>,
    user_agent: Option<&str>,
    ip_address: Option<&str>,
    expires_at: DateTime<Utc>,
) -> Result<SessionRow, DbError> {
    let row = sqlx::query_as::<_, SessionRow>(&format!(
        "INSERT INTO sessions (id, user_id, refresh_token_hash, jti, pub_key, device_id, user_agent, ip_address, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         RETURNING {SELECT_COLS}"
    ))
    .bind(id)
    .bind(user_id)
    .bind(refresh_token_hash)
    .bind(jti)
    .bind(pub_key)
    .bind(device_id)
    .bind(user_agent)
    .bind(ip_address)
    .bind(expires_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_session_by_refresh_hash(
    pool: &DbPool,
    refresh_token_hash: &str,
) -> Result<Option<SessionRow>, DbError> {
    let row = sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {SELECT_COLS} FROM sessions WHERE refresh_token_hash = ?1"
    ))
    .bind(refresh_token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Rotate the refresh token for a session, keyed on the *old* hash so a
/// replayed refresh token (already rotated away) fails instead of reviving a
/// stale session. Returns whether a row actually matched.
#[allow(clippy::too_many_arguments)]
pub async fn rotate_session_refresh_token(
    pool: &DbPool,
    session_id: &str,
    old_refresh_token_hash: &str,
    new_refresh_token_hash: &str,
    new_jti: &str,
    now: DateTime<Utc>,
    new_expires_at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE sessions SET refresh_token_hash = ?3, jti = ?4, last_seen_at = ?5, expires_at = ?6
         WHERE id = ?1 AND refresh_token_hash = ?2 AND revoked_at IS NULL",
    )
    .bind(session_id)
    .bind(old_refresh_token_hash)
    .bind(new_refresh_token_hash)
    .bind(new_jti)
    .bind(now)
    .bind(new_expires_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Revoke a session, scoped to `user_id` so a session id alone can't be used
/// to revoke someone else's session. Returns whether a row was revoked.
pub async fn revoke_session(
    pool: &DbPool,
    session_id: &str,
    user_id: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE sessions SET revoked_at = ?4, revoked_reason = ?3
         WHERE id = ?1 AND user_id = ?2 AND revoked_at IS NULL",
    )
    .bind(session_id)
    .bind(user_id)
    .bind(reason)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Revoke every live session for `user_id` except `keep_session_id`, used when
/// trust material (e.g. the account's public key) changes.
pub async fn revoke_all_user_sessions_except(
    pool: &DbPool,
    user_id: i64,
    keep_session_id: Option<&str>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE sessions SET revoked_at = ?4, revoked_reason = ?3
         WHERE user_id = ?1 AND revoked_at IS NULL AND (?2 IS NULL OR id != ?2)",
    )
    .bind(user_id)
    .bind(keep_session_id)
    .bind(reason)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn list_user_sessions(
    pool: &DbPool,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<SessionRow>, DbError> {
    let rows = sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {SELECT_COLS} FROM sessions
         WHERE user_id = ?1 AND revoked_at IS NULL AND expires_at > ?2
         ORDER BY issued_at DESC"
    ))
    .bind(user_id)
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fail-closed liveness check used on the WebSocket gateway's identify/resume
/// path: a session is active only if it exists, is unrevoked, unexpired, and
/// still carries the `jti` that was embedded in the presented access token
/// (so a refreshed-away token can't resume an old session).
pub async fn is_access_token_active(
    pool: &DbPool,
    user_id: i64,
    session_id: &str,
    jti: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM sessions
         WHERE id = ?1 AND user_id = ?2 AND jti = ?3 AND revoked_at IS NULL AND expires_at > ?4",
    )
    .bind(session_id)
    .bind(user_id)
    .bind(jti)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Delete up to `limit` sessions that expired, or were revoked, before
/// `cutoff`. Called in a loop by the retention sweep until it returns fewer
/// than `limit`.
pub async fn purge_expired_sessions(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<u64, DbError> {
    let ids: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM sessions WHERE expires_at < ?1 OR revoked_at < ?1 LIMIT ?2",
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!("DELETE FROM sessions WHERE id IN ({})", placeholders.join(", "));
    let mut query = sqlx::query(&sql);
    for (id,) in &ids {
        query = query.bind(id);
    }
    let result = query.execute(pool).await?;
    Ok(result.rows_affected())
}
