use crate::{DbError, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthGuardRow {
    pub key: String,
    pub failure_count: i32,
    pub locked_until: i64,
    pub updated_at: i64,
}

/// Failures after which a key is locked out, and for how long.
const AUTH_GUARD_LOCK_THRESHOLD: i32 = 5;
const AUTH_GUARD_LOCK_SECONDS: i64 = 300;

/// Current lockout state for a set of auth-guard keys (ip/account/device
/// composites — see `amityvox-api`'s `auth_guard_keys`). Missing keys are
/// simply absent from the result, not zero-valued rows.
pub async fn get_auth_guard_states(
    pool: &DbPool,
    keys: &[String],
) -> Result<Vec<AuthGuardRow>, DbError> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=keys.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT key, failure_count, locked_until, updated_at FROM auth_guards WHERE key IN ({})",
        placeholders.join(", ")
    );
    let mut query = sqlx::query_as::<_, AuthGuardRow>(&sql);
    for key in keys {
        query = query.bind(key);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows)
}

/// Record a failed attempt for `key`, locking it out once
/// [`AUTH_GUARD_LOCK_THRESHOLD`] consecutive failures accumulate.
pub async fn record_auth_guard_failure(pool: &DbPool, key: &str, now: i64) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO auth_guards (key, failure_count, locked_until, updated_at)
         VALUES (?1, 1, 0, ?2)
         ON CONFLICT (key) DO UPDATE SET
            failure_count = auth_guards.failure_count + 1,
            locked_until = CASE
                WHEN auth_guards.failure_count + 1 >= ?3 THEN ?2 + ?4
                ELSE auth_guards.locked_until
            END,
            updated_at = ?2",
    )
    .bind(key)
    .bind(now)
    .bind(AUTH_GUARD_LOCK_THRESHOLD)
    .bind(AUTH_GUARD_LOCK_SECONDS)
    .execute(pool)
    .await?;
    Ok(())
}

/// Clear lockout state for `keys`, called after a successful authentication.
pub async fn clear_auth_guard_keys(pool: &DbPool, keys: &[String]) -> Result<(), DbError> {
    if keys.is_empty() {
        return Ok(());
    }
    let placeholders: Vec<String> = (1..=keys.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "DELETE FROM auth_guards WHERE key IN ({})",
        placeholders.join(", ")
    );
    let mut query = sqlx::query(&sql);
    for key in keys {
        query = query.bind(key);
    }
    query.execute(pool).await?;
    Ok(())
}

/// Drop stale, unlocked auth-guard rows so the table doesn't grow without
/// bound. Run periodically, not on every request.
pub async fn purge_auth_guard_older_than(
    pool: &DbPool,
    cutoff: i64,
    limit: i64,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "DELETE FROM auth_guards WHERE updated_at < ?1 AND locked_until < ?1
         AND key IN (SELECT key FROM auth_guards WHERE updated_at < ?1 AND locked_until < ?1 LIMIT ?2)",
    )
    .bind(cutoff)
    .bind(limit)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Generic fixed-window counter: increments the count for `(key, window)` and
/// returns the post-increment total. Used for per-peer federation rate
/// limits keyed by a minute/hour bucket index.
pub async fn increment_window_counter(
    pool: &DbPool,
    key: &str,
    window: i64,
    window_secs: i64,
) -> Result<i64, DbError> {
    sqlx::query(
        "INSERT INTO rate_limit_windows (key, window_start, count)
         VALUES (?1, ?2, 1)
         ON CONFLICT (key, window_start) DO UPDATE SET count = rate_limit_windows.count + 1",
    )
    .bind(key)
    .bind(window)
    .execute(pool)
    .await?;

    let stale_cutoff = window.saturating_sub(window_secs.max(1) * 4);
    let _ = sqlx::query("DELETE FROM rate_limit_windows WHERE key = ?1 AND window_start < ?2")
        .bind(key)
        .bind(stale_cutoff)
        .execute(pool)
        .await;

    let (count,): (i64,) = sqlx::query_as(
        "SELECT count FROM rate_limit_windows WHERE key = ?1 AND window_start = ?2",
    )
    .bind(key)
    .bind(window)
    .fetch_one(pool)
    .await?;
    Ok(count)
}
