use crate::{DbError, DbPool};
use chrono::{DateTime, Utc};

/// A role row. `permissions` is the role's `allow` bitfield and
/// `deny_permissions` its `deny` bitfield (spec §3 "Role"); the evaluator
/// folds them in role-position order rather than simply OR-ing `allow`
/// across held roles.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoleRow {
    pub id: i64,
    pub guild_id: i64,
    pub name: String,
    pub color: i32,
    pub hoist: bool,
    pub position: i32,
    pub permissions: i64,
    pub deny_permissions: i64,
    pub managed: bool,
    pub mentionable: bool,
    pub created_at: DateTime<Utc>,
}

impl RoleRow {
    pub fn guild_id(&self) -> i64 {
        self.guild_id
    }

    /// True for the implicit base role every member holds: position 0,
    /// named `@everyone` (spec §3, §8 invariant).
    pub fn is_everyone(&self) -> bool {
        self.position == 0
    }
}

const ROLE_COLUMNS: &str =
    "id, guild_id, name, color, hoist, position, permissions, deny_permissions, managed, mentionable, created_at";

pub async fn create_role(
    pool: &DbPool,
    id: i64,
    guild_id: i64,
    name: &str,
    permissions: i64,
) -> Result<RoleRow, DbError> {
    let row = sqlx::query_as::<_, RoleRow>(&format!(
        "INSERT INTO roles (id, guild_id, name, permissions, deny_permissions)
         VALUES (?1, ?2, ?3, ?4, 0)
         RETURNING {ROLE_COLUMNS}"
    ))
    .bind(id)
    .bind(guild_id)
    .bind(name)
    .bind(permissions)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_role(pool: &DbPool, id: i64) -> Result<Option<RoleRow>, DbError> {
    let row = sqlx::query_as::<_, RoleRow>(&format!(
        "SELECT {ROLE_COLUMNS} FROM roles WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[allow(clippy::too_many_arguments)]
pub async fn update_role(
    pool: &DbPool,
    id: i64,
    name: Option<&str>,
    color: Option<i32>,
    hoist: Option<bool>,
    permissions: Option<i64>,
    mentionable: Option<bool>,
) -> Result<RoleRow, DbError> {
    update_role_full(pool, id, name, color, hoist, permissions, None, mentionable).await
}

/// Same as [`update_role`] but also allows setting the `deny` bitfield
/// (spec §3 "Role" has both `allow` and `deny` bits; kept as a separate
/// entry point so existing callers that only ever touch `allow` don't need
/// to thread an extra `None` through).
#[allow(clippy::too_many_arguments)]
pub async fn update_role_full(
    pool: &DbPool,
    id: i64,
    name: Option<&str>,
    color: Option<i32>,
    hoist: Option<bool>,
    permissions: Option<i64>,
    deny_permissions: Option<i64>,
    mentionable: Option<bool>,
) -> Result<RoleRow, DbError> {
    let row = sqlx::query_as::<_, RoleRow>(&format!(
        "UPDATE roles SET
            name = COALESCE(?2, name),
            color = COALESCE(?3, color),
            hoist = COALESCE(?4, hoist),
            permissions = COALESCE(?5, permissions),
            deny_permissions = COALESCE(?6, deny_permissions),
            mentionable = COALESCE(?7, mentionable)
         WHERE id = ?1
         RETURNING {ROLE_COLUMNS}"
    ))
    .bind(id)
    .bind(name)
    .bind(color)
    .bind(hoist)
    .bind(permissions)
    .bind(deny_permissions)
    .bind(mentionable)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn delete_role(pool: &DbPool, id: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM roles WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Roles for a guild, lowest `position` first — the order the permission
/// evaluator (spec §4.3 step 3) must fold them in.
pub async fn get_guild_roles(pool: &DbPool, guild_id: i64) -> Result<Vec<RoleRow>, DbError> {
    let rows = sqlx::query_as::<_, RoleRow>(&format!(
        "SELECT {ROLE_COLUMNS} FROM roles WHERE guild_id = ?1 ORDER BY position"
    ))
    .bind(guild_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn add_member_role(
    pool: &DbPool,
    user_id: i64,
    guild_id: i64,
    role_id: i64,
) -> Result<(), DbError> {
    sqlx::query("INSERT INTO member_roles (user_id, guild_id, role_id) VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING")
        .bind(user_id)
        .bind(guild_id)
        .bind(role_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn remove_member_role(
    pool: &DbPool,
    user_id: i64,
    guild_id: i64,
    role_id: i64,
) -> Result<(), DbError> {
    sqlx::query("DELETE FROM member_roles WHERE user_id = ?1 AND guild_id = ?2 AND role_id = ?3")
        .bind(user_id)
        .bind(guild_id)
        .bind(role_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// A member's held roles, lowest `position` first. Does not implicitly
/// include `@everyone` — callers walk this list starting from the guild's
/// `@everyone` row (position 0), which every member is expected to hold a
/// `member_roles` row for (assigned at join time).
pub async fn get_member_roles(
    pool: &DbPool,
    user_id: i64,
    guild_id: i64,
) -> Result<Vec<RoleRow>, DbError> {
    let rows = sqlx::query_as::<_, RoleRow>(
        "SELECT r.id, r.guild_id, r.name, r.color, r.hoist, r.position, r.permissions,
                r.deny_permissions, r.managed, r.mentionable, r.created_at
         FROM roles r
         INNER JOIN member_roles mr ON mr.role_id = r.id
         WHERE mr.user_id = ?1 AND mr.guild_id = ?2
         ORDER BY r.position"
    )
    .bind(user_id)
    .bind(guild_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
