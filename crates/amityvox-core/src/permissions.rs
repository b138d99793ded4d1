//! The permission evaluator (spec §4.3): the one path every server-side
//! check — REST, gateway filtering, federation inbound translation — goes
//! through to decide what a user may do or see. Deliberately fail-closed:
//! any DB error while loading roles or overrides resolves to no
//! permissions rather than propagating, so a transient outage can never
//! silently grant access.

use crate::error::CoreError;
use amityvox_db::channel_overwrites::ChannelOverwriteRow;
use amityvox_db::roles::RoleRow;
use amityvox_db::DbPool;
use amityvox_models::permissions::Permissions;

pub const OVERWRITE_TARGET_ROLE: i16 = 0;
pub const OVERWRITE_TARGET_MEMBER: i16 = 1;

/// Fold a member's held roles into an effective guild-scope permission set
/// (spec §4.3 steps 1-4).
///
/// `roles` must be ordered by ascending `position` — every DB accessor that
/// feeds this (`get_member_roles`, `get_guild_roles`) already sorts that
/// way. The fold starts from `Permissions::empty()` rather than a separate
/// "guild default" argument because `@everyone` (position 0) is itself a
/// member_roles row every member holds, so it is the first element folded.
///
/// `is_instance_admin` is the per-user instance admin flag (spec §4.3
/// Inputs, Algorithm step 1: "If the user is instance admin or the guild
/// owner, return all bits set") — callers resolve it with
/// [`is_instance_admin`] and pass it in since this function is pure and has
/// no DB access of its own.
pub fn compute_permissions_from_roles(
    roles: &[RoleRow],
    guild_owner_id: i64,
    user_id: i64,
    is_instance_admin: bool,
) -> Permissions {
    if user_id == guild_owner_id || is_instance_admin {
        return Permissions::all();
    }

    let mut perms = Permissions::empty();
    for role in roles {
        let allow = Permissions::from_bits_truncate(role.permissions);
        let deny = Permissions::from_bits_truncate(role.deny_permissions);
        perms = (perms & !deny) | allow;
    }

    if perms.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }

    perms
}

/// Whether a resolved guild-scope permission set belongs to someone who
/// should bypass per-action permission checks entirely (guild owner or a
/// role with `ADMINISTRATOR`). Both cases are already folded to
/// `Permissions::all()` by [`compute_permissions_from_roles`], so this is
/// just that check named for call sites that only have the resolved set.
pub fn is_server_admin(perms: Permissions) -> bool {
    perms.contains(Permissions::ADMINISTRATOR)
}

/// Check if permission set contains required permission, returning error if not
pub fn require_permission(perms: Permissions, required: Permissions) -> Result<(), CoreError> {
    if !perms.contains(required) {
        return Err(CoreError::MissingPermission);
    }
    Ok(())
}

/// Resolves the per-user instance admin flag (spec §4.3 Inputs). Fails
/// closed: a DB error or missing user resolves to `false` rather than
/// propagating, so a transient outage can never grant the admin bypass —
/// matching the evaluator's other fail-closed points (spec §7).
pub async fn is_instance_admin(pool: &DbPool, user_id: i64) -> bool {
    match amityvox_db::users::get_user_flags(pool, user_id).await {
        Ok(Some(flags)) => crate::is_admin(flags),
        Ok(None) => false,
        Err(e) => {
            tracing::warn!(
                user_id,
                error = %e,
                "permission evaluator: DB failure loading instance-admin flag, failing closed"
            );
            false
        }
    }
}

pub async fn is_guild_member(pool: &DbPool, guild_id: i64, user_id: i64) -> Result<bool, CoreError> {
    let member = amityvox_db::members::get_member(pool, user_id, guild_id).await?;
    Ok(member.is_some())
}

pub async fn ensure_guild_member(pool: &DbPool, guild_id: i64, user_id: i64) -> Result<(), CoreError> {
    if !is_guild_member(pool, guild_id, user_id).await? {
        return Err(CoreError::Forbidden);
    }
    Ok(())
}

/// Apply one `(allow, deny)` override step: deny first, then allow (spec
/// §4.3 step 5's "deny first, then allow" applies *within* each step, and
/// each step is applied in the documented order — `@everyone` override,
/// then each held role's override by position, then the user override).
fn apply_override_step(perms: Permissions, allow: i64, deny: i64) -> Permissions {
    let allow = Permissions::from_bits_truncate(allow);
    let deny = Permissions::from_bits_truncate(deny);
    (perms & !deny) | allow
}

/// Resolve effective permissions for `user_id` on `channel_id` in
/// `guild_id` (spec §4.3, the full algorithm including channel overrides).
///
/// Fails closed: any error loading roles or overrides is logged at `warn`
/// and resolved to `Permissions::empty()` rather than propagated, per spec
/// §4.3 "Error semantics" and §7 "Fail-closed points".
pub async fn compute_channel_permissions(
    pool: &DbPool,
    guild_id: i64,
    channel_id: i64,
    guild_owner_id: i64,
    user_id: i64,
) -> Result<Permissions, CoreError> {
    match compute_channel_permissions_inner(pool, guild_id, channel_id, guild_owner_id, user_id)
        .await
    {
        Ok(perms) => Ok(perms),
        Err(e) => {
            tracing::warn!(
                guild_id,
                channel_id,
                user_id,
                error = %e,
                "permission evaluator: DB failure loading roles/overrides, failing closed"
            );
            Ok(Permissions::empty())
        }
    }
}

/// Cached front door for the gateway's per-event dispatch filter (spec
/// §4.2 dispatch step 2), which runs once per live event per subscribed
/// session and can't afford a roles + overwrites query on every dispatch.
/// Consults `cache` first and falls back to [`compute_channel_permissions`]
/// on a miss, populating the cache with the resolved value (bounded TTL —
/// see [`crate::build_permission_cache`] — so a permission change is
/// reflected within that window rather than never).
pub async fn compute_channel_permissions_cached(
    cache: &moka::future::Cache<crate::PermissionCacheKey, Permissions>,
    pool: &DbPool,
    guild_id: i64,
    channel_id: i64,
    guild_owner_id: i64,
    user_id: i64,
) -> Result<Permissions, CoreError> {
    if let Some(perms) = cache.get(&(user_id, channel_id)).await {
        return Ok(perms);
    }
    let perms =
        compute_channel_permissions(pool, guild_id, channel_id, guild_owner_id, user_id).await?;
    cache.insert((user_id, channel_id), perms).await;
    Ok(perms)
}

async fn compute_channel_permissions_inner(
    pool: &DbPool,
    guild_id: i64,
    channel_id: i64,
    guild_owner_id: i64,
    user_id: i64,
) -> Result<Permissions, CoreError> {
    let is_instance_admin = is_instance_admin(pool, user_id).await;
    let roles = amityvox_db::roles::get_member_roles(pool, user_id, guild_id).await?;
    let mut perms =
        compute_permissions_from_roles(&roles, guild_owner_id, user_id, is_instance_admin);
    if user_id == guild_owner_id || is_instance_admin || perms.contains(Permissions::ADMINISTRATOR) {
        return Ok(Permissions::all());
    }

    let overwrites = amityvox_db::channel_overwrites::get_channel_overwrites(pool, channel_id).await?;
    if overwrites.is_empty() {
        return Ok(perms);
    }

    let find_target = |target_type: i16, target_id: i64| -> Option<&ChannelOverwriteRow> {
        overwrites
            .iter()
            .find(|o| o.target_type == target_type && o.target_id == target_id)
    };

    // Step 1: @everyone's channel override.
    if let Some(everyone) = find_target(OVERWRITE_TARGET_ROLE, guild_id) {
        perms = apply_override_step(perms, everyone.allow_perms, everyone.deny_perms);
    }

    // Step 2: each held role's channel override, applied in ascending
    // `position` order — `roles` is already sorted that way, so a higher
    // position role's override always wins over a lower one's, matching
    // "Higher position = higher priority" (spec §3 "Role").
    for role in &roles {
        if role.is_everyone() {
            continue;
        }
        if let Some(ow) = find_target(OVERWRITE_TARGET_ROLE, role.id) {
            perms = apply_override_step(perms, ow.allow_perms, ow.deny_perms);
        }
    }

    // Step 3: the user-specific override, applied last so it wins over
    // every role override.
    if let Some(member_ow) = find_target(OVERWRITE_TARGET_MEMBER, user_id) {
        perms = apply_override_step(perms, member_ow.allow_perms, member_ow.deny_perms);
    }

    Ok(perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn role(id: i64, position: i32, allow: i64, deny: i64) -> RoleRow {
        RoleRow {
            id,
            guild_id: 1,
            name: format!("role-{id}"),
            color: 0,
            hoist: false,
            position,
            permissions: allow,
            deny_permissions: deny,
            managed: false,
            mentionable: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn owner_gets_all_bits_regardless_of_roles() {
        let roles = vec![role(1, 0, 0, Permissions::all().bits())];
        let perms = compute_permissions_from_roles(&roles, 42, 42, false);
        assert_eq!(perms, Permissions::all());
    }

    #[test]
    fn instance_admin_gets_all_bits_regardless_of_roles() {
        // Spec §4.3 Algorithm step 1: instance admin short-circuits just
        // like the guild owner, even with no admin-bit role held.
        let roles = vec![role(1, 0, 0, Permissions::all().bits())];
        let perms = compute_permissions_from_roles(&roles, 42, 7, true);
        assert_eq!(perms, Permissions::all());
    }

    #[test]
    fn administrator_role_grants_all_bits() {
        let roles = vec![role(1, 0, Permissions::ADMINISTRATOR.bits(), 0)];
        let perms = compute_permissions_from_roles(&roles, 42, 7, false);
        assert_eq!(perms, Permissions::all());
    }

    #[test]
    fn higher_position_role_deny_overrides_lower_position_allow() {
        // @everyone (position 0) allows SEND_MESSAGES; a higher role
        // (position 1) denies it. Spec §4.3 step 3: walking low-to-high,
        // the higher role's deny must win.
        let everyone = role(1, 0, Permissions::SEND_MESSAGES.bits(), 0);
        let muted = role(2, 1, 0, Permissions::SEND_MESSAGES.bits());
        let perms = compute_permissions_from_roles(&[everyone, muted], 42, 7, false);
        assert!(!perms.contains(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn higher_position_role_allow_overrides_lower_position_deny() {
        let everyone = role(1, 0, 0, Permissions::SEND_MESSAGES.bits());
        let unmuted = role(2, 1, Permissions::SEND_MESSAGES.bits(), 0);
        let perms = compute_permissions_from_roles(&[everyone, unmuted], 42, 7, false);
        assert!(perms.contains(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn channel_override_deny_beats_role_allow_for_view_and_send() {
        // Scenario from spec §8 "Permission redaction": role R allows
        // SEND_MESSAGES but a channel override denies VIEW_CHANNEL; the
        // member must end up with neither bit.
        let perms = Permissions::SEND_MESSAGES;
        let denied = apply_override_step(perms, 0, Permissions::VIEW_CHANNEL.bits());
        assert!(!denied.contains(Permissions::VIEW_CHANNEL));
        assert!(denied.contains(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn user_override_applied_last_wins_over_role_override() {
        let after_role = apply_override_step(
            Permissions::empty(),
            0,
            Permissions::VIEW_CHANNEL.bits(),
        );
        assert!(!after_role.contains(Permissions::VIEW_CHANNEL));
        let after_user = apply_override_step(after_role, Permissions::VIEW_CHANNEL.bits(), 0);
        assert!(after_user.contains(Permissions::VIEW_CHANNEL));
    }
}
