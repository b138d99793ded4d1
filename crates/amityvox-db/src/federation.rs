//! Federation persistence: known instances, the delivery outbox and its
//! dead-letter sibling, the key-fingerprint audit trail, the local HLC
//! event history used for backfill, and the mapping tables that let a
//! remote user/space/channel resolve to a local row.
//!
//! Envelope and signature types live in `amityvox-federation`, which
//! depends on this crate rather than the other way around, so everything
//! here stores/returns envelopes as `serde_json::Value` and leaves
//! (de)serializing them into `amityvox_federation::protocol::FederationEnvelope`
//! to the caller.

use crate::{bool_from_any_row, json_from_db_text, DbPool};
use serde_json::Value;
use sqlx::Row;

/// A known peer instance, including this instance's own row (`is_local =
/// true`). Doubles as the federation mode/voice-mode source of truth an
/// operator edits via the admin API, separate from the local process's own
/// `[federation]` config which only says how *this* instance behaves.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceRow {
    pub domain: String,
    pub mode: String,
    pub voice_mode: String,
    pub is_local: bool,
    pub public_key_hex: Option<String>,
    pub key_fingerprint: Option<String>,
    pub handshake_token: Option<String>,
    pub handshake_completed_at_ms: Option<i64>,
    pub last_seen_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for InstanceRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            domain: row.try_get("domain")?,
            mode: row.try_get("mode")?,
            voice_mode: row.try_get("voice_mode")?,
            is_local: bool_from_any_row(row, "is_local")?,
            public_key_hex: row.try_get("public_key_hex")?,
            key_fingerprint: row.try_get("key_fingerprint")?,
            handshake_token: row.try_get("handshake_token")?,
            handshake_completed_at_ms: row.try_get("handshake_completed_at_ms")?,
            last_seen_at_ms: row.try_get("last_seen_at_ms")?,
            created_at_ms: row.try_get("created_at_ms")?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerKeypairRow {
    pub id: i64,
    pub key_id: String,
    pub signing_key_hex: String,
    pub public_key_hex: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct FederationOutboxRow {
    pub id: i64,
    pub event_id: String,
    pub target_instance: String,
    pub envelope: Value,
    pub attempts: i64,
    pub next_attempt_at_ms: i64,
    pub created_at_ms: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for FederationOutboxRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let envelope_raw: String = row.try_get("envelope_json")?;
        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            target_instance: row.try_get("target_instance")?,
            envelope: json_from_db_text(&envelope_raw)?,
            attempts: row.try_get("attempts")?,
            next_attempt_at_ms: row.try_get("next_attempt_at_ms")?,
            created_at_ms: row.try_get("created_at_ms")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FederationDeadLetterRow {
    pub id: i64,
    pub event_id: String,
    pub target_instance: String,
    pub envelope: Value,
    pub attempts: i64,
    pub reason: String,
    pub dead_at_ms: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for FederationDeadLetterRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let envelope_raw: String = row.try_get("envelope_json")?;
        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            target_instance: row.try_get("target_instance")?,
            envelope: json_from_db_text(&envelope_raw)?,
            attempts: row.try_get("attempts")?,
            reason: row.try_get("reason")?,
            dead_at_ms: row.try_get("dead_at_ms")?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyAuditRow {
    pub id: i64,
    pub domain: String,
    pub expected_fingerprint: Option<String>,
    pub observed_fingerprint: String,
    pub recorded_at_ms: i64,
    pub acknowledged: bool,
}

#[derive(Debug, Clone)]
pub struct EventLogRow {
    pub event_id: String,
    pub event_type: String,
    pub hlc_wall_ms: i64,
    pub hlc_counter: i64,
    pub hlc_instance: String,
    pub source_instance: String,
    pub payload: Value,
    pub recorded_at_ms: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for EventLogRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let payload_raw: String = row.try_get("payload_json")?;
        Ok(Self {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            hlc_wall_ms: row.try_get("hlc_wall_ms")?,
            hlc_counter: row.try_get("hlc_counter")?,
            hlc_instance: row.try_get("hlc_instance")?,
            source_instance: row.try_get("source_instance")?,
            payload: json_from_db_text(&payload_raw)?,
            recorded_at_ms: row.try_get("recorded_at_ms")?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RemoteFederatedUserRow {
    pub remote_user_id: String,
    pub origin_server: String,
    pub local_user_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChannelMirrorRow {
    pub origin_server: String,
    pub remote_channel_id: String,
    pub local_channel_id: i64,
    pub local_guild_id: i64,
    pub created_at: String,
}

// ── Instances ─────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn upsert_instance(
    pool: &DbPool,
    domain: &str,
    mode: &str,
    voice_mode: &str,
    is_local: bool,
    public_key_hex: Option<&str>,
    key_fingerprint: Option<&str>,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO federation_instances (
             domain, mode, voice_mode, is_local, public_key_hex, key_fingerprint, created_at_ms
         ) VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (domain) DO UPDATE SET
             mode = EXCLUDED.mode,
             voice_mode = EXCLUDED.voice_mode,
             public_key_hex = COALESCE(EXCLUDED.public_key_hex, federation_instances.public_key_hex),
             key_fingerprint = COALESCE(EXCLUDED.key_fingerprint, federation_instances.key_fingerprint)",
    )
    .bind(domain)
    .bind(mode)
    .bind(voice_mode)
    .bind(is_local)
    .bind(public_key_hex)
    .bind(key_fingerprint)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_instance(pool: &DbPool, domain: &str) -> Result<Option<InstanceRow>, sqlx::Error> {
    sqlx::query_as::<_, InstanceRow>(
        "SELECT domain, mode, voice_mode, is_local, public_key_hex, key_fingerprint,
                handshake_token, handshake_completed_at_ms, last_seen_at_ms, created_at_ms
         FROM federation_instances WHERE domain = $1",
    )
    .bind(domain)
    .fetch_optional(pool)
    .await
}

pub async fn list_instances(pool: &DbPool) -> Result<Vec<InstanceRow>, sqlx::Error> {
    sqlx::query_as::<_, InstanceRow>(
        "SELECT domain, mode, voice_mode, is_local, public_key_hex, key_fingerprint,
                handshake_token, handshake_completed_at_ms, last_seen_at_ms, created_at_ms
         FROM federation_instances ORDER BY created_at_ms ASC",
    )
    .fetch_all(pool)
    .await
}

pub async fn delete_instance(pool: &DbPool, domain: &str) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("DELETE FROM federation_instances WHERE domain = $1")
        .bind(domain)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

pub async fn touch_instance(pool: &DbPool, domain: &str, now_ms: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE federation_instances SET last_seen_at_ms = $2 WHERE domain = $1")
        .bind(domain)
        .bind(now_ms)
        .execute(pool)
        .await?;
    Ok(())
}

/// Stores a freshly-minted one-shot handshake token for `domain`, to be
/// handed out-of-band to the peer's operator (spec §4.4: closed-mode
/// pairing is a token exchange, not automatic trust).
pub async fn set_handshake_token(pool: &DbPool, domain: &str, token: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE federation_instances SET handshake_token = $2 WHERE domain = $1")
        .bind(domain)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_handshake_completed(pool: &DbPool, domain: &str, now_ms: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE federation_instances SET handshake_completed_at_ms = $2, handshake_token = NULL WHERE domain = $1",
    )
    .bind(domain)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn is_handshake_completed(pool: &DbPool, domain: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM federation_instances WHERE domain = $1 AND handshake_completed_at_ms IS NOT NULL",
    )
    .bind(domain)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

// ── Outbox / dead letters ───────────────────────────────────────────────

/// Enqueues `event_id` for delivery to `target_instance`. Idempotent:
/// re-enqueuing the same (event_id, target_instance) pair while a row is
/// still pending is a no-op, since the same local event can be published
/// to the bus more than once during retries upstream.
pub async fn enqueue_outbox_entry(
    pool: &DbPool,
    event_id: &str,
    target_instance: &str,
    envelope: &Value,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO federation_outbox (event_id, target_instance, envelope_json, attempts, next_attempt_at_ms, created_at_ms)
         VALUES ($1, $2, $3, 0, $4, $4)
         ON CONFLICT (event_id, target_instance) DO NOTHING",
    )
    .bind(event_id)
    .bind(target_instance)
    .bind(serde_json::to_string(envelope).map_err(|e| sqlx::Error::Protocol(format!("invalid outbox envelope json: {e}")))?)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_due_outbox_entries(
    pool: &DbPool,
    now_ms: i64,
    limit: i64,
) -> Result<Vec<FederationOutboxRow>, sqlx::Error> {
    sqlx::query_as::<_, FederationOutboxRow>(
        "SELECT id, event_id, target_instance, envelope_json, attempts, next_attempt_at_ms, created_at_ms
         FROM federation_outbox
         WHERE next_attempt_at_ms <= $1
         ORDER BY next_attempt_at_ms ASC
         LIMIT $2",
    )
    .bind(now_ms)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn mark_outbox_delivered(pool: &DbPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM federation_outbox WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_outbox_retry(
    pool: &DbPool,
    id: i64,
    attempts: i64,
    next_attempt_at_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE federation_outbox SET attempts = $2, next_attempt_at_ms = $3 WHERE id = $1")
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at_ms)
        .execute(pool)
        .await?;
    Ok(())
}

/// Moves an outbox row to the dead-letter table in one transaction
/// (spec §4.4 step 6). Returns `Ok(false)` if the row was already gone
/// (delivered or replayed concurrently).
pub async fn move_outbox_to_dead_letter(
    pool: &DbPool,
    id: i64,
    reason: &str,
    now_ms: i64,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query_as::<_, FederationOutboxRow>(
        "SELECT id, event_id, target_instance, envelope_json, attempts, next_attempt_at_ms, created_at_ms
         FROM federation_outbox WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(false);
    };

    sqlx::query(
        "INSERT INTO federation_dead_letters (event_id, target_instance, envelope_json, attempts, reason, dead_at_ms)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&row.event_id)
    .bind(&row.target_instance)
    .bind(serde_json::to_string(&row.envelope).map_err(|e| sqlx::Error::Protocol(e.to_string()))?)
    .bind(row.attempts)
    .bind(reason)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM federation_outbox WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

pub async fn list_dead_letters(pool: &DbPool) -> Result<Vec<FederationDeadLetterRow>, sqlx::Error> {
    sqlx::query_as::<_, FederationDeadLetterRow>(
        "SELECT id, event_id, target_instance, envelope_json, attempts, reason, dead_at_ms
         FROM federation_dead_letters ORDER BY dead_at_ms ASC",
    )
    .fetch_all(pool)
    .await
}

/// Moves a dead-lettered row back into the outbox with attempts reset,
/// for an admin-triggered replay (spec §4.4: "an admin endpoint replays
/// or discards them").
pub async fn replay_dead_letter(pool: &DbPool, id: i64, now_ms: i64) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query_as::<_, FederationDeadLetterRow>(
        "SELECT id, event_id, target_instance, envelope_json, attempts, reason, dead_at_ms
         FROM federation_dead_letters WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(false);
    };

    sqlx::query(
        "INSERT INTO federation_outbox (event_id, target_instance, envelope_json, attempts, next_attempt_at_ms, created_at_ms)
         VALUES ($1, $2, $3, 0, $4, $4)
         ON CONFLICT (event_id, target_instance) DO UPDATE SET
             attempts = 0, next_attempt_at_ms = EXCLUDED.next_attempt_at_ms",
    )
    .bind(&row.event_id)
    .bind(&row.target_instance)
    .bind(serde_json::to_string(&row.envelope).map_err(|e| sqlx::Error::Protocol(e.to_string()))?)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM federation_dead_letters WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

pub async fn discard_dead_letter(pool: &DbPool, id: i64) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("DELETE FROM federation_dead_letters WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

// ── Key fingerprint audit ────────────────────────────────────────────────

/// Records a peer key fingerprint that didn't match what was previously
/// pinned, without rejecting the traffic outright (spec's
/// `KeyFingerprintMismatch` is surfaced to an operator, not auto-resolved).
pub async fn record_key_fingerprint_mismatch(
    pool: &DbPool,
    domain: &str,
    expected_fingerprint: Option<&str>,
    observed_fingerprint: &str,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO federation_key_audit (domain, expected_fingerprint, observed_fingerprint, recorded_at_ms, acknowledged)
         VALUES ($1, $2, $3, $4, FALSE)",
    )
    .bind(domain)
    .bind(expected_fingerprint)
    .bind(observed_fingerprint)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_key_audit_entries(pool: &DbPool, domain: Option<&str>) -> Result<Vec<KeyAuditRow>, sqlx::Error> {
    match domain {
        Some(domain) => {
            sqlx::query_as::<_, KeyAuditRow>(
                "SELECT id, domain, expected_fingerprint, observed_fingerprint, recorded_at_ms, acknowledged
                 FROM federation_key_audit WHERE domain = $1 ORDER BY recorded_at_ms DESC",
            )
            .bind(domain)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, KeyAuditRow>(
                "SELECT id, domain, expected_fingerprint, observed_fingerprint, recorded_at_ms, acknowledged
                 FROM federation_key_audit ORDER BY recorded_at_ms DESC",
            )
            .fetch_all(pool)
            .await
        }
    }
}

pub async fn acknowledge_key_audit_entry(pool: &DbPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE federation_key_audit SET acknowledged = TRUE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Local event history (backfill) ───────────────────────────────────────

/// Appends a locally-originated event to the HLC-ordered history used to
/// answer `GET /federation/events` backfill requests from peers that
/// reconnect after an outage.
#[allow(clippy::too_many_arguments)]
pub async fn append_event_log(
    pool: &DbPool,
    event_id: &str,
    event_type: &str,
    hlc_wall_ms: i64,
    hlc_counter: i64,
    hlc_instance: &str,
    source_instance: &str,
    payload: &Value,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO federation_events_log (
             event_id, event_type, hlc_wall_ms, hlc_counter, hlc_instance, source_instance, payload_json, recorded_at_ms
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (event_id) DO NOTHING",
    )
    .bind(event_id)
    .bind(event_type)
    .bind(hlc_wall_ms)
    .bind(hlc_counter)
    .bind(hlc_instance)
    .bind(source_instance)
    .bind(serde_json::to_string(payload).map_err(|e| sqlx::Error::Protocol(e.to_string()))?)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_event_log_entry(pool: &DbPool, event_id: &str) -> Result<Option<EventLogRow>, sqlx::Error> {
    sqlx::query_as::<_, EventLogRow>(
        "SELECT event_id, event_type, hlc_wall_ms, hlc_counter, hlc_instance, source_instance, payload_json, recorded_at_ms
         FROM federation_events_log WHERE event_id = $1",
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_events_log_since(
    pool: &DbPool,
    after_wall_ms: i64,
    after_counter: i64,
    limit: i64,
) -> Result<Vec<EventLogRow>, sqlx::Error> {
    sqlx::query_as::<_, EventLogRow>(
        "SELECT event_id, event_type, hlc_wall_ms, hlc_counter, hlc_instance, source_instance, payload_json, recorded_at_ms
         FROM federation_events_log
         WHERE (hlc_wall_ms, hlc_counter) > ($1, $2)
         ORDER BY hlc_wall_ms ASC, hlc_counter ASC
         LIMIT $3",
    )
    .bind(after_wall_ms)
    .bind(after_counter)
    .bind(limit)
    .fetch_all(pool)
    .await
}

// ── Transport replay nonce cache ─────────────────────────────────────────

/// Insert a replay key. Returns true if inserted, false when already seen.
pub async fn insert_transport_replay_key(
    pool: &DbPool,
    origin_server: &str,
    signature_hash: &str,
    request_ts: i64,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "INSERT INTO federation_transport_replay_cache (origin_server, signature_hash, request_ts)
         VALUES ($1, $2, $3)
         ON CONFLICT (origin_server, signature_hash) DO NOTHING",
    )
    .bind(origin_server)
    .bind(signature_hash)
    .bind(request_ts)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn prune_transport_replay_cache(pool: &DbPool, older_than_ms: i64) -> Result<u64, sqlx::Error> {
    let rows = sqlx::query("DELETE FROM federation_transport_replay_cache WHERE created_at_ms < $1")
        .bind(older_than_ms)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}

// ── Remote user / channel mirror mapping ─────────────────────────────────

pub async fn upsert_remote_user_mapping(
    pool: &DbPool,
    remote_user_id: &str,
    origin_server: &str,
    local_user_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO federation_remote_users (remote_user_id, origin_server, local_user_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (remote_user_id) DO UPDATE SET
             origin_server = EXCLUDED.origin_server,
             local_user_id = EXCLUDED.local_user_id",
    )
    .bind(remote_user_id)
    .bind(origin_server)
    .bind(local_user_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_remote_user_mapping(
    pool: &DbPool,
    remote_user_id: &str,
) -> Result<Option<RemoteFederatedUserRow>, sqlx::Error> {
    sqlx::query_as::<_, RemoteFederatedUserRow>(
        "SELECT remote_user_id, origin_server, local_user_id, created_at
         FROM federation_remote_users
         WHERE remote_user_id = $1",
    )
    .bind(remote_user_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_remote_user_mapping_by_local(
    pool: &DbPool,
    local_user_id: i64,
) -> Result<Option<RemoteFederatedUserRow>, sqlx::Error> {
    sqlx::query_as::<_, RemoteFederatedUserRow>(
        "SELECT remote_user_id, origin_server, local_user_id, created_at
         FROM federation_remote_users
         WHERE local_user_id = $1",
    )
    .bind(local_user_id)
    .fetch_optional(pool)
    .await
}

/// Tracks which remote instances mirror a local channel (spec §10.6
/// `channel_mirrors`): the set of peers that must receive an outbound
/// envelope whenever something happens in that channel.
pub async fn upsert_channel_mirror(
    pool: &DbPool,
    origin_server: &str,
    remote_channel_id: &str,
    local_channel_id: i64,
    local_guild_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channel_mirrors (origin_server, remote_channel_id, local_channel_id, local_guild_id)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (origin_server, remote_channel_id) DO UPDATE SET
             local_channel_id = EXCLUDED.local_channel_id,
             local_guild_id = EXCLUDED.local_guild_id",
    )
    .bind(origin_server)
    .bind(remote_channel_id)
    .bind(local_channel_id)
    .bind(local_guild_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_channel_mirror_by_remote(
    pool: &DbPool,
    origin_server: &str,
    remote_channel_id: &str,
) -> Result<Option<ChannelMirrorRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelMirrorRow>(
        "SELECT origin_server, remote_channel_id, local_channel_id, local_guild_id, created_at
         FROM channel_mirrors
         WHERE origin_server = $1 AND remote_channel_id = $2",
    )
    .bind(origin_server)
    .bind(remote_channel_id)
    .fetch_optional(pool)
    .await
}

/// All instances mirroring `local_channel_id`, i.e. the outbound fan-out
/// set for an event published in that channel.
pub async fn list_mirror_instances_for_channel(
    pool: &DbPool,
    local_channel_id: i64,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT origin_server FROM channel_mirrors WHERE local_channel_id = $1",
    )
    .bind(local_channel_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(domain,)| domain).collect())
}

pub async fn delete_channel_mirror(
    pool: &DbPool,
    origin_server: &str,
    remote_channel_id: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("DELETE FROM channel_mirrors WHERE origin_server = $1 AND remote_channel_id = $2")
        .bind(origin_server)
        .bind(remote_channel_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

// ── Local keypair storage ────────────────────────────────────────────────

/// Store or replace the local instance's ed25519 keypair (singleton row, id=1).
pub async fn upsert_server_keypair(
    pool: &DbPool,
    key_id: &str,
    signing_key_hex: &str,
    public_key_hex: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO server_keypair (id, key_id, signing_key_hex, public_key_hex)
         VALUES (1, $1, $2, $3)
         ON CONFLICT (id) DO UPDATE SET
             key_id = EXCLUDED.key_id,
             signing_key_hex = EXCLUDED.signing_key_hex,
             public_key_hex = EXCLUDED.public_key_hex",
    )
    .bind(key_id)
    .bind(signing_key_hex)
    .bind(public_key_hex)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load the local instance's keypair if it exists.
pub async fn get_server_keypair(pool: &DbPool) -> Result<Option<ServerKeypairRow>, sqlx::Error> {
    sqlx::query_as::<_, ServerKeypairRow>(
        "SELECT id, key_id, signing_key_hex, public_key_hex, created_at FROM server_keypair WHERE id = 1",
    )
    .fetch_optional(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use serde_json::json;

    async fn memory_pool() -> DbPool {
        let pool = create_pool("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    // Outbox status transitions form a DAG: pending -> retrying* -> (delivered
    // | dead), never backwards. `mark_outbox_delivered` removes the row
    // entirely (there's nothing further to transition from) and
    // `move_outbox_to_dead_letter` moves it to a separate table, so "no
    // reverse transition" means a delivered/dead row can never reappear in
    // the outbox under the same (event_id, target_instance).
    #[tokio::test]
    async fn delivered_outbox_row_is_removed_and_cannot_be_redelivered() {
        let pool = memory_pool().await;
        enqueue_outbox_entry(&pool, "evt-1", "b.example", &json!({"n": 1}), 1000)
            .await
            .unwrap();
        let due = fetch_due_outbox_entries(&pool, 1000, 10).await.unwrap();
        assert_eq!(due.len(), 1);

        mark_outbox_delivered(&pool, due[0].id).await.unwrap();

        let due_after = fetch_due_outbox_entries(&pool, 2000, 10).await.unwrap();
        assert!(due_after.is_empty());
        assert!(list_dead_letters(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retrying_an_outbox_row_advances_attempts_and_keeps_it_pending() {
        let pool = memory_pool().await;
        enqueue_outbox_entry(&pool, "evt-1", "b.example", &json!({"n": 1}), 1000)
            .await
            .unwrap();
        let due = fetch_due_outbox_entries(&pool, 1000, 10).await.unwrap();
        let id = due[0].id;

        mark_outbox_retry(&pool, id, 1, 5000).await.unwrap();

        assert!(fetch_due_outbox_entries(&pool, 2000, 10).await.unwrap().is_empty());
        let due_later = fetch_due_outbox_entries(&pool, 5000, 10).await.unwrap();
        assert_eq!(due_later.len(), 1);
        assert_eq!(due_later[0].attempts, 1);
    }

    #[tokio::test]
    async fn dead_lettered_row_leaves_the_outbox_and_never_reappears_there() {
        let pool = memory_pool().await;
        enqueue_outbox_entry(&pool, "evt-1", "b.example", &json!({"n": 1}), 1000)
            .await
            .unwrap();
        let due = fetch_due_outbox_entries(&pool, 1000, 10).await.unwrap();
        let id = due[0].id;

        let moved = move_outbox_to_dead_letter(&pool, id, "peer rejected", 2000)
            .await
            .unwrap();
        assert!(moved);

        assert!(fetch_due_outbox_entries(&pool, 999_999, 10).await.unwrap().is_empty());
        let dead = list_dead_letters(&pool).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event_id, "evt-1");
        assert_eq!(dead[0].reason, "peer rejected");

        // Moving an already-moved row a second time is a no-op, not a
        // duplicate dead letter or a resurrected outbox row.
        let moved_again = move_outbox_to_dead_letter(&pool, id, "peer rejected", 3000)
            .await
            .unwrap();
        assert!(!moved_again);
        assert_eq!(list_dead_letters(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replaying_a_dead_letter_resets_attempts_and_removes_it_from_dead_letters() {
        let pool = memory_pool().await;
        enqueue_outbox_entry(&pool, "evt-1", "b.example", &json!({"n": 1}), 1000)
            .await
            .unwrap();
        let due = fetch_due_outbox_entries(&pool, 1000, 10).await.unwrap();
        let id = due[0].id;
        mark_outbox_retry(&pool, id, 4, 5000).await.unwrap();
        move_outbox_to_dead_letter(&pool, id, "exhausted retries", 6000)
            .await
            .unwrap();

        let dead_id = list_dead_letters(&pool).await.unwrap()[0].id;
        let replayed = replay_dead_letter(&pool, dead_id, 7000).await.unwrap();
        assert!(replayed);

        assert!(list_dead_letters(&pool).await.unwrap().is_empty());
        let due_after_replay = fetch_due_outbox_entries(&pool, 7000, 10).await.unwrap();
        assert_eq!(due_after_replay.len(), 1);
        assert_eq!(due_after_replay[0].attempts, 0);
    }

    #[tokio::test]
    async fn discarding_a_dead_letter_twice_only_removes_it_once() {
        let pool = memory_pool().await;
        enqueue_outbox_entry(&pool, "evt-1", "b.example", &json!({"n": 1}), 1000)
            .await
            .unwrap();
        let id = fetch_due_outbox_entries(&pool, 1000, 10).await.unwrap()[0].id;
        move_outbox_to_dead_letter(&pool, id, "bad envelope", 2000)
            .await
            .unwrap();
        let dead_id = list_dead_letters(&pool).await.unwrap()[0].id;

        assert!(discard_dead_letter(&pool, dead_id).await.unwrap());
        assert!(!discard_dead_letter(&pool, dead_id).await.unwrap());
    }

    // Federation-inbound idempotence: appending the same event_id twice is a
    // no-op (`ON CONFLICT (event_id) DO NOTHING`), so a retried/duplicated
    // delivery from a peer never produces a second history entry.
    #[tokio::test]
    async fn appending_the_same_event_id_twice_is_a_no_op() {
        let pool = memory_pool().await;
        append_event_log(&pool, "evt-dup", "MESSAGE_CREATE", 100, 0, "b.example", "b.example", &json!({"v": 1}), 1000)
            .await
            .unwrap();
        append_event_log(&pool, "evt-dup", "MESSAGE_CREATE", 200, 0, "b.example", "b.example", &json!({"v": 2}), 2000)
            .await
            .unwrap();

        let entry = get_event_log_entry(&pool, "evt-dup").await.unwrap().unwrap();
        assert_eq!(entry.hlc_wall_ms, 100);
        assert_eq!(entry.payload, json!({"v": 1}));

        let since = list_events_log_since(&pool, 0, 0, 10).await.unwrap();
        assert_eq!(since.len(), 1);
    }

    #[tokio::test]
    async fn transport_replay_key_is_accepted_once_and_rejected_on_repeat() {
        let pool = memory_pool().await;
        let first = insert_transport_replay_key(&pool, "b.example", "sig-hash-1", 1000)
            .await
            .unwrap();
        let second = insert_transport_replay_key(&pool, "b.example", "sig-hash-1", 1000)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }
}
