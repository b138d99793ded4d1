//! HTTP surface for the federation subsystem: the wire contract peers speak
//! (`well_known`, `inbox`, `handshake`, `voice_token`), the outbox scan the
//! delivery worker drives, and the admin endpoints that manage instances,
//! dead letters, and key-fingerprint audit entries (spec §4.4, §6).

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use amityvox_core::AppState;
use amityvox_federation::{
    client::{DeliveryWorker, OutboxDecision, OutboxRow},
    protocol::{
        FederationEnvelope, HandshakeRequest, HandshakeResponse, InboxOutcome, VoiceRelayAction,
        VoiceRelayActionRequest, VoiceRelayActionResponse, WellKnownInstance,
    },
    FederationError, FederationMode, FederationService, VoiceMode,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AdminUser;
use crate::routes::security;

/// Maximum serialized size for an inbound federation envelope's payload.
const MAX_CONTENT_SIZE_BYTES: usize = 1_048_576;
/// Maximum JSON nesting depth for an inbound federation envelope's payload.
const MAX_CONTENT_DEPTH: usize = 32;
/// Maximum number of elements/keys allowed in a single JSON collection.
const MAX_COLLECTION_LENGTH: usize = 10_000;

fn validate_federation_content(content: &Value) -> Result<(), ApiError> {
    let serialized = serde_json::to_vec(content).unwrap_or_default();
    if serialized.len() > MAX_CONTENT_SIZE_BYTES {
        return Err(ApiError::BadRequest(format!(
            "federation event payload exceeds maximum size of {} bytes",
            MAX_CONTENT_SIZE_BYTES
        )));
    }
    match validate_json_structure(content) {
        Err(reason) => return Err(ApiError::BadRequest(reason.to_string())),
        Ok(depth) if depth > MAX_CONTENT_DEPTH => {
            return Err(ApiError::BadRequest(format!(
                "federation event payload exceeds maximum nesting depth of {}",
                MAX_CONTENT_DEPTH
            )));
        }
        _ => {}
    }
    Ok(())
}

fn validate_json_structure(value: &Value) -> Result<usize, &'static str> {
    match value {
        Value::Array(arr) => {
            if arr.len() > MAX_COLLECTION_LENGTH {
                return Err("federation event payload array exceeds maximum element count");
            }
            let mut max_child = 0;
            for child in arr {
                max_child = max_child.max(validate_json_structure(child)?);
            }
            Ok(1 + max_child)
        }
        Value::Object(obj) => {
            if obj.len() > MAX_COLLECTION_LENGTH {
                return Err("federation event payload object exceeds maximum key count");
            }
            let mut max_child = 0;
            for child in obj.values() {
                max_child = max_child.max(validate_json_structure(child)?);
            }
            Ok(1 + max_child)
        }
        _ => Ok(0),
    }
}

fn db_err(e: sqlx::Error) -> ApiError {
    ApiError::Internal(anyhow::anyhow!("federation database error: {e}"))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn federation_service(state: &AppState) -> Result<&FederationService, ApiError> {
    state
        .federation_service
        .as_ref()
        .filter(|s| s.is_enabled())
        .ok_or_else(|| ApiError::ServiceUnavailable("federation is disabled on this instance".into()))
}

// ── Discovery ─────────────────────────────────────────────────────────────

/// `GET /federation/.well-known/instance` (spec §6).
pub async fn well_known(State(state): State<AppState>) -> Result<Json<WellKnownInstance>, ApiError> {
    let service = federation_service(&state)?;
    Ok(Json(service.well_known_document()))
}

// ── Handshake ─────────────────────────────────────────────────────────────

/// `POST /federation/handshake` (spec §4.4): consumes the one-shot token an
/// operator handed to `requester_domain` out-of-band, pins the requester's
/// public key, and marks the pairing complete so `closed`-mode can accept
/// inbound traffic from them.
pub async fn handshake(
    State(state): State<AppState>,
    Json(req): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>, ApiError> {
    let service = federation_service(&state)?;

    let instance = amityvox_db::federation::get_instance(&state.db, &req.requester_domain)
        .await
        .map_err(db_err)?;
    let token_matches = instance
        .as_ref()
        .and_then(|i| i.handshake_token.as_deref())
        .is_some_and(|stored| stored == req.token);
    if !token_matches {
        return Err(ApiError::Forbidden);
    }

    let now = now_ms();
    let fingerprint = fingerprint_of_hex(&req.requester_public_key);
    amityvox_db::federation::upsert_instance(
        &state.db,
        &req.requester_domain,
        "closed",
        "direct",
        false,
        Some(&req.requester_public_key),
        Some(&fingerprint),
        now,
    )
    .await
    .map_err(db_err)?;
    amityvox_db::federation::mark_handshake_completed(&state.db, &req.requester_domain, now)
        .await
        .map_err(db_err)?;

    Ok(Json(HandshakeResponse {
        accepted: true,
        peer_domain: service.domain().to_string(),
        peer_public_key: service.signing_public_key_hex().unwrap_or_default(),
    }))
}

fn fingerprint_of_hex(hex: &str) -> String {
    hex.chars().take(16).collect()
}

// ── Inbox ─────────────────────────────────────────────────────────────────

/// `POST /federation/inbox` (spec §4.4 inbound path, steps 1-6).
pub async fn inbox(
    State(state): State<AppState>,
    Json(envelope): Json<FederationEnvelope>,
) -> Result<axum::http::StatusCode, ApiError> {
    let outcome = ingest_envelope(&state, envelope).await?;
    axum::http::StatusCode::from_u16(outcome.http_status())
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("invalid inbox status code")))
}

async fn ingest_envelope(state: &AppState, envelope: FederationEnvelope) -> Result<InboxOutcome, ApiError> {
    let service = match state.federation_service.as_ref() {
        Some(s) if s.is_enabled() => s,
        _ => return Ok(InboxOutcome::PolicyRejected),
    };

    validate_federation_content(&envelope.payload)?;

    // Step 1: verify signature against the sender's published key.
    let observed_fingerprint = match service.verify_inbound(&envelope).await {
        Ok(fp) => fp,
        Err(FederationError::Http(_) | FederationError::RemoteError(_) | FederationError::Database(_)) => {
            return Ok(InboxOutcome::Transient);
        }
        Err(_) => return Ok(InboxOutcome::BadSignature),
    };

    // Step 2: check the observed fingerprint against what's pinned for this
    // peer (trust-on-first-contact if we've never seen them before).
    let instance = amityvox_db::federation::get_instance(&state.db, &envelope.source_instance)
        .await
        .map_err(db_err)?;
    match instance.as_ref().and_then(|i| i.key_fingerprint.as_deref()) {
        Some(expected) if expected != observed_fingerprint => {
            amityvox_db::federation::record_key_fingerprint_mismatch(
                &state.db,
                &envelope.source_instance,
                Some(expected),
                &observed_fingerprint,
                now_ms(),
            )
            .await
            .map_err(db_err)?;
            return Ok(InboxOutcome::BadSignature);
        }
        Some(_) => {}
        None => {
            amityvox_db::federation::upsert_instance(
                &state.db,
                &envelope.source_instance,
                "public",
                "direct",
                false,
                None,
                Some(&observed_fingerprint),
                now_ms(),
            )
            .await
            .map_err(db_err)?;
        }
    }

    // Step 3: this instance's federation mode must accept from this peer.
    let handshake_completed = amityvox_db::federation::is_handshake_completed(&state.db, &envelope.source_instance)
        .await
        .map_err(db_err)?;
    if !service.mode().accepts_inbound(handshake_completed) {
        return Ok(InboxOutcome::PolicyRejected);
    }

    // Step 4: dedup on (id, source_instance, target_instance).
    let dedup_key = envelope.dedup_key(service.domain());
    if amityvox_db::federation::get_event_log_entry(&state.db, &dedup_key)
        .await
        .map_err(db_err)?
        .is_some()
    {
        return Ok(InboxOutcome::Duplicate);
    }

    // Step 5: advance the local HLC past the inbound timestamp.
    let incoming_hlc = amityvox_core::hlc::Hlc {
        wall_ms: envelope.hlc.wall_ms,
        counter: envelope.hlc.counter,
        instance_id: envelope.hlc.instance_id.clone(),
    };
    let local_hlc = state.clock.advance_past(&incoming_hlc);

    amityvox_db::federation::touch_instance(&state.db, &envelope.source_instance, now_ms())
        .await
        .map_err(db_err)?;

    // Step 6: translate into a local effect and publish, recording the
    // event so a retransmit of the same envelope dedups cleanly.
    translate_inbound_event(state, &envelope).await?;

    amityvox_db::federation::append_event_log(
        &state.db,
        &dedup_key,
        &envelope.r#type,
        local_hlc.wall_ms,
        local_hlc.counter as i64,
        &local_hlc.instance_id,
        &envelope.source_instance,
        &envelope.payload,
        now_ms(),
    )
    .await
    .map_err(db_err)?;

    Ok(InboxOutcome::Accepted)
}

/// Translates an accepted inbound envelope into a local database write and
/// bus dispatch. `MESSAGE_CREATE` is translated concretely via a shadow
/// remote-user mapping; other event types that arrive for a mirrored
/// channel are republished to the bus as-is so connected clients still see
/// them, without a local row to back them — extending this table with a
/// concrete per-type translation (edits, reactions, membership) is future
/// work, the same shape `MESSAGE_CREATE` demonstrates.
async fn translate_inbound_event(state: &AppState, envelope: &FederationEnvelope) -> Result<(), ApiError> {
    match envelope.r#type.as_str() {
        "MESSAGE_CREATE" => translate_inbound_message_create(state, envelope).await,
        _ => {
            let remote_channel_id = envelope
                .payload
                .get("remote_channel_id")
                .and_then(Value::as_str);
            let Some(remote_channel_id) = remote_channel_id else {
                return Ok(());
            };
            let mirror = amityvox_db::federation::get_channel_mirror_by_remote(
                &state.db,
                &envelope.source_instance,
                remote_channel_id,
            )
            .await
            .map_err(db_err)?;
            if let Some(mirror) = mirror {
                state
                    .event_bus
                    .dispatch(&envelope.r#type, envelope.payload.clone(), Some(mirror.local_guild_id));
            }
            Ok(())
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteMessageCreatePayload {
    remote_channel_id: String,
    remote_author_id: String,
    author_username: String,
    content: String,
    reference_id: Option<i64>,
}

async fn translate_inbound_message_create(state: &AppState, envelope: &FederationEnvelope) -> Result<(), ApiError> {
    let payload: RemoteMessageCreatePayload = serde_json::from_value(envelope.payload.clone())
        .map_err(|e| ApiError::BadRequest(format!("malformed MESSAGE_CREATE payload: {e}")))?;

    let mirror = amityvox_db::federation::get_channel_mirror_by_remote(
        &state.db,
        &envelope.source_instance,
        &payload.remote_channel_id,
    )
    .await
    .map_err(db_err)?;
    let Some(mirror) = mirror else {
        // No local channel mirrors this remote channel; nothing to do.
        return Ok(());
    };

    let author_id = resolve_shadow_user(state, &envelope.source_instance, &payload.remote_author_id, &payload.author_username)
        .await?;

    amityvox_db::members::add_member(&state.db, author_id, mirror.local_guild_id)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e.to_string())))?;
    state.member_index.add_member(mirror.local_guild_id, author_id);

    let message_id = amityvox_util::snowflake::generate(1);
    let msg = amityvox_db::messages::create_message_with_meta(
        &state.db,
        message_id,
        mirror.local_channel_id,
        author_id,
        &payload.content,
        0,
        payload.reference_id,
        0,
        None,
        None,
    )
    .await
    .map_err(|e| ApiError::Internal(anyhow::anyhow!(e.to_string())))?;

    state.event_bus.dispatch(
        "MESSAGE_CREATE",
        json!({
            "id": msg.id.to_string(),
            "channel_id": msg.channel_id.to_string(),
            "author_id": msg.author_id.to_string(),
            "content": msg.content,
            "message_type": msg.message_type,
            "reference_id": msg.reference_id.map(|id| id.to_string()),
            "created_at": msg.created_at,
        }),
        Some(mirror.local_guild_id),
    );

    Ok(())
}

/// Resolves `remote_user_id` (scoped to `origin_server`) to a local user
/// row, creating a shadow account on first sight. Shadow accounts can
/// never log in locally (their password hash is a fixed sentinel) and
/// bypass `amityvox_core::message`'s permission gate entirely, since a
/// remote author can't hold a local guild membership to check against.
async fn resolve_shadow_user(
    state: &AppState,
    origin_server: &str,
    remote_user_id: &str,
    author_username: &str,
) -> Result<i64, ApiError> {
    if let Some(existing) = amityvox_db::federation::get_remote_user_mapping(&state.db, remote_user_id)
        .await
        .map_err(db_err)?
    {
        return Ok(existing.local_user_id);
    }

    let username = sanitize_remote_username(author_username);
    let discriminator = (amityvox_util::snowflake::generate(1).rem_euclid(10_000)) as i16;
    let email = format!("{remote_user_id}@federation.{origin_server}.invalid");
    let user_id = amityvox_util::snowflake::generate(1);

    let user = amityvox_db::users::create_user(
        &state.db,
        user_id,
        &username,
        discriminator,
        &email,
        "!federation-shadow-account!",
    )
    .await
    .map_err(|e| ApiError::Internal(anyhow::anyhow!(e.to_string())))?;

    amityvox_db::federation::upsert_remote_user_mapping(&state.db, remote_user_id, origin_server, user.id)
        .await
        .map_err(db_err)?;

    Ok(user.id)
}

fn sanitize_remote_username(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    let cleaned = if cleaned.len() < 2 {
        format!("remote_{cleaned}")
    } else {
        cleaned
    };
    cleaned.chars().take(32).collect()
}

// ── Voice relay ───────────────────────────────────────────────────────────

/// `POST /federation/voice/token`: the peer side of a voice relay action.
/// Forwarded straight through to the native media/voice stack is out of
/// scope for the realtime core (spec §1); this handler only validates the
/// envelope and signs a reply, leaving token issuance itself to whatever
/// local voice manager already backs in-process calls — a relay request
/// for a room this instance doesn't actually host comes back empty.
pub async fn voice_token(
    State(state): State<AppState>,
    Json(envelope): Json<FederationEnvelope>,
) -> Result<Json<FederationEnvelope>, ApiError> {
    let service = federation_service(&state)?;

    service
        .verify_inbound(&envelope)
        .await
        .map_err(|_| ApiError::Unauthorized)?;

    let _request: VoiceRelayActionRequest = serde_json::from_value(envelope.payload.clone())
        .map_err(|e| ApiError::BadRequest(format!("malformed voice relay request: {e}")))?;

    // This instance has no SFU room matching the request to hand a token
    // for; reply with an empty acknowledgement rather than rejecting
    // outright, since StartStream/StopStream acks carry no token either.
    let response = VoiceRelayActionResponse {
        livekit_token: None,
        livekit_url: None,
        room_name: None,
        expires_at_ms: None,
    };

    let reply = service
        .sign(FederationEnvelope {
            id: amityvox_util::ulid::generate().to_string(),
            r#type: "VOICE_RELAY".to_string(),
            hlc: amityvox_federation::protocol::HlcWire {
                wall_ms: now_ms(),
                counter: 0,
                instance_id: service.domain().to_string(),
            },
            source_instance: service.domain().to_string(),
            payload: serde_json::to_value(&response).map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?,
            signature: None,
        })
        .map_err(ApiError::from)?;

    Ok(Json(reply))
}

/// Called by `routes::voice` before falling back to a local LiveKit/native
/// room: if the channel is mirrored to a remote instance and both sides
/// use `voice_mode = relay`, requests a signed voice token/stream action
/// from that peer. Returns `Ok(None)` when there's no remote peer to relay
/// to, letting the caller proceed with its normal local path.
pub async fn request_voice_relay_for_channel(
    state: &AppState,
    channel_id: i64,
    user_id: i64,
    action: VoiceRelayAction,
    stream_title: Option<String>,
) -> Result<Option<VoiceRelayActionResponse>, ApiError> {
    let Some(service) = state.federation_service.as_ref().filter(|s| s.is_enabled()) else {
        return Ok(None);
    };
    if service.config().voice_mode != VoiceMode::Relay {
        return Ok(None);
    }

    let peers = amityvox_db::federation::list_mirror_instances_for_channel(&state.db, channel_id)
        .await
        .map_err(db_err)?;
    let Some(peer_domain) = peers.into_iter().next() else {
        return Ok(None);
    };

    let request = VoiceRelayActionRequest {
        room_id: channel_id.to_string(),
        requesting_user_id: user_id.to_string(),
        requesting_instance: service.domain().to_string(),
        action,
        stream_title,
    };

    let response = service
        .request_voice_relay(&peer_domain, request)
        .await
        .map_err(ApiError::from)?;
    Ok(Some(response))
}

// ── Outbox delivery worker ───────────────────────────────────────────────

/// Drains up to `batch` due outbox rows, attempting delivery for each and
/// applying the resulting decision. Called on a fixed interval by
/// `amityvox-server`'s delivery worker task (spec §4.4 steps 3-6).
pub async fn run_federation_outbox_scan_once(state: &AppState, service: &FederationService, batch: i64) {
    let due = match amityvox_db::federation::fetch_due_outbox_entries(&state.db, now_ms(), batch).await {
        Ok(rows) => rows,
        Err(err) => {
            tracing::warn!(error = %err, "federation: failed to fetch due outbox entries");
            return;
        }
    };
    if due.is_empty() {
        return;
    }

    let config = service.config();
    let worker = match DeliveryWorker::new(config.max_attempts, config.base_backoff_secs, config.max_backoff_secs) {
        Ok(worker) => worker,
        Err(err) => {
            tracing::error!(error = %err, "federation: failed to build delivery worker");
            return;
        }
    };

    for row in due {
        let envelope: FederationEnvelope = match serde_json::from_value(row.envelope.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(id = row.id, error = %err, "federation: outbox row has unparsable envelope, dead-lettering");
                let _ = amityvox_db::federation::move_outbox_to_dead_letter(
                    &state.db,
                    row.id,
                    "envelope failed to deserialize",
                    now_ms(),
                )
                .await;
                continue;
            }
        };

        let outbox_row = OutboxRow {
            envelope,
            target_instance: row.target_instance.clone(),
            attempts: row.attempts as u32,
        };
        let decision = worker.attempt(&outbox_row).await;

        let result = match decision {
            OutboxDecision::Delivered => amityvox_db::federation::mark_outbox_delivered(&state.db, row.id).await,
            OutboxDecision::Retry { next_attempt_at_ms, attempts } => {
                amityvox_db::federation::mark_outbox_retry(&state.db, row.id, attempts as i64, next_attempt_at_ms).await
            }
            OutboxDecision::Dead { reason, .. } => {
                amityvox_db::federation::move_outbox_to_dead_letter(&state.db, row.id, &reason, now_ms())
                    .await
                    .map(|_| ())
            }
        };
        if let Err(err) = result {
            tracing::error!(id = row.id, error = %err, "federation: failed to persist outbox delivery decision");
        }
    }
}

// ── Admin: instances ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UpsertInstanceRequest {
    pub domain: String,
    pub mode: String,
    pub voice_mode: String,
}

pub async fn list_instances(State(state): State<AppState>, _admin: AdminUser) -> Result<Json<Value>, ApiError> {
    let instances = amityvox_db::federation::list_instances(&state.db).await.map_err(db_err)?;
    Ok(Json(json!({ "instances": instances })))
}

pub async fn upsert_instance(
    State(state): State<AppState>,
    admin: AdminUser,
    headers: HeaderMap,
    Json(req): Json<UpsertInstanceRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_federation_mode(&req.mode)?;
    amityvox_db::federation::upsert_instance(
        &state.db,
        &req.domain,
        &req.mode,
        &req.voice_mode,
        false,
        None,
        None,
        now_ms(),
    )
    .await
    .map_err(db_err)?;

    security::log_security_event(
        &state,
        "admin.federation.instance_upserted",
        Some(admin.user_id),
        None,
        None,
        Some(&headers),
        Some(json!({ "domain": req.domain, "mode": req.mode })),
    )
    .await;

    Ok(Json(json!({ "ok": true })))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    admin: AdminUser,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let deleted = amityvox_db::federation::delete_instance(&state.db, &domain).await.map_err(db_err)?;
    if !deleted {
        return Err(ApiError::NotFound);
    }
    security::log_security_event(
        &state,
        "admin.federation.instance_deleted",
        Some(admin.user_id),
        None,
        None,
        Some(&headers),
        Some(json!({ "domain": domain })),
    )
    .await;
    Ok(Json(json!({ "ok": true })))
}

/// Mints a one-shot handshake token for `domain`, to be copied out-of-band
/// to that peer's operator for `closed`-mode pairing (spec §4.4).
pub async fn create_handshake_token(
    State(state): State<AppState>,
    admin: AdminUser,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let token = amityvox_util::ulid::generate().to_string();
    amityvox_db::federation::set_handshake_token(&state.db, &domain, &token)
        .await
        .map_err(db_err)?;
    security::log_security_event(
        &state,
        "admin.federation.handshake_token_created",
        Some(admin.user_id),
        None,
        None,
        Some(&headers),
        Some(json!({ "domain": domain })),
    )
    .await;
    Ok(Json(json!({ "token": token })))
}

// ── Admin: dead letters ───────────────────────────────────────────────────

pub async fn list_dead_letters(State(state): State<AppState>, _admin: AdminUser) -> Result<Json<Value>, ApiError> {
    let rows = amityvox_db::federation::list_dead_letters(&state.db).await.map_err(db_err)?;
    Ok(Json(json!({
        "dead_letters": rows.into_iter().map(|r| json!({
            "id": r.id,
            "event_id": r.event_id,
            "target_instance": r.target_instance,
            "envelope": r.envelope,
            "attempts": r.attempts,
            "reason": r.reason,
            "dead_at_ms": r.dead_at_ms,
        })).collect::<Vec<_>>()
    })))
}

pub async fn replay_dead_letter(
    State(state): State<AppState>,
    admin: AdminUser,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let replayed = amityvox_db::federation::replay_dead_letter(&state.db, id, now_ms())
        .await
        .map_err(db_err)?;
    if !replayed {
        return Err(ApiError::NotFound);
    }
    security::log_security_event(
        &state,
        "admin.federation.dead_letter_replayed",
        Some(admin.user_id),
        None,
        None,
        Some(&headers),
        Some(json!({ "id": id })),
    )
    .await;
    Ok(Json(json!({ "ok": true })))
}

pub async fn discard_dead_letter(
    State(state): State<AppState>,
    admin: AdminUser,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let discarded = amityvox_db::federation::discard_dead_letter(&state.db, id).await.map_err(db_err)?;
    if !discarded {
        return Err(ApiError::NotFound);
    }
    security::log_security_event(
        &state,
        "admin.federation.dead_letter_discarded",
        Some(admin.user_id),
        None,
        None,
        Some(&headers),
        Some(json!({ "id": id })),
    )
    .await;
    Ok(Json(json!({ "ok": true })))
}

// ── Admin: key audit ──────────────────────────────────────────────────────

pub async fn list_key_audit_entries(State(state): State<AppState>, _admin: AdminUser) -> Result<Json<Value>, ApiError> {
    let rows = amityvox_db::federation::list_key_audit_entries(&state.db, None)
        .await
        .map_err(db_err)?;
    Ok(Json(json!({
        "key_audit": rows.into_iter().map(|r| json!({
            "id": r.id,
            "domain": r.domain,
            "expected_fingerprint": r.expected_fingerprint,
            "observed_fingerprint": r.observed_fingerprint,
            "recorded_at_ms": r.recorded_at_ms,
            "acknowledged": r.acknowledged,
        })).collect::<Vec<_>>()
    })))
}

pub async fn acknowledge_key_audit_entry(
    State(state): State<AppState>,
    admin: AdminUser,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    amityvox_db::federation::acknowledge_key_audit_entry(&state.db, id)
        .await
        .map_err(db_err)?;
    security::log_security_event(
        &state,
        "admin.federation.key_audit_acknowledged",
        Some(admin.user_id),
        None,
        None,
        Some(&headers),
        Some(json!({ "id": id })),
    )
    .await;
    Ok(Json(json!({ "ok": true })))
}

fn validate_federation_mode(s: &str) -> Result<(), ApiError> {
    use std::str::FromStr;
    FederationMode::from_str(s)
        .map(|_| ())
        .map_err(|_| ApiError::BadRequest(format!("invalid federation mode: {s}")))
}
