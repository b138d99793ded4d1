use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use amityvox_core::{observability, AppState};
use amityvox_models::gateway::*;
use amityvox_models::permissions::Permissions;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant};

use crate::compression::WsCompressor;
use crate::session::Session;

const HEARTBEAT_INTERVAL_MS: u64 = 41250;
const HEARTBEAT_TIMEOUT_MS: u64 = 90000;
const SESSION_TTL_SECONDS: i64 = 3600;
const HEARTBEAT_ACK_MSG: &str = r#"{"op":11}"#;
const HELLO_MSG_PREFIX: &str = r#"{"op":10,"d":{"heartbeat_interval":"#;
const HELLO_MSG_SUFFIX: &str = r#"}}"#;
const SESSION_CACHE_MAX_ENTRIES_DEFAULT: usize = 20_000;
const WS_MAX_GLOBAL_CONNECTIONS_DEFAULT: usize = 2_000;
const WS_MAX_CONNECTIONS_PER_USER_DEFAULT: usize = 5;
const WS_MAX_MESSAGES_PER_MINUTE_DEFAULT: u32 = 240;
const WS_MAX_PRESENCE_UPDATES_PER_MINUTE_DEFAULT: u32 = 60;
const WS_MAX_TYPING_EVENTS_PER_MINUTE_DEFAULT: u32 = 120;
const WS_MAX_VOICE_UPDATES_PER_MINUTE_DEFAULT: u32 = 60;

#[derive(Clone)]
#[allow(dead_code)]
struct CachedSession {
    user_id: i64,
    guild_ids: Vec<i64>,
    guild_owner_ids: HashMap<i64, i64>,
    sequence: u64,
    updated_at: i64,
}

static SESSION_CACHE: OnceLock<moka::future::Cache<String, CachedSession>> = OnceLock::new();
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
static USER_CONNECTIONS: OnceLock<dashmap::DashMap<i64, usize>> = OnceLock::new();

struct BufferedEvent {
    sequence: u64,
    event_type: String,
    payload: Arc<Value>,
    timestamp: Instant,
}

static EVENT_BUFFERS: OnceLock<dashmap::DashMap<String, VecDeque<BufferedEvent>>> = OnceLock::new();

fn event_buffers() -> &'static dashmap::DashMap<String, VecDeque<BufferedEvent>> {
    EVENT_BUFFERS.get_or_init(|| {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // skip immediate first tick
            loop {
                interval.tick().await;
                if let Some(buffers) = EVENT_BUFFERS.get() {
                    let keys: Vec<String> = buffers.iter().map(|r| r.key().clone()).collect();
                    for key in keys {
                        buffers.remove_if(&key, |_, buffer| {
                            buffer
                                .back()
                                .is_none_or(|e| e.timestamp.elapsed() > MAX_REPLAY_AGE)
                        });
                    }
                }
            }
        });
        dashmap::DashMap::new()
    })
}

const MAX_REPLAY_EVENTS: usize = 100;
const MAX_REPLAY_AGE: Duration = Duration::from_secs(300); // 5 minutes

fn session_cache() -> &'static moka::future::Cache<String, CachedSession> {
    SESSION_CACHE.get_or_init(|| {
        moka::future::Cache::builder()
            .max_capacity(ws_limits().session_cache_max_entries as u64)
            .time_to_live(std::time::Duration::from_secs(SESSION_TTL_SECONDS as u64))
            .build()
    })
}

fn user_connections() -> &'static dashmap::DashMap<i64, usize> {
    USER_CONNECTIONS.get_or_init(dashmap::DashMap::new)
}

const MAX_ACTIVITY_ITEMS: usize = 8;
const MAX_ACTIVITY_TEXT_LEN: usize = 256;

#[derive(Clone, Copy)]
struct WsLimits {
    max_global_connections: usize,
    max_connections_per_user: usize,
    max_messages_per_minute: u32,
    max_presence_updates_per_minute: u32,
    max_typing_events_per_minute: u32,
    max_voice_updates_per_minute: u32,
    session_cache_max_entries: usize,
}

static WS_LIMITS: OnceLock<WsLimits> = OnceLock::new();

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn ws_limits() -> WsLimits {
    *WS_LIMITS.get_or_init(|| WsLimits {
        max_global_connections: env_usize(
            "AMITYVOX_WS_MAX_CONNECTIONS",
            WS_MAX_GLOBAL_CONNECTIONS_DEFAULT,
        ),
        max_connections_per_user: env_usize(
            "AMITYVOX_WS_MAX_CONNECTIONS_PER_USER",
            WS_MAX_CONNECTIONS_PER_USER_DEFAULT,
        ),
        max_messages_per_minute: env_u32(
            "AMITYVOX_WS_MAX_MESSAGES_PER_MINUTE",
            WS_MAX_MESSAGES_PER_MINUTE_DEFAULT,
        ),
        max_presence_updates_per_minute: env_u32(
            "AMITYVOX_WS_MAX_PRESENCE_UPDATES_PER_MINUTE",
            WS_MAX_PRESENCE_UPDATES_PER_MINUTE_DEFAULT,
        ),
        max_typing_events_per_minute: env_u32(
            "AMITYVOX_WS_MAX_TYPING_EVENTS_PER_MINUTE",
            WS_MAX_TYPING_EVENTS_PER_MINUTE_DEFAULT,
        ),
        max_voice_updates_per_minute: env_u32(
            "AMITYVOX_WS_MAX_VOICE_UPDATES_PER_MINUTE",
            WS_MAX_VOICE_UPDATES_PER_MINUTE_DEFAULT,
        ),
        session_cache_max_entries: env_usize(
            "AMITYVOX_WS_SESSION_CACHE_MAX_ENTRIES",
            SESSION_CACHE_MAX_ENTRIES_DEFAULT,
        ),
    })
}

fn wire_log_ws_in(
    user_id: Option<i64>,
    session_id: Option<&str>,
    opcode: u8,
    payload: &str,
    frame_type: &str,
) {
    if !observability::wire_trace_enabled() {
        return;
    }
    let payload_preview = observability::wire_trace_payload_preview(payload);
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "in",
        frame_type,
        user_id = ?user_id,
        session_id = ?session_id,
        opcode,
        bytes = payload.len(),
        payload_preview = ?payload_preview,
        "server_in"
    );
}

fn wire_log_ws_out(
    user_id: Option<i64>,
    session_id: Option<&str>,
    opcode: Option<u8>,
    payload: &str,
    frame_type: &str,
    event_type: Option<&str>,
    sequence: Option<u64>,
) {
    if !observability::wire_trace_enabled() {
        return;
    }
    let payload_preview = observability::wire_trace_payload_preview(payload);
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "out",
        frame_type,
        user_id = ?user_id,
        session_id = ?session_id,
        opcode = ?opcode,
        event_type = ?event_type,
        sequence = ?sequence,
        bytes = payload.len(),
        payload_preview = ?payload_preview,
        "server_out"
    );
}

fn wire_log_ws_close(
    user_id: Option<i64>,
    session_id: Option<&str>,
    code: u16,
    reason: &str,
    frame_type: &str,
) {
    if !observability::wire_trace_enabled() {
        return;
    }
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "out",
        frame_type,
        user_id = ?user_id,
        session_id = ?session_id,
        code,
        reason,
        "server_out"
    );
}

#[allow(clippy::too_many_arguments)]
async fn send_ws_text_logged(
    sender: &mut (impl SinkExt<Message> + Unpin),
    payload: String,
    compressor: &WsCompressor,
    user_id: Option<i64>,
    session_id: Option<&str>,
    frame_type: &str,
    opcode: Option<u8>,
    event_type: Option<&str>,
    sequence: Option<u64>,
) -> Result<(), ()> {
    wire_log_ws_out(
        user_id, session_id, opcode, &payload, frame_type, event_type, sequence,
    );

    if let Some(result) = compressor.compress(&payload) {
        match result {
            Ok(compressed) => sender
                .send(Message::Binary(compressed.into()))
                .await
                .map_err(|_| ()),
            Err(e) => {
                tracing::warn!("zlib-stream compression failed, sending uncompressed: {e}");
                sender
                    .send(Message::Text(payload.into()))
                    .await
                    .map_err(|_| ())
            }
        }
    } else {
        sender
            .send(Message::Text(payload.into()))
            .await
            .map_err(|_| ())
    }
}

async fn send_ws_close_logged(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
    user_id: Option<i64>,
    session_id: Option<&str>,
    frame_type: &str,
) -> Result<(), ()> {
    wire_log_ws_close(user_id, session_id, code, reason, frame_type);
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

struct ConnectionGuard {
    user_id: Option<i64>,
    global_acquired: bool,
}

impl ConnectionGuard {
    fn new() -> Self {
        Self {
            user_id: None,
            global_acquired: false,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(user_id) = self.user_id.take() {
            if let Some(mut count) = user_connections().get_mut(&user_id) {
                if *count <= 1 {
                    drop(count);
                    user_connections().remove(&user_id);
                } else {
                    *count -= 1;
                }
            }
        }
        if self.global_acquired {
            observability::ws_connection_close();
            ACTIVE_CONNECTIONS.fetch_sub(1, AtomicOrdering::SeqCst);
        }
    }
}

fn try_acquire_global_connection_slot() -> bool {
    let limits = ws_limits();
    let mut current = ACTIVE_CONNECTIONS.load(AtomicOrdering::SeqCst);
    loop {
        if current >= limits.max_global_connections {
            return false;
        }
        match ACTIVE_CONNECTIONS.compare_exchange(
            current,
            current + 1,
            AtomicOrdering::SeqCst,
            AtomicOrdering::SeqCst,
        ) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

fn try_acquire_user_connection_slot(user_id: i64) -> bool {
    let limits = ws_limits();
    let mut count = user_connections().entry(user_id).or_insert(0);
    if *count >= limits.max_connections_per_user {
        return false;
    }
    *count += 1;
    true
}

/// User-level rate limiters shared across all connections for the same user.
/// This prevents users from bypassing rate limits by opening multiple tabs/connections.
struct UserRateLimits {
    /// General messages (any opcode except heartbeat): 240/min per user
    messages: DefaultKeyedRateLimiter<i64>,
    /// Presence updates: 60/min per user
    presence: DefaultKeyedRateLimiter<i64>,
    /// Typing events: 120/min per user
    typing: DefaultKeyedRateLimiter<i64>,
    /// Voice state updates: 60/min per user
    voice: DefaultKeyedRateLimiter<i64>,
}

static USER_RATE_LIMITS: OnceLock<UserRateLimits> = OnceLock::new();

fn user_rate_limits() -> &'static UserRateLimits {
    USER_RATE_LIMITS.get_or_init(|| {
        let limits = ws_limits();
        let rate_limits = UserRateLimits {
            messages: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(limits.max_messages_per_minute).unwrap(),
            )),
            presence: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(limits.max_presence_updates_per_minute).unwrap(),
            )),
            typing: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(limits.max_typing_events_per_minute).unwrap(),
            )),
            voice: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(limits.max_voice_updates_per_minute).unwrap(),
            )),
        };

        // Periodic cleanup of stale rate limiter entries to prevent unbounded memory growth.
        tokio::spawn(async {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // skip immediate first tick
            loop {
                interval.tick().await;
                let rl = user_rate_limits();
                rl.messages.retain_recent();
                rl.presence.retain_recent();
                rl.typing.retain_recent();
                rl.voice.retain_recent();
                rl.messages.shrink_to_fit();
                rl.presence.shrink_to_fit();
                rl.typing.shrink_to_fit();
                rl.voice.shrink_to_fit();
                tracing::trace!("rate limiter cleanup: pruned stale entries");
            }
        });

        rate_limits
    })
}

impl UserRateLimits {
    /// Check if a message from the given user with the given opcode is allowed.
    /// Returns `Ok(())` if allowed, or `Err(retry_after_ms)` if rate limited.
    fn check(&self, user_id: i64, opcode: u8) -> Result<(), u64> {
        let clock = DefaultClock::default();
        let now = clock.now();

        // Check total message limit first
        if let Err(not_until) = self.messages.check_key(&user_id) {
            let wait = not_until.wait_time_from(now);
            return Err(wait.as_millis().max(1) as u64);
        }

        // Check per-opcode limits
        let not_until = match opcode {
            OP_PRESENCE_UPDATE => self.presence.check_key(&user_id).err(),
            OP_TYPING_START => self.typing.check_key(&user_id).err(),
            OP_VOICE_STATE_UPDATE => self.voice.check_key(&user_id).err(),
            _ => None,
        };

        if let Some(not_until) = not_until {
            let wait = not_until.wait_time_from(now);
            Err(wait.as_millis().max(1) as u64)
        } else {
            Ok(())
        }
    }
}

fn truncate_for_presence(value: &str, max: usize) -> String {
    let mut out = String::new();
    for ch in value.chars().take(max) {
        out.push(ch);
    }
    out
}

fn normalize_status(raw: Option<&str>) -> &'static str {
    match raw.unwrap_or("online") {
        "online" => "online",
        "idle" => "idle",
        "dnd" => "dnd",
        "offline" => "offline",
        "invisible" => "offline",
        _ => "online",
    }
}

fn extract_activities(raw: Option<&Value>) -> Vec<Value> {
    let mut activities = Vec::new();
    let Some(Value::Array(list)) = raw else {
        return activities;
    };

    for entry in list.iter().take(MAX_ACTIVITY_ITEMS) {
        let Some(obj) = entry.as_object() else {
            continue;
        };
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| truncate_for_presence(s, MAX_ACTIVITY_TEXT_LEN))
            .unwrap_or_else(|| "Unknown".to_string());
        let activity_type = obj
            .get("type")
            .or_else(|| obj.get("activity_type"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let details = obj
            .get("details")
            .and_then(|v| v.as_str())
            .map(|s| truncate_for_presence(s, MAX_ACTIVITY_TEXT_LEN));
        let state = obj
            .get("state")
            .and_then(|v| v.as_str())
            .map(|s| truncate_for_presence(s, MAX_ACTIVITY_TEXT_LEN));
        let started_at = obj
            .get("started_at")
            .and_then(|v| v.as_str())
            .map(|s| truncate_for_presence(s, MAX_ACTIVITY_TEXT_LEN));
        let application_id = obj
            .get("application_id")
            .and_then(|v| v.as_str())
            .map(|s| truncate_for_presence(s, MAX_ACTIVITY_TEXT_LEN));

        activities.push(json!({
            "name": name,
            "type": activity_type,
            "details": details,
            "state": state,
            "started_at": started_at,
            "application_id": application_id,
        }));
    }

    activities
}

fn build_presence_payload(
    user_id: i64,
    status: Option<&str>,
    activities: Option<&Value>,
    custom_status: Option<&str>,
) -> Value {
    json!({
        "user_id": user_id.to_string(),
        "status": normalize_status(status),
        "custom_status": custom_status.map(|v| truncate_for_presence(v, MAX_ACTIVITY_TEXT_LEN)),
        "activities": extract_activities(activities),
    })
}

fn default_presence_payload(user_id: i64, status: &str) -> Value {
    json!({
        "user_id": user_id.to_string(),
        "status": normalize_status(Some(status)),
        "custom_status": Value::Null,
        "activities": [],
    })
}

async fn collect_presence_recipient_ids(
    state: &AppState,
    user_id: i64,
    guild_ids: &[i64],
) -> Vec<i64> {
    // In-memory lookup: zero DB queries for guild members
    let mut recipients = state
        .member_index
        .get_presence_recipients(user_id, guild_ids);
    recipients.insert(user_id);

    // Friends still need a DB query (not tracked in the member index)
    if let Ok(friend_ids) =
        amityvox_db::relationships::get_friend_user_ids(&state.db, user_id).await
    {
        recipients.extend(friend_ids);
    }

    recipients.into_iter().collect()
}

fn extract_channel_id_from_event(event_type: &str, payload: &Value) -> Option<i64> {
    if let Some(raw) = payload.get("channel_id").and_then(|v| v.as_str()) {
        if let Ok(channel_id) = raw.parse::<i64>() {
            return Some(channel_id);
        }
    }

    if matches!(
        event_type,
        "CHANNEL_CREATE"
            | "CHANNEL_UPDATE"
            | "CHANNEL_DELETE"
            | "THREAD_CREATE"
            | "THREAD_UPDATE"
            | "THREAD_DELETE"
    ) {
        return payload
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|raw| raw.parse::<i64>().ok());
    }

    None
}

async fn can_receive_guild_event(_state: &AppState, session: &mut Session, guild_id: i64) -> bool {
    session.guild_ids.contains(&guild_id)
}

async fn can_receive_channel_event(
    state: &AppState,
    session: &Session,
    guild_id: i64,
    channel_id: i64,
) -> bool {
    let owner_id = match session.guild_owner_ids.get(&guild_id) {
        Some(&id) => id,
        None => return false,
    };

    let Ok(perms) = amityvox_core::permissions::compute_channel_permissions_cached(
        &state.permission_cache,
        &state.db,
        guild_id,
        channel_id,
        owner_id,
        session.user_id,
    )
    .await
    else {
        return false;
    };

    perms.contains(Permissions::VIEW_CHANNEL)
}

pub async fn handle_connection(socket: WebSocket, state: AppState, compress: bool) {
    let compressor = WsCompressor::new(compress);
    let mut connection_guard = ConnectionGuard::new();
    if !try_acquire_global_connection_slot() {
        let (mut sender, _) = socket.split();
        let _ = send_ws_close_logged(
            &mut sender,
            1013,
            "Gateway is at connection capacity",
            None,
            None,
            "capacity_close",
        )
        .await;
        return;
    }
    connection_guard.global_acquired = true;
    observability::ws_connection_open();

    if compress {
        tracing::debug!("Client requested zlib-stream compression");
    }

    let (mut sender, mut receiver) = socket.split();

    // Send HELLO
    let hello_msg = format!(
        "{}{}{}",
        HELLO_MSG_PREFIX, HEARTBEAT_INTERVAL_MS, HELLO_MSG_SUFFIX
    );
    if send_ws_text_logged(
        &mut sender,
        hello_msg,
        &compressor,
        None,
        None,
        "hello",
        Some(OP_HELLO),
        None,
        None,
    )
    .await
    .is_err()
    {
        return;
    }

    // Wait for IDENTIFY (timeout 30s)
    let identify_timeout = Duration::from_secs(30);
    let (session, resumed, requested_seq) = match tokio::time::timeout(
        identify_timeout,
        wait_for_identify_or_resume(&mut receiver, &state),
    )
    .await
    {
        Ok(Some(result)) => result,
        _ => {
            let _ = send_ws_text_logged(
                &mut sender,
                json!({"op": OP_INVALID_SESSION, "d": false}).to_string(),
                &compressor,
                None,
                None,
                "invalid_session",
                Some(OP_INVALID_SESSION),
                None,
                None,
            )
            .await;
            return;
        }
    };

    if !try_acquire_user_connection_slot(session.user_id) {
        let _ = send_ws_close_logged(
            &mut sender,
            1008,
            "Too many concurrent sessions for this user",
            Some(session.user_id),
            Some(session.session_id.as_str()),
            "user_capacity_close",
        )
        .await;
        return;
    }
    connection_guard.user_id = Some(session.user_id);

    if resumed {
        // Send RESUMED first so the client knows the session was accepted
        let resumed_payload = json!({
            "op": OP_DISPATCH,
            "t": EVENT_RESUMED,
            "s": session.sequence,
            "d": { "session_id": &session.session_id }
        });
        if send_ws_text_logged(
            &mut sender,
            resumed_payload.to_string(),
            &compressor,
            Some(session.user_id),
            Some(session.session_id.as_str()),
            "resumed",
            Some(OP_DISPATCH),
            Some(EVENT_RESUMED),
            Some(session.sequence),
        )
        .await
        .is_err()
        {
            return;
        }

        // Replay missed events (collect into Vec first to avoid holding DashMap lock across .await)
        let events_to_replay: Vec<(u64, String, Arc<Value>)> = event_buffers()
            .get(&session.session_id)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|e| e.sequence > requested_seq)
                    .map(|e| (e.sequence, e.event_type.clone(), e.payload.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut replay_count: u64 = 0;
        for (seq, event_type, payload) in &events_to_replay {
            let gateway_msg = json!({
                "op": OP_DISPATCH,
                "t": event_type,
                "s": seq,
                "d": **payload
            });
            if send_ws_text_logged(
                &mut sender,
                gateway_msg.to_string(),
                &compressor,
                Some(session.user_id),
                Some(session.session_id.as_str()),
                "replay",
                Some(OP_DISPATCH),
                Some(event_type.as_str()),
                Some(*seq),
            )
            .await
            .is_ok()
            {
                replay_count += 1;
            } else {
                return;
            }
        }
        tracing::info!(
            session_id = %session.session_id,
            replayed_events = replay_count,
            "session resumed with event replay"
        );
    } else {
        // Fresh IDENTIFY (not a resume) — the client just loaded, so any
        // voice state in the DB from a prior session is stale.  Clean it
        // up *before* building the READY payload so other clients don't
        // see ghost entries.
        if let Ok(stale) =
            amityvox_db::voice_states::get_all_user_voice_states(&state.db, session.user_id).await
        {
            for vs in &stale {
                // Only clean up if they're not actually in the LiveKit room
                // (safety check in case of race with a concurrent join).
                if !state
                    .voice
                    .is_participant_in_livekit_room(vs.channel_id, vs.guild_id(), session.user_id)
                    .await
                {
                    let _ = amityvox_db::voice_states::remove_voice_state(
                        &state.db,
                        session.user_id,
                        vs.guild_id(),
                    )
                    .await;
                    let _ = state.voice.leave_room(vs.channel_id, session.user_id).await;
                }
            }
        }

        // Send READY with full user data
        let user = amityvox_db::users::get_user_by_id(&state.db, session.user_id)
            .await
            .ok()
            .flatten();

        let user_json = if let Some(u) = &user {
            json!({
                "id": u.id.to_string(),
                "username": u.username,
                "discriminator": u.discriminator,
                "avatar_hash": u.avatar_hash,
                "display_name": u.display_name,
            })
        } else {
            json!({"id": session.user_id.to_string()})
        };

        // Snapshot of currently online users for building presence lists
        let online_snapshot = state.online_users.read().await.clone();
        let presence_snapshot = state.user_presences.read().await.clone();

        // Fetch guild data for READY with bounded concurrency.
        let sem = Arc::new(Semaphore::new(10));
        let guild_futures: Vec<_> = session
            .guild_ids
            .iter()
            .map(|&gid| {
                let state = state.clone();
                let sem = sem.clone();
                let online_snapshot = online_snapshot.clone();
                let presence_snapshot = presence_snapshot.clone();
                async move {
                    let _permit = sem.acquire_owned().await.ok()?;
                    let guild = amityvox_db::guilds::get_guild(&state.db, gid)
                        .await
                        .ok()
                        .flatten();
                    let g = guild?;

                    // Two independent queries in parallel
                    let (voice_states, member_ids) = tokio::join!(
                        amityvox_db::voice_states::get_guild_voice_states(&state.db, gid),
                        amityvox_db::members::get_guild_member_user_ids(&state.db, gid),
                    );

                    let voice_states = voice_states.unwrap_or_default();
                    let member_ids = member_ids.unwrap_or_default();

                    // Build voice_states JSON
                    let voice_states_json: Vec<Value> = voice_states
                        .iter()
                        .map(|vs| {
                            json!({
                                "user_id": vs.user_id.to_string(),
                                "channel_id": vs.channel_id.to_string(),
                                "guild_id": vs.guild_id().map(|id| id.to_string()),
                                "session_id": &vs.session_id,
                                "self_mute": vs.self_mute,
                                "self_deaf": vs.self_deaf,
                                "self_stream": vs.self_stream,
                                "self_video": vs.self_video,
                                "suppress": vs.suppress,
                                "mute": false,
                                "deaf": false,
                                "username": &vs.username,
                                "avatar_hash": &vs.avatar_hash,
                            })
                        })
                        .collect();

                    // Build presences from member IDs (lightweight query)
                    let presences_json: Vec<Value> = member_ids
                        .iter()
                        .filter(|uid| online_snapshot.contains(uid))
                        .map(|uid| {
                            presence_snapshot.get(uid).cloned().unwrap_or_else(|| {
                                json!({
                                    "user_id": uid.to_string(),
                                    "status": "online",
                                    "custom_status": Value::Null,
                                    "activities": [],
                                })
                            })
                        })
                        .collect();

                    Some(json!({
                        "id": g.id.to_string(),
                        "name": g.name,
                        "owner_id": g.owner_id.to_string(),
                        "icon_hash": g.icon_hash,
                        "member_count": member_ids.len(),
                        "channels": [],
                        "voice_states": voice_states_json,
                        "presences": presences_json,
                        "lazy": true,
                    }))
                }
            })
            .collect();

        let guild_results = futures_util::future::join_all(guild_futures).await;
        let guilds_json: Vec<Value> = guild_results.into_iter().flatten().collect();

        let ready = json!({
            "op": OP_DISPATCH,
            "t": EVENT_READY,
            "s": session.sequence.max(1),
            "d": {
                "user": user_json,
                "guilds": guilds_json,
                "session_id": &session.session_id,
            }
        });
        if send_ws_text_logged(
            &mut sender,
            ready.to_string(),
            &compressor,
            Some(session.user_id),
            Some(session.session_id.as_str()),
            "ready",
            Some(OP_DISPATCH),
            Some(EVENT_READY),
            Some(session.sequence.max(1)),
        )
        .await
        .is_err()
        {
            return;
        }
    }

    // Save user_id before session is moved into run_session
    let session_user_id = session.user_id;

    // Track this user as online
    state.presence_manager.cancel_offline(session_user_id);
    state.online_users.write().await.insert(session_user_id);
    let online_presence = {
        let existing = state
            .user_presences
            .read()
            .await
            .get(&session_user_id)
            .cloned();
        if let Some(mut value) = existing {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("user_id".to_string(), json!(session_user_id.to_string()));
                obj.insert("status".to_string(), json!("online"));
                if !obj.contains_key("activities") {
                    obj.insert("activities".to_string(), json!([]));
                }
            }
            value
        } else {
            default_presence_payload(session_user_id, "online")
        }
    };
    state
        .user_presences
        .write()
        .await
        .insert(session_user_id, online_presence.clone());

    // Publish presence only to users who share a guild or friendship edge.
    let presence_recipient_ids =
        collect_presence_recipient_ids(&state, session_user_id, &session.guild_ids).await;
    state.event_bus.dispatch_to_users(
        EVENT_PRESENCE_UPDATE,
        online_presence,
        presence_recipient_ids,
    );

    let session = run_session(sender, receiver, session, state.clone(), &compressor).await;

    // Voice cleanup: when the gateway WebSocket drops, don't remove voice
    // state immediately — the user may still be connected to LiveKit (their
    // media/WebRTC connection is independent of the gateway WS).  Wait a
    // grace period, then check LiveKit as ground truth before clearing.
    if let Ok(states) =
        amityvox_db::voice_states::get_all_user_voice_states(&state.db, session_user_id).await
    {
        if !states.is_empty() {
            let state_clone = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(8)).await;

                let dc_user = amityvox_db::users::get_user_by_id(&state_clone.db, session_user_id)
                    .await
                    .ok()
                    .flatten();

                // Re-fetch current voice states — they may have been cleared
                // by another code path (e.g. explicit leave) during the wait.
                let current_states = amityvox_db::voice_states::get_all_user_voice_states(
                    &state_clone.db,
                    session_user_id,
                )
                .await
                .unwrap_or_default();

                for voice_state in current_states {
                    // Check LiveKit ground truth: is the user actually still
                    // connected to the media room?  If yes, keep the state.
                    if state_clone
                        .voice
                        .is_participant_in_livekit_room(
                            voice_state.channel_id,
                            voice_state.guild_id(),
                            session_user_id,
                        )
                        .await
                    {
                        tracing::debug!(
                            "Gateway disconnect grace period: user {} still in LiveKit room for channel {}, keeping voice state",
                            session_user_id, voice_state.channel_id
                        );
                        continue;
                    }

                    tracing::info!(
                        "Gateway disconnect grace period: user {} not in LiveKit room for channel {}, cleaning up",
                        session_user_id, voice_state.channel_id
                    );

                    let _ = amityvox_db::voice_states::remove_voice_state(
                        &state_clone.db,
                        session_user_id,
                        voice_state.guild_id(),
                    )
                    .await;
                    if let Some(participants) = state_clone
                        .voice
                        .leave_room(voice_state.channel_id, session_user_id)
                        .await
                    {
                        if participants.is_empty() {
                            let _ = state_clone.voice.cleanup_room(voice_state.channel_id).await;
                        }
                    }
                    state_clone.event_bus.dispatch(
                        EVENT_VOICE_STATE_UPDATE,
                        json!({
                            "user_id": session_user_id.to_string(),
                            "channel_id": Value::Null,
                            "guild_id": voice_state.guild_id().map(|id| id.to_string()),
                            "self_mute": false,
                            "self_deaf": false,
                            "self_stream": false,
                            "self_video": false,
                            "suppress": false,
                            "mute": false,
                            "deaf": false,
                            "username": dc_user.as_ref().map(|u| u.username.as_str()),
                            "avatar_hash": dc_user.as_ref().and_then(|u| u.avatar_hash.as_deref()),
                        }),
                        voice_state.guild_id(),
                    );
                }
            });
        }
    }

    // Only mark offline when this was the user's last active gateway connection.
    // `USER_CONNECTIONS` still includes this connection until `connection_guard` drops,
    // so `<= 1` means no other live session remains.
    let should_mark_offline = {
        user_connections()
            .get(&session_user_id)
            .map(|c| *c)
            .unwrap_or(0)
            <= 1
    };

    if should_mark_offline {
        // Defer the offline transition through PresenceManager to avoid race
        // conditions where a reconnecting client briefly appears offline.
        let state_clone = state.clone();
        let guild_ids = session.guild_ids.clone();
        state
            .presence_manager
            .schedule_offline(session_user_id, async move {
                // Re-check connection count after the grace period — the user may
                // have reconnected during the delay.
                let still_offline = user_connections()
                    .get(&session_user_id)
                    .map(|c| *c)
                    .unwrap_or(0)
                    == 0;
                if !still_offline {
                    return;
                }

                state_clone
                    .online_users
                    .write()
                    .await
                    .remove(&session_user_id);
                let offline_presence = default_presence_payload(session_user_id, "offline");
                state_clone
                    .user_presences
                    .write()
                    .await
                    .insert(session_user_id, offline_presence.clone());

                let offline_presence_recipient_ids =
                    collect_presence_recipient_ids(&state_clone, session_user_id, &guild_ids).await;
                state_clone.event_bus.dispatch_to_users(
                    EVENT_PRESENCE_UPDATE,
                    offline_presence,
                    offline_presence_recipient_ids,
                );
            });
    }
}

async fn wait_for_identify_or_resume(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &AppState,
) -> Option<(Session, bool, u64)> {
    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Text(text) = msg {
            if let Ok(payload) = serde_json::from_str::<Value>(&text) {
                let op = payload.get("op").and_then(|v| v.as_u64()).unwrap_or(255) as u8;
                wire_log_ws_in(None, None, op, &text, "identify_or_resume");
            } else {
                wire_log_ws_in(None, None, 255, &text, "identify_or_resume");
            }
            if let Ok(payload) = serde_json::from_str::<Value>(&text) {
                if let Some(d) = payload.get("d") {
                    if let Some(token) = d.get("token").and_then(|v| v.as_str()) {
                        let claims =
                            amityvox_core::auth::validate_token(token, &state.config.jwt_secret)
                                .ok()?;
                        let (session_id, jti) = match (claims.sid.as_deref(), claims.jti.as_deref())
                        {
                            (Some(session_id), Some(jti)) => (session_id, jti),
                            _ => return None,
                        };
                        let active = amityvox_db::sessions::is_access_token_active(
                            &state.db,
                            claims.sub,
                            session_id,
                            jti,
                            chrono::Utc::now(),
                        )
                        .await
                        .ok()?;
                        if !active {
                            return None;
                        }
                        let op = payload.get("op").and_then(|v| v.as_u64())?;
                        if op == OP_IDENTIFY as u64 {
                            let guilds =
                                amityvox_db::guilds::get_user_guilds(&state.db, claims.sub)
                                    .await
                                    .unwrap_or_default();
                            let guild_ids = guilds.iter().map(|g| g.id).collect();
                            let guild_owner_ids =
                                guilds.iter().map(|g| (g.id, g.owner_id)).collect();
                            return Some((
                                Session::new(claims.sub, guild_ids, guild_owner_ids),
                                false,
                                0,
                            ));
                        }
                        if op == OP_RESUME as u64 {
                            let requested_session_id =
                                d.get("session_id").and_then(|v| v.as_str())?.to_string();
                            let requested_seq = d.get("seq").and_then(|v| v.as_u64()).unwrap_or(0);
                            if let Some(cached) = session_cache().get(&requested_session_id).await {
                                if cached.user_id == claims.sub {
                                    let mut can_replay = true;
                                    if cached.sequence > requested_seq {
                                        if let Some(buffer) =
                                            event_buffers().get(&requested_session_id)
                                        {
                                            if let Some(front) = buffer.front() {
                                                if front.sequence > requested_seq.saturating_add(1)
                                                {
                                                    can_replay = false;
                                                }
                                            } else {
                                                can_replay = false;
                                            }
                                        } else {
                                            can_replay = false;
                                        }
                                    }

                                    if can_replay {
                                        let mut resumed = Session::new(
                                            cached.user_id,
                                            cached.guild_ids.clone(),
                                            cached.guild_owner_ids.clone(),
                                        );
                                        resumed.session_id = requested_session_id;
                                        resumed.sequence = cached.sequence.max(requested_seq);
                                        return Some((resumed, true, requested_seq));
                                    } else {
                                        let oldest_buffered = event_buffers()
                                            .get(&requested_session_id)
                                            .and_then(|b| b.front().map(|e| e.sequence));
                                        tracing::info!(
                                            session_id = %requested_session_id,
                                            client_seq = requested_seq,
                                            oldest_buffered = oldest_buffered,
                                            "replay gap too large, forcing re-identify"
                                        );
                                    }
                                }
                            }
                            // If resume can't be honored (cache miss/mismatch), fall back to a
                            // fresh session immediately so clients recover without an extra
                            // invalid-session reconnect cycle.
                            let guilds =
                                amityvox_db::guilds::get_user_guilds(&state.db, claims.sub)
                                    .await
                                    .unwrap_or_default();
                            let guild_ids = guilds.iter().map(|g| g.id).collect();
                            let guild_owner_ids =
                                guilds.iter().map(|g| (g.id, g.owner_id)).collect();
                            return Some((
                                Session::new(claims.sub, guild_ids, guild_owner_ids),
                                false,
                                0,
                            ));
                        }
                    }
                }
            }
        }
    }
    None
}

async fn run_session(
    mut sender: impl SinkExt<Message> + Unpin,
    mut receiver: impl StreamExt<Item = Result<Message, axum::Error>> + Unpin,
    mut session: Session,
    state: AppState,
    compressor: &WsCompressor,
) -> Session {
    let mut event_rx = state.event_bus.register_session(
        session.session_id.clone(),
        session.user_id,
        &session.guild_ids,
    );
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let rate_limits = user_rate_limits();
    let mut ws_ping_interval = tokio::time::interval(Duration::from_secs(20));
    ws_ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);

    let (disconnect_reason, heartbeat_timed_out) = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed_payload = serde_json::from_str::<Value>(&text);
                        let opcode = parsed_payload
                            .as_ref()
                            .ok()
                            .and_then(|payload| payload.get("op").and_then(|v| v.as_u64()))
                            .unwrap_or(255) as u8;
                        wire_log_ws_in(
                            Some(session.user_id),
                            Some(session.session_id.as_str()),
                            opcode,
                            &text,
                            "client_message",
                        );
                        // Heartbeats are never rate limited
                        if opcode != OP_HEARTBEAT {
                            if let Err(retry_after_ms) = rate_limits.check(session.user_id, opcode) {
                                match opcode {
                                    OP_PRESENCE_UPDATE | OP_TYPING_START | OP_VOICE_STATE_UPDATE => {
                                        // Silent drop for high-frequency events
                                        tracing::debug!(
                                            user_id = session.user_id,
                                            opcode,
                                            "rate limited (silent drop)"
                                        );
                                        continue;
                                    }
                                    _ => {
                                        let error_payload = json!({
                                            "op": OP_DISPATCH,
                                            "t": "RATE_LIMIT",
                                            "d": {
                                                "retry_after": retry_after_ms,
                                                "type": "messages"
                                            }
                                        });
                                        let _ = send_ws_text_logged(
                                            &mut sender,
                                            error_payload.to_string(),
                                            compressor,
                                            Some(session.user_id),
                                            Some(session.session_id.as_str()),
                                            "rate_limit",
                                            Some(OP_DISPATCH),
                                            Some("RATE_LIMIT"),
                                            None,
                                        )
                                        .await;
                                        continue;
                                    }
                                }
                            }
                        }
                        if let Ok(payload) = parsed_payload {
                            handle_client_message(&payload, &mut sender, &mut session, &state, compressor).await;
                            if opcode == OP_HEARTBEAT {
                                heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break (
                            if let Some(frame) = frame {
                                format!(
                                    "client close frame (code={}, reason={})",
                                    frame.code,
                                    frame.reason
                                )
                            } else {
                                "client close frame (no code/reason)".to_string()
                            },
                            false,
                        );
                    }
                    Some(Err(err)) => {
                        break (format!("websocket receive error: {err}"), false);
                    }
                    None => {
                        break ("websocket stream ended".to_string(), false);
                    }
                    _ => {}
                }
            }
            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if !session.should_receive_event(event.guild_id, event.target_user_ids.as_deref()) {
                            continue;
                        }

                        if let Some(guild_id) = event.guild_id {
                            if !can_receive_guild_event(&state, &mut session, guild_id).await {
                                continue;
                            }
                            if let Some(channel_id) =
                                extract_channel_id_from_event(&event.event_type, &event.payload)
                            {
                                if !can_receive_channel_event(&state, &session, guild_id, channel_id).await {
                                    continue;
                                }
                            }
                        }

                        // Dynamically update guild scope for this active session.
                        if event.event_type == "GUILD_MEMBER_ADD" {
                            if let Some(uid) = event.payload.get("user_id").and_then(|v| v.as_str()) {
                                if uid == session.user_id.to_string() {
                                    if let Some(gid) = event.payload.get("guild_id")
                                        .and_then(|v| v.as_str())
                                        .and_then(|s| s.parse::<i64>().ok())
                                    {
                                        if let Some(guild) = amityvox_db::guilds::get_guild(&state.db, gid)
                                            .await
                                            .ok()
                                            .flatten()
                                        {
                                            session.add_guild(gid, guild.owner_id);
                                            state.event_bus.add_session_guild(&session.session_id, gid);
                                        }
                                    }
                                }
                            }
                        } else if event.event_type == "GUILD_MEMBER_REMOVE" || event.event_type == "GUILD_BAN_ADD" {
                            if let Some(uid) = event.payload.get("user_id").and_then(|v| v.as_str()) {
                                if uid == session.user_id.to_string() {
                                    if let Some(gid) = event.payload.get("guild_id")
                                        .and_then(|v| v.as_str())
                                        .and_then(|s| s.parse::<i64>().ok())
                                    {
                                        session.remove_guild(gid);
                                        state
                                            .event_bus
                                            .remove_session_guild(&session.session_id, gid);
                                    }
                                }
                            }
                        } else if event.event_type == "GUILD_DELETE" {
                            if let Some(gid) = event.payload.get("id")
                                .or_else(|| event.payload.get("guild_id"))
                                .and_then(|v| v.as_str())
                                .and_then(|s| s.parse::<i64>().ok())
                            {
                                session.remove_guild(gid);
                                state
                                    .event_bus
                                    .remove_session_guild(&session.session_id, gid);
                            }
                        } else if event.event_type == "GUILD_UPDATE" {
                            if let Some(gid) = event.guild_id {
                                if let Some(new_owner) = event.payload.get("owner_id")
                                    .and_then(|v| v.as_str())
                                    .and_then(|s| s.parse::<i64>().ok())
                                {
                                    session.guild_owner_ids.insert(gid, new_owner);
                                }
                            }
                        }

                        let seq = session.next_sequence();

                        // Buffer the event for potential replay
                        let mut buffer_entry = event_buffers().entry(session.session_id.clone()).or_default();
                        while buffer_entry.front().map(|e| e.timestamp.elapsed() > MAX_REPLAY_AGE).unwrap_or(false) {
                            buffer_entry.pop_front();
                        }
                        if buffer_entry.len() >= MAX_REPLAY_EVENTS {
                            buffer_entry.pop_front();
                        }
                        buffer_entry.push_back(BufferedEvent {
                            sequence: seq,
                            event_type: event.event_type.clone(),
                            payload: event.payload.clone(),
                            timestamp: Instant::now(),
                        });
                        drop(buffer_entry);

                        let dispatch_str = if let Some(ref pre) = event.serialized_payload {
                            format!(r#"{{"op":0,"t":"{}","s":{},"d":{}}}"#, event.event_type, seq, pre)
                        } else {
                            let dispatch = json!({
                                "op": OP_DISPATCH,
                                "t": event.event_type,
                                "s": seq,
                                "d": *event.payload,
                            });
                            dispatch.to_string()
                        };
                        if send_ws_text_logged(
                            &mut sender,
                            dispatch_str,
                            compressor,
                            Some(session.user_id),
                            Some(session.session_id.as_str()),
                            "dispatch",
                            Some(OP_DISPATCH),
                            Some(event.event_type.as_str()),
                            Some(seq),
                        )
                        .await
                        .is_err()
                        {
                            break ("websocket send error".to_string(), false);
                        }
                        observability::ws_event_dispatched(&event.event_type);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Gateway event stream lagged for user {} (missed {} events); forcing reconnect",
                            session.user_id,
                            skipped
                        );
                        let _ = send_ws_close_logged(
                            &mut sender,
                            1013,
                            "Gateway fell behind; reconnect required",
                            Some(session.user_id),
                            Some(session.session_id.as_str()),
                            "lagged_close",
                        )
                        .await;
                        break (format!("event stream lagged by {skipped} events"), false);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        break ("event stream closed".to_string(), false);
                    }
                }
            }
            () = &mut heartbeat_sleep => {
                break (
                    format!("heartbeat timeout after {}ms", HEARTBEAT_TIMEOUT_MS),
                    true,
                );
            }
            _ = ws_ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break ("websocket ping send error".to_string(), false);
                }
            }
        }
    };
    if heartbeat_timed_out {
        tracing::warn!(
            "Client {} disconnected: {}",
            session.user_id,
            disconnect_reason
        );
    } else {
        tracing::info!(
            "Client {} disconnected: {}",
            session.user_id,
            disconnect_reason
        );
    }
    state.event_bus.unregister_session(&session.session_id);
    session_cache()
        .insert(
            session.session_id.clone(),
            CachedSession {
                user_id: session.user_id,
                guild_ids: session.guild_ids.clone(),
                guild_owner_ids: session.guild_owner_ids.clone(),
                sequence: session.sequence,
                updated_at: chrono::Utc::now().timestamp(),
            },
        )
        .await;
    session
}

async fn handle_client_message(
    payload: &Value,
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: &mut Session,
    state: &AppState,
    compressor: &WsCompressor,
) {
    let op = payload.get("op").and_then(|v| v.as_u64()).unwrap_or(255) as u8;

    match op {
        OP_HEARTBEAT => {
            let _ = send_ws_text_logged(
                sender,
                HEARTBEAT_ACK_MSG.to_string(),
                compressor,
                Some(session.user_id),
                Some(session.session_id.as_str()),
                "heartbeat_ack",
                Some(OP_HEARTBEAT_ACK),
                None,
                None,
            )
            .await;
        }
        OP_PRESENCE_UPDATE => {
            if let Some(d) = payload.get("d") {
                let existing_presence = state
                    .user_presences
                    .read()
                    .await
                    .get(&session.user_id)
                    .cloned();
                let status = d.get("status").and_then(|v| v.as_str());
                let custom_status = d.get("custom_status").and_then(|v| v.as_str()).or_else(|| {
                    existing_presence
                        .as_ref()
                        .and_then(|v| v.get("custom_status"))
                        .and_then(|v| v.as_str())
                });
                let activities = d
                    .get("activities")
                    .or_else(|| existing_presence.as_ref().and_then(|v| v.get("activities")));
                let effective_status = status.or_else(|| {
                    existing_presence
                        .as_ref()
                        .and_then(|v| v.get("status"))
                        .and_then(|v| v.as_str())
                });
                let presence_payload = build_presence_payload(
                    session.user_id,
                    effective_status,
                    activities,
                    custom_status,
                );
                state
                    .user_presences
                    .write()
                    .await
                    .insert(session.user_id, presence_payload.clone());

                let presence_recipient_ids =
                    collect_presence_recipient_ids(state, session.user_id, &session.guild_ids)
                        .await;
                state.event_bus.dispatch_to_users(
                    EVENT_PRESENCE_UPDATE,
                    presence_payload,
                    presence_recipient_ids,
                );
            }
        }
        OP_TYPING_START => {
            if let Some(d) = payload.get("d") {
                if let Some(channel_id_str) = d.get("channel_id").and_then(|v| v.as_str()) {
                    let Some(cid) = channel_id_str.parse::<i64>().ok() else {
                        return;
                    };
                    let Some(channel) = amityvox_db::channels::get_channel(&state.db, cid)
                        .await
                        .ok()
                        .flatten()
                    else {
                        return;
                    };
                    let guild_id = channel.guild_id();

                    let allowed = if let Some(gid) = guild_id {
                        let member_ok = amityvox_core::permissions::ensure_guild_member(
                            &state.db,
                            gid,
                            session.user_id,
                        )
                        .await
                        .is_ok();
                        if !member_ok {
                            false
                        } else if let Some(&owner_id) = session.guild_owner_ids.get(&gid) {
                            let perms = amityvox_core::permissions::compute_channel_permissions(
                                &state.db,
                                gid,
                                cid,
                                owner_id,
                                session.user_id,
                            )
                            .await
                            .ok();
                            if let Some(perms) = perms {
                                perms.contains(Permissions::VIEW_CHANNEL)
                                    && perms.contains(Permissions::SEND_MESSAGES)
                            } else {
                                false
                            }
                        } else {
                            false
                        }
                    } else {
                        amityvox_db::dms::is_dm_recipient(&state.db, cid, session.user_id)
                            .await
                            .unwrap_or(false)
                    };
                    if !allowed {
                        return;
                    }

                    let typing_payload = json!({
                        "channel_id": channel_id_str,
                        "user_id": session.user_id.to_string(),
                        "timestamp": chrono::Utc::now().timestamp(),
                    });

                    if guild_id.is_none() {
                        let recipient_ids = amityvox_db::dms::get_dm_recipient_ids(&state.db, cid)
                            .await
                            .unwrap_or_default();
                        state.event_bus.dispatch_to_users(
                            EVENT_TYPING_START,
                            typing_payload,
                            recipient_ids,
                        );
                    } else {
                        state
                            .event_bus
                            .dispatch(EVENT_TYPING_START, typing_payload, guild_id);
                    }
                }
            }
        }
        OP_VOICE_STATE_UPDATE => {
            if let Some(d) = payload.get("d") {
                let self_mute = d
                    .get("self_mute")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let self_deaf = d
                    .get("self_deaf")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                let requested_guild_id = d
                    .get("guild_id")
                    .and_then(|v| v.as_str())
                    .and_then(|raw| raw.parse::<i64>().ok());

                let vs_user = amityvox_db::users::get_user_by_id(&state.db, session.user_id)
                    .await
                    .ok()
                    .flatten();

                if d.get("channel_id").is_some() && d.get("channel_id").unwrap().is_null() {
                    // Explicit leave
                    let existing = amityvox_db::voice_states::get_user_voice_state(
                        &state.db,
                        session.user_id,
                        requested_guild_id,
                    )
                    .await
                    .ok()
                    .flatten();
                    if let Some(existing_state) = existing {
                        let _ = amityvox_db::voice_states::remove_voice_state(
                            &state.db,
                            session.user_id,
                            existing_state.guild_id(),
                        )
                        .await;
                        if let Some(participants) = state
                            .voice
                            .leave_room(existing_state.channel_id, session.user_id)
                            .await
                        {
                            if participants.is_empty() {
                                let _ = state.voice.cleanup_room(existing_state.channel_id).await;
                            }
                        }
                        state.event_bus.dispatch(
                            EVENT_VOICE_STATE_UPDATE,
                            json!({
                                "user_id": session.user_id.to_string(),
                                "channel_id": Value::Null,
                                "guild_id": existing_state.guild_id().map(|id| id.to_string()),
                                "self_mute": self_mute,
                                "self_deaf": self_deaf,
                                "self_stream": false,
                                "self_video": false,
                                "suppress": false,
                                "mute": false,
                                "deaf": false,
                                "username": vs_user.as_ref().map(|u| u.username.as_str()),
                                "avatar_hash": vs_user.as_ref().and_then(|u| u.avatar_hash.as_deref()),
                            }),
                            existing_state.guild_id(),
                        );
                    }
                } else if let Some(channel_id_str) = d.get("channel_id").and_then(|v| v.as_str()) {
                    if let Ok(channel_id) = channel_id_str.parse::<i64>() {
                        let channel = amityvox_db::channels::get_channel(&state.db, channel_id)
                            .await
                            .ok()
                            .flatten();
                        let Some(channel) = channel else {
                            return;
                        };
                        if channel.channel_type != 2 {
                            return;
                        }
                        let guild_id = channel.guild_id();
                        let Some(guild_id) = guild_id else {
                            return;
                        };
                        if requested_guild_id.is_some() && requested_guild_id != Some(guild_id) {
                            return;
                        }

                        if amityvox_core::permissions::ensure_guild_member(
                            &state.db,
                            guild_id,
                            session.user_id,
                        )
                        .await
                        .is_err()
                        {
                            return;
                        }
                        let Some(&owner_id) = session.guild_owner_ids.get(&guild_id) else {
                            return;
                        };
                        let Ok(perms) = amityvox_core::permissions::compute_channel_permissions(
                            &state.db,
                            guild_id,
                            channel_id,
                            owner_id,
                            session.user_id,
                        )
                        .await
                        else {
                            return;
                        };
                        if !perms.contains(Permissions::VIEW_CHANNEL)
                            || !perms.contains(Permissions::CONNECT)
                        {
                            return;
                        }

                        let _ = amityvox_db::voice_states::upsert_voice_state(
                            &state.db,
                            session.user_id,
                            Some(guild_id),
                            channel_id,
                            &session.session_id,
                        )
                        .await;
                        state
                            .voice
                            .update_self_mute(channel_id, session.user_id, self_mute)
                            .await;
                        state
                            .voice
                            .update_self_deaf(channel_id, session.user_id, self_deaf)
                            .await;

                        // Read actual self_stream from VoiceManager instead of hardcoding false
                        let current_self_stream = state
                            .voice
                            .get_participant_stream_state(channel_id, session.user_id)
                            .await;

                        state.event_bus.dispatch(
                            EVENT_VOICE_STATE_UPDATE,
                            json!({
                                "user_id": session.user_id.to_string(),
                                "channel_id": channel_id_str,
                                "guild_id": Some(guild_id.to_string()),
                                "self_mute": self_mute,
                                "self_deaf": self_deaf,
                                "self_stream": current_self_stream,
                                "self_video": false,
                                "suppress": false,
                                "mute": false,
                                "deaf": false,
                                "username": vs_user.as_ref().map(|u| u.username.as_str()),
                                "avatar_hash": vs_user.as_ref().and_then(|u| u.avatar_hash.as_deref()),
                            }),
                            Some(guild_id),
                        );
                    }
                }
            }
        }
        _ => {
            tracing::debug!("Unknown opcode {} from client {}", op, session.user_id);
        }
    }
}
