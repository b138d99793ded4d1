use crate::bus::{subject_for_event_type, PersistentStream, StoredEvent};
use crate::hlc::HlcClock;
use crate::observability;
use amityvox_util::ulid::EventId;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub event_type: String,
    pub payload: Arc<serde_json::Value>,
    /// Guild ID this event belongs to, if applicable.
    pub guild_id: Option<i64>,
    /// When set, only deliver this event to the specified user IDs (e.g. DM recipients).
    pub target_user_ids: Option<Vec<i64>>,
    /// Pre-serialized JSON payload for efficient WebSocket dispatch.
    pub serialized_payload: Option<Arc<String>>,
    /// Publish-time ULID, the bus subject, and the stamped HLC. `None`
    /// until `EventBus::with_durability` has been wired up with a clock;
    /// older in-process-only callers (bots, internal fan-out) that never
    /// touch the durable replay path don't pay for any of this.
    pub id: Option<EventId>,
    pub subject: Option<String>,
    pub hlc: Option<crate::hlc::Hlc>,
    pub source_instance: Option<String>,
}

/// Broadcast-based event bus for real-time dispatch.
#[derive(Clone)]
pub struct EventBus {
    capacity: usize,
    sessions: Arc<DashMap<String, SessionSubscription>>,
    guild_sessions: Arc<DashMap<i64, HashSet<String>>>,
    user_sessions: Arc<DashMap<i64, HashSet<String>>>,
    system_sender: broadcast::Sender<ServerEvent>,
    /// Present once `with_durability` has been called; stamps outgoing
    /// events with an HLC and records them in the replay stream.
    durability: Option<(Arc<HlcClock>, Arc<PersistentStream>)>,
}

#[derive(Clone)]
struct SessionSubscription {
    user_id: i64,
    guild_ids: HashSet<i64>,
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (system_sender, _) = broadcast::channel(capacity);
        Self {
            capacity,
            sessions: Arc::new(DashMap::new()),
            guild_sessions: Arc::new(DashMap::new()),
            user_sessions: Arc::new(DashMap::new()),
            system_sender,
            durability: None,
        }
    }

    /// Wires the bus to a process-wide HLC and replay stream: every event
    /// published from here on is stamped with an id, subject, and HLC, and
    /// recorded durably for gateway resume. Without this, `publish` still
    /// fans out live but events carry no replay history.
    pub fn with_durability(mut self, clock: Arc<HlcClock>, stream: Arc<PersistentStream>) -> Self {
        self.durability = Some((clock, stream));
        self
    }

    pub fn subscribe_system(&self) -> broadcast::Receiver<ServerEvent> {
        self.system_sender.subscribe()
    }

    pub fn register_session(
        &self,
        session_id: impl Into<String>,
        user_id: i64,
        guild_ids: &[i64],
    ) -> broadcast::Receiver<ServerEvent> {
        let (sender, receiver) = broadcast::channel(self.capacity.max(256));
        let sid = session_id.into();
        let subscription = SessionSubscription {
            user_id,
            guild_ids: guild_ids.iter().copied().collect(),
            sender,
        };

        // Maintain guild_sessions index
        for &gid in guild_ids {
            self.guild_sessions
                .entry(gid)
                .or_default()
                .insert(sid.clone());
        }

        // Maintain user_sessions index
        self.user_sessions
            .entry(user_id)
            .or_default()
            .insert(sid.clone());

        self.sessions.insert(sid, subscription);
        receiver
    }

    pub fn unregister_session(&self, session_id: &str) {
        // Read subscription data before removing
        if let Some((_, sub)) = self.sessions.remove(session_id) {
            // Remove from guild_sessions index
            for gid in &sub.guild_ids {
                if let Some(mut sids) = self.guild_sessions.get_mut(gid) {
                    sids.remove(session_id);
                    if sids.is_empty() {
                        drop(sids);
                        self.guild_sessions.remove(gid);
                    }
                }
            }

            // Remove from user_sessions index
            if let Some(mut sids) = self.user_sessions.get_mut(&sub.user_id) {
                sids.remove(session_id);
                if sids.is_empty() {
                    drop(sids);
                    self.user_sessions.remove(&sub.user_id);
                }
            }
        }
    }

    pub fn add_session_guild(&self, session_id: &str, guild_id: i64) {
        if let Some(mut sub) = self.sessions.get_mut(session_id) {
            sub.guild_ids.insert(guild_id);
        }

        // Maintain guild_sessions index
        self.guild_sessions
            .entry(guild_id)
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn remove_session_guild(&self, session_id: &str, guild_id: i64) {
        if let Some(mut sub) = self.sessions.get_mut(session_id) {
            sub.guild_ids.remove(&guild_id);
        }

        // Maintain guild_sessions index
        if let Some(mut sids) = self.guild_sessions.get_mut(&guild_id) {
            sids.remove(session_id);
            if sids.is_empty() {
                drop(sids);
                self.guild_sessions.remove(&guild_id);
            }
        }
    }

    pub fn publish(&self, mut event: ServerEvent) {
        if let Some((clock, stream)) = &self.durability {
            let subject = subject_for_event_type(&event.event_type);
            let hlc = clock.stamp();
            let id = amityvox_util::ulid::generate();
            event.id = Some(id);
            event.subject = Some(subject.clone());
            event.hlc = Some(hlc.clone());
            event.source_instance = Some(clock.instance_id().to_string());

            stream.append(StoredEvent {
                id,
                subject,
                event_type: event.event_type.clone(),
                hlc,
                guild_id: event.guild_id,
                channel_id: None,
                payload: event.payload.clone(),
                recorded_at_ms: chrono::Utc::now().timestamp_millis(),
            });
        }

        // Collect matching session IDs
        let session_ids: Vec<String> = if let Some(ref targets) = event.target_user_ids {
            // User-targeted events: look up each target user's sessions
            let mut ids = Vec::new();
            for &uid in targets {
                if let Some(user_sids) = self.user_sessions.get(&uid) {
                    ids.extend(user_sids.iter().cloned());
                }
            }
            ids
        } else if let Some(guild_id) = event.guild_id {
            // Guild-scoped events: look up guild's sessions
            self.guild_sessions
                .get(&guild_id)
                .map(|sids| sids.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            // Global events: all sessions
            self.sessions
                .iter()
                .map(|entry| entry.key().clone())
                .collect()
        };

        if observability::wire_trace_enabled() {
            let payload_bytes = event
                .serialized_payload
                .as_ref()
                .map(|serialized| serialized.len())
                .unwrap_or_else(|| {
                    serde_json::to_string(&*event.payload)
                        .map(|s| s.len())
                        .unwrap_or(0)
                });
            let scope = if event.target_user_ids.is_some() {
                "users"
            } else if event.guild_id.is_some() {
                "guild"
            } else {
                "global"
            };
            tracing::info!(
                target: "wire",
                kind = "event_bus_dispatch",
                event_type = %event.event_type,
                scope,
                guild_id = ?event.guild_id,
                target_user_count = event.target_user_ids.as_ref().map(|users| users.len()),
                session_count = session_ids.len(),
                payload_bytes,
                "server_out"
            );
        }

        // Send to native bot system listener
        let _ = self.system_sender.send(event.clone());

        // Send to matching sessions
        for sid in session_ids {
            if let Some(sub) = self.sessions.get(&sid) {
                let _ = sub.sender.send(event.clone());
            }
        }
    }

    /// Helper: publish a typed event with guild_id
    pub fn dispatch(&self, event_type: &str, payload: serde_json::Value, guild_id: Option<i64>) {
        let payload_arc = Arc::new(payload);
        let serialized = Arc::new(serde_json::to_string(&*payload_arc).unwrap_or_default());
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload: payload_arc,
            guild_id,
            target_user_ids: None,
            serialized_payload: Some(serialized),
            id: None,
            subject: None,
            hlc: None,
            source_instance: None,
        });
    }

    /// Helper: publish a targeted event delivered only to the specified users.
    pub fn dispatch_to_users(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        target_user_ids: Vec<i64>,
    ) {
        let payload_arc = Arc::new(payload);
        let serialized = Arc::new(serde_json::to_string(&*payload_arc).unwrap_or_default());
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload: payload_arc,
            guild_id: None,
            target_user_ids: Some(target_user_ids),
            serialized_payload: Some(serialized),
            id: None,
            subject: None,
            hlc: None,
            source_instance: None,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_durability_events_carry_no_id_or_hlc() {
        let bus = EventBus::new(16);
        let mut rx = bus.register_session("s1", 1, &[]);
        bus.dispatch("MESSAGE_CREATE", serde_json::json!({"content": "hi"}), None);
        let event = rx.try_recv().unwrap();
        assert!(event.id.is_none());
        assert!(event.hlc.is_none());
    }

    #[test]
    fn with_durability_events_are_stamped_and_replayable() {
        let clock = Arc::new(HlcClock::new("a.example", 60));
        let stream = Arc::new(PersistentStream::new(3600, 1000, 10_000));
        let bus = EventBus::new(16).with_durability(clock, stream.clone());

        let mut rx = bus.register_session("s1", 1, &[]);
        bus.dispatch("MESSAGE_CREATE", serde_json::json!({"content": "hi"}), None);

        let event = rx.try_recv().unwrap();
        assert!(event.id.is_some());
        assert_eq!(event.subject.as_deref(), Some("message.create"));
        assert_eq!(stream.replay_since("message.create", None).len(), 1);
    }
}
