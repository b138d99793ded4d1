//! Persistent, subject-addressed replay stream backing gateway resume and
//! federation backfill.
//!
//! [`crate::events::EventBus`] handles live fan-out to connected sessions;
//! this module is the durability layer behind it. Every published event is
//! appended here under its dotted subject (`message.create`,
//! `guild.member.add`, ...) with finite retention, so a session that drops
//! and resumes within the retention window can replay exactly what it
//! missed instead of forcing a full re-sync.
//!
//! When `[bus].nats_url` is configured, appends are mirrored to a NATS
//! JetStream subject of the same name so a multi-process deployment shares
//! one durable history; a single-instance deployment runs on the in-process
//! ring buffer alone, mirroring the teacher's existing pattern of treating
//! an external service (there, LiveKit; here, NATS) as optional.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use amityvox_util::ulid::EventId;

/// A single durable, replayable event. Distinct from
/// [`crate::events::ServerEvent`], which is the live fan-out type handed to
/// connected sessions; this is the form retained for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: EventId,
    pub subject: String,
    pub event_type: String,
    pub hlc: Hlc,
    pub guild_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub payload: Arc<serde_json::Value>,
    pub recorded_at_ms: i64,
}

struct SubjectLog {
    entries: VecDeque<StoredEvent>,
}

impl SubjectLog {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    fn trim(&mut self, retention_secs: i64, retention_count: usize) {
        let cutoff = now_ms() - retention_secs * 1_000;
        while self
            .entries
            .front()
            .is_some_and(|e| e.recorded_at_ms < cutoff)
        {
            self.entries.pop_front();
        }
        while self.entries.len() > retention_count {
            self.entries.pop_front();
        }
    }
}

/// In-process ring buffer of recent events, keyed by subject, with optional
/// NATS JetStream mirroring for multi-process deployments.
pub struct PersistentStream {
    retention_secs: i64,
    retention_count: usize,
    /// Producer signals shedding (drop presence/typing first) once any
    /// subject's backlog crosses this; see [`Self::is_over_high_water`].
    high_water_mark: usize,
    logs: DashMap<String, SubjectLog>,
    mirror: Option<NatsMirror>,
}

impl PersistentStream {
    pub fn new(retention_secs: i64, retention_count: usize, high_water_mark: usize) -> Self {
        Self {
            retention_secs,
            retention_count,
            high_water_mark,
            logs: DashMap::new(),
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: NatsMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Appends `event` to its subject's log, trims to the retention bound,
    /// and mirrors to NATS if configured. Never returns an error to the
    /// caller — the source of truth is already committed to Postgres by the
    /// time anything reaches the bus, so a mirror failure is logged and
    /// counted, not propagated (spec's publish failure semantics).
    pub fn append(&self, event: StoredEvent) {
        let subject = event.subject.clone();
        {
            let mut log = self.logs.entry(subject.clone()).or_insert_with(SubjectLog::new);
            log.entries.push_back(event.clone());
            log.trim(self.retention_secs, self.retention_count);
        }

        if let Some(mirror) = &self.mirror {
            mirror.publish(&subject, &event);
        }
    }

    /// Replays events recorded for `subject` after `after`, in stored
    /// (ULID) order. `after = None` replays the full retained window —
    /// used when a resuming session's last-seen id has already aged out.
    pub fn replay_since(&self, subject: &str, after: Option<EventId>) -> Vec<StoredEvent> {
        let Some(log) = self.logs.get(subject) else {
            return Vec::new();
        };
        match after {
            Some(after_id) => log
                .entries
                .iter()
                .filter(|e| e.id > after_id)
                .cloned()
                .collect(),
            None => log.entries.iter().cloned().collect(),
        }
    }

    pub fn backlog_len(&self, subject: &str) -> usize {
        self.logs.get(subject).map(|l| l.entries.len()).unwrap_or(0)
    }

    /// Whether `subject`'s backlog has crossed the configured high-water
    /// mark. Producers check this before publishing low-value event kinds
    /// (presence, typing) and drop them rather than widen the backlog
    /// further.
    pub fn is_over_high_water(&self, subject: &str) -> bool {
        self.backlog_len(subject) >= self.high_water_mark
    }
}

/// Thin wrapper over an `async-nats` JetStream publish handle. Kept
/// separate from [`PersistentStream`] so a deployment without NATS
/// configured never touches the `async-nats` client at all.
pub struct NatsMirror {
    client: async_nats::Client,
    subject_prefix: String,
}

impl NatsMirror {
    /// Connects to `url` and returns a mirror that republishes every
    /// appended event to `"{subject_prefix}.{event.subject}"`. Connection
    /// failure here is fatal for gateway startup (per spec: "persistent
    /// stream outage is fatal for gateway startup") when a `nats_url` was
    /// explicitly configured, so callers should propagate the error rather
    /// than silently falling back.
    pub async fn connect(url: &str, subject_prefix: impl Into<String>) -> Result<Self, async_nats::ConnectError> {
        let client = async_nats::connect(url).await?;
        Ok(Self {
            client,
            subject_prefix: subject_prefix.into(),
        })
    }

    fn publish(&self, subject: &str, event: &StoredEvent) {
        let full_subject = format!("{}.{}", self.subject_prefix, subject);
        let client = self.client.clone();
        let bytes = match serde_json::to_vec(event) {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(subject = %full_subject, error = %err, "failed to serialize event for NATS mirror");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(err) = client.publish(full_subject.clone(), bytes.into()).await {
                tracing::warn!(subject = %full_subject, error = %err, "NATS mirror publish failed");
            }
        });
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}

/// Derives the dotted bus subject for a wire event type, per spec §4.1's
/// stable subject set. Unrecognized types fall back to a lowercased,
/// dot-joined form of the type itself so new event types degrade
/// gracefully instead of panicking.
pub fn subject_for_event_type(event_type: &str) -> String {
    match event_type {
        "GUILD_CREATE" => "guild.create",
        "GUILD_UPDATE" => "guild.update",
        "GUILD_DELETE" => "guild.delete",
        "GUILD_MEMBER_ADD" => "guild.member.add",
        "GUILD_MEMBER_REMOVE" => "guild.member.remove",
        "GUILD_MEMBER_UPDATE" => "guild.member.update",
        "GUILD_ROLE_CREATE" => "guild.role.create",
        "GUILD_ROLE_UPDATE" => "guild.role.update",
        "GUILD_ROLE_DELETE" => "guild.role.delete",
        "GUILD_BAN_ADD" => "guild.ban.add",
        "GUILD_BAN_REMOVE" => "guild.ban.remove",
        "CHANNEL_CREATE" => "channel.create",
        "CHANNEL_UPDATE" => "channel.update",
        "CHANNEL_DELETE" => "channel.delete",
        "CHANNEL_GROUP_CREATE" => "channel.group.create",
        "CHANNEL_GROUP_UPDATE" => "channel.group.update",
        "CHANNEL_GROUP_DELETE" => "channel.group.delete",
        "CHANNEL_GROUP_ITEMS_UPDATE" => "channel.group.items_update",
        "MESSAGE_CREATE" => "message.create",
        "MESSAGE_UPDATE" => "message.update",
        "MESSAGE_DELETE" => "message.delete",
        "MESSAGE_REACTION_ADD" => "message.reaction_add",
        "MESSAGE_REACTION_REMOVE" => "message.reaction_remove",
        "PRESENCE_UPDATE" => "presence.update",
        "TYPING_START" => "typing.start",
        "VOICE_STATE_UPDATE" => "voice.state.update",
        other => return other.to_ascii_lowercase().replace('_', "."),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: EventId, subject: &str) -> StoredEvent {
        StoredEvent {
            id,
            subject: subject.to_string(),
            event_type: "MESSAGE_CREATE".to_string(),
            hlc: Hlc::zero("a.example"),
            guild_id: None,
            channel_id: Some(1),
            payload: Arc::new(serde_json::json!({})),
            recorded_at_ms: now_ms(),
        }
    }

    #[test]
    fn replay_returns_only_events_after_the_given_id() {
        let stream = PersistentStream::new(3600, 1000, 10_000);
        let first = amityvox_util::ulid::generate();
        let second = amityvox_util::ulid::generate();
        stream.append(stored(first, "message.create"));
        stream.append(stored(second, "message.create"));

        let replayed = stream.replay_since("message.create", Some(first));
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, second);
    }

    #[test]
    fn replay_with_no_cursor_returns_everything_retained() {
        let stream = PersistentStream::new(3600, 1000, 10_000);
        stream.append(stored(amityvox_util::ulid::generate(), "typing.start"));
        stream.append(stored(amityvox_util::ulid::generate(), "typing.start"));
        assert_eq!(stream.replay_since("typing.start", None).len(), 2);
    }

    #[test]
    fn trims_past_retention_count() {
        let stream = PersistentStream::new(3600, 2, 10_000);
        for _ in 0..5 {
            stream.append(stored(amityvox_util::ulid::generate(), "presence.update"));
        }
        assert_eq!(stream.backlog_len("presence.update"), 2);
    }

    #[test]
    fn high_water_mark_trips_once_backlog_crosses_it() {
        let stream = PersistentStream::new(3600, 1000, 2);
        assert!(!stream.is_over_high_water("presence.update"));
        stream.append(stored(amityvox_util::ulid::generate(), "presence.update"));
        stream.append(stored(amityvox_util::ulid::generate(), "presence.update"));
        assert!(stream.is_over_high_water("presence.update"));
    }

    #[test]
    fn maps_known_event_types_to_stable_subjects() {
        assert_eq!(subject_for_event_type("MESSAGE_CREATE"), "message.create");
        assert_eq!(subject_for_event_type("GUILD_MEMBER_ADD"), "guild.member.add");
        assert_eq!(subject_for_event_type("SOMETHING_NEW"), "something.new");
    }
}
