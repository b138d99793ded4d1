//! Wire types for the federation inbox, well-known discovery document, and
//! handshake exchange (spec §6 "Federation wire").

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire form of a Hybrid Logical Clock timestamp. Deliberately independent
/// of `amityvox_core::hlc::Hlc` (this crate does not depend on
/// `amityvox-core`, to avoid a dependency cycle with it) — the two are
/// converted at the boundary where outbox rows are built from local
/// events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HlcWire {
    pub wall_ms: i64,
    pub counter: u32,
    pub instance_id: String,
}

/// The `POST /federation/inbox` request/response body and the row shape
/// persisted in the outbox, events log, and dead-letter tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationEnvelope {
    /// Publish-time ULID of the originating event, rendered as a string so
    /// this crate has no dependency on the `ulid` crate's type directly.
    pub id: String,
    pub r#type: String,
    pub hlc: HlcWire,
    pub source_instance: String,
    pub payload: Value,
    /// Base64 Ed25519 signature over the canonical JSON of every other
    /// field, absent only while the envelope is being constructed prior to
    /// signing.
    pub signature: Option<String>,
}

impl FederationEnvelope {
    /// The value actually signed/verified: every field except `signature`
    /// itself, so a receiver can check the `signature` field against the
    /// envelope's own remaining contents.
    pub fn signable_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.r#type,
            "hlc": self.hlc,
            "source_instance": self.source_instance,
            "payload": self.payload,
        })
    }

    /// Key used for inbound dedup: `(id, source_instance, target_instance)`
    /// per spec §4.4 step 4. `id` alone is not enough because the same
    /// locally-originated event can target more than one peer.
    pub fn dedup_key(&self, target_instance: &str) -> String {
        format!("{}:{}:{}", self.id, self.source_instance, target_instance)
    }
}

/// `GET /federation/.well-known/instance` response: what a peer needs to
/// validate signatures and decide whether to talk to this instance at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnownInstance {
    pub domain: String,
    pub public_key: String,
    pub public_key_fingerprint: String,
    pub protocol_version: String,
    pub capabilities: Vec<String>,
}

/// `POST /federation/handshake` request: a one-shot token-keyed pairing for
/// `closed`-mode federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub token: String,
    pub requester_domain: String,
    pub requester_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub peer_domain: String,
    pub peer_public_key: String,
}

/// `POST /federation/voice/token` request/response: a signed, short-TTL
/// LiveKit room token exchanged when a call spans instances in
/// `voice_mode = relay`. Token issuance and SFU room placement are handled
/// by `amityvox-media`; this type only carries the signed envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceRelayTokenRequest {
    pub room_id: String,
    pub requesting_user_id: String,
    pub requesting_instance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceRelayTokenResponse {
    pub livekit_token: String,
    pub livekit_url: String,
    pub expires_at_ms: i64,
}

/// What the requesting instance wants done with the relayed call. Token
/// issuance and the start/stop pair share one endpoint and one envelope
/// shape so a gateway change on one side of a call doesn't need three
/// independent wire contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceRelayAction {
    IssueToken,
    StartStream,
    StopStream,
}

/// `VOICE_RELAY` envelope payload sent to `POST /federation/voice/token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceRelayActionRequest {
    pub room_id: String,
    pub requesting_user_id: String,
    pub requesting_instance: String,
    pub action: VoiceRelayAction,
    pub stream_title: Option<String>,
}

/// Reply payload, carried back inside a `VOICE_RELAY` envelope signed by
/// the peer that owns the SFU room. Fields are optional because
/// `start_stream`/`stop_stream` acknowledgements don't carry a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceRelayActionResponse {
    pub livekit_token: Option<String>,
    pub livekit_url: Option<String>,
    pub room_name: Option<String>,
    pub expires_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    Accepted,
    Duplicate,
    BadSignature,
    PolicyRejected,
    Transient,
}

impl InboxOutcome {
    pub fn http_status(self) -> u16 {
        match self {
            InboxOutcome::Accepted => 202,
            InboxOutcome::Duplicate => 409,
            InboxOutcome::BadSignature => 401,
            InboxOutcome::PolicyRejected => 403,
            InboxOutcome::Transient => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_scoped_per_target() {
        let envelope = FederationEnvelope {
            id: "01J".to_string(),
            r#type: "MESSAGE_CREATE".to_string(),
            hlc: HlcWire {
                wall_ms: 1,
                counter: 0,
                instance_id: "a.example".to_string(),
            },
            source_instance: "a.example".to_string(),
            payload: serde_json::json!({}),
            signature: None,
        };
        assert_ne!(
            envelope.dedup_key("b.example"),
            envelope.dedup_key("c.example")
        );
    }

    #[test]
    fn http_status_matches_spec_table() {
        assert_eq!(InboxOutcome::Accepted.http_status(), 202);
        assert_eq!(InboxOutcome::BadSignature.http_status(), 401);
        assert_eq!(InboxOutcome::PolicyRejected.http_status(), 403);
        assert_eq!(InboxOutcome::Duplicate.http_status(), 409);
    }
}
