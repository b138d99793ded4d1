use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use amityvox_core::{build_permission_cache, AppConfig, AppState, RuntimeSettings};
use amityvox_federation::{
    protocol::{FederationEnvelope, HandshakeRequest, HlcWire},
    FederationConfig, FederationMode, FederationService, VoiceMode,
};
use amityvox_media::{
    LiveKitConfig, LocalStorage, Storage, StorageConfig, StorageManager, VoiceManager,
};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::{Notify, RwLock};
use tower::ServiceExt;

const LOCAL_DOMAIN: &str = "local.example";
const PEER_DOMAIN: &str = "peer.example";
const JWT_SECRET: &str = "integration-test-secret";

struct TestHarness {
    app: Router,
    db: amityvox_db::DbPool,
    _storage_dir: TempDir,
    _media_dir: TempDir,
    _backup_dir: TempDir,
}

impl TestHarness {
    async fn new(federation_service: Option<FederationService>) -> anyhow::Result<Self> {
        let db = amityvox_db::create_pool("sqlite::memory:", 1).await?;
        amityvox_db::run_migrations(&db).await?;

        let storage_dir = tempfile::tempdir()?;
        let media_dir = tempfile::tempdir()?;
        let backup_dir = tempfile::tempdir()?;
        let livekit = Arc::new(LiveKitConfig {
            api_key: "lk-test-key".to_string(),
            api_secret: "lk-test-secret".to_string(),
            url: "ws://localhost:7880".to_string(),
            http_url: "http://localhost:7880".to_string(),
        });

        let federation_mode = federation_service
            .as_ref()
            .map(|s| s.mode())
            .unwrap_or(FederationMode::Disabled);

        let state = AppState {
            db: db.clone(),
            event_bus: amityvox_core::events::EventBus::default(),
            config: AppConfig {
                jwt_secret: JWT_SECRET.to_string(),
                jwt_expiry_seconds: 3600,
                registration_enabled: true,
                allow_username_login: false,
                require_email: true,
                storage_path: storage_dir.path().to_string_lossy().into_owned(),
                max_upload_size: 10 * 1024 * 1024,
                livekit_api_key: livekit.api_key.clone(),
                livekit_api_secret: livekit.api_secret.clone(),
                livekit_url: livekit.url.clone(),
                livekit_http_url: livekit.http_url.clone(),
                livekit_public_url: livekit.url.clone(),
                livekit_available: false,
                public_url: None,
                media_storage_path: media_dir.path().to_string_lossy().into_owned(),
                media_max_file_size: 10 * 1024 * 1024,
                media_p2p_threshold: 1024 * 1024,
                file_cryptor: None,
                backup_dir: backup_dir.path().to_string_lossy().into_owned(),
                database_url: "sqlite::memory:".to_string(),
                federation_max_events_per_peer_per_minute: None,
                federation_max_user_creates_per_peer_per_hour: None,
                instance_domain: LOCAL_DOMAIN.to_string(),
                federation_mode,
                federation_bounded_skew_secs: 300,
                gateway_heartbeat_interval_ms: 30_000,
                gateway_zombie_grace_secs: 60,
                gateway_resume_buffer_capacity: 1000,
                max_guild_storage_quota: 0,
                federation_file_cache_enabled: false,
                federation_file_cache_max_size: 0,
                federation_file_cache_ttl_hours: 0,
                native_media_enabled: false,
                native_media_port: 8443,
                native_media_max_participants: 50,
                native_media_e2ee_required: false,
            },
            runtime: Arc::new(RwLock::new(RuntimeSettings::default())),
            voice: Arc::new(VoiceManager::new(livekit)),
            storage: Arc::new(StorageManager::new(StorageConfig {
                base_path: media_dir.path().to_path_buf(),
                max_file_size: 10 * 1024 * 1024,
                p2p_threshold: 1024 * 1024,
                allowed_extensions: None,
            })),
            storage_backend: Arc::new(Storage::Local(LocalStorage::new(storage_dir.path()))),
            shutdown: Arc::new(Notify::new()),
            online_users: Arc::new(RwLock::new(HashSet::new())),
            user_presences: Arc::new(RwLock::new(HashMap::new())),
            permission_cache: build_permission_cache(),
            federation_service,
            member_index: Arc::new(amityvox_core::member_index::MemberIndex::empty()),
            native_media: None,
            presence_manager: Arc::new(amityvox_core::presence_manager::PresenceManager::new()),
            clock: Arc::new(amityvox_core::hlc::HlcClock::new(LOCAL_DOMAIN, 300)),
            stream: Arc::new(amityvox_core::bus::PersistentStream::new(3600, 1000, 10_000)),
        };

        let app = amityvox_api::build_router().with_state(state);
        Ok(Self {
            app,
            db,
            _storage_dir: storage_dir,
            _media_dir: media_dir,
            _backup_dir: backup_dir,
        })
    }

    async fn request(&self, request: Request<Body>) -> anyhow::Result<(StatusCode, Value)> {
        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let payload = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body)
                .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(&body) }))
        };
        Ok((status, payload))
    }

    async fn admin_token(&self) -> anyhow::Result<String> {
        let user = amityvox_db::users::create_user_as_first_admin(
            &self.db,
            amityvox_util::snowflake::generate(1),
            "root",
            1,
            "root@example.com",
            "hash",
            amityvox_core::USER_FLAG_ADMIN,
        )
        .await?;
        Ok(amityvox_core::auth::create_token(user.id, JWT_SECRET, 3600)?)
    }
}

fn enabled_service(mode: FederationMode) -> FederationService {
    let signing_key = SigningKey::generate(&mut OsRng);
    let config = FederationConfig {
        mode,
        voice_mode: VoiceMode::Direct,
        domain: LOCAL_DOMAIN.to_string(),
        key_id: "ed25519:local".to_string(),
        signing_key: Some(signing_key),
        max_attempts: 12,
        base_backoff_secs: 30,
        max_backoff_secs: 21_600,
        bounded_skew_secs: 300,
        well_known_key_ttl_secs: 3600,
    };
    FederationService::new(config).expect("federation service construction cannot fail here")
}

fn unsigned_envelope(event_type: &str, payload: Value) -> FederationEnvelope {
    FederationEnvelope {
        id: amityvox_util::ulid::generate().to_string(),
        r#type: event_type.to_string(),
        hlc: HlcWire {
            wall_ms: chrono::Utc::now().timestamp_millis(),
            counter: 0,
            instance_id: PEER_DOMAIN.to_string(),
        },
        source_instance: PEER_DOMAIN.to_string(),
        payload,
        signature: None,
    }
}

// ── Wire contract: disabled instance ────────────────────────────────────────

#[tokio::test]
async fn disabled_federation_rejects_every_wire_endpoint() -> anyhow::Result<()> {
    let harness = TestHarness::new(None).await?;

    let (status, _) = harness
        .request(
            Request::builder()
                .uri("/federation/.well-known/instance")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // The inbox handler treats a disabled instance as a policy rejection
    // rather than a 503, since it never gets far enough to know whether the
    // envelope itself would otherwise be acceptable.
    let envelope = unsigned_envelope("MESSAGE_CREATE", json!({}));
    let (status, _) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri("/federation/inbox")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&envelope)?))?,
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let handshake_req = HandshakeRequest {
        token: "whatever".to_string(),
        requester_domain: PEER_DOMAIN.to_string(),
        requester_public_key: "00".repeat(32),
    };
    let (status, _) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri("/federation/handshake")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&handshake_req)?))?,
        )
        .await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri("/federation/voice/token")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&envelope)?))?,
        )
        .await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    Ok(())
}

// ── Discovery ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn well_known_document_advertises_this_instances_signing_key() -> anyhow::Result<()> {
    let service = enabled_service(FederationMode::Public);
    let expected_key = service.signing_public_key_hex().unwrap();
    let harness = TestHarness::new(Some(service)).await?;

    let (status, body) = harness
        .request(
            Request::builder()
                .uri("/federation/.well-known/instance")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.get("domain").and_then(|v| v.as_str()), Some(LOCAL_DOMAIN));
    assert_eq!(body.get("public_key").and_then(|v| v.as_str()), Some(expected_key.as_str()));

    Ok(())
}

// ── Inbox ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn inbox_rejects_an_envelope_with_no_signature() -> anyhow::Result<()> {
    let harness = TestHarness::new(Some(enabled_service(FederationMode::Public))).await?;
    let envelope = unsigned_envelope("MESSAGE_CREATE", json!({ "remote_channel_id": "1" }));

    let (status, _) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri("/federation/inbox")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&envelope)?))?,
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    Ok(())
}

// ── Handshake ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_completes_pairing_with_the_minted_token_and_rejects_a_wrong_one() -> anyhow::Result<()> {
    let harness = TestHarness::new(Some(enabled_service(FederationMode::Closed))).await?;
    let admin_token = harness.admin_token().await?;

    // An admin mints a one-shot token for the peer out-of-band.
    let (status, body) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri(format!(
                    "/api/v1/admin/federation/instances/{PEER_DOMAIN}/handshake-token"
                ))
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let token = body.get("token").and_then(|v| v.as_str()).unwrap().to_string();

    let peer_signing_key = SigningKey::generate(&mut OsRng);
    let peer_public_key_hex: String = peer_signing_key
        .verifying_key()
        .to_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();

    // A wrong token is rejected and does not complete the pairing.
    let wrong_req = HandshakeRequest {
        token: "not-the-real-token".to_string(),
        requester_domain: PEER_DOMAIN.to_string(),
        requester_public_key: peer_public_key_hex.clone(),
    };
    let (status, _) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri("/federation/handshake")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&wrong_req)?))?,
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!amityvox_db::federation::is_handshake_completed(&harness.db, PEER_DOMAIN).await?);

    // The correct token completes the pairing and pins the peer's key.
    let correct_req = HandshakeRequest {
        token,
        requester_domain: PEER_DOMAIN.to_string(),
        requester_public_key: peer_public_key_hex,
    };
    let (status, body) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri("/federation/handshake")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&correct_req)?))?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.get("accepted").and_then(|v| v.as_bool()), Some(true));
    assert!(amityvox_db::federation::is_handshake_completed(&harness.db, PEER_DOMAIN).await?);

    Ok(())
}

// ── Admin: instances ─────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_can_upsert_list_and_delete_instances() -> anyhow::Result<()> {
    let harness = TestHarness::new(Some(enabled_service(FederationMode::Public))).await?;
    let admin_token = harness.admin_token().await?;

    let (status, _) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri("/api/v1/admin/federation/instances")
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "domain": PEER_DOMAIN, "mode": "closed", "voice_mode": "direct" }).to_string(),
                ))?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    // Rejects a bogus mode string before touching the database.
    let (status, _) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri("/api/v1/admin/federation/instances")
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "domain": "bad.example", "mode": "not-a-real-mode", "voice_mode": "direct" })
                        .to_string(),
                ))?,
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = harness
        .request(
            Request::builder()
                .uri("/api/v1/admin/federation/instances")
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let instances = body.get("instances").and_then(|v| v.as_array()).unwrap();
    assert!(instances.iter().any(|i| i.get("domain").and_then(|d| d.as_str()) == Some(PEER_DOMAIN)));

    let (status, _) = harness
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/admin/federation/instances/{PEER_DOMAIN}"))
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = harness
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/admin/federation/instances/{PEER_DOMAIN}"))
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

// ── Admin: dead letters ──────────────────────────────────────────────────────

#[tokio::test]
async fn admin_can_list_replay_and_discard_dead_letters() -> anyhow::Result<()> {
    let harness = TestHarness::new(Some(enabled_service(FederationMode::Public))).await?;
    let admin_token = harness.admin_token().await?;

    let envelope = unsigned_envelope("MESSAGE_CREATE", json!({ "content": "hi" }));
    let envelope_value = serde_json::to_value(&envelope)?;
    amityvox_db::federation::enqueue_outbox_entry(
        &harness.db,
        &envelope.id,
        PEER_DOMAIN,
        &envelope_value,
        chrono::Utc::now().timestamp_millis(),
    )
    .await?;
    let due = amityvox_db::federation::fetch_due_outbox_entries(
        &harness.db,
        chrono::Utc::now().timestamp_millis(),
        10,
    )
    .await?;
    let outbox_id = due[0].id;
    amityvox_db::federation::move_outbox_to_dead_letter(
        &harness.db,
        outbox_id,
        "peer rejected event permanently",
        chrono::Utc::now().timestamp_millis(),
    )
    .await?;

    let (status, body) = harness
        .request(
            Request::builder()
                .uri("/api/v1/admin/federation/dead-letters")
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let dead_letters = body.get("dead_letters").and_then(|v| v.as_array()).unwrap();
    assert_eq!(dead_letters.len(), 1);
    let dead_letter_id = dead_letters[0].get("id").and_then(|v| v.as_i64()).unwrap();
    assert_eq!(
        dead_letters[0].get("target_instance").and_then(|v| v.as_str()),
        Some(PEER_DOMAIN)
    );

    let (status, _) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/admin/federation/dead-letters/{dead_letter_id}/replay"))
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let replayed = amityvox_db::federation::fetch_due_outbox_entries(
        &harness.db,
        chrono::Utc::now().timestamp_millis(),
        10,
    )
    .await?;
    assert_eq!(replayed.len(), 1);
    assert!(amityvox_db::federation::list_dead_letters(&harness.db).await?.is_empty());

    amityvox_db::federation::move_outbox_to_dead_letter(
        &harness.db,
        replayed[0].id,
        "peer rejected event permanently",
        chrono::Utc::now().timestamp_millis(),
    )
    .await?;
    let second_dead_letter_id = amityvox_db::federation::list_dead_letters(&harness.db).await?[0].id;

    let (status, _) = harness
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/admin/federation/dead-letters/{second_dead_letter_id}"))
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(amityvox_db::federation::list_dead_letters(&harness.db).await?.is_empty());

    let (status, _) = harness
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/admin/federation/dead-letters/{second_dead_letter_id}"))
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

// ── Admin: key audit ─────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_can_list_and_acknowledge_key_fingerprint_mismatches() -> anyhow::Result<()> {
    let harness = TestHarness::new(Some(enabled_service(FederationMode::Public))).await?;
    let admin_token = harness.admin_token().await?;

    amityvox_db::federation::record_key_fingerprint_mismatch(
        &harness.db,
        PEER_DOMAIN,
        Some("aaaaaaaaaaaaaaaa"),
        "bbbbbbbbbbbbbbbb",
        chrono::Utc::now().timestamp_millis(),
    )
    .await?;

    let (status, body) = harness
        .request(
            Request::builder()
                .uri("/api/v1/admin/federation/key-audit")
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let entries = body.get("key_audit").and_then(|v| v.as_array()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].get("acknowledged").and_then(|v| v.as_bool()), Some(false));
    let entry_id = entries[0].get("id").and_then(|v| v.as_i64()).unwrap();

    let (status, _) = harness
        .request(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/admin/federation/key-audit/{entry_id}/acknowledge"))
                .header(header::AUTHORIZATION, format!("Bearer {admin_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    let entries = amityvox_db::federation::list_key_audit_entries(&harness.db, None).await?;
    assert!(entries[0].acknowledged);

    Ok(())
}
