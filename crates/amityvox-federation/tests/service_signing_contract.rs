//! Covers `FederationService` itself (sign/verify round trip, well-known
//! document derivation, disabled-signing-key failure) one layer above
//! `signing.rs` and `client.rs`'s own dense `#[cfg(test)]` suites, since
//! `FederationTransport` hardcodes `https://{peer_domain}/...` URLs with
//! no injectable base and the workspace carries no HTTP-mocking crate —
//! a real signed network round trip through `verify_inbound` isn't
//! reachable from a unit test, so this exercises the parts of the
//! contract that don't require one.

use amityvox_federation::protocol::{FederationEnvelope, HlcWire};
use amityvox_federation::signing;
use amityvox_federation::{FederationConfig, FederationError, FederationMode, FederationService, VoiceMode};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde_json::json;

fn config_with_key(domain: &str) -> (FederationConfig, SigningKey) {
    let signing_key = signing::generate_keypair();
    let config = FederationConfig {
        mode: FederationMode::Public,
        voice_mode: VoiceMode::Direct,
        domain: domain.to_string(),
        key_id: "ed25519:1".to_string(),
        signing_key: Some(signing_key.clone()),
        max_attempts: 12,
        base_backoff_secs: 30,
        max_backoff_secs: 21_600,
        bounded_skew_secs: 300,
        well_known_key_ttl_secs: 3600,
    };
    (config, signing_key)
}

fn unsigned_envelope(source: &str) -> FederationEnvelope {
    FederationEnvelope {
        id: amityvox_util::ulid::generate().to_string(),
        r#type: "MESSAGE_CREATE".to_string(),
        hlc: HlcWire { wall_ms: 1, counter: 0, instance_id: source.to_string() },
        source_instance: source.to_string(),
        payload: json!({ "content": "hi" }),
        signature: None,
    }
}

#[test]
fn sign_produces_a_signature_verifiable_with_the_services_own_public_key() {
    let (config, signing_key) = config_with_key("a.example");
    let service = FederationService::new(config).unwrap();

    let signed = service.sign(unsigned_envelope("a.example")).unwrap();
    assert!(signed.signature.is_some());

    let verifying_key: VerifyingKey = signing_key.verifying_key();
    signing::verify(
        &verifying_key,
        &signed.signable_value(),
        signed.signature.as_deref().unwrap(),
    )
    .expect("a freshly signed envelope must verify against its own public key");
}

#[test]
fn tampering_with_a_signed_field_after_signing_breaks_verification() {
    let (config, signing_key) = config_with_key("a.example");
    let service = FederationService::new(config).unwrap();

    let mut signed = service.sign(unsigned_envelope("a.example")).unwrap();
    signed.payload = json!({ "content": "tampered" });

    let verifying_key: VerifyingKey = signing_key.verifying_key();
    let result = signing::verify(
        &verifying_key,
        &signed.signable_value(),
        signed.signature.as_deref().unwrap(),
    );
    assert!(matches!(result, Err(FederationError::InvalidSignature)));
}

#[test]
fn signing_without_a_configured_key_fails_closed() {
    let config = FederationConfig::disabled("a.example");
    let service = FederationService::new(config).unwrap();

    let result = service.sign(unsigned_envelope("a.example"));
    assert!(matches!(result, Err(FederationError::MissingSigningKey)));
}

#[test]
fn well_known_document_advertises_a_public_key_whose_fingerprint_is_a_prefix_of_its_hex() {
    let (config, _signing_key) = config_with_key("a.example");
    let service = FederationService::new(config).unwrap();

    let doc = service.well_known_document();
    assert_eq!(doc.domain, "a.example");
    assert_eq!(doc.public_key, service.signing_public_key_hex().unwrap());
    assert!(doc.public_key.starts_with(&doc.public_key_fingerprint));
    assert!(doc.capabilities.contains(&"events".to_string()));
}

#[test]
fn disabled_instance_advertises_no_signing_key() {
    let config = FederationConfig::disabled("a.example");
    let service = FederationService::new(config).unwrap();

    assert!(!service.is_enabled());
    assert!(service.signing_public_key_hex().is_none());
    let doc = service.well_known_document();
    assert_eq!(doc.public_key, "");
    assert_eq!(doc.public_key_fingerprint, "");
}
