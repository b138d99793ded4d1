//! Canonical-JSON Ed25519 signing for federation envelopes.
//!
//! Every envelope posted to a peer's inbox is signed over the canonical
//! JSON encoding of its fields (lexicographic key order, no insignificant
//! whitespace) excluding the `signature` field itself, per spec §6's
//! federation wire contract. Canonicalizing before signing means both
//! sides compute the same bytes regardless of how their JSON library
//! happened to order the fields when it built the value.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::Value;

use crate::FederationError;

/// Recursively sorts all object keys and serializes with no extra
/// whitespace, so the same logical JSON value always produces identical
/// bytes regardless of field insertion order.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let sorted = sort_keys(value);
    serde_json::to_vec(&sorted).expect("canonicalized value always serializes")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Signs the canonical bytes of `value` (which must not itself carry a
/// `signature` field) and returns the base64-standard-encoded signature.
pub fn sign(signing_key: &SigningKey, value: &Value) -> String {
    let bytes = canonicalize(value);
    let signature: Signature = signing_key.sign(&bytes);
    base64_encode(&signature.to_bytes())
}

/// Verifies `signature_b64` (base64 Ed25519) over the canonical bytes of
/// `value` using `public_key`. Returns [`FederationError::InvalidSignature`]
/// on any mismatch, malformed signature, or malformed key — callers must
/// not distinguish these cases in the response they send back (spec §9:
/// don't leak which part of verification failed).
pub fn verify(public_key: &VerifyingKey, value: &Value, signature_b64: &str) -> Result<(), FederationError> {
    let sig_bytes = base64_decode(signature_b64).map_err(|_| FederationError::InvalidSignature)?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| FederationError::InvalidSignature)?;
    let bytes = canonicalize(value);
    public_key
        .verify(&bytes, &signature)
        .map_err(|_| FederationError::InvalidSignature)
}

/// Generates a fresh Ed25519 keypair for first-boot instance provisioning
/// (spec §10.3: a missing signing key file is generated once and persisted,
/// not regenerated on every start).
pub fn generate_keypair() -> SigningKey {
    use rand::rngs::OsRng;
    SigningKey::generate(&mut OsRng)
}

/// Lower-case hex encoding of a signing key's 32 secret bytes, for the
/// on-disk key file format.
pub fn signing_key_to_hex(key: &SigningKey) -> String {
    key.to_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

/// Parses the hex format written by [`signing_key_to_hex`]. Returns
/// [`FederationError::MissingSigningKey`] for anything that isn't exactly
/// 32 bytes of valid hex, since a malformed key file is operationally the
/// same problem as a missing one.
pub fn signing_key_from_hex(hex: &str) -> Result<SigningKey, FederationError> {
    if hex.len() != 64 {
        return Err(FederationError::MissingSigningKey);
    }
    let mut bytes = [0u8; 32];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| FederationError::MissingSigningKey)?;
    }
    Ok(SigningKey::from_bytes(&bytes))
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn canonicalization_ignores_field_order() {
        let a = serde_json::json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        let b = serde_json::json!({"a": 2, "c": {"y": 2, "z": 1}, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn round_trips_a_valid_signature() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let envelope = serde_json::json!({"id": "01AA", "type": "MESSAGE_CREATE", "payload": {"x": 1}});

        let signature = sign(&signing_key, &envelope);
        assert!(verify(&verifying_key, &envelope, &signature).is_ok());
    }

    #[test]
    fn hex_round_trips_a_generated_key() {
        let key = generate_keypair();
        let hex = signing_key_to_hex(&key);
        let parsed = signing_key_from_hex(&hex).unwrap();
        assert_eq!(key.to_bytes(), parsed.to_bytes());
    }

    #[test]
    fn rejects_malformed_hex_key_file() {
        assert!(signing_key_from_hex("not-hex").is_err());
        assert!(signing_key_from_hex("abcd").is_err());
    }

    #[test]
    fn rejects_a_tampered_payload() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let envelope = serde_json::json!({"id": "01AA", "payload": {"x": 1}});
        let signature = sign(&signing_key, &envelope);

        let tampered = serde_json::json!({"id": "01AA", "payload": {"x": 2}});
        assert!(verify(&verifying_key, &tampered, &signature).is_err());
    }
}
