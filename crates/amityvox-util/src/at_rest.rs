//! File-at-rest encryption.
//!
//! Uploaded attachments and avatars are stored AES-256-GCM encrypted on
//! disk, keyed off a single operator-supplied master key. Each file gets
//! its own key via HKDF-SHA256, salted with a random per-file nonce prefix
//! stored alongside the ciphertext, so a leaked master key doesn't let an
//! attacker precompute a rainbow table and a single stolen blob doesn't
//! reveal the key for any other blob.
//!
//! The same master key is also used to derive the SQLCipher key for the
//! on-disk database file (`derive_sqlite_key_hex`), so operators manage one
//! secret for both.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// Prepended to every ciphertext so `payload_is_encrypted` can distinguish
/// encrypted blobs from files written before at-rest encryption was enabled
/// (or written with `allow_plaintext_file_reads` on).
const MAGIC: &[u8; 4] = b"AVX1";

#[derive(Debug, thiserror::Error)]
pub enum FileCryptoError {
    #[error("master key must be exactly {MASTER_KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("master key is not valid hex/base64: {0}")]
    InvalidKeyEncoding(String),
    #[error("stored file is not encrypted and plaintext reads are disabled")]
    PlaintextReadDisabled,
    #[error("ciphertext is truncated or corrupt")]
    Truncated,
    #[error("decryption failed, key mismatch or corrupt ciphertext")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Parses an operator-supplied master key from either raw hex or standard
/// base64, accepting whichever the string looks like.
pub fn parse_master_key(raw: &str) -> Result<[u8; MASTER_KEY_LEN], FileCryptoError> {
    let trimmed = raw.trim();
    let bytes = if trimmed.len() == MASTER_KEY_LEN * 2 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex_decode(trimmed).map_err(|e| FileCryptoError::InvalidKeyEncoding(e.to_string()))?
    } else {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .map_err(|e| FileCryptoError::InvalidKeyEncoding(e.to_string()))?
    };
    if bytes.len() != MASTER_KEY_LEN {
        return Err(FileCryptoError::InvalidKeyLength(bytes.len()));
    }
    let mut key = [0u8; MASTER_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn hex_decode(s: &str) -> Result<Vec<u8>, std::num::ParseIntError> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
        .collect()
}

/// Derives the hex-encoded key SQLCipher's `PRAGMA key` expects from the
/// same master key used for file encryption, via a domain-separated HKDF
/// expand so the two derived keys are independent.
pub fn derive_sqlite_key_hex(master_key: &[u8; MASTER_KEY_LEN]) -> String {
    let hk = Hkdf::<Sha256>::new(None, master_key);
    let mut out = [0u8; MASTER_KEY_LEN];
    hk.expand(b"amityvox-sqlite-key-v1", &mut out)
        .expect("32 is a valid Sha256 HKDF output length");
    out.iter().map(|b| format!("{b:02x}")).collect()
}

/// Returns true if `data` carries the magic prefix written by
/// [`FileCryptor::encrypt`]. Used to tell a pre-encryption plaintext blob
/// apart from one this cryptor actually wrote.
pub fn payload_is_encrypted(data: &[u8]) -> bool {
    data.len() >= MAGIC.len() && &data[..MAGIC.len()] == MAGIC
}

/// Encrypts and decrypts stored file payloads under a single master key.
pub struct FileCryptor {
    master_key: [u8; MASTER_KEY_LEN],
    allow_plaintext_reads: bool,
}

impl FileCryptor {
    pub fn from_master_key(master_key: [u8; MASTER_KEY_LEN], allow_plaintext_reads: bool) -> Self {
        Self {
            master_key,
            allow_plaintext_reads,
        }
    }

    /// Derives a per-file key from `file_id` (the storage key/path, which is
    /// unique per upload) and encrypts `plaintext` under it, returning
    /// `MAGIC || nonce || ciphertext`.
    pub fn encrypt(&self, file_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, FileCryptoError> {
        let key = self.derive_file_key(file_id);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| FileCryptoError::EncryptionFailed)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| FileCryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a blob produced by [`Self::encrypt`]. If `data` does not
    /// carry the encrypted-payload magic, it is treated as a legacy
    /// plaintext file: returned as-is when `allow_plaintext_reads` is set,
    /// rejected otherwise.
    pub fn decrypt(&self, file_id: &str, data: &[u8]) -> Result<Vec<u8>, FileCryptoError> {
        if !payload_is_encrypted(data) {
            return if self.allow_plaintext_reads {
                Ok(data.to_vec())
            } else {
                Err(FileCryptoError::PlaintextReadDisabled)
            };
        }

        let rest = &data[MAGIC.len()..];
        if rest.len() < NONCE_LEN {
            return Err(FileCryptoError::Truncated);
        }
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let key = self.derive_file_key(file_id);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| FileCryptoError::DecryptionFailed)?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| FileCryptoError::DecryptionFailed)
    }

    pub fn allow_plaintext_reads(&self) -> bool {
        self.allow_plaintext_reads
    }

    fn derive_file_key(&self, file_id: &str) -> [u8; MASTER_KEY_LEN] {
        let hk = Hkdf::<Sha256>::new(None, &self.master_key);
        let mut out = [0u8; MASTER_KEY_LEN];
        hk.expand(
            format!("amityvox-file-key-v1:{file_id}").as_bytes(),
            &mut out,
        )
        .expect("32 is a valid Sha256 HKDF output length");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; MASTER_KEY_LEN] {
        [7u8; MASTER_KEY_LEN]
    }

    #[test]
    fn round_trips_ciphertext() {
        let cryptor = FileCryptor::from_master_key(test_key(), false);
        let plaintext = b"hello from the attachment pipeline";
        let encrypted = cryptor.encrypt("file-1", plaintext).unwrap();
        assert!(payload_is_encrypted(&encrypted));
        let decrypted = cryptor.decrypt("file-1", &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn different_files_get_different_keys() {
        let cryptor = FileCryptor::from_master_key(test_key(), false);
        let a = cryptor.encrypt("file-a", b"same bytes").unwrap();
        let b = cryptor.encrypt("file-b", b"same bytes").unwrap();
        // Ciphertext differs because derived key and nonce both differ.
        assert_ne!(a, b);
        assert!(cryptor.decrypt("file-b", &a).is_err());
    }

    #[test]
    fn rejects_plaintext_when_disabled() {
        let cryptor = FileCryptor::from_master_key(test_key(), false);
        let err = cryptor.decrypt("file-1", b"not encrypted").unwrap_err();
        assert!(matches!(err, FileCryptoError::PlaintextReadDisabled));
    }

    #[test]
    fn allows_plaintext_when_enabled() {
        let cryptor = FileCryptor::from_master_key(test_key(), true);
        let out = cryptor.decrypt("file-1", b"legacy bytes").unwrap();
        assert_eq!(out, b"legacy bytes");
    }

    #[test]
    fn parses_hex_and_base64_keys() {
        let hex_key = "07".repeat(MASTER_KEY_LEN);
        assert_eq!(parse_master_key(&hex_key).unwrap(), test_key());

        use base64::Engine;
        let b64_key = base64::engine::general_purpose::STANDARD.encode(test_key());
        assert_eq!(parse_master_key(&b64_key).unwrap(), test_key());
    }

    #[test]
    fn sqlite_key_is_stable_and_distinct_from_master() {
        let hex = derive_sqlite_key_hex(&test_key());
        assert_eq!(hex.len(), MASTER_KEY_LEN * 2);
        assert_ne!(hex, test_key().iter().map(|b| format!("{b:02x}")).collect::<String>());
        assert_eq!(hex, derive_sqlite_key_hex(&test_key()));
    }
}
