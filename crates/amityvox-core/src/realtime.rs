//! Error taxonomy shared by the bus, gateway, permission evaluator, and
//! federation delivery subsystem.
//!
//! Each of those four components returns its own `thiserror` enum for the
//! failure modes specific to it, but they all collapse into this one
//! taxonomy at the boundary so `amityvox-api` and `amityvox-ws` only have to
//! know how to render eight kinds of failure, not four crates' worth of
//! variants. The mapping to HTTP status / WS close code lives at the
//! `amityvox-api` / `amityvox-ws` layer; this enum only classifies.

use thiserror::Error;

use crate::error::CoreError;

/// The eight error kinds every realtime-core failure collapses into.
/// Corresponds 1:1 with the REST error envelope's `code` families and the
/// gateway's INVALID_SESSION / close-code decisions.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Malformed input: bad opcode payload, schema violation, oversized
    /// frame. Caller's fault, not retryable as-is.
    #[error("validation: {0}")]
    Validation(String),

    /// Missing or invalid bearer token / gateway IDENTIFY token / resume
    /// token. Distinguished from `Authorization` so callers never have to
    /// guess whether re-authenticating could fix it (it can, here).
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The permission evaluator said no. Message is intentionally coarse —
    /// never names the missing permission bit, per the fail-closed policy.
    #[error("not authorized")]
    Authorization,

    /// Resource does not exist, or exists but its existence must not be
    /// disclosed to this caller (the two are deliberately indistinguishable
    /// at this layer).
    #[error("not found")]
    NotFound,

    /// Duplicate nonce, unique constraint violation, or an HLC/event replay
    /// already observed. Federation inbound treats this as silent dedup
    /// rather than an error surfaced to the sender.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller exceeded a rate limit; `retry_after_secs` becomes the
    /// `Retry-After` header on the REST surface.
    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    /// A dependency (DB, bus, peer instance) is unavailable right now but
    /// the operation may succeed if retried. Workers retry these with
    /// backoff and jitter; the gateway and REST surfaces do not retry and
    /// just report the failure.
    #[error("transient dependency failure: {0}")]
    Transient(String),

    /// A dependency failure that retrying will not fix: bad signature,
    /// unknown peer key, policy rejection. Never queued for retry.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl RealtimeError {
    /// Stable snake_case identifier for the REST error envelope's `code`
    /// field (§6). Does not vary with the human-readable message, so
    /// clients can match on it without string-matching prose.
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Validation(_) => "validation_error",
            RealtimeError::Authentication(_) => "authentication_failed",
            RealtimeError::Authorization => "not_authorized",
            RealtimeError::NotFound => "not_found",
            RealtimeError::Conflict(_) => "conflict",
            RealtimeError::RateLimited { .. } => "rate_limited",
            RealtimeError::Transient(_) => "transient_error",
            RealtimeError::Permanent(_) => "permanent_error",
        }
    }

    /// Whether a worker (federation outbox scanner, push delivery, link
    /// unfurl) should retry this failure with backoff. Only `Transient`
    /// failures are retryable; everything else either already succeeded in
    /// a durable way (`Conflict`) or will never succeed (`Permanent` and
    /// the four caller-fault kinds).
    pub fn is_retryable(&self) -> bool {
        matches!(self, RealtimeError::Transient(_))
    }
}

impl From<CoreError> for RealtimeError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NotFound => RealtimeError::NotFound,
            CoreError::Forbidden | CoreError::MissingPermission => RealtimeError::Authorization,
            CoreError::BadRequest(msg) => RealtimeError::Validation(msg),
            CoreError::Conflict(msg) => RealtimeError::Conflict(msg),
            CoreError::Database(db_err) => RealtimeError::Transient(db_err.to_string()),
            CoreError::Internal(msg) => RealtimeError::Transient(msg),
        }
    }
}

impl From<amityvox_db::DbError> for RealtimeError {
    fn from(e: amityvox_db::DbError) -> Self {
        match e {
            amityvox_db::DbError::NotFound => RealtimeError::NotFound,
            amityvox_db::DbError::Sqlx(err) => RealtimeError::Transient(err.to_string()),
        }
    }
}

impl From<amityvox_federation::FederationError> for RealtimeError {
    fn from(e: amityvox_federation::FederationError) -> Self {
        use amityvox_federation::FederationError as FE;
        match e {
            FE::Disabled => RealtimeError::Permanent("federation disabled for this instance".into()),
            FE::MissingSigningKey => RealtimeError::Permanent("no signing key configured".into()),
            FE::InvalidSignature => RealtimeError::Permanent("invalid signature".into()),
            FE::HandshakeRequired => {
                RealtimeError::Authorization
            }
            FE::KeyFingerprintMismatch => {
                RealtimeError::Permanent("peer key fingerprint mismatch, awaiting admin acknowledgement".into())
            }
            FE::UnknownServer(peer) => RealtimeError::Permanent(format!("unknown peer instance: {peer}")),
            FE::Database(err) => RealtimeError::Transient(err.to_string()),
            FE::Http(msg) | FE::RemoteError(msg) => RealtimeError::Transient(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(RealtimeError::Transient("db down".into()).is_retryable());
        assert!(!RealtimeError::Permanent("bad signature".into()).is_retryable());
        assert!(!RealtimeError::Conflict("duplicate nonce".into()).is_retryable());
        assert!(!RealtimeError::Authorization.is_retryable());
    }

    #[test]
    fn codes_are_stable_snake_case() {
        assert_eq!(RealtimeError::NotFound.code(), "not_found");
        assert_eq!(
            RealtimeError::RateLimited { retry_after_secs: 5 }.code(),
            "rate_limited"
        );
    }
}
