//! HTTP transport for the federation wire: posting signed envelopes to a
//! peer's inbox, fetching its well-known discovery document, and the
//! handshake exchange. Kept separate from [`crate::FederationService`] so
//! the delivery worker (`crate::client`) can be tested against a fake
//! transport without spinning up real HTTP.

use std::time::Duration;

use reqwest::{Client, StatusCode};

use crate::protocol::{FederationEnvelope, HandshakeRequest, HandshakeResponse, WellKnownInstance};
use crate::FederationError;

/// Deadline for a single outbound delivery attempt (spec §5: "federation
/// deliver 20s").
const DELIVER_TIMEOUT: Duration = Duration::from_secs(20);
/// Deadline for well-known/handshake lookups, which are not on the
/// per-event retry path and can afford to be snappier.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// What happened when an envelope was POSTed to a peer's inbox, collapsed
/// from the peer's HTTP status per spec §4.4 steps 4-6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx: mark the outbox row delivered.
    Delivered,
    /// 4xx other than 429: the peer rejected the event on its merits, mark
    /// the row dead and stop retrying.
    Rejected,
    /// 409: the peer already has this event, treat as delivered.
    DuplicateAtPeer,
    /// 5xx, 429, timeout, or connection failure: retry with backoff.
    Transient,
}

pub struct FederationTransport {
    http: Client,
}

impl FederationTransport {
    pub fn new() -> Result<Self, FederationError> {
        let http = Client::builder()
            .user_agent(concat!("AmityVox-Federation/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Http(e.to_string()))?;
        Ok(Self { http })
    }

    /// POSTs a signed envelope to `https://{peer_domain}/federation/inbox`.
    pub async fn deliver(&self, peer_domain: &str, envelope: &FederationEnvelope) -> DeliveryOutcome {
        let url = format!("https://{peer_domain}/federation/inbox");
        let result = self
            .http
            .post(&url)
            .timeout(DELIVER_TIMEOUT)
            .json(envelope)
            .send()
            .await;

        match result {
            Ok(resp) => Self::classify(resp.status()),
            Err(err) => {
                tracing::warn!(peer_domain, error = %err, "federation delivery request failed");
                DeliveryOutcome::Transient
            }
        }
    }

    fn classify(status: StatusCode) -> DeliveryOutcome {
        if status.is_success() {
            DeliveryOutcome::Delivered
        } else if status == StatusCode::CONFLICT {
            DeliveryOutcome::DuplicateAtPeer
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            DeliveryOutcome::Transient
        } else {
            DeliveryOutcome::Rejected
        }
    }

    pub async fn fetch_well_known(&self, peer_domain: &str) -> Result<WellKnownInstance, FederationError> {
        let url = format!("https://{peer_domain}/federation/.well-known/instance");
        let resp = self
            .http
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| FederationError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(FederationError::UnknownServer(peer_domain.to_string()));
        }
        resp.json()
            .await
            .map_err(|e| FederationError::RemoteError(format!("invalid well-known document: {e}")))
    }

    /// POSTs a signed `VOICE_RELAY` envelope to a peer's voice token
    /// endpoint and returns its (still-signed) reply envelope for the
    /// caller to verify.
    pub async fn relay_voice_action(
        &self,
        peer_domain: &str,
        envelope: &FederationEnvelope,
    ) -> Result<FederationEnvelope, FederationError> {
        let url = format!("https://{peer_domain}/federation/voice/token");
        let resp = self
            .http
            .post(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .json(envelope)
            .send()
            .await
            .map_err(|e| FederationError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(FederationError::RemoteError(format!(
                "voice relay request rejected with status {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| FederationError::RemoteError(format!("invalid voice relay response: {e}")))
    }

    pub async fn handshake(
        &self,
        peer_domain: &str,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, FederationError> {
        let url = format!("https://{peer_domain}/federation/handshake");
        let resp = self
            .http
            .post(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(|e| FederationError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(FederationError::RemoteError(format!(
                "handshake rejected with status {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| FederationError::RemoteError(format!("invalid handshake response: {e}")))
    }
}

impl Default for FederationTransport {
    fn default() -> Self {
        Self::new().expect("reqwest client construction cannot fail with this configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes_per_spec_table() {
        assert_eq!(FederationTransport::classify(StatusCode::OK), DeliveryOutcome::Delivered);
        assert_eq!(FederationTransport::classify(StatusCode::CREATED), DeliveryOutcome::Delivered);
        assert_eq!(
            FederationTransport::classify(StatusCode::CONFLICT),
            DeliveryOutcome::DuplicateAtPeer
        );
        assert_eq!(
            FederationTransport::classify(StatusCode::TOO_MANY_REQUESTS),
            DeliveryOutcome::Transient
        );
        assert_eq!(
            FederationTransport::classify(StatusCode::SERVICE_UNAVAILABLE),
            DeliveryOutcome::Transient
        );
        assert_eq!(
            FederationTransport::classify(StatusCode::BAD_REQUEST),
            DeliveryOutcome::Rejected
        );
        assert_eq!(
            FederationTransport::classify(StatusCode::FORBIDDEN),
            DeliveryOutcome::Rejected
        );
    }
}
