//! Outbox delivery worker: turns a due outbox row into an HTTP attempt and
//! decides the row's next state per spec §4.4 steps 3-6.
//!
//! The actual row scanning/persistence lives in `amityvox-db`'s federation
//! query module; this type is the pure decision logic plus the transport
//! call, kept separate so backoff/dead-letter behavior is unit-testable
//! without a database.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::protocol::FederationEnvelope;
use crate::transport::{DeliveryOutcome, FederationTransport};

/// An outbox row as the delivery worker sees it. Field names mirror the
/// `federation_outbox` table (see `amityvox-db::federation`).
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub envelope: FederationEnvelope,
    pub target_instance: String,
    pub attempts: u32,
}

/// The decision the worker makes after one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboxDecision {
    /// Peer accepted it (or already had it); mark the row delivered.
    Delivered,
    /// Retry later at this absolute millisecond timestamp.
    Retry { next_attempt_at_ms: i64, attempts: u32 },
    /// Terminal failure; move to the dead-letter table.
    Dead { reason: String, attempts: u32 },
}

pub struct DeliveryWorker {
    transport: FederationTransport,
    max_attempts: u32,
    base_backoff_secs: u64,
    max_backoff_secs: u64,
}

impl DeliveryWorker {
    pub fn new(max_attempts: u32, base_backoff_secs: u64, max_backoff_secs: u64) -> Result<Self, crate::FederationError> {
        Ok(Self {
            transport: FederationTransport::new()?,
            max_attempts,
            base_backoff_secs,
            max_backoff_secs,
        })
    }

    /// Attempts delivery of `row` and returns the next state transition.
    /// Pipelines naturally: callers fire this per due row without waiting
    /// for the previous row's result, since rows for the same peer are
    /// already ordered by HLC before being enqueued (spec §5: "pipelining
    /// per peer preserves send order but does not wait for acks").
    pub async fn attempt(&self, row: &OutboxRow) -> OutboxDecision {
        let outcome = self.transport.deliver(&row.target_instance, &row.envelope).await;
        match outcome {
            DeliveryOutcome::Delivered | DeliveryOutcome::DuplicateAtPeer => OutboxDecision::Delivered,
            DeliveryOutcome::Rejected => OutboxDecision::Dead {
                reason: "peer rejected event on its merits (4xx)".to_string(),
                attempts: row.attempts + 1,
            },
            DeliveryOutcome::Transient => self.retry_or_dead(row.attempts + 1),
        }
    }

    fn retry_or_dead(&self, attempts: u32) -> OutboxDecision {
        if attempts >= self.max_attempts {
            OutboxDecision::Dead {
                reason: format!("exceeded max_attempts ({})", self.max_attempts),
                attempts,
            }
        } else {
            let delay_ms = backoff_millis(attempts, self.base_backoff_secs, self.max_backoff_secs);
            OutboxDecision::Retry {
                next_attempt_at_ms: now_ms() + delay_ms as i64,
                attempts,
            }
        }
    }
}

/// Exponential backoff with +-10% jitter: `min(base * 2^attempts, max)`,
/// jittered. `attempts` is the attempt count *after* the failure just
/// recorded, so the first retry (attempts=1) waits `base`, the second
/// waits `base*2`, and so on, capped at `max`.
pub fn backoff_millis(attempts: u32, base_secs: u64, max_secs: u64) -> u64 {
    let base_ms = base_secs.saturating_mul(1_000);
    let max_ms = max_secs.saturating_mul(1_000);
    let exp = attempts.saturating_sub(1).min(32);
    let unjittered = base_ms.saturating_mul(1u64 << exp).min(max_ms);

    let jitter_span = unjittered / 10; // +-10%
    if jitter_span == 0 {
        return unjittered;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_span * 2);
    unjittered - jitter_span + jitter
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let small = backoff_millis(1, 30, 21_600);
        let bigger = backoff_millis(2, 30, 21_600);
        assert!(small <= 33_000 && small >= 27_000);
        assert!(bigger >= 54_000 && bigger <= 66_000);

        // after enough attempts, always capped at max_secs (+-10%)
        let capped = backoff_millis(20, 30, 21_600);
        assert!(capped <= 21_600_000 + 2_160_000);
        assert!(capped >= 21_600_000 - 2_160_000);
    }

    #[test]
    fn dead_letters_after_max_attempts() {
        let worker_attempts = 12;
        let decision = DeliveryWorker {
            transport: FederationTransport::default(),
            max_attempts: worker_attempts,
            base_backoff_secs: 30,
            max_backoff_secs: 21_600,
        }
        .retry_or_dead(worker_attempts);
        assert!(matches!(decision, OutboxDecision::Dead { .. }));
    }

    #[test]
    fn retries_before_max_attempts() {
        let decision = DeliveryWorker {
            transport: FederationTransport::default(),
            max_attempts: 12,
            base_backoff_secs: 30,
            max_backoff_secs: 21_600,
        }
        .retry_or_dead(3);
        assert!(matches!(decision, OutboxDecision::Retry { .. }));
    }
}
