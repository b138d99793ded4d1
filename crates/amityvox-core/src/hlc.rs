//! Hybrid Logical Clock: causally orders events across this instance and
//! its federation peers without requiring synchronized wall clocks.
//!
//! Every locally-published event is stamped with an [`Hlc`]. The stamp is
//! chosen so that it is greater than both the local clock's previous value
//! and any HLC seen in the request that produced the event (a reply to a
//! remote message, for instance), giving a partial order that respects
//! causality even across instances with skewed clocks.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// `(wall_ms, counter, instance_id)`. Ordered lexicographically on that
/// tuple: wall-clock time dominates, `counter` breaks ties within the same
/// millisecond, `instance_id` breaks ties between two instances that
/// otherwise produced an identical `(wall_ms, counter)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hlc {
    pub wall_ms: i64,
    pub counter: u32,
    pub instance_id: String,
}

impl Hlc {
    pub fn zero(instance_id: impl Into<String>) -> Self {
        Self {
            wall_ms: 0,
            counter: 0,
            instance_id: instance_id.into(),
        }
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:08x}-{}", self.wall_ms, self.counter, self.instance_id)
    }
}

struct ClockState {
    last: Hlc,
}

/// Process-wide HLC source. One instance per running server; `AppState`
/// holds it behind an `Arc` and every module that stamps or advances an
/// HLC goes through this handle rather than touching wall-clock time
/// directly.
pub struct HlcClock {
    instance_id: String,
    /// Inbound `wall_ms` values are capped at `now + bounded_skew_secs` so a
    /// peer with a badly wrong clock can't permanently drag this instance's
    /// HLC into the future; see `advance_past`.
    bounded_skew_secs: i64,
    state: Mutex<ClockState>,
}

impl HlcClock {
    pub fn new(instance_id: impl Into<String>, bounded_skew_secs: i64) -> Self {
        let instance_id = instance_id.into();
        Self {
            state: Mutex::new(ClockState {
                last: Hlc::zero(instance_id.clone()),
            }),
            instance_id,
            bounded_skew_secs,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Stamps a new locally-originated event: advances past the current
    /// wall clock and the previous local HLC.
    pub fn stamp(&self) -> Hlc {
        let now = now_ms();
        let mut state = self.state.lock().unwrap();
        state.last = Self::next(&state.last, now, &self.instance_id);
        state.last.clone()
    }

    /// Advances the clock past an HLC observed on an inbound federation
    /// event or a causally-preceding local event, per the merge rule: the
    /// new wall time is `max(now, prev.wall_ms, incoming.wall_ms)`, and the
    /// counter resets to zero unless the winning wall time ties with one of
    /// the inputs, in which case it continues from the larger counter.
    ///
    /// `incoming.wall_ms` is clamped to `now + bounded_skew_secs` first, so
    /// a peer with a clock set far in the future can widen this instance's
    /// HLC by at most that bound rather than permanently.
    pub fn advance_past(&self, incoming: &Hlc) -> Hlc {
        let now = now_ms();
        let clamp = now + self.bounded_skew_secs * 1_000;
        let mut clamped = incoming.clone();
        if clamped.wall_ms > clamp {
            tracing::warn!(
                peer_instance = %incoming.instance_id,
                incoming_wall_ms = incoming.wall_ms,
                clamp_wall_ms = clamp,
                "inbound HLC wall clock exceeds bounded skew, clamping"
            );
            clamped.wall_ms = clamp;
        }

        let mut state = self.state.lock().unwrap();
        let merged = Self::merge(&state.last, &clamped, now);
        state.last = Self::next(&merged, now, &self.instance_id);
        state.last.clone()
    }

    /// Merge step shared by `stamp` (incoming = self) and `advance_past`:
    /// the resulting wall time is the max of all three inputs; the counter
    /// continues from whichever input achieved that max, or resets to zero
    /// if `now` alone is strictly greatest.
    fn merge(prev: &Hlc, incoming: &Hlc, now: i64) -> Hlc {
        let wall = now.max(prev.wall_ms).max(incoming.wall_ms);
        let counter = if wall == prev.wall_ms && wall == incoming.wall_ms {
            prev.counter.max(incoming.counter)
        } else if wall == prev.wall_ms {
            prev.counter
        } else if wall == incoming.wall_ms {
            incoming.counter
        } else {
            0
        };
        Hlc {
            wall_ms: wall,
            counter,
            instance_id: prev.instance_id.clone(),
        }
    }

    /// Bumps `merged` one tick forward for `instance_id`: if wall time
    /// didn't move past `prev`, increments the counter; otherwise resets it.
    fn next(prev: &Hlc, now: i64, instance_id: &str) -> Hlc {
        let wall = now.max(prev.wall_ms);
        let counter = if wall == prev.wall_ms { prev.counter + 1 } else { 0 };
        Hlc {
            wall_ms: wall,
            counter,
            instance_id: instance_id.to_string(),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_strictly_increasing() {
        let clock = HlcClock::new("a.example", 60);
        let mut prev = clock.stamp();
        for _ in 0..500 {
            let next = clock.stamp();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn advancing_past_a_future_peer_hlc_jumps_forward() {
        let clock = HlcClock::new("a.example", 60);
        let local = clock.stamp();
        let far_future = Hlc {
            wall_ms: local.wall_ms + 10_000,
            counter: 3,
            instance_id: "b.example".to_string(),
        };
        let advanced = clock.advance_past(&far_future);
        assert!(advanced.wall_ms >= far_future.wall_ms);
        assert_eq!(advanced.instance_id, "a.example");
    }

    #[test]
    fn clamps_unbounded_peer_skew() {
        let clock = HlcClock::new("a.example", 1);
        let now = now_ms();
        let wildly_ahead = Hlc {
            wall_ms: now + 1_000_000,
            counter: 0,
            instance_id: "b.example".to_string(),
        };
        let advanced = clock.advance_past(&wildly_ahead);
        assert!(advanced.wall_ms < wildly_ahead.wall_ms);
        assert!(advanced.wall_ms <= now + 1_000 + 10);
    }

    #[test]
    fn ties_break_on_instance_id() {
        let a = Hlc {
            wall_ms: 100,
            counter: 1,
            instance_id: "a.example".to_string(),
        };
        let b = Hlc {
            wall_ms: 100,
            counter: 1,
            instance_id: "b.example".to_string(),
        };
        assert!(a < b);
    }
}
