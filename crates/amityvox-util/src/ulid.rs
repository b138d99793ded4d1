//! ULID generation for wire-level event identifiers.
//!
//! Entity primary keys (messages, guilds, channels, ...) keep the existing
//! [`crate::snowflake`] scheme; both are time-sortable 64/128-bit ids with
//! the same monotonicity guarantee, so there is no ordering difference for
//! callers. ULIDs are used specifically for the values the realtime core's
//! data model calls out as `ULID`: bus event envelope ids, federation
//! outbox/dead-letter row ids, and the federation event log key.

use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use ulid::Generator;

static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

fn generator() -> &'static Mutex<Generator> {
    GENERATOR.get_or_init(|| Mutex::new(Generator::new()))
}

/// A 128-bit, lexicographically-sortable identifier: 48 bits of millisecond
/// timestamp followed by 80 bits of randomness, rendered as Crockford
/// base32. Two ids minted in the same millisecond by the same generator are
/// still strictly ordered (see [`generate`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(ulid::Ulid);

impl EventId {
    pub fn nil() -> Self {
        Self(ulid::Ulid::nil())
    }

    pub fn timestamp_millis(&self) -> u64 {
        self.0.timestamp_ms()
    }

    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        ulid::Ulid::from_string(s).map(Self)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_string(&s).map_err(serde::de::Error::custom)
    }
}

/// Generate a new ULID, monotonic within this process: if two calls land in
/// the same millisecond, the random component is incremented rather than
/// re-rolled, so ordering within a millisecond still reflects call order.
///
/// Monotonicity only holds per-process. Cross-instance causal order is the
/// HLC's job (see `amityvox_core::hlc`), not the ULID's.
pub fn generate() -> EventId {
    let mut gen = generator().lock().unwrap();
    // `Generator::generate` only fails if the clock has regressed past u48
    // wraparound, which cannot happen on any real deployment; fall back to a
    // fresh unseeded id rather than panic on a clock glitch.
    let id = gen.generate().unwrap_or_else(|_| ulid::Ulid::new());
    EventId(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_monotonic() {
        let mut prev = generate();
        for _ in 0..1000 {
            let next = generate();
            assert!(next > prev, "{next} should sort after {prev}");
            prev = next;
        }
    }

    #[test]
    fn round_trips_through_string() {
        let id = generate();
        let parsed = EventId::from_string(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
