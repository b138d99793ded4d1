//! Lightweight process-wide counters and the wire-trace gate shared by the
//! gateway and event bus. Kept here (rather than in `amityvox-ws`) so the
//! event bus can report dispatch volume without depending on the gateway
//! crate.
//!
//! Wire tracing logs every inbound/outbound gateway frame and bus dispatch
//! at `info` under the `wire` tracing target, including a payload preview.
//! Off by default since a busy instance would otherwise pay JSON
//! serialization cost on every message; enable with `AMITYVOX_WIRE_TRACE=1`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

const WIRE_TRACE_PREVIEW_MAX: usize = 512;

fn wire_trace_enabled_cell() -> &'static bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    CELL.get_or_init(|| {
        std::env::var("AMITYVOX_WIRE_TRACE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

pub fn wire_trace_enabled() -> bool {
    *wire_trace_enabled_cell()
}

/// Truncates `payload` to a bounded preview for wire-trace logging so a
/// large message body doesn't blow up log volume.
pub fn wire_trace_payload_preview(payload: &str) -> String {
    if payload.len() <= WIRE_TRACE_PREVIEW_MAX {
        payload.to_string()
    } else {
        let mut preview: String = payload.chars().take(WIRE_TRACE_PREVIEW_MAX).collect();
        preview.push_str("...(truncated)");
        preview
    }
}

static CONNECTIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
static EVENTS_DISPATCHED: AtomicU64 = AtomicU64::new(0);

pub fn ws_connection_open() {
    CONNECTIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}

pub fn ws_connection_close() {
    CONNECTIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
}

pub fn ws_event_dispatched(event_type: &str) {
    EVENTS_DISPATCHED.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(event_type, "gateway event dispatched to session");
}

/// Snapshot of the counters above, for an admin diagnostics endpoint.
pub struct GatewayCounters {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub events_dispatched: u64,
}

pub fn gateway_counters() -> GatewayCounters {
    GatewayCounters {
        connections_opened: CONNECTIONS_OPENED.load(Ordering::Relaxed),
        connections_closed: CONNECTIONS_CLOSED.load(Ordering::Relaxed),
        events_dispatched: EVENTS_DISPATCHED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_payloads() {
        let long = "x".repeat(1000);
        let preview = wire_trace_payload_preview(&long);
        assert!(preview.len() < long.len());
        assert!(preview.ends_with("...(truncated)"));
    }

    #[test]
    fn preview_passes_through_short_payloads() {
        assert_eq!(wire_trace_payload_preview("hi"), "hi");
    }

    #[test]
    fn counters_increment() {
        let before = gateway_counters().events_dispatched;
        ws_event_dispatched("MESSAGE_CREATE");
        assert_eq!(gateway_counters().events_dispatched, before + 1);
    }
}
