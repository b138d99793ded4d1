use axum::http::{header, HeaderMap};
use amityvox_core::AppState;
use serde_json::Value;

fn header_str<'a>(headers: &'a HeaderMap, name: axum::http::HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Record a best-effort entry in the security audit trail. Failures are
/// logged and swallowed: a broken audit log must never block the action it
/// is describing.
pub async fn log_security_event(
    state: &AppState,
    action: &str,
    actor_user_id: Option<i64>,
    target_user_id: Option<i64>,
    session_id: Option<&str>,
    headers: Option<&HeaderMap>,
    details: Option<Value>,
) {
    let device_id = headers.and_then(|h| header_str(h, axum::http::HeaderName::from_static("x-device-id")));
    let user_agent = headers.and_then(|h| header_str(h, header::USER_AGENT));
    let ip_address = headers.and_then(client_ip);

    if let Err(err) = amityvox_db::security_events::log_event(
        &state.db,
        actor_user_id,
        action,
        target_user_id,
        session_id,
        device_id,
        user_agent,
        ip_address.as_deref(),
        details.as_ref(),
    )
    .await
    {
        tracing::warn!("failed to record security event {}: {}", action, err);
    }
}
