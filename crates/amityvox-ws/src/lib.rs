mod compression;
mod handler;
pub mod session;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use amityvox_core::AppState;
use serde::Deserialize;

pub fn gateway_router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

#[derive(Deserialize)]
struct GatewayQuery {
    compress: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let compress = query.compress.as_deref() == Some("zlib-stream");
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, compress))
}
