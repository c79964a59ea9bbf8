// =============================================================================
// Downstream server — snapshot push over websocket
// =============================================================================
//
// Any client that connects receives one full snapshot immediately and
// another after every debounced state change. There is no client protocol:
// inbound frames are read and discarded until the peer goes away. A small
// JSON health route sits next to the websocket route.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::types::now_ms;

// =============================================================================
// Router construction
// =============================================================================

/// Build the downstream router: the websocket feed at `/` plus `/health`.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    quote: String,
    entries: usize,
    clients: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        quote: state.settings.quote_coin.clone(),
        entries: state.store.entry_count(),
        clients: state.registry.len(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: now_ms(),
    })
}

// =============================================================================
// Websocket feed
// =============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// One connection lifecycle: register, push the join snapshot, then drain
/// inbound frames until close. The broadcaster owns all later sends.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (sink, mut receiver) = socket.split();
    let handle = state.registry.register(sink);
    info!(
        client_id = handle.id,
        clients = state.registry.len(),
        "downstream client connected"
    );

    // Immediate snapshot on join.
    state.store.recompute_overview();
    let snapshot = state.store.build_snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            if let Err(e) = handle.send_text(json).await {
                warn!(client_id = handle.id, error = %e, "failed to send join snapshot");
                state.registry.remove(handle.id);
                return;
            }
        }
        // Serialisation errors are not network errors; keep the client.
        Err(e) => warn!(error = %e, "failed to serialize join snapshot"),
    }

    // No client protocol: discard everything until the peer goes away.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // The broadcaster may have already dropped this client on a send failure.
    if state.registry.remove(handle.id).is_some() {
        info!(
            client_id = handle.id,
            clients = state.registry.len(),
            "downstream client disconnected"
        );
    }
}
