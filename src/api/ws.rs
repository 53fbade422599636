// =============================================================================
// WebSocket feed — read-only engine status push for dashboards
// =============================================================================
//
// Market data itself fans out over Redis pub/sub; this socket carries the
// same health snapshot as `GET /api/v1/health`, pushed once a second, so a
// dashboard can watch pool fill, breaker states, and counters without
// polling.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use tracing::debug;

use crate::app_state::AppState;

const PUSH_INTERVAL: Duration = Duration::from_secs(1);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| feed(socket, state))
}

async fn feed(mut socket: WebSocket, state: Arc<AppState>) {
    debug!("status feed client connected");
    let mut interval = tokio::time::interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snapshot = state.health_snapshot();
                let payload = match serde_json::to_string(&snapshot) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(error = %e, "snapshot serialization failed");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // feed is one-way; client messages ignored
                Some(Err(e)) => {
                    debug!(error = %e, "status feed read error");
                    break;
                }
            },
        }
    }

    debug!("status feed client disconnected");
}
