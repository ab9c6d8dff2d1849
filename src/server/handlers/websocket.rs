// src/server/handlers/websocket.rs

//! `/websocket` - migration channel attach point.
//!
//! Each migration channel arrives as its own websocket; the first frame
//! carries the channel secret, which routes the socket to the session
//! waiting on it. Unknown secrets close the socket unauthorised without
//! leaking whether a session exists.

use crate::migration::Channel;
use crate::server::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State as AxState;
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, warn};

/// GET `/websocket` (upgrade)
pub async fn websocket_get(
    AxState(state): AxState<Arc<State>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<State>, mut socket: WebSocket) {
    // First frame: the channel secret.
    let secret = match socket.recv().await {
        Some(Ok(Message::Text(secret))) => secret,
        Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
        _ => {
            debug!("Websocket closed before presenting a secret");
            return;
        }
    };

    let Some(waiter) = state.channels.claim(&secret) else {
        warn!("Rejecting websocket with invalid channel secret");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    debug!("Handing websocket to migration channel");
    if waiter.send(Channel::Server(socket)).is_err() {
        debug!("Migration session is gone, dropping websocket");
    }
}
