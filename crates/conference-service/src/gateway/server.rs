//! WebSocket transport for signaling.
//!
//! Each socket gets a reader loop (this task) and a writer task fed by a
//! bounded outbound queue. Requests are handled one at a time in arrival
//! order; when the socket closes or the connection is superseded, queued
//! requests are discarded and the graceful-disconnect cleanup runs.

use super::hub::ConnectionHub;
use super::protocol::ServerMessage;
use super::session::SignalingSession;
use crate::room::RoomService;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::types::ConnectionId;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Shared state of the signaling endpoint.
#[derive(Clone)]
pub struct GatewayState {
    pub room: Arc<RoomService>,
    pub hub: Arc<ConnectionHub>,
    /// Per-connection outbound queue capacity.
    pub outbound_queue_size: usize,
}

/// Router serving the signaling socket at `GET /ws`.
pub fn signaling_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

#[instrument(skip_all, name = "cs.gateway.connection")]
async fn serve_connection(socket: WebSocket, state: GatewayState) {
    let connection_id = ConnectionId::new();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(state.outbound_queue_size.max(1));
    let cancel_token = CancellationToken::new();
    state
        .hub
        .register(connection_id, out_tx.clone(), cancel_token.clone());
    info!(
        target: "cs.gateway",
        connection_id = %connection_id,
        "Signaling connection attached"
    );

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, ServerMessage::Closing { .. });
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "cs.gateway", error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut session = SignalingSession::new(connection_id, Arc::clone(&state.room));
    loop {
        // Cancellation wins over a frame that is already buffered
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => {
                debug!(
                    target: "cs.gateway",
                    connection_id = %connection_id,
                    "Reader cancelled"
                );
                break;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = session.handle_frame(&text).await {
                        if out_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(
                        target: "cs.gateway",
                        connection_id = %connection_id,
                        error = %e,
                        "Socket error"
                    );
                    break;
                }
            }
        }
    }

    session.disconnect().await;
    state.hub.unregister(connection_id);
    drop(out_tx);
    let _ = writer.await;

    info!(
        target: "cs.gateway",
        connection_id = %connection_id,
        state = ?session.state(),
        "Signaling connection detached"
    );
}
