// =============================================================================
// WebSocket Handler — per-analysis progress streaming
// =============================================================================
//
// Clients connect to `/api/v1/analyses/:id/ws` and receive every progress
// event published for that analysis from the moment of subscription onward,
// as JSON frames `{type, analysis_id, timestamp, ...payload}`.
//
// Delivery follows the bus contract: per-analysis FIFO, at-least-once while
// connected, and a subscriber that falls behind the bounded backlog is
// disconnected rather than allowed to stall the publisher.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(analysis_id): Path<String>,
) -> impl IntoResponse {
    info!(analysis_id = %analysis_id, "progress subscription accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, analysis_id))
}

/// Manages a single subscriber connection.
///
/// Runs a `tokio::select!` between the bus receiver and the client side:
/// bus events are forwarded as text frames, Pings are answered, and a close
/// from either side tears the connection down.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, analysis_id: String) {
    let mut events = state.bus.subscribe(&analysis_id);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        match serde_json::to_string(&event) {
                            Ok(frame) => {
                                if let Err(e) = sender.send(Message::Text(frame)).await {
                                    debug!(analysis_id = %analysis_id, error = %e, "WebSocket send failed — disconnecting");
                                    break;
                                }
                            }
                            Err(e) => {
                                // Serialisation errors are not network errors;
                                // skip the frame and keep the stream alive.
                                warn!(analysis_id = %analysis_id, error = %e, "failed to serialize progress event");
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(
                            analysis_id = %analysis_id,
                            missed,
                            "subscriber exceeded backlog — dropping connection"
                        );
                        let _ = sender
                            .send(Message::Close(None))
                            .await;
                        break;
                    }
                    Err(RecvError::Closed) => {
                        debug!(analysis_id = %analysis_id, "progress channel closed — disconnecting");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(analysis_id = %analysis_id, "subscriber disconnected");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/binary/pong from clients carry no meaning here.
                    }
                    Some(Err(e)) => {
                        debug!(analysis_id = %analysis_id, error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }
}
