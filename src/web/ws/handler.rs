//! Chat WebSocket handler.
//!
//! One socket maps to one dispatcher session. Outbound events flow through
//! the session's unbounded channel; the socket task serializes them onto the
//! wire and feeds parsed inbound events to the dispatcher.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chat::{ClientEvent, Dispatcher, ServerEvent};

/// WebSocket chat handler.
///
/// GET /ws
pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, dispatcher))
}

/// Handle a WebSocket connection until it closes.
async fn handle_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let session_id = dispatcher.connect(event_tx).await;
    tracing::debug!("WebSocket session started: {}", session_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    loop {
        tokio::select! {
            // Inbound frames from the client
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                dispatcher.handle_event(&session_id, event).await;
                            }
                            Err(e) => {
                                tracing::debug!("Failed to parse client event: {}", e);
                                let rejection =
                                    ServerEvent::rejected("invalid_event", "Invalid event format");
                                if let Ok(json) = serde_json::to_string(&rejection) {
                                    let _ = ws_sender.send(Message::Text(json.into())).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("WebSocket closed by client: {}", session_id);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        break;
                    }
                }
            }

            // Outbound events from the dispatcher
            event = event_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to serialize server event: {}", e);
                    }
                }
            }
        }
    }

    dispatcher.disconnect(&session_id).await;
    tracing::debug!("WebSocket session ended: {}", session_id);
}
