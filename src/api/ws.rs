//! WebSocket terminal streaming.
//!
//! `GET /ws?sessionId=<id>[&token=<t>]`. On connect the client receives the
//! buffered tail as one output message, then live chunks as they arrive.
//! Reconnecting clients get the current tail, not a replay from a cursor.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;

use super::http::AppState;
use crate::api::protocol::{ClientMessage, ServerMessage};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Upgrade handler for `/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Browsers cannot set headers on WebSocket connects; the token rides the
    // query string instead.
    if let Some(expected) = &state.config.token {
        if query.token.as_deref() != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, query.session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: AppState) {
    tracing::info!(%session_id, "Terminal WebSocket connected");

    let Some(handle) = state.manager.live_handle(&session_id) else {
        tracing::warn!(%session_id, "WebSocket for unknown session");
        return;
    };

    // Snapshot and subscribe under one lock so no chunk lands between them.
    let (snapshot, mut events) = {
        let session = handle.state.lock();
        (session.buffer_text(), handle.subscribe())
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    if !snapshot.is_empty() {
        let message = ServerMessage::Output { data: snapshot };
        if let Ok(payload) = serde_json::to_string(&message) {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(payload) => {
                        if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(dropped)) => {
                        tracing::warn!(
                            %session_id,
                            dropped_messages = dropped,
                            "Subscriber lagged, output dropped"
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            ws_msg = ws_receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        let message: ClientMessage = match serde_json::from_str(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                tracing::debug!(%session_id, error = %e, "Invalid WebSocket message");
                                continue;
                            }
                        };

                        match message {
                            ClientMessage::Input { data } => {
                                if let Err(e) = state.manager.write_input(&session_id, &data).await {
                                    tracing::debug!(%session_id, error = %e, "Input write failed");
                                }
                            }
                            ClientMessage::Resize { cols, rows } => {
                                state.manager.resize(&session_id, cols, rows).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%session_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(%session_id, "Terminal WebSocket disconnected");
}
