use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::broadcast::{HubEvent, SubscriberId};
use crate::SharedState;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Client-to-server messages, `{"event": name, "data": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum ClientMessage {
    JoinSession { session_id: String },
    LeaveSession { session_id: String },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observe(socket, state))
}

fn frame(event: &str, data: Value) -> Message {
    Message::Text(json!({ "event": event, "data": data }).to_string())
}

async fn observe(mut socket: WebSocket, state: SharedState) {
    let buffer = state.settings.engine().subscriber_buffer.max(1);
    let (event_tx, mut event_rx) = mpsc::channel::<HubEvent>(buffer);
    let mut joined: HashMap<String, SubscriberId> = HashMap::new();

    if socket
        .send(frame("connection_response", json!({ "status": "connected" })))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        log_debug!("websocket receive failed: {err}");
                        break;
                    }
                };

                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::JoinSession { session_id }) => {
                        if !joined.contains_key(&session_id) {
                            let id = state.hub.subscribe(&session_id, event_tx.clone());
                            joined.insert(session_id.clone(), id);
                        }
                        frame("joined_session", json!({ "session_id": session_id }))
                    }
                    Ok(ClientMessage::LeaveSession { session_id }) => {
                        if let Some(id) = joined.remove(&session_id) {
                            state.hub.unsubscribe(&session_id, id);
                        }
                        frame("left_session", json!({ "session_id": session_id }))
                    }
                    Err(err) => frame("error", json!({ "message": format!("unrecognized message: {err}") })),
                };
                if socket.send(reply).await.is_err() {
                    break;
                }
            }
            Some(event) = event_rx.recv() => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        log_warn!("failed to encode {} event: {err}", event.name());
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
        }
    }

    for (session_id, id) in joined {
        state.hub.unsubscribe(&session_id, id);
    }
}
