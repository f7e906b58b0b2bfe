use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::Value;
use tracing::{info, warn};

use crate::broadcaster::Broadcaster;

/// Deadline for a single write to a subscriber's socket (spec.md §5's
/// 100ms subscriber-write budget). A write that doesn't clear this in
/// time marks the subscriber slow, same eviction path as a full buffer.
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Upgrades to a WebSocket and hands the connection off to the shared
/// `Broadcaster`. Subscription lifecycle (buffer, eviction on lag) lives
/// entirely in `broadcaster.rs`; this module is just the axum/tungstenite
/// transport glue around it.
pub async fn ws_handler(ws: WebSocketUpgrade, State(broadcaster): State<Arc<Broadcaster>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

async fn handle_socket(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let (subscriber_id, mut rx) = broadcaster.subscribe();
    info!("websocket subscriber {subscriber_id} connected");

    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let Ok(json) = serde_json::to_string(envelope.as_ref()) else {
                continue;
            };
            match tokio::time::timeout(SUBSCRIBER_WRITE_TIMEOUT, sender.send(Message::Text(json))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!("websocket subscriber {subscriber_id} write exceeded {SUBSCRIBER_WRITE_TIMEOUT:?}, evicting");
                    break;
                }
            }
        }
    });

    // Client frames never mutate scoreboard state; any inbound `userId`
    // is logged for correlation only. Malformed JSON gets an `error`
    // envelope written straight back on this connection rather than
    // dropping it — spec.md §6: "malformed frames ... do not drop the
    // connection."
    let recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    handle_client_frame(subscriber_id, &text, &broadcaster);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("websocket subscriber {subscriber_id} error: {e}");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    broadcaster.unsubscribe(subscriber_id);
    info!("websocket subscriber {subscriber_id} disconnected");
}

fn handle_client_frame(subscriber_id: uuid::Uuid, text: &str, broadcaster: &Broadcaster) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            if let Some(user_id) = value.get("userId").and_then(Value::as_str) {
                info!(%subscriber_id, %user_id, "websocket client frame");
            }
        }
        Err(e) => {
            warn!("websocket subscriber {subscriber_id} sent malformed frame: {e}");
            broadcaster.send_error(subscriber_id, "malformed frame", Utc::now().to_rfc3339());
        }
    }
}
