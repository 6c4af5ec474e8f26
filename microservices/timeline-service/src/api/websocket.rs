//! WebSocket handler for live timeline updates

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tempo_core::EntityType;

use crate::fanout::{LiveEvent, SubscriptionFilter};
use crate::service::TimelineService;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<TimelineService>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

/// Client-to-server WebSocket messages
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replaces the current subscription filter. An empty filter matches
    /// every update.
    Subscribe {
        entity_type: Option<String>,
        entity_id: Option<String>,
    },
    Unsubscribe,
    Ping,
}

/// Server-to-client WebSocket messages
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Subscribed {
        entity_type: Option<String>,
        entity_id: Option<String>,
    },
    Unsubscribed,
    Pong,
    Error {
        code: String,
        message: String,
    },
}

async fn handle_socket(socket: WebSocket, service: Arc<TimelineService>) {
    let (mut sender, mut receiver) = socket.split();
    let mut stream = service.fanout().subscribe(SubscriptionFilter::default());
    let mut subscribed = false;

    loop {
        tokio::select! {
            event = stream.recv(), if subscribed => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(_) => continue,
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
                if matches!(event, LiveEvent::ResyncRequired { .. }) {
                    debug!("Live subscriber lagged; resync signalled");
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { entity_type, entity_id }) => {
                                let filter = SubscriptionFilter {
                                    entity_type: entity_type.as_deref().map(EntityType::parse),
                                    entity_id: entity_id.clone(),
                                };
                                // Fresh receiver: updates published before the
                                // subscribe are not replayed.
                                stream = service.fanout().subscribe(filter);
                                subscribed = true;
                                WsMessage::Subscribed { entity_type, entity_id }
                            }
                            Ok(ClientMessage::Unsubscribe) => {
                                subscribed = false;
                                WsMessage::Unsubscribed
                            }
                            Ok(ClientMessage::Ping) => WsMessage::Pong,
                            Err(e) => WsMessage::Error {
                                code: "BAD_MESSAGE".to_string(),
                                message: e.to_string(),
                            },
                        };
                        if let Ok(json) = serde_json::to_string(&reply) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    debug!("Live subscriber disconnected");
}
