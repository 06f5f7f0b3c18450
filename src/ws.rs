use crate::events::GatewayEvent;
use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

/// Wire frame sent to websocket consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

impl From<&GatewayEvent> for WsEvent {
    fn from(event: &GatewayEvent) -> Self {
        WsEvent {
            event: event.name().to_string(),
            payload: event.payload(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsCommand {
    #[serde(rename = "connect")]
    Connect { token: Option<String> },
    #[serde(rename = "subscribe")]
    Subscribe { events: Option<Vec<String>> },
    #[serde(rename = "ping")]
    Ping,
}

pub async fn handle_ws(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<GatewayEvent>,
    auth_token: Option<String>,
) {
    let mut authorized = auth_token.is_none();
    let mut subscriptions: Option<HashSet<String>> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                if msg.is_none() {
                    break;
                }
                if let Some(Ok(Message::Close(_))) = msg {
                    break;
                }
                if let Some(Ok(Message::Text(text))) = msg {
                    if let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) {
                        match cmd {
                            WsCommand::Connect { token } => {
                                if let Some(expected) = auth_token.as_ref() {
                                    if token.as_deref() != Some(expected.as_str()) {
                                        let _ = socket.send(Message::Close(None)).await;
                                        break;
                                    }
                                }
                                authorized = true;
                                let ack = WsEvent {
                                    event: "presence".to_string(),
                                    payload: serde_json::json!({"status": "connected"}),
                                };
                                let _ = socket.send(Message::Text(serde_json::to_string(&ack).unwrap_or_default())).await;
                            }
                            WsCommand::Subscribe { events } => {
                                subscriptions = events.map(|items| items.into_iter().collect());
                            }
                            WsCommand::Ping => {
                                let health = WsEvent {
                                    event: "health".to_string(),
                                    payload: serde_json::json!({"status": "ok"}),
                                };
                                let _ = socket.send(Message::Text(serde_json::to_string(&health).unwrap_or_default())).await;
                            }
                        }
                    }
                }
            }
            evt = rx.recv() => {
                if let Ok(evt) = evt {
                    if !authorized {
                        continue;
                    }
                    let frame = WsEvent::from(&evt);
                    if let Some(subs) = subscriptions.as_ref() {
                        if !subs.contains(&frame.event) {
                            continue;
                        }
                    }
                    let text = serde_json::to_string(&frame).unwrap_or_default();
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
