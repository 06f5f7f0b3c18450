use crate::messages::NormalizedMessage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

/// Consumer-facing event stream. `Login` fires once the service account is
/// resolved, `Ready` once the catch-up sync pass has drained, and `Message`
/// once per de-duplicated message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum GatewayEvent {
    Login { account_id: String, account_name: String },
    Ready,
    Message { message: NormalizedMessage },
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::Login { .. } => "login",
            GatewayEvent::Ready => "ready",
            GatewayEvent::Message { .. } => "message",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            GatewayEvent::Login {
                account_id,
                account_name,
            } => json!({"account_id": account_id, "account_name": account_name}),
            GatewayEvent::Ready => json!({}),
            GatewayEvent::Message { message } => {
                serde_json::to_value(message).unwrap_or_else(|_| json!({}))
            }
        }
    }
}

pub type EventSender = broadcast::Sender<GatewayEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, broadcast::Receiver<GatewayEvent>) {
    broadcast::channel(capacity)
}
