use thiserror::Error;

/// Vendor error codes we translate into a friendlier message. Unknown codes
/// pass the raw vendor `errmsg` through unchanged.
pub fn known_error_reason(code: i64) -> Option<&'static str> {
    match code {
        // The vendor caps unsolicited replies per customer; more messages are
        // only allowed after the customer writes again.
        95001 => Some(
            "the send limit for this customer has been reached, wait for the customer to reply before sending again",
        ),
        _ => None,
    }
}

/// Error taxonomy of the gateway core.
///
/// Cloneable on purpose: the execution queue fans a representative task's
/// outcome out to every coalesced caller, failures included.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("auth error: {0}")]
    Auth(String),

    #[error("vendor error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("message parse error: {0}")]
    MessageParse(String),

    #[error("contact parse error: {0}")]
    ContactParse(String),

    #[error("invalid parameter: {0}")]
    Param(String),

    #[error("execution queue is full")]
    QueueFull,

    #[error("task timed out, queue id: {queue_id}")]
    Timeout { queue_id: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(String),
}

impl GatewayError {
    pub fn server(code: i64, vendor_message: &str) -> Self {
        let message = known_error_reason(code)
            .map(|reason| reason.to_string())
            .unwrap_or_else(|| vendor_message.to_string());
        GatewayError::Server { code, message }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Store(err.to_string())
    }
}
