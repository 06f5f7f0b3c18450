use crate::config::AuthConfig;
use crate::crypto::{decode_encoding_aes_key, decrypt_envelope, verify_signature};
use crate::error::GatewayError;
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Event name the vendor pushes when new customer-service traffic is waiting
/// to be pulled.
pub const SYNC_EVENT: &str = "kf_msg_or_event";

/// Callback credentials resolved once at startup.
#[derive(Clone)]
pub struct WebhookCredentials {
    pub token: String,
    pub aes_key: Vec<u8>,
    pub corp_id: String,
    /// Configured service-account id; pushes declaring a different `OpenKfId`
    /// are rejected. `None` when the account is configured by name only.
    pub kf_open_id: Option<String>,
}

impl WebhookCredentials {
    pub fn from_auth(auth: &AuthConfig) -> Result<Self, GatewayError> {
        auth.validate()?;
        let token = auth.token.clone().unwrap_or_default();
        let corp_id = auth.corp_id.clone().unwrap_or_default();
        let aes_key = decode_encoding_aes_key(auth.encoding_aes_key.as_deref().unwrap_or_default())?;
        let kf_open_id = auth
            .kf_open_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Ok(Self {
            token,
            aes_key,
            corp_id,
            kf_open_id,
        })
    }
}

/// Query parameters the vendor attaches to both verification and push calls.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub msg_signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub echostr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    /// New traffic is waiting; the pull token seeds the first sync page.
    SyncTrigger {
        pull_token: Option<String>,
        open_kf_id: Option<String>,
    },
    Other {
        event: String,
    },
}

fn check_receiver(creds: &WebhookCredentials, receiver_id: &str) -> Result<(), GatewayError> {
    // The trailing id can legitimately be empty on some vendor pushes; a
    // present mismatching id is rejected.
    if !receiver_id.is_empty() && !receiver_id.eq_ignore_ascii_case(creds.corp_id.trim()) {
        return Err(GatewayError::Auth(format!(
            "callback receiver mismatch: {receiver_id}"
        )));
    }
    Ok(())
}

/// GET verification handshake: prove the signature covers the echo blob, then
/// answer with its decrypted body.
pub fn verify_challenge(
    creds: &WebhookCredentials,
    query: &CallbackQuery,
) -> Result<String, GatewayError> {
    let echostr = query
        .echostr
        .as_deref()
        .ok_or_else(|| GatewayError::Param("echostr is missing".to_string()))?;

    if !verify_signature(
        &creds.token,
        &query.timestamp,
        &query.nonce,
        echostr,
        &query.msg_signature,
    ) {
        return Err(GatewayError::Auth("challenge signature mismatch".to_string()));
    }

    let envelope = decrypt_envelope(&creds.aes_key, echostr)?;
    check_receiver(creds, &envelope.receiver_id)?;
    Ok(envelope.message)
}

pub fn parse_xml_fields(xml: &str) -> Result<HashMap<String, String>, GatewayError> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut current_tag: Option<String> = None;
    let mut output = HashMap::new();

    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(event)) => {
                current_tag =
                    Some(String::from_utf8_lossy(event.local_name().as_ref()).to_string());
            }
            Ok(Event::Text(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = event
                        .unescape()
                        .map_err(|_| {
                            GatewayError::MessageParse("callback xml text decode failed".to_string())
                        })?
                        .trim()
                        .to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            }
            Ok(Event::CData(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = String::from_utf8_lossy(event.as_ref()).trim().to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            }
            Ok(Event::End(_)) => {
                current_tag = None;
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(GatewayError::MessageParse(format!(
                    "callback xml parse failed: {err}"
                )))
            }
            _ => {}
        }
        buffer.clear();
    }
    Ok(output)
}

/// POST push: authenticate over the encrypted blob, decrypt, and classify the
/// inner event.
pub fn handle_push(
    creds: &WebhookCredentials,
    query: &CallbackQuery,
    body_xml: &str,
) -> Result<WebhookEvent, GatewayError> {
    let outer = parse_xml_fields(body_xml)?;
    let encrypted = outer
        .get("Encrypt")
        .map(String::as_str)
        .ok_or_else(|| GatewayError::MessageParse("callback has no Encrypt field".to_string()))?;

    if !verify_signature(
        &creds.token,
        &query.timestamp,
        &query.nonce,
        encrypted,
        &query.msg_signature,
    ) {
        return Err(GatewayError::Auth("push signature mismatch".to_string()));
    }

    let envelope = decrypt_envelope(&creds.aes_key, encrypted)?;
    check_receiver(creds, &envelope.receiver_id)?;

    let inner = parse_xml_fields(&envelope.message)?;
    if let Some(to_user) = inner.get("ToUserName") {
        check_receiver(creds, to_user)?;
    }
    if let (Some(expected), Some(declared)) = (creds.kf_open_id.as_deref(), inner.get("OpenKfId"))
    {
        if !declared.eq_ignore_ascii_case(expected) {
            return Err(GatewayError::Auth(format!(
                "callback service account mismatch: {declared}"
            )));
        }
    }

    let event = inner.get("Event").cloned().unwrap_or_default();
    debug!(event, "decrypted a callback push");
    if event.eq_ignore_ascii_case(SYNC_EVENT) {
        Ok(WebhookEvent::SyncTrigger {
            pull_token: inner.get("Token").cloned(),
            open_kf_id: inner.get("OpenKfId").cloned(),
        })
    } else {
        Ok(WebhookEvent::Other { event })
    }
}
