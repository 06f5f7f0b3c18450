use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where a message came from, as encoded by the vendor.
/// 3 = the external customer, 4 = a system event, 5 = an agent replying from
/// the service-account console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum MessageOrigin {
    Customer,
    SystemEvent,
    AgentConsole,
    Other(i64),
}

impl From<i64> for MessageOrigin {
    fn from(code: i64) -> Self {
        match code {
            3 => MessageOrigin::Customer,
            4 => MessageOrigin::SystemEvent,
            5 => MessageOrigin::AgentConsole,
            other => MessageOrigin::Other(other),
        }
    }
}

impl From<MessageOrigin> for i64 {
    fn from(origin: MessageOrigin) -> i64 {
        match origin {
            MessageOrigin::Customer => 3,
            MessageOrigin::SystemEvent => 4,
            MessageOrigin::AgentConsole => 5,
            MessageOrigin::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub media_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkPayload {
    pub title: String,
    #[serde(default)]
    pub desc: String,
    pub url: String,
    #[serde(default)]
    pub pic_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessCardPayload {
    pub userid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniProgramPayload {
    pub appid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pagepath: String,
    #[serde(default)]
    pub thumb_media_id: String,
}

/// Type-tagged vendor payload. Kinds the gateway does not understand map to an
/// explicit `Unsupported` variant instead of being dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msgtype", rename_all = "snake_case")]
pub enum RawPayload {
    Text { text: TextPayload },
    Image { image: MediaRef },
    Voice { voice: MediaRef },
    Video { video: MediaRef },
    File { file: MediaRef },
    Location { location: LocationPayload },
    Link { link: LinkPayload },
    BusinessCard { business_card: BusinessCardPayload },
    Miniprogram { miniprogram: MiniProgramPayload },
    #[serde(other)]
    Unsupported,
}

/// Vendor-shaped message as returned by the sync endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub msgid: String,
    #[serde(default)]
    pub open_kfid: Option<String>,
    #[serde(default)]
    pub external_userid: Option<String>,
    pub send_time: i64,
    pub origin: MessageOrigin,
    #[serde(default)]
    pub servicer_userid: Option<String>,
    #[serde(flatten)]
    pub payload: RawPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    Video,
    File,
    Location,
    Link,
    Contact,
    MiniProgram,
    Unsupported,
}

impl MessageKind {
    /// Kinds that carry downloadable media.
    pub fn has_media(self) -> bool {
        matches!(
            self,
            MessageKind::Image
                | MessageKind::Voice
                | MessageKind::Video
                | MessageKind::File
                | MessageKind::MiniProgram
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub title: String,
    pub description: String,
    pub url: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniProgramInfo {
    pub appid: String,
    pub title: String,
    pub page_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
    pub address: String,
    pub accuracy: f64,
}

/// Direction-resolved, de-duplicated projection of a [`RawMessage`]. Persisted
/// in the store keyed by `id`; the media fields are attached later when the
/// media is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: String,
    pub talker_id: String,
    pub listener_id: String,
    pub timestamp_ms: i64,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_oss_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mini_program: Option<MiniProgramInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
}

/// The vendor mixes second- and millisecond-precision timestamps.
pub fn timestamp_to_milliseconds(timestamp: i64) -> i64 {
    if timestamp < 100_000_000_000 {
        timestamp * 1000
    } else {
        timestamp
    }
}

/// Projects a vendor message into the normalized shape. Direction is resolved
/// from `origin`: messages the agent sent from the console swap talker and
/// listener so the external customer is always the counterpart.
pub fn normalize_message(raw: &RawMessage) -> NormalizedMessage {
    let account_id = raw.open_kfid.clone().unwrap_or_default();
    let external_id = raw.external_userid.clone().unwrap_or_default();

    let (talker_id, listener_id) = if raw.origin == MessageOrigin::AgentConsole {
        (account_id, external_id)
    } else {
        (external_id, account_id)
    };

    if raw.origin == MessageOrigin::SystemEvent {
        warn!(msgid = %raw.msgid, "got a system event message in the sync stream");
    }

    let mut normalized = NormalizedMessage {
        id: raw.msgid.clone(),
        talker_id,
        listener_id,
        timestamp_ms: timestamp_to_milliseconds(raw.send_time),
        kind: MessageKind::Unsupported,
        text: None,
        media_id: None,
        media_oss_url: None,
        filename: None,
        location: None,
        link: None,
        mini_program: None,
        contact_id: None,
    };

    match &raw.payload {
        RawPayload::Text { text } => {
            normalized.kind = MessageKind::Text;
            normalized.text = Some(text.content.clone());
        }
        RawPayload::Image { image } => {
            normalized.kind = MessageKind::Image;
            normalized.media_id = Some(image.media_id.clone());
        }
        RawPayload::Voice { voice } => {
            normalized.kind = MessageKind::Voice;
            normalized.media_id = Some(voice.media_id.clone());
        }
        RawPayload::Video { video } => {
            normalized.kind = MessageKind::Video;
            normalized.media_id = Some(video.media_id.clone());
        }
        RawPayload::File { file } => {
            normalized.kind = MessageKind::File;
            normalized.media_id = Some(file.media_id.clone());
        }
        RawPayload::Location { location } => {
            normalized.kind = MessageKind::Location;
            normalized.location = Some(LocationInfo {
                latitude: location.latitude,
                longitude: location.longitude,
                name: location.name.clone(),
                address: location.address.clone(),
                // The vendor does not report accuracy; a fixed value keeps the
                // payload shape complete for consumers.
                accuracy: 15.0,
            });
        }
        RawPayload::Link { link } => {
            normalized.kind = MessageKind::Link;
            normalized.link = Some(LinkInfo {
                title: link.title.clone(),
                description: link.desc.clone(),
                url: link.url.clone(),
                thumbnail_url: link.pic_url.clone(),
            });
        }
        RawPayload::BusinessCard { business_card } => {
            normalized.kind = MessageKind::Contact;
            normalized.contact_id = Some(business_card.userid.clone());
        }
        RawPayload::Miniprogram { miniprogram } => {
            normalized.kind = MessageKind::MiniProgram;
            normalized.mini_program = Some(MiniProgramInfo {
                appid: miniprogram.appid.clone(),
                title: miniprogram.title.clone(),
                page_path: miniprogram.pagepath.clone(),
            });
            normalized.media_id = Some(miniprogram.thumb_media_id.clone());
        }
        RawPayload::Unsupported => {
            normalized.kind = MessageKind::Unsupported;
        }
    }

    normalized
}
