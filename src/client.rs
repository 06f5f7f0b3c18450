use crate::contacts::RawCustomer;
use crate::error::GatewayError;
use crate::messages::{LocationPayload, MediaRef, MiniProgramPayload, RawMessage, TextPayload};
use bytes::Bytes;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const ACCOUNT_PAGE_SIZE: i64 = 100;

/// Media category the vendor distinguishes on upload, each with its own size
/// cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Voice,
    Video,
    File,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Voice => "voice",
            FileKind::Video => "video",
            FileKind::File => "file",
        }
    }

    pub fn max_bytes(self) -> usize {
        match self {
            FileKind::Image => 10 * 1024 * 1024,
            FileKind::Voice => 2 * 1024 * 1024,
            FileKind::Video => 10 * 1024 * 1024,
            FileKind::File => 20 * 1024 * 1024,
        }
    }
}

/// Classifies an upload by file extension; anything unrecognized goes up as a
/// generic file.
pub fn classify_file(filename: &str) -> FileKind {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "bmp" => FileKind::Image,
        "amr" => FileKind::Voice,
        "mp4" => FileKind::Video,
        _ => FileKind::File,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Short-lived pull token from a webhook push; only valid on the first
    /// page of a sync pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub open_kfid: String,
    pub voice_format: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub next_cursor: String,
    #[serde(default)]
    pub has_more: i64,
    #[serde(default)]
    pub msg_list: Vec<RawMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendLinkPayload {
    pub title: String,
    pub desc: String,
    pub url: String,
    pub thumb_media_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "msgtype", rename_all = "snake_case")]
pub enum SendPayload {
    Text { text: TextPayload },
    Image { image: MediaRef },
    Voice { voice: MediaRef },
    Video { video: MediaRef },
    File { file: MediaRef },
    Location { location: LocationPayload },
    Link { link: SendLinkPayload },
    Miniprogram { miniprogram: MiniProgramPayload },
}

#[derive(Debug, Clone, Serialize)]
pub struct SendRequest {
    pub touser: String,
    pub open_kfid: String,
    #[serde(flatten)]
    pub payload: SendPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendResponse {
    pub msgid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KfAccount {
    pub open_kfid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    /// Whether the credentials may manage and send through this account; the
    /// vendor omits the field when the privilege is absent.
    #[serde(default)]
    pub manage_privilege: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountListResponse {
    #[serde(default)]
    pub account_list: Vec<KfAccount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerBatchResponse {
    #[serde(default)]
    pub customer_list: Vec<RawCustomer>,
    #[serde(default)]
    pub invalid_external_userid: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub media_id: String,
}

#[derive(Debug, Clone)]
pub struct MediaDownload {
    pub bytes: Bytes,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Every JSON response carries an `errcode`/`errmsg` pair; nonzero codes are
/// surfaced as [`GatewayError::Server`] with the known-code table applied.
fn check_errcode(value: &Value) -> Result<(), GatewayError> {
    let code = value.get("errcode").and_then(|v| v.as_i64()).unwrap_or(0);
    if code != 0 {
        let message = value
            .get("errmsg")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown vendor error");
        return Err(GatewayError::server(code, message));
    }
    Ok(())
}

fn parse_body<T: DeserializeOwned>(value: Value) -> Result<T, GatewayError> {
    check_errcode(&value)?;
    serde_json::from_value(value)
        .map_err(|err| GatewayError::MessageParse(format!("vendor response shape mismatch: {err}")))
}

/// Filename from a `Content-Disposition: attachment; filename="..."` header.
fn filename_from_disposition(disposition: &str) -> Option<String> {
    let marker = "filename=";
    let idx = disposition.find(marker)?;
    let raw = disposition[idx + marker.len()..].trim();
    let raw = raw.split(';').next().unwrap_or(raw).trim();
    let cleaned = raw.trim_matches('"').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[derive(Clone)]
pub struct VendorClient {
    http: Client,
    base_url: String,
}

impl VendorClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, GatewayError> {
        let resp = self.http.get(self.url(path)).query(query).send().await?;
        let value: Value = resp.json().await?;
        parse_body(value)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        access_token: &str,
        body: &impl Serialize,
    ) -> Result<T, GatewayError> {
        let resp = self
            .http
            .post(self.url(path))
            .query(&[("access_token", access_token)])
            .json(body)
            .send()
            .await?;
        let value: Value = resp.json().await?;
        parse_body(value)
    }

    pub async fn get_access_token(
        &self,
        corp_id: &str,
        corp_secret: &str,
    ) -> Result<TokenResponse, GatewayError> {
        debug!("requesting a fresh access token");
        self.get_json(
            "/gettoken",
            &[("corpid", corp_id), ("corpsecret", corp_secret)],
        )
        .await
    }

    pub async fn sync_messages(
        &self,
        access_token: &str,
        request: &SyncRequest,
    ) -> Result<SyncResponse, GatewayError> {
        self.post_json("/kf/sync_msg", access_token, request).await
    }

    pub async fn send_message(
        &self,
        access_token: &str,
        request: &SendRequest,
    ) -> Result<SendResponse, GatewayError> {
        self.post_json("/kf/send_msg", access_token, request).await
    }

    pub async fn list_accounts(
        &self,
        access_token: &str,
        offset: i64,
    ) -> Result<AccountListResponse, GatewayError> {
        self.post_json(
            "/kf/account/list",
            access_token,
            &serde_json::json!({ "offset": offset, "limit": ACCOUNT_PAGE_SIZE }),
        )
        .await
    }

    pub async fn batch_get_customers(
        &self,
        access_token: &str,
        external_userids: &[String],
    ) -> Result<CustomerBatchResponse, GatewayError> {
        self.post_json(
            "/kf/customer/batchget",
            access_token,
            &serde_json::json!({ "external_userid_list": external_userids }),
        )
        .await
    }

    pub async fn upload_media(
        &self,
        access_token: &str,
        kind: FileKind,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<UploadResponse, GatewayError> {
        if data.len() > kind.max_bytes() {
            return Err(GatewayError::Param(format!(
                "file too large for {} upload: {} bytes, limit {}",
                kind.as_str(),
                data.len(),
                kind.max_bytes()
            )));
        }
        let part = reqwest::multipart::Part::bytes(data).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("media", part);
        let resp = self
            .http
            .post(self.url("/media/upload"))
            .query(&[("access_token", access_token), ("type", kind.as_str())])
            .multipart(form)
            .send()
            .await?;
        let value: Value = resp.json().await?;
        parse_body(value)
    }

    /// Fetches media bytes. The endpoint answers with JSON only on failure, so
    /// the content type decides how the body is read.
    pub async fn download_media(
        &self,
        access_token: &str,
        media_id: &str,
    ) -> Result<MediaDownload, GatewayError> {
        let resp = self
            .http
            .get(self.url("/media/get"))
            .query(&[("access_token", access_token), ("media_id", media_id)])
            .send()
            .await?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let filename = resp
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition);

        let is_json = content_type
            .as_deref()
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        let bytes = resp.bytes().await?;

        if is_json {
            if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                check_errcode(&value)?;
            }
        }

        Ok(MediaDownload {
            bytes,
            filename,
            content_type,
        })
    }
}
