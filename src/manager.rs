use crate::client::{
    classify_file, FileKind, KfAccount, SendLinkPayload, SendPayload, SendRequest, SyncRequest,
    VendorClient,
};
use crate::config::AuthConfig;
use crate::error::GatewayError;
use crate::events::{EventSender, GatewayEvent};
use crate::exec_queue::{ExecOptions, ExecQueue};
use crate::messages::{
    normalize_message, LocationPayload, MediaRef, MiniProgramPayload, NormalizedMessage,
    RawMessage, TextPayload,
};
use crate::oss::ObjectStorage;
use crate::store::{self, DbKind, CURSOR_PROPERTY_KEY};
use crate::token::AccessTokenManager;
use crate::webhook::WebhookEvent;
use bytes::Bytes;
use chrono::Utc;
use sqlx::AnyPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

pub const SYNC_QUEUE_ID: &str = "sync-message";

const SYNC_REQUEST_SPACING: Duration = Duration::from_millis(100);

/// Messages older than this are persisted for dedup but never emitted; the
/// vendor replays up to a week of history on a cold cursor.
const HISTORY_THRESHOLD_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct MediaArtifact {
    pub filename: String,
    pub url: Option<String>,
    pub bytes: Option<Bytes>,
    pub content_type: Option<String>,
}

/// Orchestrates login, the sync engine, and outbound sends on top of the
/// vendor client, the token manager, and the store.
#[derive(Clone)]
pub struct GatewayManager {
    auth: AuthConfig,
    client: VendorClient,
    tokens: AccessTokenManager,
    queue: ExecQueue,
    pool: AnyPool,
    db_kind: DbKind,
    events: EventSender,
    storage: Option<Arc<dyn ObjectStorage>>,
    account: Arc<Mutex<Option<KfAccount>>>,
}

impl GatewayManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: AuthConfig,
        client: VendorClient,
        tokens: AccessTokenManager,
        queue: ExecQueue,
        pool: AnyPool,
        db_kind: DbKind,
        events: EventSender,
        storage: Option<Arc<dyn ObjectStorage>>,
    ) -> Self {
        Self {
            auth,
            client,
            tokens,
            queue,
            pool,
            db_kind,
            events,
            storage,
            account: Arc::new(Mutex::new(None)),
        }
    }

    fn emit(&self, event: GatewayEvent) {
        // Nobody listening is fine; the broadcast just drops the event.
        let _ = self.events.send(event);
    }

    pub fn current_account(&self) -> Option<KfAccount> {
        self.account
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_account(&self, account: KfAccount) {
        let mut slot = self
            .account
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(account);
    }

    fn require_account(&self) -> Result<KfAccount, GatewayError> {
        self.current_account()
            .ok_or_else(|| GatewayError::Auth("service account is not resolved yet".to_string()))
    }

    /// Resolves the configured service account from the vendor's account list,
    /// matching on open id when configured and on display name otherwise.
    pub async fn get_self_info(&self) -> Result<KfAccount, GatewayError> {
        let wanted_id = self
            .auth
            .kf_open_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let wanted_name = self
            .auth
            .kf_name
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let mut offset = 0;
        loop {
            let access_token = self.tokens.access_token().await?;
            let page = self
                .client
                .list_accounts(&access_token, offset)
                .await
                .map_err(|err| match err {
                    GatewayError::Server { code, message } => GatewayError::Auth(format!(
                        "cannot list service accounts (vendor error {code}: {message}), check that the credentials carry the customer-service privilege"
                    )),
                    other => other,
                })?;
            if page.account_list.is_empty() {
                break;
            }
            let count = page.account_list.len();
            for account in page.account_list {
                let id_match = wanted_id.map(|id| account.open_kfid == id).unwrap_or(false);
                let name_match = wanted_name
                    .map(|name| account.name == name)
                    .unwrap_or(false);
                if id_match || name_match {
                    if !account.manage_privilege {
                        return Err(GatewayError::Auth(format!(
                            "the credentials lack the manage privilege for service account {}",
                            account.open_kfid
                        )));
                    }
                    return Ok(account);
                }
            }
            if (count as i64) < crate::client::ACCOUNT_PAGE_SIZE {
                break;
            }
            offset += count as i64;
        }

        Err(GatewayError::Auth(
            "cannot find the configured service account, check kf_open_id / kf_name".to_string(),
        ))
    }

    /// Brings the gateway online: resolves the account, emits `Login`, runs
    /// the catch-up sync pass, and emits `Ready`.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.auth.validate()?;

        let account = self.get_self_info().await?;
        info!(
            account_id = %account.open_kfid,
            account_name = %account.name,
            "resolved the service account"
        );
        self.set_account(account.clone());
        self.emit(GatewayEvent::Login {
            account_id: account.open_kfid,
            account_name: account.name,
        });

        self.sync_message(None).await?;
        self.emit(GatewayEvent::Ready);
        Ok(())
    }

    pub async fn handle_webhook_event(&self, event: WebhookEvent) -> Result<(), GatewayError> {
        match event {
            WebhookEvent::SyncTrigger { pull_token, .. } => self.sync_message(pull_token).await,
            WebhookEvent::Other { event } => {
                info!(event, "ignoring a callback event the gateway does not consume");
                Ok(())
            }
        }
    }

    /// Runs one sync pass through the execution queue, so overlapping webhook
    /// pushes drain one at a time.
    pub async fn sync_message(&self, pull_token: Option<String>) -> Result<(), GatewayError> {
        let manager = self.clone();
        self.queue
            .exec(
                async move { manager.sync_pass(pull_token).await },
                ExecOptions {
                    queue_id: Some(SYNC_QUEUE_ID.to_string()),
                    delay_after: Some(SYNC_REQUEST_SPACING),
                    ..Default::default()
                },
            )
            .await
    }

    async fn sync_pass(&self, pull_token: Option<String>) -> Result<(), GatewayError> {
        let account = self.require_account()?;

        let mut cursor =
            store::get_property(&self.pool, self.db_kind, CURSOR_PROPERTY_KEY).await?;
        // A pass without a pull token is a catch-up (startup) pass; everything
        // it pulls is backfill and must not reach consumers. Token-bearing
        // passes were triggered by a webhook push and always emit.
        let first_sync = pull_token.is_none();
        let mut page_token = pull_token;
        let mut handles = Vec::new();

        loop {
            let access_token = self.tokens.access_token().await?;
            let request = SyncRequest {
                cursor: cursor.clone(),
                token: page_token.take(),
                open_kfid: account.open_kfid.clone(),
                voice_format: 1,
            };
            let page = self.client.sync_messages(&access_token, &request).await?;

            if !page.msg_list.is_empty() {
                let manager = self.clone();
                let batch = page.msg_list;
                handles.push(tokio::spawn(async move {
                    manager.ingest_batch(batch, first_sync).await
                }));
            }

            if !page.next_cursor.is_empty() {
                cursor = Some(page.next_cursor);
            }
            if page.has_more == 0 {
                break;
            }
        }

        for handle in handles {
            handle
                .await
                .map_err(|_| GatewayError::Transport("page ingestion task panicked".to_string()))??;
        }

        // Only after every fetched page landed; a crash mid-pass re-pulls
        // from the old cursor and dedup absorbs the replay.
        if let Some(cursor) = cursor {
            store::set_property(&self.pool, self.db_kind, CURSOR_PROPERTY_KEY, &cursor).await?;
        }
        Ok(())
    }

    async fn ingest_batch(
        &self,
        batch: Vec<RawMessage>,
        suppress_emission: bool,
    ) -> Result<(), GatewayError> {
        let now_ms = Utc::now().timestamp_millis();
        for raw in &batch {
            if store::message_exists(&self.pool, self.db_kind, &raw.msgid).await? {
                continue;
            }
            let message = normalize_message(raw);
            // Replayed history past the threshold is skipped outright, not
            // cached.
            if now_ms - message.timestamp_ms > HISTORY_THRESHOLD_MS {
                continue;
            }
            store::upsert_message(&self.pool, self.db_kind, &message).await?;
            if suppress_emission {
                continue;
            }
            self.emit(GatewayEvent::Message { message });
        }
        Ok(())
    }

    pub async fn message_payload(
        &self,
        message_id: &str,
    ) -> Result<NormalizedMessage, GatewayError> {
        store::get_message(&self.pool, self.db_kind, message_id)
            .await?
            .ok_or_else(|| GatewayError::Param(format!("unknown message id: {message_id}")))
    }

    /// Resolves the media behind a message: an already-archived URL wins,
    /// otherwise the bytes are fetched and, when storage is configured,
    /// archived so the next call is a URL hit.
    pub async fn message_file(&self, message_id: &str) -> Result<MediaArtifact, GatewayError> {
        let mut message = self.message_payload(message_id).await?;
        if !message.kind.has_media() {
            return Err(GatewayError::Param(format!(
                "message {message_id} carries no media"
            )));
        }
        if let Some(url) = message.media_oss_url.clone() {
            return Ok(MediaArtifact {
                filename: message.filename.clone().unwrap_or_default(),
                url: Some(url),
                bytes: None,
                content_type: None,
            });
        }

        // The vendor invalidates media ids after three days; past that only an
        // already-archived URL can serve the file.
        let age_ms = Utc::now().timestamp_millis() - message.timestamp_ms;
        if age_ms > store::MEDIA_EXPIRE_SECONDS * 1000 {
            return Err(GatewayError::MessageParse(format!(
                "cannot fetch media for message {message_id}, the file has expired"
            )));
        }

        let media_id = message
            .media_id
            .clone()
            .ok_or_else(|| GatewayError::Param(format!("message {message_id} has no media id")))?;
        let access_token = self.tokens.access_token().await?;
        let download = self.client.download_media(&access_token, &media_id).await?;
        let filename = download
            .filename
            .clone()
            .or_else(|| message.filename.clone())
            .unwrap_or_else(|| message_id.to_string());

        if let Some(storage) = self.storage.as_ref() {
            let key = format!("media/{message_id}/{filename}");
            match storage
                .put_object(&key, download.bytes.clone(), download.content_type.as_deref())
                .await
            {
                Ok(url) => {
                    message.media_oss_url = Some(url.clone());
                    message.filename = Some(filename.clone());
                    store::upsert_message(&self.pool, self.db_kind, &message).await?;
                    return Ok(MediaArtifact {
                        filename,
                        url: Some(url),
                        bytes: Some(download.bytes),
                        content_type: download.content_type,
                    });
                }
                Err(err) => {
                    warn!("archiving media for message {message_id} failed: {err}");
                }
            }
        }

        Ok(MediaArtifact {
            filename,
            url: None,
            bytes: Some(download.bytes),
            content_type: download.content_type,
        })
    }

    pub async fn contact_payload(
        &self,
        contact_id: &str,
    ) -> Result<crate::contacts::Contact, GatewayError> {
        if let Some(contact) = store::get_contact(&self.pool, self.db_kind, contact_id).await? {
            return Ok(contact);
        }

        let access_token = self.tokens.access_token().await?;
        let response = self
            .client
            .batch_get_customers(&access_token, &[contact_id.to_string()])
            .await?;
        let raw = response
            .customer_list
            .first()
            .ok_or_else(|| GatewayError::ContactParse(format!("unknown contact: {contact_id}")))?;
        let contact = crate::contacts::normalize_contact(raw);
        store::upsert_contact(&self.pool, self.db_kind, &contact).await?;
        Ok(contact)
    }

    async fn dispatch(&self, to_user: &str, payload: SendPayload) -> Result<String, GatewayError> {
        let account = self.require_account()?;
        let access_token = self.tokens.access_token().await?;
        let request = SendRequest {
            touser: to_user.to_string(),
            open_kfid: account.open_kfid,
            payload,
        };
        let response = self.client.send_message(&access_token, &request).await?;
        Ok(response.msgid)
    }

    pub async fn send_text(&self, to_user: &str, content: &str) -> Result<String, GatewayError> {
        self.dispatch(
            to_user,
            SendPayload::Text {
                text: TextPayload {
                    content: content.to_string(),
                    menu_id: None,
                },
            },
        )
        .await
    }

    pub async fn send_location(
        &self,
        to_user: &str,
        location: LocationPayload,
    ) -> Result<String, GatewayError> {
        self.dispatch(to_user, SendPayload::Location { location }).await
    }

    pub async fn send_link(
        &self,
        to_user: &str,
        title: &str,
        description: &str,
        url: &str,
        thumbnail: Option<(String, Vec<u8>)>,
    ) -> Result<String, GatewayError> {
        let thumb_media_id = match thumbnail {
            Some((filename, data)) => self.upload_media(&filename, data).await?,
            None => String::new(),
        };
        self.dispatch(
            to_user,
            SendPayload::Link {
                link: SendLinkPayload {
                    title: title.to_string(),
                    desc: description.to_string(),
                    url: url.to_string(),
                    thumb_media_id,
                },
            },
        )
        .await
    }

    pub async fn send_mini_program(
        &self,
        to_user: &str,
        mut payload: MiniProgramPayload,
        thumbnail: Option<(String, Vec<u8>)>,
    ) -> Result<String, GatewayError> {
        if let Some((filename, data)) = thumbnail {
            payload.thumb_media_id = self.upload_media(&filename, data).await?;
        }
        self.dispatch(to_user, SendPayload::Miniprogram { miniprogram: payload })
            .await
    }

    pub async fn send_file(
        &self,
        to_user: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<String, GatewayError> {
        let kind = classify_file(filename);
        let media_id = self.upload_media(filename, data).await?;
        let media = MediaRef { media_id };
        let payload = match kind {
            FileKind::Image => SendPayload::Image { image: media },
            FileKind::Voice => SendPayload::Voice { voice: media },
            FileKind::Video => SendPayload::Video { video: media },
            FileKind::File => SendPayload::File { file: media },
        };
        self.dispatch(to_user, payload).await
    }

    /// Uploads media, keyed in the cache by content hash so identical bytes
    /// reuse the vendor media id until it expires.
    pub async fn upload_media(
        &self,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<String, GatewayError> {
        let kind = classify_file(filename);
        let content_hash = format!("{:x}", md5::compute(&data));
        if let Some(entry) =
            store::get_cached_media(&self.pool, self.db_kind, &content_hash).await?
        {
            if entry.media_type == kind.as_str() {
                return Ok(entry.media_id);
            }
        }

        let access_token = self.tokens.access_token().await?;
        let response = self
            .client
            .upload_media(&access_token, kind, filename, data)
            .await?;
        store::put_cached_media(
            &self.pool,
            self.db_kind,
            &content_hash,
            &response.media_id,
            kind.as_str(),
        )
        .await?;
        Ok(response.media_id)
    }
}
