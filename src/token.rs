use crate::client::VendorClient;
use crate::error::GatewayError;
use crate::exec_queue::{ExecOptions, ExecQueue};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const TOKEN_QUEUE_ID: &str = "get-access-token";

/// A token younger than this is served from cache; the vendor grants tokens
/// for two hours, so ten minutes leaves ample slack.
const TOKEN_FRESH_WINDOW: Duration = Duration::from_secs(10 * 60);

const TOKEN_REQUEST_SPACING: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct CachedToken {
    token: String,
    fetched_at: Instant,
}

/// Caches the vendor access token and serializes refreshes through the
/// execution queue, so concurrent callers coalesce into one vendor request.
#[derive(Clone)]
pub struct AccessTokenManager {
    client: VendorClient,
    corp_id: String,
    corp_secret: String,
    queue: ExecQueue,
    cached: Arc<Mutex<Option<CachedToken>>>,
}

impl AccessTokenManager {
    pub fn new(
        client: VendorClient,
        corp_id: impl Into<String>,
        corp_secret: impl Into<String>,
        queue: ExecQueue,
    ) -> Self {
        Self {
            client,
            corp_id: corp_id.into(),
            corp_secret: corp_secret.into(),
            queue,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    fn fresh_cached(&self) -> Option<String> {
        let cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cached
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < TOKEN_FRESH_WINDOW)
            .map(|entry| entry.token.clone())
    }

    fn store(&self, token: String) {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = Some(CachedToken {
            token,
            fetched_at: Instant::now(),
        });
    }

    /// Drops the cached token so the next caller refreshes, e.g. after the
    /// vendor rejects it.
    pub fn invalidate(&self) {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = None;
    }

    pub async fn access_token(&self) -> Result<String, GatewayError> {
        if let Some(token) = self.fresh_cached() {
            return Ok(token);
        }

        let manager = self.clone();
        self.queue
            .exec(
                async move {
                    // A coalesced peer may have refreshed while this task sat
                    // in the queue.
                    if let Some(token) = manager.fresh_cached() {
                        return Ok(token);
                    }
                    let response = manager
                        .client
                        .get_access_token(&manager.corp_id, &manager.corp_secret)
                        .await?;
                    info!(expires_in = response.expires_in, "refreshed the access token");
                    manager.store(response.access_token.clone());
                    Ok(response.access_token)
                },
                ExecOptions {
                    queue_id: Some(TOKEN_QUEUE_ID.to_string()),
                    unique_key: Some(TOKEN_QUEUE_ID.to_string()),
                    delay_after: Some(TOKEN_REQUEST_SPACING),
                    ..Default::default()
                },
            )
            .await
    }

    /// Keeps the cached token inside its freshness window without busy
    /// looping: one refresh attempt per half-window tick.
    pub fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TOKEN_FRESH_WINDOW / 2);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = manager.access_token().await {
                    warn!("proactive token refresh failed: {err}");
                }
            }
        })
    }
}
