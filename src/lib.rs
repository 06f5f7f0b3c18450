pub mod client;
pub mod config;
pub mod contacts;
pub mod crypto;
pub mod error;
pub mod events;
pub mod exec_queue;
pub mod manager;
pub mod messages;
pub mod oss;
pub mod store;
pub mod token;
pub mod webhook;
pub mod ws;

pub use config::Config;
pub use error::GatewayError;

/// Installs the global tracing subscriber; `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

use self::client::VendorClient;
use self::config::{load_config, resolve_database_url};
use self::events::{event_channel, EventSender};
use self::exec_queue::ExecQueue;
use self::manager::GatewayManager;
use self::store::DbKind;
use self::token::AccessTokenManager;
use self::webhook::{CallbackQuery, WebhookCredentials};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub events: EventSender,
    pub queue: ExecQueue,
    pub manager: GatewayManager,
    pub webhook: Option<WebhookCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendTextRequest {
    pub to_user: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SendTextResponse {
    pub message_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub messages: i64,
    pub account_id: Option<String>,
    pub queued_tasks: usize,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let config = load_config();
    let db_url = resolve_database_url(&config);
    let db_kind = store::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    store::init_store(&pool, db_kind).await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.api.timeout_seconds))
        .build()?;
    let client = VendorClient::new(http, config.api.base_url.clone());
    let queue = ExecQueue::new();
    let tokens = AccessTokenManager::new(
        client.clone(),
        config.auth.corp_id.clone().unwrap_or_default(),
        config.auth.corp_secret.clone().unwrap_or_default(),
        queue.clone(),
    );

    let (events, _) = event_channel(100);
    let manager = GatewayManager::new(
        config.auth.clone(),
        client,
        tokens.clone(),
        queue.clone(),
        pool.clone(),
        db_kind,
        events.clone(),
        None,
    );

    let webhook = match WebhookCredentials::from_auth(&config.auth) {
        Ok(creds) => Some(creds),
        Err(err) => {
            info!("callback endpoints disabled: {err}");
            None
        }
    };

    if webhook.is_some() {
        let startup = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = startup.start().await {
                error!("gateway startup failed: {err}");
            }
        });
        let _ = tokens.spawn_refresh_loop();
    }

    let state = AppState {
        config,
        pool,
        db_kind,
        events,
        queue,
        manager,
        webhook,
    };

    let authed_routes = Router::new()
        .route("/v1/messages/send", post(send_text))
        .route("/v1/messages/:message_id", get(get_message))
        .route("/v1/messages/:message_id/file", get(get_message_file))
        .route("/v1/contacts/:contact_id", get(get_contact))
        .route("/v1/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/callback", get(callback_verify).post(callback_push));

    let app = Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state.clone());

    Ok((state, app))
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.server.api_token.as_ref() {
        let header = headers
            .get("X-Wxkf-Gateway-Token")
            .and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let messages = store::count_messages(&state.pool, state.db_kind)
        .await
        .unwrap_or(0);
    Json(StatusResponse {
        messages,
        account_id: state
            .manager
            .current_account()
            .map(|account| account.open_kfid),
        queued_tasks: state.queue.outstanding(),
    })
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.events.subscribe();
    let token = state.config.server.api_token.clone();
    ws.on_upgrade(move |socket| ws::handle_ws(socket, rx, token))
}

/// GET side of the vendor handshake: echo the decrypted challenge back.
async fn callback_verify(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> impl IntoResponse {
    let Some(creds) = state.webhook.as_ref() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    match webhook::verify_challenge(creds, &query) {
        Ok(echo) => echo.into_response(),
        Err(err) => {
            error!("callback verification rejected: {err}");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// POST side: authenticate, decrypt, then ack immediately while the sync pass
/// runs in the background.
async fn callback_push(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> impl IntoResponse {
    let Some(creds) = state.webhook.as_ref() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    match webhook::handle_push(creds, &query, &body) {
        Ok(event) => {
            let manager = state.manager.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.handle_webhook_event(event).await {
                    error!("webhook-triggered sync failed: {err}");
                }
            });
            // The vendor expects a bare 200 ack.
            StatusCode::OK.into_response()
        }
        Err(err @ GatewayError::Auth(_)) => {
            error!("callback push rejected: {err}");
            StatusCode::UNAUTHORIZED.into_response()
        }
        Err(err) => {
            error!("callback push malformed: {err}");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn send_text(
    State(state): State<AppState>,
    Json(req): Json<SendTextRequest>,
) -> impl IntoResponse {
    match state.manager.send_text(&req.to_user, &req.text).await {
        Ok(message_id) => Json(SendTextResponse {
            message_id,
            status: "sent".to_string(),
        })
        .into_response(),
        Err(err) => {
            error!("send_text error: {err}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.message_payload(&message_id).await {
        Ok(message) => Json(message).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_message_file(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.message_file(&message_id).await {
        Ok(artifact) => Json(json!({
            "filename": artifact.filename,
            "url": artifact.url,
            "content_type": artifact.content_type,
            "data": artifact
                .bytes
                .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)),
        }))
        .into_response(),
        Err(err) => {
            error!("message file lookup failed: {err}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn get_contact(
    State(state): State<AppState>,
    Path(contact_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.contact_payload(&contact_id).await {
        Ok(contact) => Json(contact).into_response(),
        Err(err) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}
