use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde_json::json;
use std::sync::Mutex;
use tower::ServiceExt;
use wxkf_gateway::events::{event_channel, GatewayEvent};
use wxkf_gateway::messages::{MessageKind, NormalizedMessage};

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn clear_env() {
    for var in [
        "WECOM_APP_TOKEN",
        "WECOM_APP_AES_KEY",
        "WECOM_CORP_ID",
        "WECOM_CORP_SECRET",
        "WECOM_KF_OPEN_ID",
        "WECOM_KF_NAME",
        "WXKF_CALLBACK_PORT",
        "WXKF_GATEWAY_DATABASE_URL",
        "WXKF_GATEWAY_SQLITE_PATH",
        "WXKF_GATEWAY_API_TOKEN",
    ] {
        std::env::remove_var(var);
    }
}

/// Minimal config with no vendor credentials: the app still serves the local
/// surface, with the callback endpoints disabled.
fn write_bare_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let db_path = dir.path().join("state.sqlite");
    let config = json!({
        "server": {"host": "127.0.0.1", "port": 0, "api_token": null},
        "auth": {
            "token": null,
            "encoding_aes_key": null,
            "corp_id": null,
            "corp_secret": null,
            "kf_open_id": null,
            "kf_name": null
        },
        "api": {"base_url": "http://127.0.0.1:1", "timeout_seconds": 5},
        "database": {
            "url": format!("sqlite://{}?mode=rwc", db_path.display()),
            "sqlite_path": db_path.display().to_string()
        }
    });
    let path = dir.path().join("config.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_app_without_credentials_serves_local_surface_only() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("WXKF_GATEWAY_CONFIG", write_bare_config(&dir));

    let (state, app) = wxkf_gateway::create_app().await.unwrap();
    assert!(state.webhook.is_none());
    assert!(state.manager.current_account().is_none());

    let response = app
        .clone()
        .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // No callback credentials, no handshake.
    let response = app
        .oneshot(
            Request::get("/callback?msg_signature=x&timestamp=1&nonce=n&echostr=e")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_environment_overrides_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("WXKF_GATEWAY_CONFIG", write_bare_config(&dir));
    std::env::set_var("WECOM_CORP_ID", "ww-from-env");
    std::env::set_var("WXKF_CALLBACK_PORT", "8443");

    let config = wxkf_gateway::config::load_config();
    assert_eq!(config.auth.corp_id.as_deref(), Some("ww-from-env"));
    assert_eq!(config.server.port, 8443);

    std::env::remove_var("WECOM_CORP_ID");
    std::env::remove_var("WXKF_CALLBACK_PORT");
}

#[test]
fn test_event_wire_shapes() {
    let login = GatewayEvent::Login {
        account_id: "kf-1".to_string(),
        account_name: "support desk".to_string(),
    };
    let value = serde_json::to_value(&login).unwrap();
    assert_eq!(value["event"], "login");
    assert_eq!(value["payload"]["account_id"], "kf-1");

    let ready = serde_json::to_value(GatewayEvent::Ready).unwrap();
    assert_eq!(ready["event"], "ready");

    let message = GatewayEvent::Message {
        message: NormalizedMessage {
            id: "m-1".to_string(),
            talker_id: "user-1".to_string(),
            listener_id: "kf-1".to_string(),
            timestamp_ms: 1_710_000_000_000,
            kind: MessageKind::Text,
            text: Some("hello".to_string()),
            media_id: None,
            media_oss_url: None,
            filename: None,
            location: None,
            link: None,
            mini_program: None,
            contact_id: None,
        },
    };
    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["event"], "message");
    assert_eq!(value["payload"]["message"]["id"], "m-1");
}

#[tokio::test]
async fn test_broadcast_fans_out_to_every_subscriber() {
    let (tx, mut rx1) = event_channel(16);
    let mut rx2 = tx.subscribe();

    tx.send(GatewayEvent::Ready).unwrap();
    assert!(matches!(rx1.recv().await.unwrap(), GatewayEvent::Ready));
    assert!(matches!(rx2.recv().await.unwrap(), GatewayEvent::Ready));
}
