use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Mutex;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use wxkf_gateway::crypto::{decode_encoding_aes_key, encrypt_envelope, get_signature};

// Config loading reads process-global environment variables, so every test
// that builds an app holds this lock for its whole body.
static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const CORP_ID: &str = "wwintegration";
const CALLBACK_TOKEN: &str = "cb-token";

fn aes_key_raw() -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
    encoded.trim_end_matches('=').to_string()
}

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

fn write_config(dir: &tempfile::TempDir, base_url: &str, api_token: Option<&str>) -> PathBuf {
    let db_path = dir.path().join("state.sqlite");
    let config = json!({
        "server": {"host": "127.0.0.1", "port": 0, "api_token": api_token},
        "auth": {
            "token": CALLBACK_TOKEN,
            "encoding_aes_key": aes_key_raw(),
            "corp_id": CORP_ID,
            "corp_secret": "secret-1",
            "kf_open_id": "kf-1",
            "kf_name": null
        },
        "api": {"base_url": base_url, "timeout_seconds": 5},
        "database": {
            "url": format!("sqlite://{}?mode=rwc", db_path.display()),
            "sqlite_path": db_path.display().to_string()
        }
    });
    let path = dir.path().join("config.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}

async fn mount_vendor(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/gettoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "access_token": "AT-int",
            "expires_in": 7200
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/kf/account/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "account_list": [{
                "open_kfid": "kf-1",
                "name": "support desk",
                "avatar": "",
                "manage_privilege": true
            }]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/kf/sync_msg"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "next_cursor": "C-int",
            "has_more": 0,
            "msg_list": []
        })))
        .mount(server)
        .await;
}

async fn build_app(server: &MockServer, api_token: Option<&str>) -> (tempfile::TempDir, axum::Router) {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, &server.uri(), api_token);
    std::env::set_var("WXKF_GATEWAY_CONFIG", &config_path);
    let (_state, app) = wxkf_gateway::create_app().await.unwrap();
    (dir, app)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// Base64 values in query strings need their plus signs escaped; everything
// else in the alphabet survives form decoding.
fn query_escape(value: &str) -> String {
    value.replace('%', "%25").replace('+', "%2B").replace('&', "%26")
}

#[tokio::test]
async fn test_health_endpoint() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let server = MockServer::start().await;
    mount_vendor(&server).await;
    let (_dir, app) = build_app(&server, None).await;

    let response = app
        .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"status":"ok"}"#);
}

#[tokio::test]
async fn test_callback_challenge_round_trip() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let server = MockServer::start().await;
    mount_vendor(&server).await;
    let (_dir, app) = build_app(&server, None).await;

    let key = decode_encoding_aes_key(&aes_key_raw()).unwrap();
    let challenge = "1219558347940450151";
    let echostr = encrypt_envelope(&key, challenge, CORP_ID).unwrap();
    let timestamp = "1710000000";
    let nonce = "nonce-ch";
    let signature = get_signature(CALLBACK_TOKEN, timestamp, nonce, &echostr);

    let uri = format!(
        "/callback?msg_signature={signature}&timestamp={timestamp}&nonce={nonce}&echostr={}",
        query_escape(&echostr)
    );
    let response = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, challenge);
}

#[tokio::test]
async fn test_callback_challenge_rejects_bad_signature() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let server = MockServer::start().await;
    mount_vendor(&server).await;
    let (_dir, app) = build_app(&server, None).await;

    let key = decode_encoding_aes_key(&aes_key_raw()).unwrap();
    let echostr = encrypt_envelope(&key, "challenge", CORP_ID).unwrap();
    let uri = format!(
        "/callback?msg_signature=deadbeef&timestamp=1710000000&nonce=n&echostr={}",
        query_escape(&echostr)
    );
    let response = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_callback_push_acks_and_triggers_sync() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let server = MockServer::start().await;
    mount_vendor(&server).await;
    let (_dir, app) = build_app(&server, None).await;

    let key = decode_encoding_aes_key(&aes_key_raw()).unwrap();
    let inner = format!(
        "<xml><ToUserName><![CDATA[{CORP_ID}]]></ToUserName>\
         <Event><![CDATA[kf_msg_or_event]]></Event>\
         <Token><![CDATA[PULL-int]]></Token>\
         <OpenKfId><![CDATA[kf-1]]></OpenKfId></xml>"
    );
    let encrypted = encrypt_envelope(&key, &inner, CORP_ID).unwrap();
    let timestamp = "1710000001";
    let nonce = "nonce-push";
    let signature = get_signature(CALLBACK_TOKEN, timestamp, nonce, &encrypted);
    let body = format!("<xml><Encrypt><![CDATA[{encrypted}]]></Encrypt></xml>");

    let uri = format!("/callback?msg_signature={signature}&timestamp={timestamp}&nonce={nonce}");
    let response = app
        .oneshot(Request::post(uri).body(Body::from(body)).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // The vendor expects nothing but the bare 200.
    assert_eq!(body_string(response).await, "");
}

#[tokio::test]
async fn test_callback_push_rejects_tampered_blob() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let server = MockServer::start().await;
    mount_vendor(&server).await;
    let (_dir, app) = build_app(&server, None).await;

    let body = "<xml><Encrypt><![CDATA[bm90LXJlYWw=]]></Encrypt></xml>".to_string();
    let uri = "/callback?msg_signature=deadbeef&timestamp=1710000002&nonce=n".to_string();
    let response = app
        .oneshot(Request::post(uri).body(Body::from(body)).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_status_endpoint_shape() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let server = MockServer::start().await;
    mount_vendor(&server).await;
    let (_dir, app) = build_app(&server, None).await;

    let response = app
        .oneshot(Request::get("/v1/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert!(value["messages"].as_i64().is_some());
    assert!(value["queued_tasks"].as_u64().is_some());
}

#[tokio::test]
async fn test_consumer_routes_require_the_api_token() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let server = MockServer::start().await;
    mount_vendor(&server).await;
    let (_dir, app) = build_app(&server, Some("local-secret")).await;

    let response = app
        .clone()
        .oneshot(
            Request::get("/v1/messages/m-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // With the header the middleware passes; the unknown id then 404s.
    let response = app
        .oneshot(
            Request::get("/v1/messages/m-1")
                .header("X-Wxkf-Gateway-Token", "local-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
