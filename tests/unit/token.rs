use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use wxkf_gateway::client::VendorClient;
use wxkf_gateway::error::GatewayError;
use wxkf_gateway::exec_queue::ExecQueue;
use wxkf_gateway::token::AccessTokenManager;

fn manager(server: &MockServer) -> AccessTokenManager {
    AccessTokenManager::new(
        VendorClient::new(reqwest::Client::new(), server.uri()),
        "corp-1",
        "secret-1",
        ExecQueue::new(),
    )
}

#[tokio::test]
async fn test_token_fetched_once_then_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gettoken"))
        .and(query_param("corpid", "corp-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "access_token": "AT-cached",
            "expires_in": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;

    let manager = manager(&server);
    assert_eq!(manager.access_token().await.unwrap(), "AT-cached");
    // Second call inside the freshness window never reaches the vendor.
    assert_eq!(manager.access_token().await.unwrap(), "AT-cached");
}

#[tokio::test]
async fn test_concurrent_requests_coalesce_into_one_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gettoken"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(std::time::Duration::from_millis(50))
                .set_body_json(json!({
                    "errcode": 0,
                    "errmsg": "ok",
                    "access_token": "AT-shared",
                    "expires_in": 7200
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = manager(&server);
    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.access_token().await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "AT-shared");
    }
}

#[tokio::test]
async fn test_invalidate_forces_a_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gettoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "access_token": "AT-1",
            "expires_in": 7200
        })))
        .expect(2)
        .mount(&server)
        .await;

    let manager = manager(&server);
    assert_eq!(manager.access_token().await.unwrap(), "AT-1");
    manager.invalidate();
    assert_eq!(manager.access_token().await.unwrap(), "AT-1");
}

#[tokio::test]
async fn test_vendor_rejection_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gettoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 40001,
            "errmsg": "invalid credential"
        })))
        .mount(&server)
        .await;

    let err = manager(&server).access_token().await.unwrap_err();
    assert!(matches!(err, GatewayError::Server { code: 40001, .. }));
}
