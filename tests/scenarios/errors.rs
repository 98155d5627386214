//! Error normalization and the auth-failure retry protocol.

use super::{CountingSource, config_for, gateway_with};
use market_gateway::{GatewayError, NETWORK_CODE, RequestDescriptor, to_domain_error};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn quote_request() -> RequestDescriptor {
    RequestDescriptor::new(
        "t1102",
        "/stock/market-data",
        json!({"t1102InBlock": {"shcode": "005930"}}),
    )
}

#[tokio::test]
async fn test_structured_404_becomes_domain_error() {
    let server = MockServer::start().await;
    let payload = json!({"rsp_cd": "01404", "rsp_msg": "No matching symbol"});
    Mock::given(method("POST"))
        .and(path("/stock/market-data"))
        .respond_with(ResponseTemplate::new(404).set_body_json(payload.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway_with(config_for(&server), &Arc::new(CountingSource::default())).await;
    let err = gateway.request(&quote_request()).await.unwrap_err();

    let domain = to_domain_error(err).unwrap();
    assert_eq!(domain.code, "404");
    assert_eq!(domain.message, "No matching symbol");
    assert_eq!(domain.raw_payload, Some(payload));
    assert_eq!(domain.http_status(), 404);
}

#[tokio::test]
async fn test_connection_refused_becomes_network_error() {
    let server = MockServer::start().await;
    // Nothing listens on port 1
    let config = config_for(&server).with_base_url("http://127.0.0.1:1");

    let gateway = gateway_with(config, &Arc::new(CountingSource::default())).await;
    let err = gateway.request(&quote_request()).await.unwrap_err();

    assert_eq!(err.code(), NETWORK_CODE);
    let domain = to_domain_error(err).unwrap();
    assert!(domain.is_network());
    assert_eq!(domain.http_status(), 502);
}

#[tokio::test]
async fn test_one_auth_failure_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer token-1"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"rsp_cd": "IGW00121", "rsp_msg": "Token expired"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer token-2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"rsp_cd": "00000", "t1102OutBlock": {"price": 71000}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let source = Arc::new(CountingSource::default());
    let gateway = gateway_with(config_for(&server), &source).await;

    let body = gateway.request(&quote_request()).await.unwrap();
    assert_eq!(body["t1102OutBlock"]["price"], 71000);
    assert_eq!(source.calls(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_two_auth_failures_surface_after_one_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"rsp_cd": "IGW00121", "rsp_msg": "Token expired"})),
        )
        .mount(&server)
        .await;

    let source = Arc::new(CountingSource::default());
    let gateway = gateway_with(config_for(&server), &source).await;

    let err = gateway.request(&quote_request()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Domain(ref domain) if domain.code == "401"));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_timeout_override_applies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let gateway = gateway_with(config_for(&server), &Arc::new(CountingSource::default())).await;

    let err = gateway
        .request(&quote_request().with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), NETWORK_CODE);

    // The configured default is long enough
    assert!(gateway.request(&quote_request()).await.is_ok());
    // A timed-out call is not retried
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
