//! Per operation-code call spacing.

use super::{CountingSource, config_for, gateway_with};
use market_gateway::{RateLimiter, RequestDescriptor};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test(start_paused = true)]
async fn test_grants_for_one_code_are_spaced() {
    let interval = Duration::from_millis(750);
    let limiter = Arc::new(RateLimiter::new(interval));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter.acquire_slot("t1102").await;
            tokio::time::Instant::now()
        }));
    }

    let mut grants = Vec::new();
    for handle in handles {
        grants.push(handle.await.unwrap());
    }
    grants.sort();

    for pair in grants.windows(2) {
        assert!(pair[1] - pair[0] >= interval);
    }
}

#[tokio::test(start_paused = true)]
async fn test_different_codes_do_not_wait_for_each_other() {
    let limiter = RateLimiter::new(Duration::from_secs(60));
    let start = tokio::time::Instant::now();

    for code in ["t1102", "t8412", "t1305", "t0424"] {
        limiter.acquire_slot(code).await;
    }

    assert_eq!(tokio::time::Instant::now(), start);
    assert_eq!(limiter.tracked_codes(), 4);
}

#[tokio::test]
async fn test_gateway_spaces_calls_per_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let interval = Duration::from_millis(300);
    let config = config_for(&server).with_min_interval("t1102", interval);
    let source = Arc::new(CountingSource::default());
    let gateway = Arc::new(gateway_with(config, &source).await);

    let quote = RequestDescriptor::new("t1102", "/stock/market-data", json!({}));
    let chart = RequestDescriptor::new("t8412", "/stock/chart", json!({}));

    // Warm the token cache so only the limiter adds latency
    gateway.request(&chart).await.unwrap();

    let started = Instant::now();
    let queued = {
        let gateway = Arc::clone(&gateway);
        let quote = quote.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                gateway.request(&quote).await.unwrap();
            }
        })
    };

    // t8412 is not held up by the t1102 queue
    tokio::time::sleep(Duration::from_millis(50)).await;
    let chart_started = Instant::now();
    gateway.request(&chart).await.unwrap();
    assert!(chart_started.elapsed() < interval);

    queued.await.unwrap();
    assert!(started.elapsed() >= interval * 2);
}
