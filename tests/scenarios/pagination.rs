//! Header-driven pagination through the gateway.

use super::{CountingSource, config_for, gateway_with};
use futures::StreamExt;
use market_gateway::{RequestDescriptor, StopReason};
use serde_json::{Value, json};
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OUT_BLOCK: &str = "t8412OutBlock1";

/// Pages 1-3 announce more data, page 4 is the last.
async fn mount_chart(server: &MockServer) {
    let pages = [
        (None, Some("c2"), json!([{"date": "20240105"}, {"date": "20240104"}])),
        (Some("c2"), Some("c3"), json!([{"date": "20240103"}])),
        (Some("c3"), Some("c4"), json!([{"date": "20240102"}])),
        (Some("c4"), None, json!([{"date": "20240101"}])),
    ];

    for (key, next, rows) in pages {
        let mut mock = Mock::given(method("POST")).and(path("/stock/chart"));
        mock = match key {
            Some(key) => mock.and(header("tr_cont", "Y")).and(header("tr_cont_key", key)),
            None => mock.and(header("tr_cont", "N")),
        };

        let body = json!({"rsp_cd": "00000", "t8412OutBlock": {"shcode": "005930"}, OUT_BLOCK: rows});
        let mut response = ResponseTemplate::new(200).set_body_json(body);
        response = match next {
            Some(next) => response
                .insert_header("tr_cont", "Y")
                .insert_header("tr_cont_key", next),
            None => response.insert_header("tr_cont", "N"),
        };

        mock.respond_with(response).mount(server).await;
    }
}

fn chart_request() -> RequestDescriptor {
    RequestDescriptor::new(
        "t8412",
        "/stock/chart",
        json!({"t8412InBlock": {"shcode": "005930", "ncnt": 1, "qrycnt": 2}}),
    )
}

fn dates(rows: &[Value]) -> Vec<&str> {
    rows.iter().filter_map(|row| row["date"].as_str()).collect()
}

#[tokio::test]
async fn test_paginate_yields_four_pages_in_order() {
    let server = MockServer::start().await;
    mount_chart(&server).await;
    let gateway = gateway_with(config_for(&server), &Arc::new(CountingSource::default())).await;

    let mut pages = gateway.paginate(chart_request(), None);
    let mut keys = Vec::new();
    let mut rows = Vec::new();
    while let Some(page) = pages.next_page().await.unwrap() {
        keys.push(page.next_key.clone());
        rows.extend(page.data[OUT_BLOCK].as_array().unwrap().clone());
    }

    assert_eq!(
        keys,
        vec![
            Some("c2".to_string()),
            Some("c3".to_string()),
            Some("c4".to_string()),
            None
        ]
    );
    assert_eq!(
        dates(&rows),
        vec!["20240105", "20240104", "20240103", "20240102", "20240101"]
    );
    assert_eq!(pages.pages_fetched(), 4);
    assert_eq!(pages.stop_reason(), Some(StopReason::Exhausted));
}

#[tokio::test]
async fn test_collect_all_with_page_bound_returns_first_pages() {
    let server = MockServer::start().await;
    mount_chart(&server).await;
    let gateway = gateway_with(config_for(&server), &Arc::new(CountingSource::default())).await;

    let rows = gateway
        .collect_all(chart_request(), OUT_BLOCK, Some(2))
        .await
        .unwrap();

    assert_eq!(dates(&rows), vec!["20240105", "20240104", "20240103"]);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_independent_iterators() {
    let server = MockServer::start().await;
    mount_chart(&server).await;
    let gateway = gateway_with(config_for(&server), &Arc::new(CountingSource::default())).await;

    let mut first = gateway.paginate(chart_request(), None);
    let mut second = gateway.paginate(chart_request(), Some(1));

    let a = first.next_page().await.unwrap().unwrap();
    let b = second.next_page().await.unwrap().unwrap();
    assert_eq!(a, b);
    assert!(second.next_page().await.unwrap().is_none());
    assert_eq!(second.stop_reason(), Some(StopReason::PageLimit));

    let rest: Vec<_> = first.into_stream().collect().await;
    assert_eq!(rest.len(), 3);
}
