//! Walk through the gateway against a local fake brokerage.
//!
//! This demo shows how to:
//! - Build a gateway from a configuration preset
//! - Issue a single call and decode it into a typed envelope
//! - Page through a header-paginated query, lazily and all at once
//! - Map a failure to the status an HTTP layer would answer with
//!
//! Run with: cargo run --example gateway_demo
//! More logging: RUST_LOG=market_gateway=debug cargo run --example gateway_demo

use futures::StreamExt;
use market_gateway::{
    ApiEnvelope, ConfigPreset, Gateway, GatewayConfig, RequestDescriptor, TokenEndpointConfig,
    to_domain_error,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(rename = "t1102OutBlock")]
    out: QuoteBlock,
}

#[derive(Debug, Deserialize)]
struct QuoteBlock {
    hname: String,
    price: i64,
}

async fn fake_brokerage() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "demo-token",
            "token_type": "Bearer",
            "expires_in": 86400
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/stock/market-data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rsp_cd": "00000",
            "rsp_msg": "Lookup complete",
            "t1102OutBlock": {"hname": "Samsung Electronics", "price": 71000}
        })))
        .mount(&server)
        .await;

    for (key, next, date) in [
        (None, Some("p2"), "20240103"),
        (Some("p2"), Some("p3"), "20240102"),
        (Some("p3"), None, "20240101"),
    ] {
        let mut mock = Mock::given(method("POST")).and(path("/stock/chart"));
        mock = match key {
            Some(key) => mock.and(header("tr_cont_key", key)),
            None => mock.and(header("tr_cont", "N")),
        };
        let mut response = ResponseTemplate::new(200)
            .set_body_json(json!({"t8412OutBlock1": [{"date": date, "close": 71000}]}));
        if let Some(next) = next {
            response = response
                .insert_header("tr_cont", "Y")
                .insert_header("tr_cont_key", next);
        }
        mock.respond_with(response).mount(&server).await;
    }

    Mock::given(method("POST"))
        .and(path("/stock/unknown"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "rsp_cd": "01404",
            "rsp_msg": "Unknown operation code"
        })))
        .mount(&server)
        .await;

    server
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "market_gateway=info".into()),
        )
        .init();

    println!("Market Gateway Demo");
    println!("===================\n");

    let server = fake_brokerage().await;

    let config = GatewayConfig::from(ConfigPreset::Development)
        .with_base_url(server.uri())
        .with_min_interval("t8412", Duration::from_millis(250));
    println!("{}\n", config.summary());
    for warning in config.validate() {
        println!("  warning: {warning}");
    }

    let gateway = Gateway::builder(config)
        .with_token_endpoint(TokenEndpointConfig::new("demo-key", "demo-secret"))
        .build_and_init()
        .await?;

    println!("\n1. Single call, typed");
    let quote: ApiEnvelope<Quote> = gateway
        .request_as(&RequestDescriptor::new(
            "t1102",
            "/stock/market-data",
            json!({"t1102InBlock": {"shcode": "005930"}}),
        ))
        .await?;
    println!(
        "   {} trades at {} ({})",
        quote.data.out.hname,
        quote.data.out.price,
        quote.rsp_msg.unwrap_or_default()
    );

    let chart = RequestDescriptor::new(
        "t8412",
        "/stock/chart",
        json!({"t8412InBlock": {"shcode": "005930", "ncnt": 1}}),
    );

    println!("\n2. Lazy pagination (pages are 250ms apart)");
    let mut pages = gateway.paginate(chart.clone(), None).into_stream().boxed();
    let mut n = 0;
    while let Some(page) = pages.next().await {
        let page = page?;
        n += 1;
        println!(
            "   page {n}: {} (more: {}, next key: {:?})",
            page.data["t8412OutBlock1"], page.has_more, page.next_key
        );
    }

    println!("\n3. Collect with a page bound of 2");
    let rows = gateway.collect_all(chart, "t8412OutBlock1", Some(2)).await?;
    println!("   {} rows", rows.len());

    println!("\n4. Error translation");
    let err = gateway
        .request(&RequestDescriptor::new("t9999", "/stock/unknown", json!({})))
        .await
        .unwrap_err();
    println!("   error: {err} (code {})", err.code());
    if let Ok(domain) = to_domain_error(err) {
        println!("   outward HTTP status: {}", domain.http_status());
    }

    println!("\nCredential store: {}", gateway.store_stats().await?.backend_info);

    Ok(())
}
