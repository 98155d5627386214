//! # Market Gateway
//!
//! An async client for a brokerage market-data API that is awkward to call
//! correctly from a horizontally scaled service.
//!
//! The API limits how often each operation code (`tr_cd`) may be called,
//! authenticates with a bearer token that expires, paginates through response
//! headers instead of the body, and mixes its own error codes with transport
//! failures. This crate hides all of that behind one [`Gateway`] value:
//!
//! - **Rate limiting**: calls with the same operation code are spaced by a
//!   configurable minimum interval and granted in FIFO order
//! - **Shared token cache**: the bearer token is cached in a [`CredentialStore`]
//!   shared by every replica; at most one replica refreshes it at a time
//! - **Auth recovery**: a rejected token is replaced and the call re-issued once
//! - **Pagination**: [`Pages`] follows `tr_cont` / `tr_cont_key` lazily, with a
//!   page bound
//! - **Uniform errors**: API and network failures become a [`DomainError`] with
//!   a stable code
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use market_gateway::{ConfigPreset, Gateway, GatewayConfig, RequestDescriptor, TokenEndpointConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), market_gateway::GatewayError> {
//! let config = GatewayConfig::from(ConfigPreset::Production)
//!     .with_min_interval("t8412", Duration::from_millis(500));
//!
//! let gateway = Gateway::builder(config)
//!     .with_token_endpoint(TokenEndpointConfig::new("app-key", "app-secret"))
//!     .build_and_init()
//!     .await?;
//!
//! // One call
//! let quote = gateway
//!     .request(&RequestDescriptor::new(
//!         "t1102",
//!         "/stock/market-data",
//!         json!({"t1102InBlock": {"shcode": "005930"}}),
//!     ))
//!     .await?;
//!
//! // Every page of a chart query, at most 10 pages
//! let candles = gateway
//!     .collect_all(
//!         RequestDescriptor::new(
//!             "t8412",
//!             "/stock/chart",
//!             json!({"t8412InBlock": {"shcode": "005930", "ncnt": 1}}),
//!         ),
//!         "t8412OutBlock1",
//!         Some(10),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sharing the token between replicas
//!
//! The default [`MemoryStore`] only coordinates tasks inside one process. With
//! several replicas, enable `redis-store` (or `sqlite-store` for replicas on
//! one host) and hand the store to the builder:
//!
//! ```rust,ignore
//! use market_gateway::storage::RedisStore;
//!
//! let store = Arc::new(RedisStore::new("redis://cache:6379", "market_gateway")?);
//! let gateway = Gateway::builder(config).with_store(store).build_and_init().await?;
//! ```
//!
//! ## Errors
//!
//! Every failure is a [`GatewayError`] with a machine-readable
//! [`code`](GatewayError::code). Failures reported by the API or the network
//! arrive as [`GatewayError::Domain`]; [`DomainError::http_status`] maps them
//! to the status an HTTP layer in front of the gateway should answer with.
//!
//! ## Feature flags
//!
//! - `memory-store` (default): in-process store
//! - `redis-store`: [`storage::RedisStore`]
//! - `sqlite-store`: [`storage::SqliteStore`]
//! - `metrics`: [`metrics::MetricsCollector`] and friends

pub mod gateway;

pub use gateway::storage;

#[cfg(feature = "metrics")]
pub use gateway::metrics;

// Re-export commonly used types
pub use gateway::{
    ApiEnvelope, CachedToken, ConfigPreset, Continuation, ContinuationCursor, CredentialStore,
    DomainError, Gateway, GatewayBuilder, GatewayConfig, GatewayError, HttpTokenSource,
    IssuedToken, MemoryStore, NETWORK_CODE, Page, Pages, RateLimiter, RequestDescriptor,
    RequestExecutor, StopReason, TokenEndpointConfig, TokenManager, TokenSource, collect_all,
    to_domain_error, translate,
};

#[cfg(test)]
mod tests {
    use crate::{
        ConfigPreset, DomainError, Gateway, GatewayConfig, GatewayError, IssuedToken,
        RequestDescriptor, TokenSource, to_domain_error,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<IssuedToken, GatewayError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(IssuedToken {
                value: format!("token-{n}"),
                expires_in: Duration::from_secs(3600),
            })
        }
    }

    #[tokio::test]
    async fn test_gateway_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stock/market-data"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "rsp_cd": "IGW00121",
                "rsp_msg": "Token expired"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/stock/market-data"))
            .and(header("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rsp_cd": "00000",
                "t1102OutBlock": {"price": 71000}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/stock/unknown"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "rsp_cd": "01404",
                "rsp_msg": "Unknown operation"
            })))
            .mount(&server)
            .await;

        let mut config = GatewayConfig::from(ConfigPreset::Development).with_base_url(server.uri());
        config.default_min_interval = Duration::ZERO;

        let source = Arc::new(CountingSource::default());
        let gateway = Gateway::builder(config)
            .with_token_source(Arc::clone(&source))
            .build_and_init()
            .await
            .unwrap();

        let body = gateway
            .request(&RequestDescriptor::new(
                "t1102",
                "/stock/market-data",
                json!({"t1102InBlock": {"shcode": "005930"}}),
            ))
            .await
            .unwrap();
        assert_eq!(body["t1102OutBlock"]["price"], 71000);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        let err = gateway
            .request(&RequestDescriptor::new("t9999", "/stock/unknown", json!({})))
            .await
            .unwrap_err();
        let domain = to_domain_error(err).unwrap();
        assert_eq!(domain, DomainError::new("404", "Unknown operation").with_payload(json!({
            "rsp_cd": "01404",
            "rsp_msg": "Unknown operation"
        })));
        assert_eq!(domain.http_status(), 404);
    }
}
