use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

#[cfg(feature = "metrics")]
use super::metrics::{GatewayMetrics, MetricsCollector};

use super::config::{GatewayConfig, TokenEndpointConfig};
use super::error::GatewayError;
use super::executor::RequestExecutor;
use super::pagination::{self, Pages};
use super::rate_limiter::RateLimiter;
use super::request::{ApiEnvelope, RequestDescriptor};
use super::storage::{CredentialStore, MemoryStore, StoreStats};
use super::token::{HttpTokenSource, TokenManager, TokenSource};

/// Entry point to the brokerage API.
///
/// One `Gateway` owns the rate limiter, the token manager and the HTTP
/// client. Build it once at start-up and share it (it is cheap to wrap in an
/// `Arc`); every method takes `&self`.
///
/// # Example
///
/// ```rust,no_run
/// use market_gateway::{ConfigPreset, Gateway, GatewayConfig, RequestDescriptor, TokenEndpointConfig};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), market_gateway::GatewayError> {
/// let gateway = Gateway::builder(GatewayConfig::from(ConfigPreset::Production))
///     .with_token_endpoint(TokenEndpointConfig::new("app-key", "app-secret"))
///     .build_and_init()
///     .await?;
///
/// let quote = gateway
///     .request(&RequestDescriptor::new(
///         "t1102",
///         "/stock/market-data",
///         json!({"t1102InBlock": {"shcode": "005930"}}),
///     ))
///     .await?;
/// println!("{quote}");
/// # Ok(())
/// # }
/// ```
pub struct Gateway {
    config: GatewayConfig,
    store: Arc<dyn CredentialStore>,
    limiter: Arc<RateLimiter>,
    tokens: Arc<TokenManager>,
    executor: Arc<RequestExecutor>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl Gateway {
    /// Starts building a gateway.
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Issues one call and returns the parsed body.
    pub async fn request(&self, descriptor: &RequestDescriptor) -> Result<Value, GatewayError> {
        self.executor.execute(descriptor).await
    }

    /// Issues one call and decodes the body into `T` inside the common
    /// response envelope.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<ApiEnvelope<T>, GatewayError> {
        let body = self.request(descriptor).await?;
        serde_json::from_value(body).map_err(|e| {
            GatewayError::Decode(format!(
                "Unexpected response shape for {}: {e}",
                descriptor.operation_code
            ))
        })
    }

    /// Lazily pages through a query, stopping after `max_pages` pages
    /// (default: the configured bound).
    pub fn paginate(&self, descriptor: RequestDescriptor, max_pages: Option<usize>) -> Pages {
        let pages = Pages::new(
            Arc::clone(&self.executor),
            descriptor,
            max_pages.unwrap_or(self.config.max_pages),
        );
        #[cfg(feature = "metrics")]
        let pages = pages.with_metrics(self.metrics.clone());
        pages
    }

    /// Fetches every page (up to the bound) and concatenates the array field
    /// `array_field` of each.
    pub async fn collect_all(
        &self,
        descriptor: RequestDescriptor,
        array_field: &str,
        max_pages: Option<usize>,
    ) -> Result<Vec<Value>, GatewayError> {
        pagination::collect_all(self.paginate(descriptor, max_pages), array_field).await
    }

    /// The token manager, e.g. to invalidate the cached token.
    pub fn token_manager(&self) -> &TokenManager {
        &self.tokens
    }

    /// The rate limiter shared by every call.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The configuration the gateway was built with.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Statistics of the credential store backend.
    pub async fn store_stats(&self) -> Result<StoreStats, GatewayError> {
        self.store.get_stats().await
    }

    /// Snapshot of collected metrics; all zero when no collector is attached.
    #[cfg(feature = "metrics")]
    pub async fn metrics(&self) -> Result<GatewayMetrics, GatewayError> {
        match &self.metrics {
            Some(metrics) => metrics.get_metrics().await,
            None => Ok(GatewayMetrics::default()),
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("tokens", &self.tokens)
            .finish()
    }
}

/// A builder for [`Gateway`].
///
/// Defaults to [`MemoryStore`]; production deployments with several replicas
/// should supply a shared store with [`with_store`](Self::with_store). The
/// token source is, in order of preference: an explicit
/// [`with_token_source`](Self::with_token_source), an HTTP source for
/// [`with_token_endpoint`](Self::with_token_endpoint), or an HTTP source for
/// [`TokenEndpointConfig::from_env`].
#[must_use = "The builder does nothing unless `.build_and_init()` is called."]
pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn CredentialStore>>,
    token_source: Option<Arc<dyn TokenSource>>,
    endpoint: Option<TokenEndpointConfig>,
    client: Option<reqwest::Client>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl GatewayBuilder {
    fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            store: None,
            token_source: None,
            endpoint: None,
            client: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Uses `store` for the cached token and the refresh lock.
    pub fn with_store<S: CredentialStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses a custom token source.
    pub fn with_token_source<T: TokenSource + 'static>(mut self, source: Arc<T>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Fetches tokens from the brokerage's OAuth endpoint.
    pub fn with_token_endpoint(mut self, endpoint: TokenEndpointConfig) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Uses a preconfigured HTTP client (proxies, custom roots, ...).
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Reports metrics to `collector`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics<M: MetricsCollector + 'static>(mut self, collector: Arc<M>) -> Self {
        self.metrics = Some(collector);
        self
    }

    /// Builds the gateway and initializes the credential store.
    pub async fn build_and_init(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        for warning in config.validate() {
            warn!(%warning, "Gateway configuration warning");
        }

        let client = match self.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .build()
                .map_err(|e| GatewayError::Config(format!("Cannot build HTTP client: {e}")))?,
        };

        let token_source: Arc<dyn TokenSource> = match (self.token_source, self.endpoint) {
            (Some(source), _) => source,
            (None, Some(endpoint)) => Arc::new(HttpTokenSource::new(
                client.clone(),
                &config.base_url,
                endpoint,
                config.request_timeout,
            )),
            (None, None) => {
                let endpoint = TokenEndpointConfig::from_env().ok_or_else(|| {
                    GatewayError::Config(
                        "No token source: set MARKET_GATEWAY_APP_KEY and MARKET_GATEWAY_APP_SECRET \
                         or configure one on the builder"
                            .to_string(),
                    )
                })?;
                Arc::new(HttpTokenSource::new(
                    client.clone(),
                    &config.base_url,
                    endpoint,
                    config.request_timeout,
                ))
            }
        };

        let store: Arc<dyn CredentialStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        store.init().await?;

        let tokens = TokenManager::new(Arc::clone(&store), token_source, &config);
        #[cfg(feature = "metrics")]
        let tokens = match &self.metrics {
            Some(metrics) => tokens.with_metrics(Arc::clone(metrics)),
            None => tokens,
        };
        let tokens = Arc::new(tokens);

        let limiter = Arc::new(RateLimiter::from_config(&config));

        let executor =
            RequestExecutor::new(client, &config, Arc::clone(&limiter), Arc::clone(&tokens));
        #[cfg(feature = "metrics")]
        let executor = match &self.metrics {
            Some(metrics) => executor.with_metrics(Arc::clone(metrics)),
            None => executor,
        };

        info!(config = %config.summary(), "Gateway initialized");

        Ok(Gateway {
            config,
            store,
            limiter,
            tokens,
            executor: Arc::new(executor),
            #[cfg(feature = "metrics")]
            metrics: self.metrics,
        })
    }
}
