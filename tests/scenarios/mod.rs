//! Shared fixtures for the integration scenarios.

pub mod errors;
pub mod pagination;
pub mod rate_limiting;
pub mod token_sharing;

use async_trait::async_trait;
use market_gateway::{
    ConfigPreset, Gateway, GatewayConfig, GatewayError, IssuedToken, TokenSource,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use wiremock::MockServer;

/// Token source issuing `token-1`, `token-2`, ... after an optional delay.
#[derive(Default)]
pub struct CountingSource {
    calls: AtomicU32,
    delay: Duration,
}

impl CountingSource {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for CountingSource {
    async fn fetch_token(&self) -> Result<IssuedToken, GatewayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(IssuedToken {
            value: format!("token-{n}"),
            expires_in: Duration::from_secs(3600),
        })
    }
}

/// Development preset pointed at `server`, without call spacing.
pub fn config_for(server: &MockServer) -> GatewayConfig {
    let mut config = GatewayConfig::from(ConfigPreset::Development).with_base_url(server.uri());
    config.default_min_interval = Duration::ZERO;
    config.credential_id = "integration".to_string();
    config
}

pub async fn gateway_with(config: GatewayConfig, source: &Arc<CountingSource>) -> Gateway {
    Gateway::builder(config)
        .with_token_source(Arc::clone(source))
        .build_and_init()
        .await
        .expect("gateway should build")
}

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
