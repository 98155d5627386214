//! Bearer token lifecycle shared across processes.
//!
//! The current token lives in the [`CredentialStore`] as a JSON-encoded
//! [`CachedToken`]. Refreshing is guarded by a lock key in the same store:
//! the process that wins `set_if_absent` calls the token endpoint, everyone
//! else polls the cached token until a usable one appears.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use super::metrics::{MetricEvent, MetricsCollector};

use super::config::{GatewayConfig, TokenEndpointConfig};
use super::error::GatewayError;
use super::storage::CredentialStore;
use super::time_utils::{current_timestamp_millis, duration_millis};
use super::translator::translate;

/// The token record shared by every process through the credential store.
///
/// Timestamps are wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    /// Opaque bearer value
    pub value: String,
    /// When the API stops accepting the token
    pub expires_at: i64,
    /// When the token was issued
    pub issued_at: i64,
}

impl CachedToken {
    /// Returns `true` if the token is usable at `now_ms` without a refresh,
    /// i.e. it is further than `buffer` away from expiry.
    pub fn is_fresh(&self, now_ms: i64, buffer: Duration) -> bool {
        now_ms < self.expires_at.saturating_sub(duration_millis(buffer))
    }
}

/// A token as handed out by the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Opaque bearer value
    pub value: String,
    /// Lifetime counted from now
    pub expires_in: Duration,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("value", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Something that can issue a new bearer token.
///
/// [`HttpTokenSource`] talks to the brokerage's OAuth endpoint. Tests and
/// alternative deployments plug in their own implementation.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Requests a brand-new token.
    async fn fetch_token(&self) -> Result<IssuedToken, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<Value>,
}

/// `expires_in` arrives as a number from the live API and as a string from
/// some sandbox deployments.
fn parse_expires_in(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// OAuth client-credentials token source.
pub struct HttpTokenSource {
    client: reqwest::Client,
    url: String,
    endpoint: TokenEndpointConfig,
    timeout: Duration,
}

impl HttpTokenSource {
    /// Creates a token source posting to `{base_url}{endpoint.token_path}`.
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        endpoint: TokenEndpointConfig,
        timeout: Duration,
    ) -> Self {
        let url = format!("{}{}", base_url.trim_end_matches('/'), endpoint.token_path);
        Self {
            client,
            url,
            endpoint,
            timeout,
        }
    }

    async fn request_token(&self) -> Result<IssuedToken, GatewayError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("appkey", self.endpoint.app_key.as_str()),
            ("appsecretkey", self.endpoint.app_secret.as_str()),
            ("scope", self.endpoint.scope.as_str()),
        ];

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let payload = serde_json::from_str(&text).unwrap_or(Value::String(text));
            return Err(GatewayError::Api {
                status: status.as_u16(),
                payload,
            });
        }

        let body: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Token(format!("Malformed token response: {e}")))?;

        let value = body
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| GatewayError::Token("Token response has no access_token".into()))?;

        let expires_in = body
            .expires_in
            .as_ref()
            .and_then(parse_expires_in)
            .filter(|secs| *secs > 0)
            .ok_or_else(|| GatewayError::Token("Token response has no usable expires_in".into()))?;

        Ok(IssuedToken {
            value,
            expires_in: Duration::from_secs(expires_in),
        })
    }
}

impl std::fmt::Debug for HttpTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTokenSource")
            .field("url", &self.url)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_token(&self) -> Result<IssuedToken, GatewayError> {
        self.request_token().await.map_err(translate)
    }
}

/// Ownership of the refresh lock.
///
/// Normal paths call [`release`](Self::release). If the guard is dropped
/// while still held, a release is spawned on the current runtime. Either way
/// the key is only deleted while it still carries this guard's owner id.
struct RefreshLockGuard {
    store: Arc<dyn CredentialStore>,
    key: String,
    owner: String,
    released: bool,
}

impl RefreshLockGuard {
    async fn release(mut self) {
        self.released = true;
        match self.store.delete_if_equals(&self.key, &self.owner).await {
            Ok(true) => debug!(lock = %self.key, "Refresh lock released"),
            Ok(false) => warn!(lock = %self.key, "Refresh lock expired before it was released"),
            Err(e) => warn!(lock = %self.key, error = %e, "Failed to release refresh lock"),
        }
    }
}

impl Drop for RefreshLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.key, "Refresh lock dropped outside a runtime, left to expire");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = store.delete_if_equals(&key, &owner).await {
                warn!(lock = %key, error = %e, "Failed to release abandoned refresh lock");
            }
        });
    }
}

/// What a caller is prepared to accept as a result of the refresh protocol.
#[derive(Debug, Clone, Copy)]
enum Wanted<'a> {
    /// Any token outside the refresh buffer.
    Fresh,
    /// A fresh token that is not the one the API just rejected.
    Replacing(Option<&'a str>),
}

impl Wanted<'_> {
    fn accepts(&self, token: &CachedToken, now_ms: i64, buffer: Duration) -> bool {
        match self {
            Self::Fresh => token.is_fresh(now_ms, buffer),
            Self::Replacing(rejected) => {
                token.is_fresh(now_ms, buffer) && Some(token.value.as_str()) != *rejected
            }
        }
    }
}

/// Read-through cache of the bearer token with cross-process refresh.
///
/// Key layout in the credential store (`id` is the configured credential id):
///
/// - `token:{id}` holds the JSON-encoded [`CachedToken`], expiring with it
/// - `lock:{id}` holds the owner id of the process currently refreshing
///
/// At most one process calls the token endpoint at a time. A process that
/// finds the lock taken polls the cached token every `lock_poll_interval` up
/// to `lock_retry_bound()` times. If the lock disappears without a usable
/// token appearing (the holder failed), a poller tries to take the lock
/// itself.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    source: Arc<dyn TokenSource>,
    token_key: String,
    lock_key: String,
    refresh_buffer: Duration,
    lock_ttl: Duration,
    poll_interval: Duration,
    max_polls: u32,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl TokenManager {
    /// Creates a token manager for the credential named in `config`.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        source: Arc<dyn TokenSource>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            store,
            source,
            token_key: format!("token:{}", config.credential_id),
            lock_key: format!("lock:{}", config.credential_id),
            refresh_buffer: config.token_refresh_buffer,
            lock_ttl: config.lock_ttl,
            poll_interval: config.lock_poll_interval,
            max_polls: config.lock_retry_bound(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Attaches a metrics collector.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[cfg(feature = "metrics")]
    async fn record(&self, event: MetricEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.record_event(event).await;
        }
    }

    /// Store key of the cached token.
    pub fn token_key(&self) -> &str {
        &self.token_key
    }

    /// Store key of the refresh lock.
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Reads the cached token, if any.
    ///
    /// An entry that cannot be decoded is reported as absent so that the next
    /// refresh overwrites it.
    pub async fn cached_token(&self) -> Result<Option<CachedToken>, GatewayError> {
        let Some(raw) = self.store.get(&self.token_key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(key = %self.token_key, error = %e, "Ignoring undecodable cached token");
                Ok(None)
            }
        }
    }

    /// Returns a token that is not within the refresh buffer of expiry,
    /// refreshing it first if necessary.
    pub async fn get_valid_token(&self) -> Result<String, GatewayError> {
        let now = current_timestamp_millis()?;
        if let Some(token) = self.cached_token().await? {
            if token.is_fresh(now, self.refresh_buffer) {
                debug!(credential = %self.token_key, "Token cache hit");
                return Ok(token.value);
            }
            debug!(credential = %self.token_key, "Cached token is near expiry");
        }
        self.refresh(Wanted::Fresh).await
    }

    /// Replaces the currently cached token, regardless of its expiry.
    pub async fn force_refresh(&self) -> Result<String, GatewayError> {
        let current = self.cached_token().await?.map(|token| token.value);
        info!(credential = %self.token_key, "Forcing token refresh");
        self.refresh(Wanted::Replacing(current.as_deref())).await
    }

    /// Replaces `rejected`, a token the API refused.
    ///
    /// If another caller already replaced it, the replacement is returned
    /// without contacting the token endpoint again.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<String, GatewayError> {
        info!(credential = %self.token_key, "Token rejected by the API, refreshing");
        self.refresh(Wanted::Replacing(Some(rejected))).await
    }

    /// Deletes the cached token so the next call refreshes.
    pub async fn invalidate(&self) -> Result<(), GatewayError> {
        if self.store.delete(&self.token_key).await? {
            info!(credential = %self.token_key, "Cached token invalidated");
        }
        Ok(())
    }

    async fn refresh(&self, wanted: Wanted<'_>) -> Result<String, GatewayError> {
        let mut polls = 0u32;

        loop {
            let owner = Uuid::new_v4().to_string();
            if self
                .store
                .set_if_absent(&self.lock_key, &owner, self.lock_ttl)
                .await?
            {
                debug!(lock = %self.lock_key, "Refresh lock acquired");
                let guard = RefreshLockGuard {
                    store: Arc::clone(&self.store),
                    key: self.lock_key.clone(),
                    owner,
                    released: false,
                };
                let result = self.refresh_holding_lock(wanted).await;
                guard.release().await;
                return result;
            }

            debug!(lock = %self.lock_key, "Refresh lock held elsewhere, polling");
            let mut lock_vanished = false;
            while polls < self.max_polls {
                tokio::time::sleep(self.poll_interval).await;
                polls += 1;

                let now = current_timestamp_millis()?;
                if let Some(token) = self.cached_token().await? {
                    if wanted.accepts(&token, now, self.refresh_buffer) {
                        debug!(polls, "Token refreshed by another holder");
                        #[cfg(feature = "metrics")]
                        self.record(MetricEvent::LockContention { polls, resolved: true })
                            .await;
                        return Ok(token.value);
                    }
                }

                if self.store.get(&self.lock_key).await?.is_none() {
                    debug!(polls, "Refresh lock vanished without a new token, retrying");
                    lock_vanished = true;
                    break;
                }
            }

            // A free lock always earns one more acquisition attempt
            if !lock_vanished && polls >= self.max_polls {
                warn!(
                    lock = %self.lock_key,
                    attempts = polls,
                    "Gave up waiting for another holder to refresh the token"
                );
                #[cfg(feature = "metrics")]
                self.record(MetricEvent::LockContention {
                    polls,
                    resolved: false,
                })
                .await;
                return Err(GatewayError::TokenUnavailable { attempts: polls });
            }
        }
    }

    async fn refresh_holding_lock(&self, wanted: Wanted<'_>) -> Result<String, GatewayError> {
        // Someone may have refreshed between our read and the lock acquisition
        if let Some(token) = self.cached_token().await? {
            if wanted.accepts(&token, current_timestamp_millis()?, self.refresh_buffer) {
                debug!("Token already refreshed, skipping token endpoint");
                return Ok(token.value);
            }
        }

        let started = Instant::now();
        let fetched = self.source.fetch_token().await;

        #[cfg(feature = "metrics")]
        self.record(MetricEvent::TokenRefresh {
            duration: started.elapsed(),
            success: fetched.is_ok(),
        })
        .await;

        let issued = match fetched {
            Ok(issued) => issued,
            Err(e) => {
                warn!(error = %e, "Token endpoint call failed");
                return Err(e);
            }
        };

        if issued.expires_in <= self.refresh_buffer {
            warn!(
                expires_in_secs = issued.expires_in.as_secs(),
                buffer_secs = self.refresh_buffer.as_secs(),
                "Token lifetime does not exceed the refresh buffer; every call will refresh"
            );
        }

        let issued_at = current_timestamp_millis()?;
        let cached = CachedToken {
            value: issued.value,
            expires_at: issued_at.saturating_add(duration_millis(issued.expires_in)),
            issued_at,
        };
        let encoded = serde_json::to_string(&cached)
            .map_err(|e| GatewayError::Token(format!("Cannot encode token: {e}")))?;

        self.store
            .set(&self.token_key, &encoded, Some(issued.expires_in))
            .await?;

        info!(
            credential = %self.token_key,
            expires_in_secs = issued.expires_in.as_secs(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Token refreshed"
        );

        Ok(cached.value)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("token_key", &self.token_key)
            .field("lock_key", &self.lock_key)
            .field("refresh_buffer", &self.refresh_buffer)
            .field("lock_ttl", &self.lock_ttl)
            .field("poll_interval", &self.poll_interval)
            .field("max_polls", &self.max_polls)
            .finish()
    }
}
