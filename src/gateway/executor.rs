//! Single API calls with auth-failure recovery.
//!
//! Every call takes a rate-limiter slot, attaches the current bearer token
//! and the operation headers, and parses the body. If the API rejects the
//! token, the executor replaces it once and re-issues the call once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "metrics")]
use super::metrics::{MetricEvent, MetricsCollector, MetricsTimer};

use super::config::GatewayConfig;
use super::error::GatewayError;
use super::rate_limiter::RateLimiter;
use super::request::{
    ContinuationCursor, ContinuedResponse, RequestDescriptor, TR_CD_HEADER, TR_CONT_HEADER,
    TR_CONT_KEY_HEADER,
};
use super::token::TokenManager;
use super::translator::translate;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Where a call stands. Each phase is visited at most once per call.
enum Phase {
    Init,
    Sent {
        token: String,
        outcome: Result<ContinuedResponse, GatewayError>,
    },
    Refreshing {
        rejected: String,
    },
    Retried {
        outcome: Result<ContinuedResponse, GatewayError>,
    },
    Done(ContinuedResponse),
    Failed(GatewayError),
}

/// Issues calls against the brokerage API.
pub struct RequestExecutor {
    client: reqwest::Client,
    base_url: String,
    default_timeout: Duration,
    auth_failure_codes: Vec<String>,
    limiter: Arc<RateLimiter>,
    tokens: Arc<TokenManager>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl RequestExecutor {
    /// Creates an executor sharing `limiter` and `tokens` with the rest of
    /// the gateway.
    pub fn new(
        client: reqwest::Client,
        config: &GatewayConfig,
        limiter: Arc<RateLimiter>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_timeout: config.request_timeout,
            auth_failure_codes: config.auth_failure_codes.clone(),
            limiter,
            tokens,
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

    /// Issues the call and returns the parsed body.
    pub async fn execute(&self, descriptor: &RequestDescriptor) -> Result<Value, GatewayError> {
        self.execute_with_continuation(descriptor)
            .await
            .map(|response| response.body)
    }

    /// Issues the call and returns the parsed body with the continuation
    /// state of the response headers.
    ///
    /// Failures other than a rejected token are never retried. API and
    /// network failures leave as [`GatewayError::Domain`].
    #[instrument(skip(self, descriptor), fields(tr_cd = %descriptor.operation_code, path = %descriptor.path))]
    pub async fn execute_with_continuation(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<ContinuedResponse, GatewayError> {
        let mut phase = Phase::Init;

        loop {
            phase = match phase {
                Phase::Init => {
                    self.wait_for_slot(&descriptor.operation_code).await;
                    match self.tokens.get_valid_token().await {
                        Ok(token) => Phase::Sent {
                            outcome: self.send_once(descriptor, &token).await,
                            token,
                        },
                        Err(e) => Phase::Failed(e),
                    }
                }
                Phase::Sent { token, outcome } => match outcome {
                    Ok(response) => Phase::Done(response),
                    Err(e) if self.is_auth_failure(&e) => {
                        info!(status = %e.code(), "API rejected the token");
                        Phase::Refreshing { rejected: token }
                    }
                    Err(e) => Phase::Failed(e),
                },
                Phase::Refreshing { rejected } => {
                    match self.tokens.refresh_rejected(&rejected).await {
                        Ok(token) => {
                            #[cfg(feature = "metrics")]
                            self.record(MetricEvent::AuthRetry {
                                operation_code: descriptor.operation_code.clone(),
                            })
                            .await;
                            self.wait_for_slot(&descriptor.operation_code).await;
                            debug!("Retrying with refreshed token");
                            Phase::Retried {
                                outcome: self.send_once(descriptor, &token).await,
                            }
                        }
                        Err(e) => Phase::Failed(e),
                    }
                }
                Phase::Retried { outcome } => match outcome {
                    Ok(response) => Phase::Done(response),
                    Err(e) => {
                        if self.is_auth_failure(&e) {
                            warn!("API rejected the refreshed token as well");
                        }
                        Phase::Failed(e)
                    }
                },
                Phase::Done(response) => return Ok(response),
                Phase::Failed(e) => return Err(translate(e)),
            };
        }
    }

    async fn wait_for_slot(&self, operation_code: &str) {
        let waited = self.limiter.acquire_slot(operation_code).await;
        if !waited.is_zero() {
            #[cfg(feature = "metrics")]
            self.record(MetricEvent::RateLimitWait {
                operation_code: operation_code.to_string(),
                waited,
            })
            .await;
        }
    }

    /// The API rejected the token: HTTP 401, or an error response whose
    /// `rsp_cd` is one of the configured auth failure codes.
    fn is_auth_failure(&self, error: &GatewayError) -> bool {
        match error {
            GatewayError::Api { status: 401, .. } => true,
            GatewayError::Api { payload, .. } => payload
                .get("rsp_cd")
                .and_then(Value::as_str)
                .is_some_and(|code| self.auth_failure_codes.iter().any(|c| c == code)),
            _ => false,
        }
    }

    async fn send_once(
        &self,
        descriptor: &RequestDescriptor,
        token: &str,
    ) -> Result<ContinuedResponse, GatewayError> {
        #[cfg(feature = "metrics")]
        let timer = self.metrics.as_ref().map(|m| MetricsTimer::new(Arc::clone(m)));
        let started = Instant::now();
        let result = self.send_request(descriptor, token).await;

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "API call finished"
        );
        #[cfg(feature = "metrics")]
        if let Some(timer) = timer {
            timer
                .finish_request(&descriptor.operation_code, result.is_ok())
                .await;
        }

        result
    }

    async fn send_request(
        &self,
        descriptor: &RequestDescriptor,
        token: &str,
    ) -> Result<ContinuedResponse, GatewayError> {
        let url = format!("{}{}", self.base_url, descriptor.path);
        let continuation = descriptor.continuation.clone().unwrap_or_default();

        let mut request = self
            .client
            .post(url)
            .timeout(descriptor.timeout_override.unwrap_or(self.default_timeout))
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .bearer_auth(token)
            .header(TR_CD_HEADER, descriptor.operation_code.as_str())
            .header(TR_CONT_HEADER, continuation.flag_header());

        if let Some(key) = continuation.key.as_deref() {
            request = request.header(TR_CONT_KEY_HEADER, key);
        }

        let response = request.body(descriptor.body.to_string()).send().await?;

        let status = response.status();
        let cursor = ContinuationCursor::from_headers(response.headers());
        let text = response.text().await?;

        if !status.is_success() {
            let payload = serde_json::from_str(&text).unwrap_or(Value::String(text));
            return Err(GatewayError::Api {
                status: status.as_u16(),
                payload,
            });
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                GatewayError::Decode(format!("Response to {} is not JSON: {e}", descriptor.operation_code))
            })?
        };

        Ok(ContinuedResponse {
            body,
            continuation: cursor,
        })
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("base_url", &self.base_url)
            .field("default_timeout", &self.default_timeout)
            .field("auth_failure_codes", &self.auth_failure_codes)
            .finish()
    }
}
