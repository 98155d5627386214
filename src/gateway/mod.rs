// Core components
mod client;
mod config;
mod error;
mod executor;
mod pagination;
mod rate_limiter;
mod request;
mod time_utils;
mod token;
mod translator;

// Credential store backends
pub mod storage;

// Metrics (optional feature)
#[cfg(feature = "metrics")]
pub mod metrics;

pub use client::{Gateway, GatewayBuilder};
pub use config::{
    ConfigPreset, DEFAULT_AUTH_FAILURE_CODES, DEFAULT_BASE_URL, DEFAULT_TOKEN_PATH, GatewayConfig,
    TokenEndpointConfig,
};
pub use error::{DomainError, GatewayError, NETWORK_CODE};
pub use executor::RequestExecutor;
pub use pagination::{Page, Pages, StopReason, collect_all};
pub use rate_limiter::RateLimiter;
pub use request::{
    ApiEnvelope, Continuation, ContinuationCursor, ContinuedResponse, RequestDescriptor,
    TR_CD_HEADER, TR_CONT_HEADER, TR_CONT_KEY_HEADER,
};
pub use token::{CachedToken, HttpTokenSource, IssuedToken, TokenManager, TokenSource};
pub use translator::{to_domain_error, translate};

pub use storage::{CredentialStore, MemoryStore, StoreStats};

#[cfg(feature = "metrics")]
pub use metrics::{
    GatewayMetrics, InMemoryMetricsCollector, MetricEvent, MetricsCollector, MetricsTimer,
    NoOpMetricsCollector, PerformanceMetrics,
};
