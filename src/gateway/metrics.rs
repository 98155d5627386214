//! Metrics collection for gateway traffic.
//!
//! Collection is optional and enabled with the `metrics` feature. The gateway
//! reports [`MetricEvent`]s to a pluggable [`MetricsCollector`]; the default
//! [`InMemoryMetricsCollector`] keeps atomic counters.

use crate::GatewayError;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Snapshot of everything the gateway has counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayMetrics {
    /// Calls that went out to the API, retries included
    pub requests_sent: u64,
    /// Calls answered successfully
    pub request_successes: u64,
    /// Calls that failed for any reason
    pub request_failures: u64,
    /// Calls re-issued after the API rejected the token
    pub auth_retries: u64,
    /// Calls to the token endpoint
    pub token_refreshes: u64,
    /// Calls to the token endpoint that failed
    pub token_refresh_failures: u64,
    /// Refreshes served by waiting for another lock holder
    pub lock_waits: u64,
    /// Waits for another lock holder that ran out of polls
    pub lock_timeouts: u64,
    /// Calls that had to sleep for the rate limiter
    pub rate_limited_calls: u64,
    /// Pages yielded by pagination
    pub pages_fetched: u64,
    /// Paginations cut off by the page bound
    pub page_limit_stops: u64,
    /// Timing averages
    pub performance: PerformanceMetrics,
}

/// Timing averages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformanceMetrics {
    /// Average duration of an API call (microseconds)
    pub avg_request_time_us: u64,
    /// Average duration of a token endpoint call (microseconds)
    pub avg_refresh_time_us: u64,
    /// Average rate-limiter sleep among calls that slept (microseconds)
    pub avg_rate_limit_wait_us: u64,
}

/// Events reported by the gateway.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    /// One HTTP call to the API finished
    Request {
        /// Operation code of the call
        operation_code: String,
        /// Time from send to parsed body
        duration: Duration,
        /// Whether the call succeeded
        success: bool,
    },
    /// A call is re-issued after a token refresh
    AuthRetry {
        /// Operation code of the call
        operation_code: String,
    },
    /// The token endpoint was called
    TokenRefresh {
        /// Time the endpoint took
        duration: Duration,
        /// Whether a token was issued
        success: bool,
    },
    /// A refresh was left to another lock holder
    LockContention {
        /// Number of polls made
        polls: u32,
        /// Whether a token appeared before the poll bound
        resolved: bool,
    },
    /// The rate limiter delayed a call
    RateLimitWait {
        /// Operation code of the call
        operation_code: String,
        /// Time slept
        waited: Duration,
    },
    /// Pagination yielded a page
    PageFetched {
        /// Operation code of the pagination
        operation_code: String,
    },
    /// Pagination stopped at the page bound while the API had more data
    PageLimitReached {
        /// Operation code of the pagination
        operation_code: String,
        /// The bound that was hit
        max_pages: usize,
    },
}

/// Trait for metrics collection backends.
///
/// All methods may be called concurrently from many tasks.
///
/// # Example Implementation
///
/// ```rust
/// use market_gateway::metrics::{GatewayMetrics, MetricEvent, MetricsCollector};
/// use async_trait::async_trait;
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// #[derive(Default)]
/// pub struct RetryCounter {
///     retries: AtomicU64,
/// }
///
/// #[async_trait]
/// impl MetricsCollector for RetryCounter {
///     async fn record_event(&self, event: MetricEvent) {
///         if let MetricEvent::AuthRetry { .. } = event {
///             self.retries.fetch_add(1, Ordering::Relaxed);
///         }
///     }
///
///     async fn get_metrics(&self) -> Result<GatewayMetrics, market_gateway::GatewayError> {
///         Ok(GatewayMetrics {
///             auth_retries: self.retries.load(Ordering::Relaxed),
///             ..GatewayMetrics::default()
///         })
///     }
///
///     async fn reset_metrics(&self) -> Result<(), market_gateway::GatewayError> {
///         self.retries.store(0, Ordering::Relaxed);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Record a metric event. Called on the request path, so keep it cheap.
    async fn record_event(&self, event: MetricEvent);

    /// Point-in-time snapshot of all collected metrics.
    async fn get_metrics(&self) -> Result<GatewayMetrics, GatewayError>;

    /// Reset all metrics to zero.
    async fn reset_metrics(&self) -> Result<(), GatewayError>;

    /// Flush buffered metrics to an external system, if any.
    async fn flush(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// In-memory metrics collector backed by atomic counters.
///
/// # Example
///
/// ```rust
/// use market_gateway::metrics::{InMemoryMetricsCollector, MetricEvent, MetricsCollector};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), market_gateway::GatewayError> {
/// let collector = InMemoryMetricsCollector::new();
///
/// collector.record_event(MetricEvent::Request {
///     operation_code: "t1102".to_string(),
///     duration: Duration::from_millis(40),
///     success: true,
/// }).await;
///
/// let metrics = collector.get_metrics().await?;
/// println!("Requests sent: {}", metrics.requests_sent);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryMetricsCollector {
    requests_sent: AtomicU64,
    request_successes: AtomicU64,
    request_failures: AtomicU64,
    auth_retries: AtomicU64,
    token_refreshes: AtomicU64,
    token_refresh_failures: AtomicU64,
    lock_waits: AtomicU64,
    lock_timeouts: AtomicU64,
    rate_limited_calls: AtomicU64,
    pages_fetched: AtomicU64,
    page_limit_stops: AtomicU64,

    request_time_total: AtomicU64,
    refresh_time_total: AtomicU64,
    rate_limit_wait_total: AtomicU64,
}

impl InMemoryMetricsCollector {
    /// Create a new in-memory metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> [&AtomicU64; 14] {
        [
            &self.requests_sent,
            &self.request_successes,
            &self.request_failures,
            &self.auth_retries,
            &self.token_refreshes,
            &self.token_refresh_failures,
            &self.lock_waits,
            &self.lock_timeouts,
            &self.rate_limited_calls,
            &self.pages_fetched,
            &self.page_limit_stops,
            &self.request_time_total,
            &self.refresh_time_total,
            &self.rate_limit_wait_total,
        ]
    }
}

fn average(total: &AtomicU64, samples: u64) -> u64 {
    if samples > 0 {
        total.load(Ordering::Relaxed) / samples
    } else {
        0
    }
}

#[async_trait]
impl MetricsCollector for InMemoryMetricsCollector {
    async fn record_event(&self, event: MetricEvent) {
        match event {
            MetricEvent::Request {
                duration, success, ..
            } => {
                self.requests_sent.fetch_add(1, Ordering::Relaxed);
                if success {
                    self.request_successes.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.request_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.request_time_total
                    .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
            }
            MetricEvent::AuthRetry { .. } => {
                self.auth_retries.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::TokenRefresh { duration, success } => {
                self.token_refreshes.fetch_add(1, Ordering::Relaxed);
                if !success {
                    self.token_refresh_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.refresh_time_total
                    .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
            }
            MetricEvent::LockContention { resolved, .. } => {
                if resolved {
                    self.lock_waits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                }
            }
            MetricEvent::RateLimitWait { waited, .. } => {
                self.rate_limited_calls.fetch_add(1, Ordering::Relaxed);
                self.rate_limit_wait_total
                    .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
            }
            MetricEvent::PageFetched { .. } => {
                self.pages_fetched.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::PageLimitReached { .. } => {
                self.page_limit_stops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn get_metrics(&self) -> Result<GatewayMetrics, GatewayError> {
        let requests_sent = self.requests_sent.load(Ordering::Relaxed);
        let token_refreshes = self.token_refreshes.load(Ordering::Relaxed);
        let rate_limited_calls = self.rate_limited_calls.load(Ordering::Relaxed);

        Ok(GatewayMetrics {
            requests_sent,
            request_successes: self.request_successes.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            auth_retries: self.auth_retries.load(Ordering::Relaxed),
            token_refreshes,
            token_refresh_failures: self.token_refresh_failures.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            rate_limited_calls,
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            page_limit_stops: self.page_limit_stops.load(Ordering::Relaxed),
            performance: PerformanceMetrics {
                avg_request_time_us: average(&self.request_time_total, requests_sent),
                avg_refresh_time_us: average(&self.refresh_time_total, token_refreshes),
                avg_rate_limit_wait_us: average(&self.rate_limit_wait_total, rate_limited_calls),
            },
        })
    }

    async fn reset_metrics(&self) -> Result<(), GatewayError> {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Collector that discards every event.
#[derive(Debug, Default)]
pub struct NoOpMetricsCollector;

impl NoOpMetricsCollector {
    /// Create a new no-op metrics collector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsCollector for NoOpMetricsCollector {
    async fn record_event(&self, _event: MetricEvent) {}

    async fn get_metrics(&self) -> Result<GatewayMetrics, GatewayError> {
        Ok(GatewayMetrics::default())
    }

    async fn reset_metrics(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// Times an operation and reports it as a [`MetricEvent::Request`].
pub struct MetricsTimer {
    collector: Arc<dyn MetricsCollector>,
    start_time: Instant,
}

impl MetricsTimer {
    /// Starts timing now.
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self {
            collector,
            start_time: Instant::now(),
        }
    }

    /// Time since the timer was started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Records the request outcome with the elapsed time.
    pub async fn finish_request(self, operation_code: &str, success: bool) {
        let duration = self.elapsed();
        self.collector
            .record_event(MetricEvent::Request {
                operation_code: operation_code.to_string(),
                duration,
                success,
            })
            .await;
    }
}
