//! Header-driven pagination.
//!
//! [`Pages`] is a pull-based cursor over one query: every call to
//! [`Pages::next_page`] issues at most one API call, sending the continuation
//! returned by the previous page. Iteration ends when the API stops
//! signalling more data or the page bound is reached, whichever comes first.

use std::sync::Arc;

use futures::Stream;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::GatewayError;
use super::executor::RequestExecutor;
use super::request::{Continuation, RequestDescriptor};

#[cfg(feature = "metrics")]
use super::metrics::{MetricEvent, MetricsCollector};

/// One page of a paginated query.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Parsed response body
    pub data: Value,
    /// The API has more data after this page
    pub has_more: bool,
    /// Continuation key for the next page
    pub next_key: Option<String>,
}

/// Why a pagination stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The API reported no more data.
    Exhausted,
    /// The page bound was reached while the API still had more data.
    PageLimit,
    /// A page request failed.
    Failed,
}

/// Lazy sequence of pages for one query.
///
/// Created by [`Gateway::paginate`](crate::Gateway::paginate). Instances
/// never share state, so several paginations may run side by side.
///
/// ```rust,no_run
/// # use market_gateway::{Gateway, RequestDescriptor, StopReason};
/// # async fn example(gateway: Gateway) -> Result<(), market_gateway::GatewayError> {
/// let descriptor = RequestDescriptor::new("t8412", "/stock/chart", serde_json::json!({}));
/// let mut pages = gateway.paginate(descriptor, Some(10));
///
/// while let Some(page) = pages.next_page().await? {
///     println!("{}", page.data);
/// }
/// if pages.stop_reason() == Some(StopReason::PageLimit) {
///     println!("more data available than fetched");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Pages {
    executor: Arc<RequestExecutor>,
    descriptor: RequestDescriptor,
    next: Option<Continuation>,
    fetched: usize,
    max_pages: usize,
    stop: Option<StopReason>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl Pages {
    pub(crate) fn new(
        executor: Arc<RequestExecutor>,
        descriptor: RequestDescriptor,
        max_pages: usize,
    ) -> Self {
        Self {
            executor,
            descriptor,
            next: None,
            fetched: 0,
            max_pages,
            stop: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn with_metrics(mut self, metrics: Option<Arc<dyn MetricsCollector>>) -> Self {
        self.metrics = metrics;
        self
    }

    #[cfg(feature = "metrics")]
    async fn record(&self, event: MetricEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.record_event(event).await;
        }
    }

    /// Number of pages yielded so far.
    pub fn pages_fetched(&self) -> usize {
        self.fetched
    }

    /// Why iteration ended, or `None` while pages may still follow.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    /// Fetches the next page, or returns `None` once iteration has ended.
    ///
    /// After an error the sequence is over and further calls return `None`.
    pub async fn next_page(&mut self) -> Result<Option<Page>, GatewayError> {
        if self.stop.is_some() {
            return Ok(None);
        }
        if self.fetched >= self.max_pages {
            self.stop_at_limit().await;
            return Ok(None);
        }

        let descriptor = self.descriptor.continued(self.next.take());
        let response = match self.executor.execute_with_continuation(&descriptor).await {
            Ok(response) => response,
            Err(e) => {
                self.stop = Some(StopReason::Failed);
                return Err(e);
            }
        };

        self.fetched += 1;
        let cursor = response.continuation;
        debug!(
            tr_cd = %self.descriptor.operation_code,
            page = self.fetched,
            has_more = cursor.has_more,
            "Fetched page"
        );
        #[cfg(feature = "metrics")]
        self.record(MetricEvent::PageFetched {
            operation_code: self.descriptor.operation_code.clone(),
        })
        .await;

        match cursor.next_continuation() {
            None => self.stop = Some(StopReason::Exhausted),
            Some(_) if self.fetched >= self.max_pages => self.stop_at_limit().await,
            next => self.next = next,
        }

        Ok(Some(Page {
            data: response.body,
            has_more: cursor.has_more,
            next_key: cursor.next_key,
        }))
    }

    async fn stop_at_limit(&mut self) {
        warn!(
            tr_cd = %self.descriptor.operation_code,
            max_pages = self.max_pages,
            "Page bound reached before the API ran out of data"
        );
        self.stop = Some(StopReason::PageLimit);
        #[cfg(feature = "metrics")]
        self.record(MetricEvent::PageLimitReached {
            operation_code: self.descriptor.operation_code.clone(),
            max_pages: self.max_pages,
        })
        .await;
    }

    /// The remaining pages as a [`Stream`]. The stream ends after the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Page, GatewayError>> + Send {
        futures::stream::unfold(self, |mut pages| async move {
            match pages.next_page().await {
                Ok(Some(page)) => Some((Ok(page), pages)),
                Ok(None) => None,
                Err(e) => Some((Err(e), pages)),
            }
        })
    }
}

impl std::fmt::Debug for Pages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pages")
            .field("operation_code", &self.descriptor.operation_code)
            .field("fetched", &self.fetched)
            .field("max_pages", &self.max_pages)
            .field("stop", &self.stop)
            .finish()
    }
}

/// Drains `pages` and concatenates the array named `array_field` of every
/// page, in page order.
///
/// A page whose field is `null` contributes nothing. A page without the field,
/// or where it is not an array, fails with [`GatewayError::Decode`].
pub async fn collect_all(mut pages: Pages, array_field: &str) -> Result<Vec<Value>, GatewayError> {
    let mut items = Vec::new();

    while let Some(page) = pages.next_page().await? {
        let field = match page.data {
            Value::Object(mut map) => map.remove(array_field),
            _ => None,
        };
        match field {
            Some(Value::Array(values)) => items.extend(values),
            Some(Value::Null) => {}
            Some(other) => {
                return Err(GatewayError::Decode(format!(
                    "Field '{array_field}' of page {} is not an array: {other}",
                    pages.pages_fetched()
                )));
            }
            None => {
                return Err(GatewayError::Decode(format!(
                    "Page {} has no field '{array_field}'",
                    pages.pages_fetched()
                )));
            }
        }
    }

    debug!(
        tr_cd = %pages.descriptor.operation_code,
        pages = pages.pages_fetched(),
        items = items.len(),
        "Collected all pages"
    );
    Ok(items)
}
