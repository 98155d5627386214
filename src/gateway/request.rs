//! Request and response values exchanged with the brokerage API.

use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the operation code.
pub const TR_CD_HEADER: &str = "tr_cd";
/// Header carrying the continuation flag (`"Y"` or `"N"`).
pub const TR_CONT_HEADER: &str = "tr_cont";
/// Header carrying the opaque continuation key.
pub const TR_CONT_KEY_HEADER: &str = "tr_cont_key";

/// Continuation state sent with a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Continuation {
    /// Whether this request continues a previous one
    pub flag: bool,
    /// Opaque key returned by the previous response
    pub key: Option<String>,
}

impl Continuation {
    /// Continuation of a previous response that returned `key`.
    pub fn next(key: Option<String>) -> Self {
        Self { flag: true, key }
    }

    pub(crate) fn flag_header(&self) -> &'static str {
        if self.flag { "Y" } else { "N" }
    }
}

/// Everything needed to issue one call.
///
/// # Example
///
/// ```rust
/// use market_gateway::RequestDescriptor;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let descriptor = RequestDescriptor::new(
///     "t1102",
///     "/stock/market-data",
///     json!({"t1102InBlock": {"shcode": "005930"}}),
/// )
/// .with_timeout(Duration::from_secs(3));
///
/// assert_eq!(descriptor.operation_code, "t1102");
/// assert!(descriptor.continuation.is_none());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// Operation code, sent as `tr_cd` and used as the rate-limiter key
    pub operation_code: String,
    /// Path appended to the base URL
    pub path: String,
    /// JSON request body
    pub body: Value,
    /// Continuation to send; `None` sends `tr_cont: N`
    pub continuation: Option<Continuation>,
    /// Per-request timeout replacing the configured default
    pub timeout_override: Option<Duration>,
}

impl RequestDescriptor {
    /// Creates a descriptor without continuation or timeout override.
    pub fn new(operation_code: impl Into<String>, path: impl Into<String>, body: Value) -> Self {
        Self {
            operation_code: operation_code.into(),
            path: path.into(),
            body,
            continuation: None,
            timeout_override: None,
        }
    }

    /// Overrides the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    /// Sets the continuation to send.
    pub fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = Some(continuation);
        self
    }

    /// A copy of this descriptor carrying `continuation` (or none).
    pub(crate) fn continued(&self, continuation: Option<Continuation>) -> Self {
        Self {
            continuation,
            ..self.clone()
        }
    }
}

/// Pagination state read from response headers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContinuationCursor {
    /// The API has more data for this query
    pub has_more: bool,
    /// Key to send with the next request
    pub next_key: Option<String>,
}

impl ContinuationCursor {
    /// Reads `tr_cont` and `tr_cont_key`. Anything but `Y` means no more data.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        Self {
            has_more: header(TR_CONT_HEADER).is_some_and(|flag| flag.eq_ignore_ascii_case("y")),
            next_key: header(TR_CONT_KEY_HEADER).map(str::to_string),
        }
    }

    /// The continuation to send next, if there is more data.
    pub fn next_continuation(&self) -> Option<Continuation> {
        self.has_more
            .then(|| Continuation::next(self.next_key.clone()))
    }
}

/// A parsed body together with the pagination headers of its response.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuedResponse {
    /// Parsed JSON body (`Null` for an empty body)
    pub body: Value,
    /// Continuation state from the response headers
    pub continuation: ContinuationCursor,
}

/// Common envelope of every API response with a typed output block.
///
/// ```rust
/// use market_gateway::ApiEnvelope;
/// use serde::Deserialize;
///
/// #[derive(Debug, Deserialize)]
/// struct Quote {
///     #[serde(rename = "t1102OutBlock")]
///     out: QuoteBlock,
/// }
///
/// #[derive(Debug, Deserialize)]
/// struct QuoteBlock {
///     hname: String,
///     price: i64,
/// }
///
/// let envelope: ApiEnvelope<Quote> = serde_json::from_value(serde_json::json!({
///     "rsp_cd": "00000",
///     "rsp_msg": "ok",
///     "t1102OutBlock": {"hname": "Samsung", "price": 71000, "volume": 1}
/// }))
/// .unwrap();
///
/// assert_eq!(envelope.data.out.price, 71000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    /// Application response code
    #[serde(default)]
    pub rsp_cd: Option<String>,
    /// Application response message
    #[serde(default)]
    pub rsp_msg: Option<String>,
    /// Operation-specific output blocks
    #[serde(flatten)]
    pub data: T,
}
