use serde_json::Value;
use thiserror::Error;

/// Code carried by every [`DomainError`] that stems from a transport failure.
pub const NETWORK_CODE: &str = "NETWORK";

const NETWORK_MESSAGE: &str = "Network error while contacting the brokerage API";

/// Normalized error returned to callers of the gateway.
///
/// A `DomainError` carries a stable, machine-readable `code` that does not
/// depend on transport details. For failures reported by the brokerage API the
/// code is the HTTP status the API answered with (for example `"404"`), and the
/// message is taken from the response payload. Transport failures without a
/// response (timeouts, refused connections, DNS) always use [`NETWORK_CODE`].
///
/// # Example
///
/// ```rust
/// use market_gateway::DomainError;
///
/// let err = DomainError::new("404", "no such symbol");
/// assert_eq!(err.code, "404");
/// assert_eq!(err.http_status(), 404);
///
/// let err = DomainError::network();
/// assert_eq!(err.http_status(), 502);
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{code}] {message}")]
pub struct DomainError {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable message, usually the API's `rsp_msg`
    pub message: String,
    /// The response body the error was built from, when there was one
    pub raw_payload: Option<Value>,
}

impl DomainError {
    /// Creates a domain error without a raw payload.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            raw_payload: None,
        }
    }

    /// Creates the generic error used for every transport-level failure.
    pub fn network() -> Self {
        Self::new(NETWORK_CODE, NETWORK_MESSAGE)
    }

    /// Attaches the raw response payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.raw_payload = Some(payload);
        self
    }

    /// Returns `true` if this error represents a transport failure.
    pub fn is_network(&self) -> bool {
        self.code == NETWORK_CODE
    }

    /// The API's own application code (`rsp_cd`), if the payload carried one.
    pub fn application_code(&self) -> Option<&str> {
        self.raw_payload
            .as_ref()
            .and_then(|payload| payload.get("rsp_cd"))
            .and_then(Value::as_str)
    }

    /// Maps the code to the status an outward-facing HTTP layer should answer with.
    ///
    /// Client errors pass through, upstream server errors and transport
    /// failures become `502 Bad Gateway`, anything unrecognised becomes `500`.
    pub fn http_status(&self) -> u16 {
        match self.code.parse::<u16>() {
            Ok(status @ 400..=499) => status,
            Ok(500..=599) => 502,
            Ok(_) => 500,
            Err(_) if self.is_network() => 502,
            Err(_) => 500,
        }
    }
}

/// Error type for every gateway operation.
///
/// # Error Categories
///
/// - **Domain**: `Domain`, an API or network failure after translation
/// - **Token**: `Token`, `TokenUnavailable`
/// - **Untranslated**: `Api` and `Transport` hold raw failures before they pass the
///   error translator; callers normally only see these when a transport error
///   is not a network condition (for example a malformed request)
/// - **System**: `Decode`, `Storage`, `Config`
///
/// # Example
///
/// ```rust
/// use market_gateway::{DomainError, GatewayError};
///
/// let err = GatewayError::Domain(DomainError::network());
/// assert_eq!(err.code(), "NETWORK");
///
/// let err = GatewayError::TokenUnavailable { attempts: 50 };
/// assert_eq!(err.code(), "TOKEN_UNAVAILABLE");
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The brokerage API reported a failure, or the network failed.
    #[error("{0}")]
    Domain(#[from] DomainError),

    /// No valid token appeared while another process held the refresh lock.
    #[error("Token unavailable after {attempts} polling attempts")]
    TokenUnavailable {
        /// Number of polls made before giving up
        attempts: u32,
    },

    /// The token endpoint answered with something that is not a usable token.
    #[error("Token error: {0}")]
    Token(String),

    /// A non-success HTTP response, before translation.
    #[error("API responded with status {status}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Parsed response body, or the raw text wrapped in a JSON string
        payload: Value,
    },

    /// A transport error, before translation.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A response did not match the expected schema.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The credential store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> String {
        match self {
            Self::Domain(domain) => domain.code.clone(),
            Self::TokenUnavailable { .. } => "TOKEN_UNAVAILABLE".to_string(),
            Self::Token(_) => "TOKEN_ERROR".to_string(),
            Self::Api { status, .. } => status.to_string(),
            Self::Transport(_) => "TRANSPORT".to_string(),
            Self::Decode(_) => "DECODE".to_string(),
            Self::Storage(_) => "STORAGE".to_string(),
            Self::Config(_) => "CONFIG".to_string(),
        }
    }

    /// Returns the domain error if this is one.
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(domain) => Some(domain),
            _ => None,
        }
    }

    #[cfg(any(feature = "sqlite-store", feature = "redis-store"))]
    pub(crate) fn from_storage_message(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    #[cfg(feature = "sqlite-store")]
    pub(crate) fn from_database_error(err: rusqlite::Error) -> Self {
        Self::Storage(format!("SQLite error: {err}"))
    }

    #[cfg(feature = "redis-store")]
    pub(crate) fn from_redis_error(err: redis::RedisError) -> Self {
        Self::Storage(format!("Redis error: {err}"))
    }
}
