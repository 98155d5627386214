use std::collections::HashMap;
use std::time::Duration;

/// Production base URL of the brokerage API.
pub const DEFAULT_BASE_URL: &str = "https://openapi.ls-sec.co.kr:8080";

/// Path of the OAuth token endpoint, relative to the base URL.
pub const DEFAULT_TOKEN_PATH: &str = "/oauth2/token";

/// Application codes the API uses to report an invalid or expired token.
pub const DEFAULT_AUTH_FAILURE_CODES: &[&str] = &["IGW00121"];

/// Predefined configuration presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPreset {
    /// Production settings.
    ///
    /// - Request timeout: 10 seconds
    /// - Refresh buffer: 5 minutes before expiry
    /// - Lock TTL: 10 seconds, polled every 200 ms
    /// - Minimum interval per operation code: 1 second
    /// - Page bound: 100
    Production,

    /// Development settings.
    ///
    /// Longer request timeout for debugging, shorter lock TTL so a crashed
    /// local process does not stall the next run, and a small page bound.
    Development,

    /// Load configuration from `MARKET_GATEWAY_*` environment variables.
    ///
    /// See [`GatewayConfig`] for the list of variables.
    FromEnv,
}

/// Configuration of the gateway.
///
/// # Environment Variables
///
/// `GatewayConfig::default()` reads the following variables, falling back to
/// production values when a variable is unset or unparsable:
///
/// - `MARKET_GATEWAY_BASE_URL`
/// - `MARKET_GATEWAY_REQUEST_TIMEOUT_MS` (default: 10000)
/// - `MARKET_GATEWAY_TOKEN_REFRESH_BUFFER_MS` (default: 300000)
/// - `MARKET_GATEWAY_LOCK_TTL_MS` (default: 10000)
/// - `MARKET_GATEWAY_LOCK_POLL_INTERVAL_MS` (default: 200)
/// - `MARKET_GATEWAY_LOCK_MAX_RETRIES` (default: derived from TTL / poll interval)
/// - `MARKET_GATEWAY_DEFAULT_MIN_INTERVAL_MS` (default: 1000)
/// - `MARKET_GATEWAY_MIN_INTERVALS`, e.g. `t1102=1000,t8412=500`
/// - `MARKET_GATEWAY_MAX_PAGES` (default: 100)
/// - `MARKET_GATEWAY_CREDENTIAL_ID` (default: `default`)
/// - `MARKET_GATEWAY_AUTH_FAILURE_CODES`, comma separated
///
/// # Example
///
/// ```rust
/// use market_gateway::{ConfigPreset, GatewayConfig};
/// use std::time::Duration;
///
/// let config = GatewayConfig::from(ConfigPreset::Production)
///     .with_min_interval("t8412", Duration::from_millis(500));
///
/// assert_eq!(config.min_interval_for("t8412"), Duration::from_millis(500));
/// assert_eq!(config.min_interval_for("t1102"), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL every request path is appended to
    pub base_url: String,
    /// Timeout of one HTTP call unless the descriptor overrides it
    pub request_timeout: Duration,
    /// A cached token this close to expiry is refreshed proactively
    pub token_refresh_buffer: Duration,
    /// Time-to-live of the refresh lock
    pub lock_ttl: Duration,
    /// Interval at which a process that lost the lock race polls for a token
    pub lock_poll_interval: Duration,
    /// Maximum number of polls; `None` derives it from TTL and poll interval
    pub lock_max_retries: Option<u32>,
    /// Minimum interval for operation codes without an entry in `min_intervals`
    pub default_min_interval: Duration,
    /// Minimum interval between calls, per operation code
    pub min_intervals: HashMap<String, Duration>,
    /// Page bound used by `paginate` and `collect_all` when the caller gives none
    pub max_pages: usize,
    /// Identifies the credential in the shared store
    pub credential_id: String,
    /// Application codes that mean "token rejected"
    pub auth_failure_codes: Vec<String>,
}

/// Configuration of the OAuth token endpoint.
#[derive(Clone)]
pub struct TokenEndpointConfig {
    /// Path of the token endpoint, relative to the gateway base URL
    pub token_path: String,
    /// Application key issued by the brokerage
    pub app_key: String,
    /// Application secret issued by the brokerage
    pub app_secret: String,
    /// OAuth scope
    pub scope: String,
}

impl std::fmt::Debug for TokenEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEndpointConfig")
            .field("token_path", &self.token_path)
            .field("app_key", &self.app_key)
            .field("app_secret", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

impl TokenEndpointConfig {
    /// Creates an endpoint configuration with the default path and scope.
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            token_path: DEFAULT_TOKEN_PATH.to_string(),
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            scope: "oob".to_string(),
        }
    }

    /// Reads `MARKET_GATEWAY_APP_KEY`, `MARKET_GATEWAY_APP_SECRET` and the
    /// optional `MARKET_GATEWAY_TOKEN_PATH`. Returns `None` if a credential is
    /// missing.
    pub fn from_env() -> Option<Self> {
        let app_key = std::env::var("MARKET_GATEWAY_APP_KEY").ok()?;
        let app_secret = std::env::var("MARKET_GATEWAY_APP_SECRET").ok()?;
        let mut config = Self::new(app_key, app_secret);
        if let Ok(path) = std::env::var("MARKET_GATEWAY_TOKEN_PATH") {
            config.token_path = path;
        }
        Some(config)
    }
}

fn env_millis(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(
        std::env::var(name)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(default_ms),
    )
}

/// Parses `code=millis` pairs separated by commas. Malformed pairs are skipped.
pub(crate) fn parse_interval_table(raw: &str) -> HashMap<String, Duration> {
    raw.split(',')
        .filter_map(|pair| {
            let (code, millis) = pair.split_once('=')?;
            let code = code.trim();
            let millis: u64 = millis.trim().parse().ok()?;
            if code.is_empty() {
                return None;
            }
            Some((code.to_string(), Duration::from_millis(millis)))
        })
        .collect()
}

fn default_auth_failure_codes() -> Vec<String> {
    DEFAULT_AUTH_FAILURE_CODES
        .iter()
        .map(|code| code.to_string())
        .collect()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("MARKET_GATEWAY_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            request_timeout: env_millis("MARKET_GATEWAY_REQUEST_TIMEOUT_MS", 10_000),
            token_refresh_buffer: env_millis("MARKET_GATEWAY_TOKEN_REFRESH_BUFFER_MS", 300_000),
            lock_ttl: env_millis("MARKET_GATEWAY_LOCK_TTL_MS", 10_000),
            lock_poll_interval: env_millis("MARKET_GATEWAY_LOCK_POLL_INTERVAL_MS", 200),
            lock_max_retries: std::env::var("MARKET_GATEWAY_LOCK_MAX_RETRIES")
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            default_min_interval: env_millis("MARKET_GATEWAY_DEFAULT_MIN_INTERVAL_MS", 1_000),
            min_intervals: std::env::var("MARKET_GATEWAY_MIN_INTERVALS")
                .map(|raw| parse_interval_table(&raw))
                .unwrap_or_default(),
            max_pages: std::env::var("MARKET_GATEWAY_MAX_PAGES")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(100),
            credential_id: std::env::var("MARKET_GATEWAY_CREDENTIAL_ID")
                .unwrap_or_else(|_| "default".to_string()),
            auth_failure_codes: std::env::var("MARKET_GATEWAY_AUTH_FAILURE_CODES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|code| !code.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|_| default_auth_failure_codes()),
        }
    }
}

impl GatewayConfig {
    /// Sets the minimum interval for one operation code.
    pub fn with_min_interval(mut self, code: impl Into<String>, interval: Duration) -> Self {
        self.min_intervals.insert(code.into(), interval);
        self
    }

    /// Sets the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Minimum interval for `code`, falling back to the default.
    pub fn min_interval_for(&self, code: &str) -> Duration {
        self.min_intervals
            .get(code)
            .copied()
            .unwrap_or(self.default_min_interval)
    }

    /// Number of times a process that lost the lock race polls for a token.
    ///
    /// Unless set explicitly, enough polls to outlast one lock TTL.
    pub fn lock_retry_bound(&self) -> u32 {
        if let Some(retries) = self.lock_max_retries {
            return retries.max(1);
        }
        let poll = self.lock_poll_interval.as_millis().max(1);
        let ttl = self.lock_ttl.as_millis();
        u32::try_from(ttl.div_ceil(poll)).unwrap_or(u32::MAX).max(1)
    }

    /// Validates the configuration and returns any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.base_url.trim().is_empty() {
            warnings.push("Base URL is empty".to_string());
        } else if !self.base_url.starts_with("https://") {
            warnings.push("Base URL is not HTTPS; the bearer token is sent in clear".to_string());
        }

        if self.request_timeout.is_zero() {
            warnings.push("Request timeout is zero; every call will time out".to_string());
        }

        if self.token_refresh_buffer > Duration::from_secs(6 * 3600) {
            warnings.push(
                "Token refresh buffer (> 6 hours) may cause a refresh on every request".to_string(),
            );
        }

        if self.lock_ttl < Duration::from_secs(1) {
            warnings.push(
                "Very short lock TTL (< 1 second) may expire before the token endpoint answers"
                    .to_string(),
            );
        }

        if self.lock_poll_interval >= self.lock_ttl {
            warnings.push("Lock poll interval should be shorter than the lock TTL".to_string());
        }

        if self.max_pages == 0 {
            warnings.push("Page bound is zero; pagination will yield nothing".to_string());
        }

        if self.auth_failure_codes.is_empty() {
            warnings.push(
                "No auth failure codes configured; only HTTP 401 triggers a token refresh"
                    .to_string(),
            );
        }

        warnings
    }

    /// Returns a one-line summary of the configuration.
    pub fn summary(&self) -> String {
        format!(
            "GatewayConfig {{ Base URL: {}, Timeout: {}ms, Refresh buffer: {}s, Lock TTL: {}ms, \
             Poll: {}ms x{}, Default interval: {}ms, Per-code intervals: {}, Max pages: {} }}",
            self.base_url,
            self.request_timeout.as_millis(),
            self.token_refresh_buffer.as_secs(),
            self.lock_ttl.as_millis(),
            self.lock_poll_interval.as_millis(),
            self.lock_retry_bound(),
            self.default_min_interval.as_millis(),
            self.min_intervals.len(),
            self.max_pages,
        )
    }
}

impl From<ConfigPreset> for GatewayConfig {
    fn from(preset: ConfigPreset) -> Self {
        match preset {
            ConfigPreset::Production => Self {
                base_url: DEFAULT_BASE_URL.to_string(),
                request_timeout: Duration::from_secs(10),
                token_refresh_buffer: Duration::from_secs(300),
                lock_ttl: Duration::from_secs(10),
                lock_poll_interval: Duration::from_millis(200),
                lock_max_retries: None,
                default_min_interval: Duration::from_secs(1),
                min_intervals: HashMap::new(),
                max_pages: 100,
                credential_id: "default".to_string(),
                auth_failure_codes: default_auth_failure_codes(),
            },
            ConfigPreset::Development => Self {
                base_url: DEFAULT_BASE_URL.to_string(),
                request_timeout: Duration::from_secs(30),
                token_refresh_buffer: Duration::from_secs(60),
                lock_ttl: Duration::from_secs(5),
                lock_poll_interval: Duration::from_millis(100),
                lock_max_retries: None,
                default_min_interval: Duration::from_secs(1),
                min_intervals: HashMap::new(),
                max_pages: 20,
                credential_id: "development".to_string(),
                auth_failure_codes: default_auth_failure_codes(),
            },
            ConfigPreset::FromEnv => Self::default(),
        }
    }
}
