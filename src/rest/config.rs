//! # REST Configuration
//!
//! Settings for the REST thread: where requests go, how they authenticate,
//! how often a failed request is resent and how long the thread may sleep.
//!
//! ## Retry Budget
//!
//! ```text
//!     attempt 0 ──► 503 ──► attempt 1 ──► 503 ──► ... ──► attempt N ──► 503
//!                                                                    │
//!                         N = retry_limit                            ▼
//!                                                         terminal failure
//! ```
//!
//! ## Modes
//!
//! ```text
//!     token = Some(..) ─► bot mode      (Authorization: Bot <token>)
//!     token = None ─────► webhook mode  (no Authorization header)
//! ```

use std::fmt;

/// Default API root requests are resolved against.
pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// Default number of times a retryable failure is resent.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default upper bound for a single REST thread poll, in milliseconds.
pub const DEFAULT_MAX_POLL_WAIT_MS: u64 = 60_000;

/// Default per-transfer timeout, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Configuration for the REST core.
///
/// ## Examples
///
/// ```rust
/// use winecord::RestConfig;
///
/// // Bot client with defaults
/// let config = RestConfig::bot("my-token");
///
/// // Webhook-only client against a local mock
/// let config = RestConfig::webhook()
///     .with_base_url("http://127.0.0.1:8080")
///     .with_retry_limit(1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct RestConfig {
    /// API root every endpoint is appended to.
    pub base_url: String,

    /// Bot token. `None` runs the client in webhook mode.
    pub token: Option<String>,

    /// Value of the `User-Agent` header.
    pub user_agent: String,

    /// How many times a retryable failure is resent before it becomes terminal.
    pub retry_limit: u32,

    /// Longest time the REST thread blocks waiting for work, in milliseconds.
    pub max_poll_wait_ms: u64,

    /// Per-transfer timeout, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for RestConfig {
    /// Webhook-mode configuration against the public API.
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            user_agent: format!("DiscordBot (https://github.com/winecord/winecord, {})", crate::VERSION),
            retry_limit: DEFAULT_RETRY_LIMIT,
            max_poll_wait_ms: DEFAULT_MAX_POLL_WAIT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .field("retry_limit", &self.retry_limit)
            .field("max_poll_wait_ms", &self.max_poll_wait_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl RestConfig {
    /// Creates a bot-mode configuration.
    ///
    /// # Example
    ///
    /// ```rust
    /// use winecord::RestConfig;
    ///
    /// let config = RestConfig::bot("abc");
    /// assert!(!config.is_webhook());
    /// ```
    pub fn bot(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    /// Creates a webhook-mode configuration (no token).
    pub fn webhook() -> Self {
        Self::default()
    }

    /// Sets the API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the bot token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the `User-Agent` header value.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets how many times retryable failures are resent.
    ///
    /// # Example
    ///
    /// ```rust
    /// use winecord::RestConfig;
    ///
    /// // Never resend
    /// let config = RestConfig::webhook().with_retry_limit(0);
    /// assert_eq!(config.retry_limit, 0);
    /// ```
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets the REST thread poll cap.
    pub fn with_max_poll_wait_ms(mut self, max_poll_wait_ms: u64) -> Self {
        self.max_poll_wait_ms = max_poll_wait_ms;
        self
    }

    /// Sets the per-transfer timeout.
    pub fn with_request_timeout_ms(mut self, request_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self
    }

    /// Returns `true` when no token is configured.
    pub fn is_webhook(&self) -> bool {
        self.token.is_none()
    }

    /// Value of the `Authorization` header, if any.
    pub(crate) fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|token| format!("Bot {}", token))
    }

    /// Joins the API root and an endpoint path.
    pub(crate) fn url_for(&self, endpoint: &str) -> String {
        let mut url = String::with_capacity(self.base_url.len() + endpoint.len());
        url.push_str(self.base_url.trim_end_matches('/'));
        url.push_str(endpoint);
        url
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message if:
    /// - `base_url` is not an http(s) URL
    /// - `token` is present but blank
    /// - `user_agent` is empty
    /// - `max_poll_wait_ms` or `request_timeout_ms` is 0
    ///
    /// # Example
    ///
    /// ```rust
    /// use winecord::RestConfig;
    ///
    /// let config = RestConfig::webhook().with_base_url("ftp://nope");
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err("base_url must start with http:// or https://");
        }

        if matches!(&self.token, Some(token) if token.trim().is_empty()) {
            return Err("token must not be blank");
        }

        if self.user_agent.is_empty() {
            return Err("user_agent must not be empty");
        }

        if self.max_poll_wait_ms == 0 {
            return Err("max_poll_wait_ms must be greater than 0");
        }

        if self.request_timeout_ms == 0 {
            return Err("request_timeout_ms must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RestConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.max_poll_wait_ms, 60_000);
        assert!(config.is_webhook());
        assert!(config.authorization().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bot_authorization() {
        let config = RestConfig::bot("secret");
        assert_eq!(config.authorization().as_deref(), Some("Bot secret"));
        assert!(!config.is_webhook());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = RestConfig::bot("super-secret-token");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret-token"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_url_for() {
        let config = RestConfig::webhook().with_base_url("http://localhost:1234/api/");
        assert_eq!(config.url_for("/channels/1/messages"), "http://localhost:1234/api/channels/1/messages");
    }

    #[test]
    fn test_config_validation() {
        assert!(RestConfig::webhook().with_base_url("localhost").validate().is_err());
        assert!(RestConfig::bot("   ").validate().is_err());
        assert!(RestConfig::webhook().with_user_agent("").validate().is_err());
        assert!(RestConfig::webhook().with_max_poll_wait_ms(0).validate().is_err());
        assert!(RestConfig::webhook().with_request_timeout_ms(0).validate().is_err());
        assert!(RestConfig::webhook().with_retry_limit(0).validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = RestConfig::webhook()
            .with_token("t")
            .with_retry_limit(7)
            .with_max_poll_wait_ms(500)
            .with_request_timeout_ms(1_000)
            .with_user_agent("agent");

        assert_eq!(config.token.as_deref(), Some("t"));
        assert_eq!(config.retry_limit, 7);
        assert_eq!(config.max_poll_wait_ms, 500);
        assert_eq!(config.request_timeout_ms, 1_000);
        assert_eq!(config.user_agent, "agent");
    }
}
