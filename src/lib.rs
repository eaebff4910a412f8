//! # Winecord - REST Dispatch and Ratelimiting Core
//!
//! The part of a chat-platform client that sits between endpoint wrappers and
//! the network: it turns `(method, endpoint template, args)` into HTTP
//! transfers, discovers the provider's ratelimit buckets from response
//! headers, serializes requests per bucket, honors global cooldowns and
//! retries what can be retried. All network I/O runs on one dedicated thread.
//!
//! ## How Buckets Are Discovered
//!
//! The provider groups routes into buckets but only names a bucket after a
//! request to it returns. Until then requests wait in a single-file
//! placeholder:
//!
//! ```text
//!     first request for route key K
//!          │
//!          ▼
//!     [null] ── one at a time ──► response headers
//!                                     │
//!               x-ratelimit-bucket: H ┼── none
//!                        │            │
//!                        ▼            ▼
//!                  bucket(H)        [miss]  never waits
//!                        │
//!     queued requests for K follow into bucket(H)
//! ```
//!
//! - **Route key** = method + path with everything but the major parameter
//!   (channel / guild id) templated away
//! - **Bucket** = one request in flight, FIFO queue, remaining/reset window
//! - **Global cooldown** = holds every bucket until it passes
//!
//! ## Quick Start
//!
//! ### Synchronous Request
//!
//! ```rust,no_run
//! use winecord::{Attributes, Client, Empty, Method, RestConfig, RouteArg};
//!
//! let client = Client::new(RestConfig::bot("my-token")).unwrap();
//!
//! // blocks until the REST thread finishes the transfer
//! client
//!     .request_sync(
//!         Attributes::<Empty>::new().reason("cleanup"),
//!         None,
//!         Method::Delete,
//!         "/channels/%u/messages/%u",
//!         &[RouteArg::Id(123), RouteArg::Id(456)],
//!     )
//!     .unwrap();
//! ```
//!
//! ### Asynchronous Requests and the Main Loop
//!
//! ```rust,no_run
//! use winecord::{Attributes, ClientBuilder, Method, RouteArg};
//!
//! #[derive(serde::Deserialize)]
//! struct Message {
//!     id: String,
//! }
//!
//! let client = ClientBuilder::new()
//!     .token("my-token")
//!     .retry_limit(5)
//!     .build()
//!     .unwrap();
//!
//! client
//!     .request(
//!         Attributes::<Message>::new().done(|_, msg| println!("sent {}", msg.id)),
//!         Some(br#"{"content":"hello"}"#),
//!         Method::Post,
//!         "/channels/%u/messages",
//!         &[RouteArg::Id(123)],
//!     )
//!     .unwrap();
//!
//! // print metrics every 10 seconds, forever
//! client.timer_interval(|client, _| println!("{}", client.metrics()), 0, 10_000, -1);
//! client.run();
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │   Endpoint wrappers     │
//!                    └──────────┬──────────────┘
//!                               │
//!                    ┌──────────▼──────────────┐
//!                    │        Client           │
//!                    ├─────────────────────────┤
//!                    │  • request()            │
//!                    │  • request_sync()       │
//!                    │  • run() / timers       │
//!                    └──────────┬──────────────┘
//!                               │ pending queue
//!                ┌──────────────▼───────────────┐
//!                │          REST thread          │
//!     ┌──────────┴──────────┐       ┌────────────┴─────────┐
//!     │   Ratelimiter       │       │   Transport          │
//!     ├─────────────────────┤       ├──────────────────────┤
//!     │ • null / miss       │       │ • reqwest + tokio    │
//!     │ • buckets by hash   │       │ • multipart uploads  │
//!     │ • wake timers       │       │ • cancel in flight   │
//!     └─────────────────────┘       └──────────────────────┘
//! ```
//!
//! ## Outcomes
//!
//! | Status | Handling |
//! |--------|----------|
//! | 2xx | body decoded into the requested type, `done` callback |
//! | 429 | bucket or global cooldown, retried |
//! | 5xx, 405, read errors | retried up to `retry_limit` |
//! | other 4xx | terminal, `fail` callback with the body |
//!
//! ## Logging
//!
//! Everything is reported through `tracing`; install any subscriber to see
//! bucket matches (`debug`), cooldowns (`info`) and failures (`warn`/`error`).

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

// Internal module
mod rest;

// Public re-exports
pub use rest::{
    build_key, current_time_ms, current_time_us, format_endpoint, Attachment, AttachmentContent,
    Attributes, BucketId, BucketSnapshot, BusyState, Client, Completion, ConnId, Empty,
    HealthStatus, Headers, HttpRequest, HttpResponse, HttpTransport, Method, Poller,
    RequestHandle, Response, RestConfig, RestError, RestMetrics, Result, Route, RouteArg,
    Timer, TimerCallback, TimerFlags, TimerId, Timers, Transport, TransportError, UserData,
    Waker, DEFAULT_BASE_URL, DEFAULT_CONTENT_TYPE, DEFAULT_FILENAME, DEFAULT_MAX_POLL_WAIT_MS,
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRY_LIMIT, ENDPT_LEN, ROUTE_LEN, UNLIMITED,
};

/// A client wrapped in `Arc` for sharing.
///
/// [`Client`] is already a cheap handle; this alias exists for code that
/// stores it next to other `Arc`-shared services.
pub type SharedClient = std::sync::Arc<Client>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.70.0";

/// Prelude module for convenient imports.
///
/// ```rust
/// use winecord::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for issuing requests.
    //!
    //! # Example
    //! ```rust
    //! use winecord::prelude::*;
    //!
    //! let config = RestConfig::webhook();
    //! let attrs = Attributes::<Empty>::new();
    //! let route = Route::new(Method::Get, "/gateway", &[]);
    //! let status = HealthStatus::Healthy;
    //! ```

    pub use crate::{
        Attachment, Attributes, Client, ClientBuilder, Empty, HealthStatus, Method, RequestHandle,
        Response, RestConfig, RestError, RestMetrics, Route, RouteArg, Timer, TimerFlags, TimerId,
    };
}

/// Fluent construction of a [`Client`].
///
/// # Example
///
/// ```rust
/// use winecord::ClientBuilder;
///
/// // validate settings without starting anything
/// let config = ClientBuilder::new()
///     .token("my-token")
///     .retry_limit(5)
///     .max_poll_wait_ms(1_000)
///     .try_build()
///     .unwrap();
/// assert_eq!(config.retry_limit, 5);
///
/// let result = ClientBuilder::new().base_url("ftp://nope").try_build();
/// assert!(result.is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    config: RestConfig,
}

impl ClientBuilder {
    /// Starts from [`RestConfig::default`]: no token (webhook mode), the
    /// public API base url, 3 retries.
    pub fn new() -> Self {
        Self {
            config: RestConfig::default(),
        }
    }

    /// Starts from an existing configuration.
    pub fn from_config(config: RestConfig) -> Self {
        Self { config }
    }

    /// Bot token sent as `Authorization: Bot <token>`.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config = self.config.with_token(token);
        self
    }

    /// API root every endpoint is appended to.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config = self.config.with_base_url(base_url);
        self
    }

    /// `User-Agent` header value.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config = self.config.with_user_agent(user_agent);
        self
    }

    /// How many times a retryable failure is resent.
    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.config = self.config.with_retry_limit(retry_limit);
        self
    }

    /// Longest the REST thread and the main loop block in one poll.
    pub fn max_poll_wait_ms(mut self, ms: u64) -> Self {
        self.config = self.config.with_max_poll_wait_ms(ms);
        self
    }

    /// Per-transfer timeout of the HTTP transport.
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config = self.config.with_request_timeout_ms(ms);
        self
    }

    /// Starts a client over HTTPS.
    ///
    /// # Errors
    ///
    /// `Parameter` on an invalid configuration, `Transport` when the HTTP
    /// stack can't start.
    pub fn build(self) -> Result<Client> {
        Client::new(self.config)
    }

    /// Starts a client over a custom transport.
    pub fn build_with_transport<T>(self, transport: T) -> Result<Client>
    where
        T: Transport + 'static,
    {
        Client::with_transport(self.config, transport)
    }

    /// Validates the settings and returns them without starting a client.
    ///
    /// # Errors
    ///
    /// Returns an error message if the configuration is invalid.
    pub fn try_build(self) -> std::result::Result<RestConfig, &'static str> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
