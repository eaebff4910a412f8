//! # REST Module
//!
//! Internal implementation of the REST core, one file per component.
//!
//! ## Module Structure
//!
//! ```text
//!     rest/
//!     ├── mod.rs          (Module organization)
//!     ├── client.rs       (Client handle and main loop)
//!     ├── manager.rs      (REST thread)
//!     ├── requestor.rs    (Request queues, retries, response checks)
//!     ├── ratelimit.rs    (Bucket discovery and cooldowns)
//!     ├── bucket.rs       (Bucket state and singletons)
//!     ├── request.rs      (Request object, attributes, typed dispatch)
//!     ├── route.rs        (Route keys and endpoints)
//!     ├── timer.rs        (Timer queue)
//!     ├── transport.rs    (HTTP transport seam)
//!     ├── refcount.rs     (Ownership registry)
//!     ├── metrics.rs      (Counters and health)
//!     ├── config.rs       (Settings and validation)
//!     ├── error.rs        (Error taxonomy)
//!     └── utils.rs        (Clock and poller)
//! ```
//!
//! ## Thread Layout
//!
//! ```text
//!     caller threads                REST thread                 main loop
//!     ──────────────                ───────────                 ─────────
//!     request() ──► pending ──────► Ratelimiter ──► Transport
//!                                        │              │
//!                                   bucket timers ◄─────┤ headers / 429
//!                                        │              │
//!     request_sync() ◄── SyncSlot ◄──────┴── finished ──┴──► dispatch_responses()
//!                                                            internal / user timers
//! ```

mod bucket;
mod client;
mod config;
mod error;
mod manager;
mod metrics;
mod ratelimit;
mod refcount;
mod request;
mod requestor;
mod route;
mod timer;
mod transport;
mod utils;

/// Bucket views published by the ratelimiter
pub use bucket::{BucketId, BucketSnapshot, BusyState, UNLIMITED};

/// Client handle and main loop
pub use client::Client;

/// Configuration and its defaults
pub use config::{
    RestConfig, DEFAULT_BASE_URL, DEFAULT_MAX_POLL_WAIT_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_RETRY_LIMIT,
};

/// Error taxonomy
pub use error::{RestError, Result};

/// Metrics and health monitoring for observability
pub use metrics::{HealthStatus, RestMetrics};

/// Request attributes and outcomes
pub use request::{
    Attachment, AttachmentContent, Attributes, Empty, RequestHandle, Response, UserData,
};

/// Route keys and endpoint formatting
pub use route::{build_key, format_endpoint, Method, Route, RouteArg, ENDPT_LEN, ROUTE_LEN};

/// Timer queue
pub use timer::{Timer, TimerCallback, TimerFlags, TimerId, Timers};

/// HTTP transport seam
pub use transport::{
    Completion, ConnId, Headers, HttpRequest, HttpResponse, HttpTransport, Transport,
    TransportError, Waker, DEFAULT_CONTENT_TYPE, DEFAULT_FILENAME,
};

/// Clock and wakeup helpers
pub use utils::{current_time_ms, current_time_us, Poller};
