//! # Transport (transport.rs)
//!
//! The REST thread talks HTTP through the [`Transport`] trait: it starts
//! transfers keyed by a [`ConnId`], cancels them, and drains the ones that
//! finished since the last tick. Nothing here knows about buckets or retries.
//!
//! ```text
//!     REST thread                     HttpTransport
//!     ───────────                     ─────────────
//!     start(conn, req) ─────────────► spawn on private tokio runtime
//!                                          │ reqwest send + read body
//!                                          ▼
//!     drain_completed() ◄──────────── completed queue ──► Waker::wake()
//! ```
//!
//! Tests plug in scripted transports; production uses [`HttpTransport`].

use crate::rest::config::RestConfig;
use crate::rest::error::{RestError, Result};
use crate::rest::request::{Attachment, AttachmentContent};
use crate::rest::route::Method;
use crate::rest::utils::Poller;
use ahash::RandomState;
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default file name of an attachment without one.
pub const DEFAULT_FILENAME: &str = "a.out";

/// Default MIME type of an attachment without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Identifier of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl ConnId {
    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value of `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns `true` if `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Headers(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A fully built HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method; [`Method::MimePost`] is sent as `multipart/form-data`.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Request headers.
    pub headers: Headers,
    /// JSON body (the `payload_json` part for multipart requests).
    pub body: Vec<u8>,
    /// Files of a multipart request.
    pub attachments: Vec<Attachment>,
}

/// What came back from the provider.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Response with the given status and no headers or body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Connection-layer failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Description from the HTTP stack.
    pub message: String,
    /// Failure while reading; the request may be resent.
    pub retryable: bool,
}

impl TransportError {
    /// Failure while reading the response.
    pub fn read(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Any other connection failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            retryable: err.is_body() || err.is_decode(),
            message: err.to_string(),
        }
    }
}

impl From<TransportError> for RestError {
    fn from(err: TransportError) -> Self {
        RestError::Transport {
            message: err.message,
            retryable: err.retryable,
        }
    }
}

/// A finished transfer.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Transfer the outcome belongs to.
    pub conn: ConnId,
    /// Response, or the connection failure.
    pub result: std::result::Result<HttpResponse, TransportError>,
}

/// Wakes the REST thread when completions are ready.
#[derive(Debug, Clone)]
pub struct Waker(Arc<Poller>);

impl Waker {
    pub(crate) fn new(poller: Arc<Poller>) -> Self {
        Self(poller)
    }

    /// Interrupts the REST thread's wait.
    pub fn wake(&self) {
        self.0.wakeup();
    }
}

/// Multiplexing HTTP client driven by the REST thread.
pub trait Transport: Send {
    /// Gives the transport a way to wake the REST thread. Called once before use.
    fn bind(&mut self, waker: Waker) {
        let _ = waker;
    }

    /// Starts a transfer; its outcome is reported by [`drain_completed`](Transport::drain_completed).
    fn start(&mut self, conn: ConnId, request: HttpRequest);

    /// Aborts a transfer. Its outcome must never be reported.
    fn cancel(&mut self, conn: ConnId);

    /// Takes every transfer finished since the last call.
    fn drain_completed(&mut self) -> Vec<Completion>;
}

/// [`Transport`] backed by `reqwest` on a private tokio runtime.
pub struct HttpTransport {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    completed: Arc<Mutex<Vec<Completion>>>,
    tasks: HashMap<ConnId, tokio::task::JoinHandle<()>, RandomState>,
    waker: Option<Waker>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("in_flight", &self.tasks.len())
            .field("completed", &self.completed.lock().len())
            .finish()
    }
}

impl HttpTransport {
    /// Builds the runtime and HTTP client.
    pub fn new(config: &RestConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("winecord-http")
            .enable_all()
            .build()
            .map_err(|err| RestError::Transport {
                message: format!("failed to start HTTP runtime: {}", err),
                retryable: false,
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| RestError::from(TransportError::from(err)))?;

        Ok(Self {
            runtime,
            client,
            completed: Arc::new(Mutex::new(Vec::new())),
            tasks: HashMap::with_hasher(RandomState::new()),
            waker: None,
        })
    }
}

impl Transport for HttpTransport {
    fn bind(&mut self, waker: Waker) {
        self.waker = Some(waker);
    }

    fn start(&mut self, conn: ConnId, request: HttpRequest) {
        let client = self.client.clone();
        let completed = Arc::clone(&self.completed);
        let waker = self.waker.clone();

        let handle = self.runtime.spawn(async move {
            let result = perform(client, request).await;
            completed.lock().push(Completion { conn, result });
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        self.tasks.insert(conn, handle);
    }

    fn cancel(&mut self, conn: ConnId) {
        if let Some(handle) = self.tasks.remove(&conn) {
            handle.abort();
        }
        self.completed.lock().retain(|completion| completion.conn != conn);
    }

    fn drain_completed(&mut self) -> Vec<Completion> {
        let completed = std::mem::take(&mut *self.completed.lock());
        for completion in &completed {
            self.tasks.remove(&completion.conn);
        }
        completed
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Delete => reqwest::Method::DELETE,
        Method::Get => reqwest::Method::GET,
        Method::Post | Method::MimePost => reqwest::Method::POST,
        Method::Patch => reqwest::Method::PATCH,
        Method::Put => reqwest::Method::PUT,
    }
}

async fn perform(client: reqwest::Client, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
    let HttpRequest {
        method,
        url,
        headers,
        body,
        attachments,
    } = request;

    let mut builder = client.request(reqwest_method(method), &url);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }

    if method == Method::MimePost {
        builder = builder.multipart(multipart_form(body, attachments).await?);
    } else if !body.is_empty() {
        builder = builder.body(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str().to_string(), value.to_string())))
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|err| TransportError::read(err.to_string()))?
        .to_vec();

    Ok(HttpResponse { status, headers, body })
}

/// `payload_json` plus one `files[n]` part per attachment.
async fn multipart_form(payload: Vec<u8>, attachments: Vec<Attachment>) -> std::result::Result<Form, TransportError> {
    let mut form = Form::new();

    if !payload.is_empty() {
        let part = Part::bytes(payload)
            .mime_str("application/json")
            .map_err(|err| TransportError::other(err.to_string()))?;
        form = form.part("payload_json", part);
    }

    for (n, attachment) in attachments.into_iter().enumerate() {
        let Attachment {
            filename,
            content_type,
            content,
        } = attachment;

        let bytes = match content {
            AttachmentContent::Bytes(bytes) => bytes,
            AttachmentContent::Path(path) => match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("Skipping attachment {}: {}", path.display(), err);
                    continue;
                }
            },
        };

        let part = Part::bytes(bytes)
            .file_name(filename.unwrap_or_else(|| DEFAULT_FILENAME.to_string()))
            .mime_str(content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE))
            .map_err(|err| TransportError::other(err.to_string()))?;
        form = form.part(format!("files[{}]", n), part);
    }

    Ok(form)
}
