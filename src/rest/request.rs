//! # Requests (request.rs)
//!
//! A [`Request`] is one REST call travelling through the queues. Callers never
//! hold one directly: they describe the call with [`Attributes`] and get a
//! [`RequestHandle`] (async) or the decoded value (sync) back.
//!
//! ## Lifecycle
//!
//! ```text
//!     recycling ──► begin() ──► pending ──► bucket queue ──► busy (in flight)
//!         ▲                                     ▲               │
//!         │                                     └── retry ◄─────┤
//!         │                                                     ▼
//!         └──── dispatched / canceled ◄──── finished | sync slot
//! ```
//!
//! Recycled requests keep their endpoint, key and body buffers so a busy
//! client stops allocating after warm-up; every attribute is cleared.

use crate::rest::bucket::BucketId;
use crate::rest::error::{RestError, Result};
use crate::rest::route::Method;
use crate::rest::transport::ConnId;
use parking_lot::{Condvar, Mutex};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

/// Caller-owned value carried along a request and handed back in its [`Response`].
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Handle identifying an asynchronous request, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestHandle(pub(crate) u64);

impl RequestHandle {
    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Payload type for routes that answer without a body (204) or whose body is ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Empty;

impl<'de> Deserialize<'de> for Empty {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        IgnoredAny::deserialize(deserializer)?;
        Ok(Empty)
    }
}

/// Where an attachment's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentContent {
    /// In-memory bytes, copied when the request begins.
    Bytes(Vec<u8>),
    /// A file read when the request is sent.
    Path(PathBuf),
}

/// A file uploaded with a multipart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// File name shown by the provider; `a.out` when absent.
    pub filename: Option<String>,
    /// MIME type; `application/octet-stream` when absent.
    pub content_type: Option<String>,
    /// Attachment bytes.
    pub content: AttachmentContent,
}

impl Attachment {
    /// Attachment backed by in-memory bytes.
    pub fn bytes(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: Some(filename.into()),
            content_type: None,
            content: AttachmentContent::Bytes(content.into()),
        }
    }

    /// Attachment read from disk when sent. The file name defaults to the path's.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            filename: path.file_name().map(|name| name.to_string_lossy().into_owned()),
            content_type: None,
            content: AttachmentContent::Path(path),
        }
    }

    /// Sets the MIME type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Outcome handed to callbacks.
#[derive(Clone)]
pub struct Response {
    /// The request's `data` value.
    pub data: Option<UserData>,
    /// The request's `keep` value.
    pub keep: Option<UserData>,
    /// `None` on success.
    pub error: Option<RestError>,
}

impl Response {
    /// Returns `true` when the request succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Downcasts `data`.
    pub fn data_as<T: Any>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|data| data.downcast_ref::<T>())
    }

    /// Downcasts `keep`.
    pub fn keep_as<T: Any>(&self) -> Option<&T> {
        self.keep.as_deref().and_then(|keep| keep.downcast_ref::<T>())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("data", &self.data.is_some())
            .field("keep", &self.keep.is_some())
            .field("error", &self.error)
            .finish()
    }
}

type DoneFn<T> = Box<dyn FnOnce(&Response, &T) + Send>;
type FailFn = Box<dyn FnOnce(&Response) + Send>;

/// Describes how a request's outcome reaches the caller.
///
/// `T` is the JSON payload type of a successful response; use [`Empty`] for
/// routes without one.
///
/// # Example
///
/// ```rust
/// use winecord::{Attributes, Empty};
///
/// let attrs = Attributes::<Empty>::new()
///     .done(|_, _| println!("deleted"))
///     .fail(|resp| eprintln!("failed: {:?}", resp.error))
///     .reason("cleanup");
/// ```
pub struct Attributes<T> {
    pub(crate) done: Option<DoneFn<T>>,
    pub(crate) fail: Option<FailFn>,
    pub(crate) data: Option<UserData>,
    pub(crate) keep: Option<UserData>,
    pub(crate) reason: Option<String>,
    pub(crate) attachments: Vec<Attachment>,
    pub(crate) high_priority: bool,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Default for Attributes<T> {
    fn default() -> Self {
        Self {
            done: None,
            fail: None,
            data: None,
            keep: None,
            reason: None,
            attachments: Vec::new(),
            high_priority: false,
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Attributes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("done", &self.done.is_some())
            .field("fail", &self.fail.is_some())
            .field("data", &self.data.is_some())
            .field("keep", &self.keep.is_some())
            .field("reason", &self.reason)
            .field("attachments", &self.attachments.len())
            .field("high_priority", &self.high_priority)
            .finish()
    }
}

impl<T> Attributes<T> {
    /// Attributes with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Success callback, run on the thread that dispatches responses.
    pub fn done<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Response, &T) + Send + 'static,
    {
        self.done = Some(Box::new(f));
        self
    }

    /// Failure callback, run on the thread that dispatches responses.
    pub fn fail<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Response) + Send + 'static,
    {
        self.fail = Some(Box::new(f));
        self
    }

    /// Value handed back in [`Response::data`]; registered for cleanup if new.
    pub fn data(mut self, data: UserData) -> Self {
        self.data = Some(data);
        self
    }

    /// Already-registered value handed back in [`Response::keep`].
    pub fn keep(mut self, keep: UserData) -> Self {
        self.keep = Some(keep);
        self
    }

    /// Audit log reason sent as `X-Audit-Log-Reason`.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Adds a multipart attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Queue ahead of requests already waiting in the same bucket.
    pub fn high_priority(mut self, high_priority: bool) -> Self {
        self.high_priority = high_priority;
        self
    }
}

/// Type-erased decode/dispatch step of a request.
///
/// `decode` runs on the REST thread once a 2xx response arrives; `dispatch`
/// runs on the thread that drains finished requests (or the sync caller).
pub(crate) trait Dispatch: Send {
    fn decode(&mut self, body: &[u8]) -> Result<()>;
    fn dispatch(self: Box<Self>, response: &Response);
}

/// Slot a synchronous caller reads the decoded value from.
pub(crate) type SyncOutput<T> = Arc<Mutex<Option<T>>>;

pub(crate) struct TypedDispatch<T> {
    value: Option<T>,
    done: Option<DoneFn<T>>,
    fail: Option<FailFn>,
    out: Option<SyncOutput<T>>,
}

impl<T> TypedDispatch<T> {
    pub(crate) fn new(done: Option<DoneFn<T>>, fail: Option<FailFn>, out: Option<SyncOutput<T>>) -> Self {
        Self {
            value: None,
            done,
            fail,
            out,
        }
    }
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

impl<T> Dispatch for TypedDispatch<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn decode(&mut self, body: &[u8]) -> Result<()> {
        let body = if is_blank(body) { b"null".as_slice() } else { body };
        self.value = Some(serde_json::from_slice(body)?);
        Ok(())
    }

    fn dispatch(self: Box<Self>, response: &Response) {
        let TypedDispatch { value, done, fail, out } = *self;

        match (&response.error, value) {
            (None, Some(value)) => {
                if let Some(done) = done {
                    done(response, &value);
                }
                if let Some(out) = out {
                    *out.lock() = Some(value);
                }
            }
            _ => {
                if let Some(fail) = fail {
                    fail(response);
                }
            }
        }
    }
}

/// Rendezvous between the REST thread and a blocked synchronous caller.
pub(crate) struct SyncSlot {
    finished: Mutex<Option<Request>>,
    cond: Condvar,
}

impl SyncSlot {
    pub(crate) fn new() -> Self {
        Self {
            finished: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Hands the request back to the waiting caller.
    pub(crate) fn complete(&self, req: Request) {
        *self.finished.lock() = Some(req);
        self.cond.notify_one();
    }

    /// Blocks until the REST thread completes (or cancels) the request.
    pub(crate) fn wait(&self) -> Request {
        let mut finished = self.finished.lock();
        loop {
            if let Some(req) = finished.take() {
                return req;
            }
            self.cond.wait(&mut finished);
        }
    }
}

/// One REST call.
pub(crate) struct Request {
    pub(crate) id: u64,
    pub(crate) method: Method,
    pub(crate) endpoint: String,
    pub(crate) key: String,
    pub(crate) body: Vec<u8>,
    pub(crate) attachments: Vec<Attachment>,
    pub(crate) reason: Option<String>,
    pub(crate) dispatch: Option<Box<dyn Dispatch>>,
    pub(crate) data: Option<UserData>,
    pub(crate) keep: Option<UserData>,
    pub(crate) high_priority: bool,
    pub(crate) bucket: Option<BucketId>,
    pub(crate) conn: Option<ConnId>,
    pub(crate) code: Result<()>,
    pub(crate) retry_attempt: u32,
    pub(crate) sync: Option<Arc<SyncSlot>>,
}

impl Request {
    pub(crate) fn new() -> Self {
        Self {
            id: 0,
            method: Method::Get,
            endpoint: String::new(),
            key: String::new(),
            body: Vec::new(),
            attachments: Vec::new(),
            reason: None,
            dispatch: None,
            data: None,
            keep: None,
            high_priority: false,
            bucket: None,
            conn: None,
            code: Ok(()),
            retry_attempt: 0,
            sync: None,
        }
    }

    /// Copies the call description, reusing this request's buffers.
    pub(crate) fn fill(&mut self, method: Method, endpoint: &str, key: &str, body: Option<&[u8]>) {
        self.method = method;
        self.endpoint.clear();
        self.endpoint.push_str(endpoint);
        self.key.clear();
        self.key.push_str(key);
        self.body.clear();
        if let Some(body) = body {
            self.body.extend_from_slice(body);
        }
    }

    /// Clears every field while keeping allocated buffers for the next user.
    pub(crate) fn clear(&mut self) {
        self.id = 0;
        self.method = Method::Get;
        self.endpoint.clear();
        self.key.clear();
        self.body.clear();
        self.attachments.clear();
        self.reason = None;
        self.dispatch = None;
        self.data = None;
        self.keep = None;
        self.high_priority = false;
        self.bucket = None;
        self.conn = None;
        self.code = Ok(());
        self.retry_attempt = 0;
        self.sync = None;
    }

    /// Response object passed to callbacks.
    pub(crate) fn response(&self) -> Response {
        Response {
            data: self.data.clone(),
            keep: self.keep.clone(),
            error: self.code.clone().err(),
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        matches!(self.code, Err(RestError::Canceled))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("endpoint", &self.endpoint)
            .field("key", &self.key)
            .field("body_len", &self.body.len())
            .field("attachments", &self.attachments.len())
            .field("bucket", &self.bucket)
            .field("conn", &self.conn)
            .field("code", &self.code)
            .field("retry_attempt", &self.retry_attempt)
            .field("sync", &self.sync.is_some())
            .finish()
    }
}
