//! # Requestor (requestor.rs)
//!
//! Owns the request queues shared between the caller threads and the REST
//! thread, and the REST-thread half ([`RestWorker`]) that moves requests
//! through the ratelimiter and the transport.
//!
//! ## Queues
//!
//! ```text
//!     caller threads                 │  REST thread (RestWorker)
//!                                    │
//!     begin ──► pending ─────────────┼──► bucket queues ──► transport
//!       ▲        (lock)              │          ▲                │
//!       │                            │          └─── retry ◄─────┤
//!     recycling ◄── dispatch ◄── finished ◄──────────────────────┤ async
//!       (lock)        (main)       (lock)                        │
//!                                    │       sync slot ◄─────────┘ sync
//! ```
//!
//! Every queue has its own lock, held only to splice requests in or out.
//! The ratelimiter is touched by the REST thread alone.

use crate::rest::bucket::BucketId;
use crate::rest::config::RestConfig;
use crate::rest::error::{RestError, Result};
use crate::rest::metrics::MetricsRecorder;
use crate::rest::ratelimit::{BucketViews, Ratelimiter};
use crate::rest::refcount::Refcounter;
use crate::rest::request::{Attributes, Request, RequestHandle, SyncOutput, SyncSlot, TypedDispatch};
use crate::rest::route::{Method, Route};
use crate::rest::timer::Timers;
use crate::rest::transport::{Completion, ConnId, Headers, HttpRequest, HttpResponse, Transport, Waker};
use crate::rest::utils::Poller;
use ahash::RandomState;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Wait applied on a 429 whose body carries no usable `retry_after`.
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

/// Body of a 429 response.
#[derive(Debug, Default, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    global: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    retry_after: Option<f64>,
}

/// Request queues shared by every thread of a client.
pub(crate) struct Requestor {
    pub(crate) config: RestConfig,
    authorization: Option<String>,
    pending: Mutex<VecDeque<Request>>,
    recycling: Mutex<Vec<Request>>,
    finished: Mutex<VecDeque<Request>>,
    cancels: Mutex<Vec<u64>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    rest_poller: Arc<Poller>,
    main_poller: Arc<Poller>,
    pub(crate) refcounter: Arc<Refcounter>,
    pub(crate) metrics: Arc<MetricsRecorder>,
}

impl fmt::Debug for Requestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requestor")
            .field("config", &self.config)
            .field("pending", &self.pending.lock().len())
            .field("recycling", &self.recycling.lock().len())
            .field("finished", &self.finished.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Requestor {
    pub(crate) fn new(
        config: RestConfig,
        refcounter: Arc<Refcounter>,
        metrics: Arc<MetricsRecorder>,
        main_poller: Arc<Poller>,
    ) -> Self {
        Self {
            authorization: config.authorization(),
            config,
            pending: Mutex::new(VecDeque::new()),
            recycling: Mutex::new(Vec::new()),
            finished: Mutex::new(VecDeque::new()),
            cancels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            rest_poller: Arc::new(Poller::new()),
            main_poller,
            refcounter,
            metrics,
        }
    }

    pub(crate) fn rest_poller(&self) -> &Arc<Poller> {
        &self.rest_poller
    }

    /// Takes a request out of recycling (or allocates one) and fills it in.
    fn prepare<T>(
        &self,
        attrs: Attributes<T>,
        body: Option<&[u8]>,
        method: Method,
        route: &Route,
        out: Option<SyncOutput<T>>,
    ) -> Result<Request>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if matches!(body, Some(body) if body.is_empty()) {
            return Err(RestError::MalformedPayload);
        }

        let Attributes {
            done,
            fail,
            data,
            keep,
            reason,
            attachments,
            high_priority,
            ..
        } = attrs;

        if let Some(keep) = &keep {
            self.refcounter.incr(keep)?;
        }
        if let Some(data) = &data {
            self.refcounter.visit(data);
        }

        let mut req = self.recycling.lock().pop().unwrap_or_else(Request::new);
        req.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        req.fill(method, &route.endpoint, &route.key, body);
        req.attachments = attachments;
        req.reason = reason;
        req.data = data;
        req.keep = keep;
        req.high_priority = high_priority;
        req.dispatch = Some(Box::new(TypedDispatch::new(done, fail, out)));
        Ok(req)
    }

    /// Hands a request to the REST thread; gives it back once the client is closed.
    fn enqueue(&self, req: Request) -> std::result::Result<(), Request> {
        {
            let mut pending = self.pending.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(req);
            }
            trace!("[{}] Enqueued {} {}", req.id, req.method, req.endpoint);
            pending.push_back(req);
        }
        self.metrics.record_submitted();
        self.rest_poller.wakeup();
        Ok(())
    }

    /// Starts an asynchronous request; callbacks run on [`dispatch_responses`](Self::dispatch_responses).
    pub(crate) fn begin_async<T>(
        &self,
        attrs: Attributes<T>,
        body: Option<&[u8]>,
        method: Method,
        route: &Route,
    ) -> Result<RequestHandle>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let req = self.prepare(attrs, body, method, route, None)?;
        let handle = RequestHandle(req.id);
        if let Err(req) = self.enqueue(req) {
            self.recycle(req);
            return Err(RestError::Canceled);
        }
        Ok(handle)
    }

    /// Runs a request to completion on the calling thread.
    pub(crate) fn begin_sync<T>(
        &self,
        attrs: Attributes<T>,
        body: Option<&[u8]>,
        method: Method,
        route: &Route,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let out: SyncOutput<T> = Arc::new(Mutex::new(None));
        let slot = Arc::new(SyncSlot::new());

        let mut req = self.prepare(attrs, body, method, route, Some(Arc::clone(&out)))?;
        req.sync = Some(Arc::clone(&slot));
        if let Err(req) = self.enqueue(req) {
            self.recycle(req);
            return Err(RestError::Canceled);
        }

        let mut req = slot.wait();
        if req.is_canceled() {
            self.recycle(req);
            return Err(RestError::Canceled);
        }

        let response = req.response();
        if let Some(dispatch) = req.dispatch.take() {
            dispatch.dispatch(&response);
        }
        let code = req.code.clone();
        self.recycle(req);

        code?;
        let value = out.lock().take();
        value.ok_or_else(|| RestError::Decode("response carried no payload".to_string()))
    }

    /// Routes a finished request to its sync caller or to the finished queue.
    pub(crate) fn finish(&self, mut req: Request) {
        match req.sync.take() {
            Some(slot) => slot.complete(req),
            None => {
                self.finished.lock().push_back(req);
                self.main_poller.wakeup();
            }
        }
    }

    /// Runs callbacks of every finished asynchronous request.
    ///
    /// Skips the pass when the REST thread holds the finished queue.
    pub(crate) fn dispatch_responses(&self) -> usize {
        let finished = match self.finished.try_lock() {
            Some(mut finished) => std::mem::take(&mut *finished),
            None => return 0,
        };

        let count = finished.len();
        for mut req in finished {
            let response = req.response();
            if let Some(dispatch) = req.dispatch.take() {
                dispatch.dispatch(&response);
            }
            self.recycle(req);
        }
        count
    }

    /// Releases a request's references and returns it to recycling.
    pub(crate) fn recycle(&self, mut req: Request) {
        if let Some(data) = req.data.take() {
            if let Err(err) = self.refcounter.decr(&data) {
                debug!("[{}] Couldn't release request data: {}", req.id, err);
            }
        }
        if let Some(keep) = req.keep.take() {
            if let Err(err) = self.refcounter.decr(&keep) {
                debug!("[{}] Couldn't release kept value: {}", req.id, err);
            }
        }
        req.clear();
        self.recycling.lock().push(req);
    }

    /// Asks the REST thread to drop an asynchronous request.
    pub(crate) fn cancel(&self, handle: RequestHandle) {
        self.cancels.lock().push(handle.0);
        self.rest_poller.wakeup();
    }

    /// Refuses new requests from now on.
    pub(crate) fn close(&self) {
        let _pending = self.pending.lock();
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn recycled_len(&self) -> usize {
        self.recycling.lock().len()
    }

    fn take_pending(&self) -> VecDeque<Request> {
        std::mem::take(&mut *self.pending.lock())
    }

    fn take_finished(&self) -> VecDeque<Request> {
        std::mem::take(&mut *self.finished.lock())
    }

    /// Pulls a not yet dispatched response out of the finished queue.
    ///
    /// The main thread skips its dispatch pass while this holds the lock,
    /// so it is woken afterwards to retry.
    fn take_finished_by_id(&self, id: u64) -> Option<Request> {
        let req = {
            let mut finished = self.finished.lock();
            finished
                .iter()
                .position(|req| req.id == id)
                .and_then(|pos| finished.remove(pos))
        };
        self.main_poller.wakeup();
        req
    }

    /// Transfer description for a request about to be sent.
    fn http_request(&self, req: &Request) -> HttpRequest {
        let mut headers = Headers::new();
        headers.insert("User-Agent", self.config.user_agent.as_str());
        if let Some(authorization) = &self.authorization {
            headers.insert("Authorization", authorization.as_str());
        }
        if req.method != Method::MimePost && !req.body.is_empty() {
            headers.insert("Content-Type", "application/json");
        }
        if let Some(reason) = req.reason.as_deref().filter(|reason| !reason.is_empty()) {
            headers.insert("X-Audit-Log-Reason", reason);
        }

        HttpRequest {
            method: req.method,
            url: self.config.url_for(&req.endpoint),
            headers,
            body: req.body.clone(),
            attachments: req.attachments.clone(),
        }
    }
}

/// Interprets a response status; decodes the payload on 2xx.
fn check_response(req: &mut Request, resp: &HttpResponse) -> Result<()> {
    let body = || String::from_utf8_lossy(&resp.body).into_owned();

    match resp.status {
        200..=299 => {
            let decoded = match req.dispatch.as_mut() {
                Some(dispatch) => dispatch.decode(&resp.body),
                None => Ok(()),
            };
            if let Err(err) = &decoded {
                error!("[{}] {} {}: {}", req.id, req.method, req.endpoint, err);
            }
            decoded
        }
        401 => {
            error!("UNAUTHORIZED: Please provide a valid authentication token");
            Err(RestError::Unauthorized)
        }
        405 => {
            error!("METHOD_NOT_ALLOWED: The server couldn't recognize the received HTTP method");
            Err(RestError::MethodNotAllowed)
        }
        429 => {
            let parsed: RateLimitBody = serde_json::from_slice(&resp.body).unwrap_or_default();
            let retry_after_ms = parsed
                .retry_after
                .filter(|secs| *secs > 0.0)
                .map_or(DEFAULT_RETRY_AFTER_MS, |secs| (1000.0 * secs) as u64);

            warn!(
                "429 {}RATELIMITING (wait: {} ms) : {}",
                if parsed.global { "GLOBAL " } else { "" },
                retry_after_ms,
                parsed.message
            );
            Err(RestError::RateLimited {
                retry_after_ms,
                global: parsed.global,
            })
        }
        status @ 500.. => {
            warn!("[{}] {} {}: HTTP {}", req.id, req.method, req.endpoint, status);
            Err(RestError::Server { status })
        }
        status => {
            let body = body();
            error!("{}", body);
            Err(RestError::Http { status, body })
        }
    }
}

/// REST-thread state: the ratelimiter, its timers and the transport.
pub(crate) struct RestWorker {
    requestor: Arc<Requestor>,
    ratelimiter: Ratelimiter,
    timers: Arc<Timers<Ratelimiter>>,
    transport: Box<dyn Transport>,
    inflight: HashMap<ConnId, BucketId, RandomState>,
    next_conn: u64,
}

impl fmt::Debug for RestWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestWorker")
            .field("ratelimiter", &self.ratelimiter)
            .field("timers", &self.timers)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

impl RestWorker {
    pub(crate) fn new(requestor: Arc<Requestor>, mut transport: Box<dyn Transport>, views: BucketViews) -> Self {
        let poller = Arc::clone(requestor.rest_poller());
        transport.bind(Waker::new(Arc::clone(&poller)));

        Self {
            requestor,
            ratelimiter: Ratelimiter::with_views(views),
            timers: Arc::new(Timers::with_poller("rest", poller)),
            transport,
            inflight: HashMap::with_hasher(RandomState::new()),
            next_conn: 1,
        }
    }

    pub(crate) fn timers(&self) -> &Arc<Timers<Ratelimiter>> {
        &self.timers
    }

    /// One REST tick: collect finished transfers, then send what may be sent.
    pub(crate) fn perform(&mut self) {
        self.info_read();
        self.start_pending();
    }

    /// Fires due ratelimit timers.
    pub(crate) fn run_timers(&mut self) {
        self.timers.run(&mut self.ratelimiter);
    }

    /// Microseconds until the next ratelimit timer, capped at `max_us`.
    pub(crate) fn next_trigger(&self, now_us: u64, max_us: u64) -> u64 {
        self.timers.next_trigger(now_us, max_us)
    }

    fn info_read(&mut self) {
        for completion in self.transport.drain_completed() {
            self.complete(completion);
        }
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { conn, result } = completion;
        let Some(bucket) = self.inflight.remove(&conn) else {
            trace!("Ignoring completion of unknown transfer {}", conn.get());
            return;
        };

        let mut req = self.ratelimiter.request_unselect(bucket);
        req.conn = None;

        let mut resolved = bucket;
        match result {
            Ok(resp) => {
                req.code = check_response(&mut req, &resp);
                resolved = self.ratelimiter.build(bucket, &req.key, &resp.headers);

                if let Err(RestError::RateLimited { retry_after_ms, global }) = req.code {
                    self.requestor.metrics.record_ratelimited(global);
                    if global {
                        self.ratelimiter.set_global_timeout(resolved, retry_after_ms);
                    } else {
                        self.ratelimiter.set_timeout(resolved, retry_after_ms);
                    }
                }
                self.requestor
                    .metrics
                    .set_known_buckets(self.ratelimiter.known_buckets());
            }
            Err(err) => {
                warn!("[{}] {} {}: {}", req.id, req.method, req.endpoint, err.message);
                req.code = Err(err.into());
            }
        }

        let retry = matches!(&req.code, Err(err) if err.is_retryable())
            && req.retry_attempt < self.requestor.config.retry_limit;

        if retry {
            req.retry_attempt += 1;
            self.requestor.metrics.record_retried();
            debug!(
                "[{}] Retrying {} {} (attempt {}/{})",
                req.id, req.method, req.endpoint, req.retry_attempt, self.requestor.config.retry_limit
            );
            self.ratelimiter.insert(resolved, req, true);
        } else {
            self.requestor.metrics.record_outcome(req.code.is_ok());
            self.requestor.finish(req);
        }
    }

    fn start_pending(&mut self) {
        for req in self.requestor.take_pending() {
            let id = self.ratelimiter.get(&req.key);
            let high_priority = req.high_priority;
            self.ratelimiter.insert(id, req, high_priority);
        }

        let cancels = std::mem::take(&mut *self.requestor.cancels.lock());
        for id in cancels {
            let found = self
                .ratelimiter
                .remove_request(id)
                .or_else(|| self.requestor.take_finished_by_id(id));
            match found {
                Some(req) => self.cancel_request(req),
                None => debug!("[{}] Nothing to cancel", id),
            }
        }

        let requestor = &self.requestor;
        let transport = &mut self.transport;
        let inflight = &mut self.inflight;
        let next_conn = &mut self.next_conn;

        self.ratelimiter.request_selector(&self.timers, |bucket, req| {
            let conn = ConnId(*next_conn);
            *next_conn += 1;

            trace!("[{}] Sending {} {} through {}", req.id, req.method, req.endpoint, bucket);
            transport.start(conn, requestor.http_request(req));
            req.conn = Some(conn);
            inflight.insert(conn, bucket);
            requestor.metrics.record_sent();
        });
    }

    /// Drops a request without callbacks; sync callers get `Canceled`.
    fn cancel_request(&mut self, mut req: Request) {
        if let Some(conn) = req.conn.take() {
            self.transport.cancel(conn);
            self.inflight.remove(&conn);
        }
        self.requestor.metrics.record_canceled();
        debug!("[{}] Canceled {} {}", req.id, req.method, req.endpoint);

        req.code = Err(RestError::Canceled);
        match req.sync.take() {
            Some(slot) => slot.complete(req),
            None => self.requestor.recycle(req),
        }
    }

    /// Cancels every outstanding request and timer and drops undispatched
    /// responses. Runs on the REST thread at exit.
    pub(crate) fn cleanup(&mut self) {
        self.requestor.close();

        let mut outstanding = self.ratelimiter.drain_all();
        outstanding.extend(self.requestor.take_pending());
        for req in outstanding {
            self.cancel_request(req);
        }
        self.requestor.cancels.lock().clear();

        // finished but never dispatched: dropped without callbacks
        let undispatched = self.requestor.take_finished();
        if !undispatched.is_empty() {
            debug!("Discarding {} undispatched responses", undispatched.len());
        }
        for req in undispatched {
            self.requestor.recycle(req);
        }

        self.timers.cleanup(&mut self.ratelimiter);
        debug!("REST worker cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::bucket::BusyState;
    use crate::rest::request::{Empty, UserData};
    use crate::rest::route::RouteArg;
    use crate::rest::transport::TransportError;
    use crate::rest::utils::current_time_us;
    use dashmap::DashMap;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    type Outcome = std::result::Result<HttpResponse, TransportError>;

    /// Answers every transfer from a script, 200 `{}` once the script runs out.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Arc<Mutex<VecDeque<Outcome>>>,
        sent: Arc<Mutex<Vec<HttpRequest>>>,
        completed: Vec<Completion>,
    }

    impl Transport for ScriptedTransport {
        fn start(&mut self, conn: ConnId, request: HttpRequest) {
            self.sent.lock().push(request);
            let result = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(200).with_body("{}")));
            self.completed.push(Completion { conn, result });
        }

        fn cancel(&mut self, conn: ConnId) {
            self.completed.retain(|completion| completion.conn != conn);
        }

        fn drain_completed(&mut self) -> Vec<Completion> {
            std::mem::take(&mut self.completed)
        }
    }

    struct Harness {
        requestor: Arc<Requestor>,
        worker: RestWorker,
        script: Arc<Mutex<VecDeque<Outcome>>>,
        sent: Arc<Mutex<Vec<HttpRequest>>>,
        views: BucketViews,
    }

    impl Harness {
        fn new(config: RestConfig) -> Self {
            let transport = ScriptedTransport::default();
            let script = Arc::clone(&transport.script);
            let sent = Arc::clone(&transport.sent);
            let requestor = Arc::new(Requestor::new(
                config,
                Arc::new(Refcounter::new()),
                Arc::new(MetricsRecorder::new()),
                Arc::new(Poller::new()),
            ));
            let views: BucketViews = Arc::new(DashMap::with_hasher(RandomState::new()));
            let worker = RestWorker::new(Arc::clone(&requestor), Box::new(transport), Arc::clone(&views));
            Self {
                requestor,
                worker,
                script,
                sent,
                views,
            }
        }

        fn respond(&self, outcome: Outcome) {
            self.script.lock().push_back(outcome);
        }

        fn sent(&self) -> usize {
            self.sent.lock().len()
        }

        fn tick(&mut self, n: usize) {
            for _ in 0..n {
                self.worker.perform();
            }
        }
    }

    fn route(channel: u64) -> Route {
        Route::new(Method::Get, "/channels/%u/messages", &[RouteArg::Id(channel)])
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Message {
        id: String,
    }

    #[test]
    fn test_async_success_runs_done_and_recycles() {
        let mut h = Harness::new(RestConfig::bot("secret"));
        h.respond(Ok(HttpResponse::new(200).with_body(r#"{"id":"42"}"#)));

        let seen = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);
        let attrs = Attributes::<Message>::new().done(move |resp, msg| {
            assert!(resp.is_ok());
            *seen_cb.lock() = Some(msg.id.clone());
        });
        h.requestor.begin_async(attrs, None, Method::Get, &route(1)).unwrap();

        h.tick(2);
        assert_eq!(h.requestor.dispatch_responses(), 1);
        assert_eq!(seen.lock().as_deref(), Some("42"));
        assert_eq!(h.requestor.recycled_len(), 1);

        let metrics = h.requestor.metrics.snapshot();
        assert_eq!(metrics.submitted, 1);
        assert_eq!(metrics.succeeded, 1);
    }

    #[test]
    fn test_request_headers() {
        let mut h = Harness::new(RestConfig::bot("secret"));
        let attrs = Attributes::<Empty>::new().reason("spring cleaning");
        h.requestor
            .begin_async(attrs, Some(br#"{"name":"x"}"#), Method::Patch, &route(9))
            .unwrap();
        h.tick(1);

        let sent = h.sent.lock();
        let req = &sent[0];
        assert_eq!(req.url, "https://discord.com/api/v10/channels/9/messages");
        assert_eq!(req.headers.get("authorization"), Some("Bot secret"));
        assert_eq!(req.headers.get("content-type"), Some("application/json"));
        assert_eq!(req.headers.get("x-audit-log-reason"), Some("spring cleaning"));
        assert!(req.headers.get("user-agent").is_some());
    }

    #[test]
    fn test_webhook_mode_sends_no_authorization() {
        let mut h = Harness::new(RestConfig::webhook());
        h.requestor
            .begin_async(Attributes::<Empty>::new(), None, Method::Get, &route(1))
            .unwrap();
        h.tick(1);
        assert!(h.sent.lock()[0].headers.get("authorization").is_none());
    }

    #[test]
    fn test_server_errors_retry_until_budget() {
        let mut h = Harness::new(RestConfig::webhook().with_retry_limit(2));
        for _ in 0..5 {
            h.respond(Ok(HttpResponse::new(503)));
        }

        let failed = Arc::new(Mutex::new(None));
        let failed_cb = Arc::clone(&failed);
        let attrs = Attributes::<Empty>::new()
            .done(|_, _| panic!("must fail"))
            .fail(move |resp| *failed_cb.lock() = resp.error.clone());
        h.requestor.begin_async(attrs, None, Method::Get, &route(1)).unwrap();

        h.tick(10);
        h.requestor.dispatch_responses();

        assert_eq!(h.sent(), 3);
        assert_eq!(*failed.lock(), Some(RestError::Server { status: 503 }));
        assert_eq!(h.requestor.metrics.snapshot().retried, 2);
    }

    #[test]
    fn test_terminal_client_error_keeps_body() {
        let mut h = Harness::new(RestConfig::webhook());
        h.respond(Ok(HttpResponse::new(404).with_body(r#"{"message":"Unknown Channel"}"#)));

        let failed = Arc::new(Mutex::new(None));
        let failed_cb = Arc::clone(&failed);
        let attrs = Attributes::<Empty>::new().fail(move |resp| *failed_cb.lock() = resp.error.clone());
        h.requestor.begin_async(attrs, None, Method::Get, &route(1)).unwrap();
        h.tick(3);
        h.requestor.dispatch_responses();

        assert_eq!(h.sent(), 1);
        match failed.lock().clone() {
            Some(RestError::Http { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("Unknown Channel"));
            }
            other => panic!("unexpected outcome {:?}", other),
        };
    }

    #[test]
    fn test_decode_failure_reaches_fail_callback() {
        let mut h = Harness::new(RestConfig::webhook());
        h.respond(Ok(HttpResponse::new(200).with_body("not json")));

        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        let attrs = Attributes::<Message>::new()
            .done(|_, _| panic!("must not decode"))
            .fail(move |resp| {
                assert!(matches!(resp.error, Some(RestError::Decode(_))));
                flag.store(true, Ordering::SeqCst);
            });
        h.requestor.begin_async(attrs, None, Method::Get, &route(1)).unwrap();
        h.tick(2);
        h.requestor.dispatch_responses();
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_bucket_429_times_out_then_resends() {
        let mut h = Harness::new(RestConfig::webhook());
        h.respond(Ok(HttpResponse::new(429)
            .with_header("x-ratelimit-bucket", "abcd")
            .with_body(r#"{"message":"You are being rate limited.","retry_after":0.05,"global":false}"#)));

        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let attrs = Attributes::<Empty>::new().done(move |_, _| flag.store(true, Ordering::SeqCst));
        h.requestor.begin_async(attrs, None, Method::Get, &route(1)).unwrap();

        // send, receive 429, requeue into the discovered bucket and time it out
        h.tick(3);
        assert_eq!(h.sent(), 1);
        let view = h.views.get(&BucketId::Bounded(0)).map(|v| v.value().clone()).unwrap();
        assert_eq!(view.busy, BusyState::TimedOut);
        assert_eq!(view.queued, 1);

        h.worker.timers.run_at(&mut h.worker.ratelimiter, current_time_us() + 100_000);
        h.tick(2);
        h.requestor.dispatch_responses();

        assert_eq!(h.sent(), 2);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(h.requestor.metrics.snapshot().ratelimited, 1);
    }

    #[test]
    fn test_global_429_sets_cooldown() {
        let mut h = Harness::new(RestConfig::webhook());
        h.respond(Ok(HttpResponse::new(429).with_body(r#"{"retry_after":1.2,"global":true}"#)));
        h.requestor
            .begin_async(Attributes::<Empty>::new(), None, Method::Get, &route(1))
            .unwrap();

        let before = crate::rest::utils::current_time_ms();
        h.tick(2);
        assert!(h.worker.ratelimiter.global_wait_ms() >= before + 1200);
        assert_eq!(h.requestor.metrics.snapshot().global_ratelimits, 1);
    }

    #[test]
    fn test_recycled_request_carries_no_stale_data() {
        let mut h = Harness::new(RestConfig::webhook());

        let data: UserData = Arc::new(String::from("first"));
        let attrs = Attributes::<Empty>::new().data(data).reason("first reason");
        h.requestor.begin_async(attrs, Some(b"{}"), Method::Post, &route(1)).unwrap();
        h.tick(2);
        h.requestor.dispatch_responses();
        assert_eq!(h.requestor.recycled_len(), 1);

        let saw_data = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&saw_data);
        let attrs = Attributes::<Empty>::new().done(move |resp, _| flag.store(resp.data.is_some(), Ordering::SeqCst));
        h.requestor.begin_async(attrs, None, Method::Get, &route(2)).unwrap();
        assert_eq!(h.requestor.recycled_len(), 0);
        h.tick(2);
        h.requestor.dispatch_responses();

        assert!(!saw_data.load(Ordering::SeqCst));
        let second = &h.sent.lock()[1];
        assert!(second.body.is_empty());
        assert!(second.headers.get("x-audit-log-reason").is_none());
    }

    #[test]
    fn test_data_cleanup_after_last_request() {
        let mut h = Harness::new(RestConfig::webhook());
        let cleaned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleaned);
        let data: UserData = Arc::new(5u64);
        h.requestor.refcounter.add(
            &data,
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        h.requestor
            .begin_async(Attributes::<Empty>::new().keep(Arc::clone(&data)), None, Method::Get, &route(1))
            .unwrap();
        h.tick(2);
        h.requestor.dispatch_responses();

        // the registration still holds its own visit
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);
        h.requestor.refcounter.decr(&data).unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_begin_validation() {
        let h = Harness::new(RestConfig::webhook());

        let err = h
            .requestor
            .begin_async(Attributes::<Empty>::new(), Some(b""), Method::Post, &route(1))
            .unwrap_err();
        assert_eq!(err, RestError::MalformedPayload);

        let unknown: UserData = Arc::new(1u8);
        let err = h
            .requestor
            .begin_async(Attributes::<Empty>::new().keep(unknown), None, Method::Get, &route(1))
            .unwrap_err();
        assert_eq!(err, RestError::ResourceUnavailable);
        assert_eq!(h.requestor.metrics.snapshot().submitted, 0);
    }

    #[test]
    fn test_cancel_queued_request_skips_callbacks() {
        let mut h = Harness::new(RestConfig::webhook());
        let fired = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let a = Arc::clone(&fired);
            let b = Arc::clone(&fired);
            let attrs = Attributes::<Empty>::new()
                .done(move |_, _| {
                    a.fetch_add(1, Ordering::SeqCst);
                })
                .fail(move |_| {
                    b.fetch_add(100, Ordering::SeqCst);
                });
            handles.push(h.requestor.begin_async(attrs, None, Method::Get, &route(1)).unwrap());
        }

        // first one goes out through the null bucket, second waits behind it
        h.tick(1);
        h.requestor.cancel(handles[1]);
        h.tick(3);
        h.requestor.dispatch_responses();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(h.sent(), 1);
        assert_eq!(h.requestor.metrics.snapshot().canceled, 1);
    }

    #[test]
    fn test_transport_read_errors_are_retried() {
        let mut h = Harness::new(RestConfig::webhook().with_retry_limit(1));
        h.respond(Err(TransportError::read("connection reset")));
        h.respond(Err(TransportError::other("connection refused")));

        let failed = Arc::new(Mutex::new(None));
        let failed_cb = Arc::clone(&failed);
        let attrs = Attributes::<Empty>::new().fail(move |resp| *failed_cb.lock() = resp.error.clone());
        h.requestor.begin_async(attrs, None, Method::Get, &route(1)).unwrap();
        h.tick(5);
        h.requestor.dispatch_responses();

        assert_eq!(h.sent(), 2);
        assert!(matches!(*failed.lock(), Some(RestError::Transport { retryable: false, .. })));
    }

    #[test]
    fn test_sync_request_round_trip() {
        let mut h = Harness::new(RestConfig::webhook());
        h.respond(Ok(HttpResponse::new(200).with_body(r#"{"id":"7"}"#)));
        let requestor = Arc::clone(&h.requestor);

        let caller = thread::spawn(move || requestor.begin_sync(Attributes::<Message>::new(), None, Method::Get, &route(1)));

        while !caller.is_finished() {
            h.worker.perform();
            thread::yield_now();
        }
        let msg = caller.join().unwrap().unwrap();
        assert_eq!(msg, Message { id: "7".into() });
        assert_eq!(h.requestor.recycled_len(), 1);
    }

    #[test]
    fn test_cleanup_cancels_everything() {
        let mut h = Harness::new(RestConfig::webhook());
        let fired = Arc::new(AtomicUsize::new(0));
        for channel in [1, 1, 2] {
            let counter = Arc::clone(&fired);
            let attrs = Attributes::<Empty>::new().done(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            h.requestor.begin_async(attrs, None, Method::Get, &route(channel)).unwrap();
        }
        h.worker.start_pending();
        h.worker.cleanup();
        h.requestor.dispatch_responses();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(h.requestor.metrics.snapshot().canceled, 3);
        assert_eq!(h.requestor.recycled_len(), 3);
        assert!(h.requestor.is_closed());
        assert_eq!(
            h.requestor
                .begin_async(Attributes::<Empty>::new(), None, Method::Get, &route(1))
                .unwrap_err(),
            RestError::Canceled
        );
    }

    #[test]
    fn test_cleanup_drops_undispatched_responses() {
        let mut h = Harness::new(RestConfig::webhook());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let attrs = Attributes::<Empty>::new().done(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        h.requestor.begin_async(attrs, None, Method::Get, &route(1)).unwrap();

        // answered, waiting in the finished queue
        h.tick(2);
        h.worker.cleanup();

        assert_eq!(h.requestor.dispatch_responses(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(h.requestor.recycled_len(), 1);

        let metrics = h.requestor.metrics.snapshot();
        assert_eq!(metrics.succeeded, 1);
        assert_eq!(metrics.canceled, 0);
    }

    #[test]
    fn test_canceling_finished_response_wakes_main_thread() {
        let mut h = Harness::new(RestConfig::webhook());
        let handle = h
            .requestor
            .begin_async(Attributes::<Empty>::new(), None, Method::Get, &route(1))
            .unwrap();
        h.tick(2);

        let zero = std::time::Duration::ZERO;
        assert!(h.requestor.main_poller.wait(zero));
        assert!(!h.requestor.main_poller.wait(zero));

        h.requestor.cancel(handle);
        h.tick(1);

        assert!(h.requestor.main_poller.wait(zero));
        assert_eq!(h.requestor.dispatch_responses(), 0);
        assert_eq!(h.requestor.metrics.snapshot().canceled, 1);
    }
}
