//! # Client and Main Loop (client.rs)
//!
//! [`Client`] is the embedder-facing handle. It owns the REST thread, the
//! requestor queues and two timer groups driven by the main loop:
//!
//! ```text
//!     run_once():
//!         wait = on_idle set ? 0 : next timer (internal, user), capped
//!         main_poller.wait(wait)          cut short by finished requests
//!         timed out ─► on_idle, or sleep off a sub-millisecond timer
//!         on_cycle
//!         run internal timers, run user timers
//!         dispatch finished responses     done / fail callbacks
//! ```
//!
//! The internal group carries the reschedulable wakeup timer
//! ([`set_next_wakeup`](Client::set_next_wakeup)); the user group holds
//! everything created through the `timer*` methods.
//!
//! `Client` is a cheap `Arc` handle: clone it into callbacks or other
//! threads. The last handle to drop shuts the client down.

use crate::rest::bucket::{BucketId, BucketSnapshot};
use crate::rest::config::RestConfig;
use crate::rest::error::{RestError, Result};
use crate::rest::manager::RestManager;
use crate::rest::metrics::{MetricsRecorder, RestMetrics};
use crate::rest::ratelimit::BucketViews;
use crate::rest::refcount::Refcounter;
use crate::rest::request::{Attributes, RequestHandle, UserData};
use crate::rest::requestor::{Requestor, RestWorker};
use crate::rest::route::{Method, Route, RouteArg};
use crate::rest::timer::{Timer, TimerId, Timers};
use crate::rest::transport::{HttpTransport, Transport};
use crate::rest::utils::{current_time_us, Poller};
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Wait below which the main loop sleeps instead of polling.
const SPIN_THRESHOLD_US: u64 = 1000;

type Hook = Arc<dyn Fn(&Client) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_idle: Option<Hook>,
    on_cycle: Option<Hook>,
    on_wakeup: Option<Hook>,
    wakeup_timer: Option<TimerId>,
}

struct ClientInner {
    config: RestConfig,
    requestor: Arc<Requestor>,
    refcounter: Arc<Refcounter>,
    metrics: Arc<MetricsRecorder>,
    views: BucketViews,
    internal_timers: Timers<Client>,
    user_timers: Timers<Client>,
    main_poller: Arc<Poller>,
    manager: Mutex<Option<RestManager>>,
    hooks: Mutex<Hooks>,
    stop: AtomicBool,
    shut: AtomicBool,
}

/// Handle to a REST client and its main loop.
///
/// # Example
///
/// ```rust,no_run
/// use winecord::{Attributes, Client, Method, RestConfig, RouteArg};
///
/// #[derive(serde::Deserialize)]
/// struct Message {
///     id: String,
/// }
///
/// let client = Client::new(RestConfig::bot("my-token")).unwrap();
///
/// client
///     .request(
///         Attributes::<Message>::new()
///             .done(|_, msg| println!("sent message {}", msg.id))
///             .fail(|resp| eprintln!("failed: {:?}", resp.error)),
///         Some(br#"{"content":"hello"}"#),
///         Method::Post,
///         "/channels/%u/messages",
///         &[RouteArg::Id(123)],
///     )
///     .unwrap();
///
/// client.run_once();
/// ```
///
/// # Lifetime
///
/// Handles are cheap clones of one shared client, shut down when the last
/// one is dropped. Hooks and timers get the client passed in; a callback
/// that captures a clone instead keeps the client alive until
/// [`shutdown`](Client::shutdown) is called:
///
/// ```rust
/// use winecord::{Client, RestConfig};
///
/// let client = Client::new(RestConfig::webhook()).unwrap();
/// let captured = client.clone();
/// client.set_on_cycle(move |_| {
///     let _ = captured.metrics();
/// });
///
/// // dropping `client` alone would leave the REST thread running
/// client.shutdown();
/// assert!(!client.is_running());
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .field("internal_timers", &self.inner.internal_timers)
            .field("user_timers", &self.inner.user_timers)
            .finish()
    }
}

impl Client {
    /// Creates a client sending over HTTPS and starts its REST thread.
    ///
    /// # Errors
    ///
    /// `Parameter` when the configuration is invalid, `Transport` when the
    /// HTTP stack or the REST thread can't be set up.
    pub fn new(config: RestConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|msg| RestError::Parameter(msg.to_string()))?;
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, transport)
    }

    /// Creates a client over a custom [`Transport`].
    pub fn with_transport<T>(config: RestConfig, transport: T) -> Result<Self>
    where
        T: Transport + 'static,
    {
        config
            .validate()
            .map_err(|msg| RestError::Parameter(msg.to_string()))?;

        let main_poller = Arc::new(Poller::new());
        let refcounter = Arc::new(Refcounter::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let requestor = Arc::new(Requestor::new(
            config.clone(),
            Arc::clone(&refcounter),
            Arc::clone(&metrics),
            Arc::clone(&main_poller),
        ));

        let views: BucketViews = Arc::new(DashMap::with_hasher(RandomState::new()));
        let worker = RestWorker::new(Arc::clone(&requestor), Box::new(transport), Arc::clone(&views));
        let manager = RestManager::start(
            worker,
            Arc::clone(requestor.rest_poller()),
            config.max_poll_wait_ms,
        )?;

        info!(
            "Client started ({} mode, {})",
            if config.is_webhook() { "webhook" } else { "bot" },
            config.base_url
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                internal_timers: Timers::with_poller("internal", Arc::clone(&main_poller)),
                user_timers: Timers::with_poller("user", Arc::clone(&main_poller)),
                config,
                requestor,
                refcounter,
                metrics,
                views,
                main_poller,
                manager: Mutex::new(Some(manager)),
                hooks: Mutex::new(Hooks::default()),
                stop: AtomicBool::new(false),
                shut: AtomicBool::new(false),
            }),
        })
    }

    /// The configuration the client was built with.
    pub fn config(&self) -> &RestConfig {
        &self.inner.config
    }

    /// Returns `true` until [`shutdown`](Self::shutdown).
    pub fn is_running(&self) -> bool {
        !self.inner.shut.load(Ordering::Acquire)
            && self
                .inner
                .manager
                .lock()
                .as_ref()
                .map_or(false, RestManager::is_running)
    }

    fn route(method: Method, template: &str, args: &[RouteArg<'_>]) -> Result<Route> {
        if template.is_empty() {
            return Err(RestError::Parameter("endpoint template is empty".to_string()));
        }
        Ok(Route::new(method, template, args))
    }

    /// Queues an asynchronous request.
    ///
    /// `template` uses `%u`/`%s` placeholders filled from `args`. Callbacks
    /// run on the thread calling [`dispatch_responses`](Self::dispatch_responses)
    /// (or the main loop).
    ///
    /// # Errors
    ///
    /// Fails without network activity on an empty template (`Parameter`), a
    /// present but empty body (`MalformedPayload`) or after shutdown
    /// (`Canceled`).
    ///
    /// # Panics
    ///
    /// When placeholders and `args` don't match, or the endpoint overruns its
    /// fixed capacity.
    pub fn request<T>(
        &self,
        attrs: Attributes<T>,
        body: Option<&[u8]>,
        method: Method,
        template: &str,
        args: &[RouteArg<'_>],
    ) -> Result<RequestHandle>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let route = Self::route(method, template, args)?;
        self.inner.requestor.begin_async(attrs, body, method, &route)
    }

    /// Sends a request and blocks until it finishes.
    ///
    /// Callbacks in `attrs` still run, on the calling thread, before this
    /// returns.
    pub fn request_sync<T>(
        &self,
        attrs: Attributes<T>,
        body: Option<&[u8]>,
        method: Method,
        template: &str,
        args: &[RouteArg<'_>],
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let route = Self::route(method, template, args)?;
        self.inner.requestor.begin_sync(attrs, body, method, &route)
    }

    /// Runs the callbacks of every finished asynchronous request.
    ///
    /// Returns how many responses were dispatched.
    pub fn dispatch_responses(&self) -> usize {
        self.inner.requestor.dispatch_responses()
    }

    /// Drops a queued or in-flight asynchronous request without firing its
    /// callbacks. Unknown or finished handles are ignored.
    pub fn cancel(&self, handle: RequestHandle) {
        self.inner.requestor.cancel(handle);
    }

    /// Live REST counters.
    pub fn metrics(&self) -> RestMetrics {
        self.inner.metrics.snapshot()
    }

    /// Every bucket the ratelimiter knows of, singletons first.
    pub fn buckets(&self) -> Vec<BucketSnapshot> {
        let mut buckets: Vec<BucketSnapshot> =
            self.inner.views.iter().map(|view| view.value().clone()).collect();
        buckets.sort_by_key(|bucket| match bucket.id {
            BucketId::Null => 0,
            BucketId::Miss => 1,
            BucketId::Bounded(n) => n + 2,
        });
        buckets
    }

    // ---- ownership registry ----

    /// Registers `data` with a cleanup run once its last user releases it.
    ///
    /// The registration itself counts as one visit; drop it with
    /// [`release_data`](Self::release_data).
    pub fn register_data<F>(&self, data: &UserData, cleanup: F)
    where
        F: FnOnce(UserData) + Send + Sync + 'static,
    {
        self.inner.refcounter.add(data, Some(Box::new(cleanup)));
    }

    /// Drops one visit of `data`.
    pub fn release_data(&self, data: &UserData) -> Result<()> {
        self.inner.refcounter.decr(data)
    }

    /// Keeps `data` alive past its last request.
    pub fn claim(&self, data: &UserData) -> Result<()> {
        self.inner.refcounter.claim(data)
    }

    /// Returns a claim taken with [`claim`](Self::claim).
    pub fn unclaim(&self, data: &UserData) -> Result<()> {
        self.inner.refcounter.unclaim(data)
    }

    /// Returns `true` while `data` is held by the registry.
    pub fn is_registered(&self, data: &UserData) -> bool {
        self.inner.refcounter.contains(data)
    }

    // ---- user timers ----

    /// One-shot timer, deleted after it fires. `delay` is in milliseconds.
    pub fn timer<F>(&self, on_tick: F, delay: i64) -> TimerId
    where
        F: Fn(&mut Client, &mut Timer<Client>) + Send + Sync + 'static,
    {
        self.inner.user_timers.timer(on_tick, delay)
    }

    /// Repeating timer; a negative `repeat` fires forever.
    pub fn timer_interval<F>(&self, on_tick: F, delay: i64, interval: i64, repeat: i64) -> TimerId
    where
        F: Fn(&mut Client, &mut Timer<Client>) + Send + Sync + 'static,
    {
        self.inner
            .user_timers
            .timer_interval(on_tick, delay, interval, repeat)
    }

    /// Creates or updates a user timer. See [`Timers::ctl`].
    pub fn timer_ctl(&self, timer: Timer<Client>) -> Option<TimerId> {
        self.inner.user_timers.ctl(timer)
    }

    /// Copy of a user timer.
    pub fn timer_get(&self, id: TimerId) -> Option<Timer<Client>> {
        self.inner.user_timers.get(id)
    }

    /// Re-arms a timer with its delay.
    pub fn timer_start(&self, id: TimerId) -> bool {
        self.inner.user_timers.start(id)
    }

    /// Disables a timer without removing it.
    pub fn timer_stop(&self, id: TimerId) -> bool {
        self.inner.user_timers.stop(id)
    }

    /// Cancels a timer; its status callback runs on the next pass.
    pub fn timer_cancel(&self, id: TimerId) -> bool {
        self.inner.user_timers.cancel(id)
    }

    /// Deletes a timer on the next pass.
    pub fn timer_delete(&self, id: TimerId) -> bool {
        self.inner.user_timers.delete(id)
    }

    /// Cancels and deletes a timer on the next pass.
    pub fn timer_cancel_and_delete(&self, id: TimerId) -> bool {
        self.inner.user_timers.cancel_and_delete(id)
    }

    // ---- main loop ----

    /// Called whenever a loop iteration had nothing to wait for.
    ///
    /// While set, the loop never blocks in its poll. Use the `&Client`
    /// argument rather than capturing a handle; see [lifetime](Client#lifetime).
    pub fn set_on_idle<F>(&self, f: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.inner.hooks.lock().on_idle = Some(Arc::new(f));
    }

    /// Called on every loop iteration.
    pub fn set_on_cycle<F>(&self, f: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.inner.hooks.lock().on_cycle = Some(Arc::new(f));
    }

    /// Sets the wakeup callback and disarms any scheduled wakeup.
    pub fn set_on_wakeup<F>(&self, f: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        let wakeup_timer = {
            let mut hooks = self.inner.hooks.lock();
            hooks.on_wakeup = Some(Arc::new(f));
            hooks.wakeup_timer
        };
        if let Some(id) = wakeup_timer {
            let mut timer = Self::wakeup_timer().with_delay(-1);
            timer.id = Some(id);
            self.inner.internal_timers.ctl(timer);
        }
    }

    /// Schedules the wakeup callback `delay` ms from now, replacing any
    /// earlier schedule. A negative delay disarms it.
    pub fn set_next_wakeup(&self, delay: i64) {
        let previous = self.inner.hooks.lock().wakeup_timer;
        let mut timer = Self::wakeup_timer().with_delay(delay);
        timer.id = previous;

        let id = match self.inner.internal_timers.ctl(timer.clone()) {
            Some(id) => id,
            None => {
                timer.id = None;
                match self.inner.internal_timers.ctl(timer) {
                    Some(id) => id,
                    None => return,
                }
            }
        };
        self.inner.hooks.lock().wakeup_timer = Some(id);
    }

    fn wakeup_timer() -> Timer<Client> {
        Timer::new().on_tick(|client: &mut Client, _| {
            let hook = client.inner.hooks.lock().on_wakeup.clone();
            if let Some(hook) = hook {
                hook(client);
            }
        })
    }

    fn next_trigger(&self, max_us: u64) -> u64 {
        let now = current_time_us();
        self.inner
            .internal_timers
            .next_trigger(now, max_us)
            .min(self.inner.user_timers.next_trigger(now, max_us))
    }

    /// One main loop iteration. Returns the number of responses dispatched.
    pub fn run_once(&self) -> usize {
        let (on_idle, on_cycle) = {
            let hooks = self.inner.hooks.lock();
            (hooks.on_idle.clone(), hooks.on_cycle.clone())
        };

        let poll_us = match on_idle {
            Some(_) => 0,
            None => self.next_trigger(self.inner.config.max_poll_wait_ms.saturating_mul(1000)),
        };
        let woken = poll_us > 0 && self.inner.main_poller.wait(Duration::from_micros(poll_us));

        if !woken {
            match &on_idle {
                Some(hook) => hook(self),
                None => {
                    let wait_us = self.next_trigger(SPIN_THRESHOLD_US);
                    if wait_us > 0 && wait_us < SPIN_THRESHOLD_US {
                        thread::sleep(Duration::from_micros(wait_us));
                    }
                }
            }
        }

        if let Some(hook) = on_cycle {
            hook(self);
        }

        let mut ctx = self.clone();
        self.inner.internal_timers.run(&mut ctx);
        self.inner.user_timers.run(&mut ctx);

        self.dispatch_responses()
    }

    /// Runs the main loop until [`stop`](Self::stop) or shutdown.
    pub fn run(&self) {
        debug!("Main loop started");
        while !self.inner.stop.load(Ordering::Acquire) && !self.inner.shut.load(Ordering::Acquire) {
            self.run_once();
        }
        self.inner.stop.store(false, Ordering::Release);
        debug!("Main loop stopped");
    }

    /// Makes [`run`](Self::run) return after its current iteration.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.main_poller.wakeup();
    }

    /// Stops the REST thread and releases everything the client holds.
    ///
    /// Outstanding requests and responses not dispatched yet are dropped
    /// without callbacks; blocked sync callers get `Canceled`. Every timer is
    /// canceled with its status callback fired. Idempotent.
    ///
    /// Dropping the last handle calls this. A hook or timer callback that
    /// captured a clone keeps the client alive, so such clients must be shut
    /// down explicitly; this also releases the hooks and timer callbacks.
    /// Callbacks receive the client as an argument and rarely need to
    /// capture one.
    pub fn shutdown(&self) {
        if self.inner.shut.swap(true, Ordering::AcqRel) {
            return;
        }

        let manager = self.inner.manager.lock().take();
        if let Some(mut manager) = manager {
            manager.shutdown();
        }

        let mut ctx = self.clone();
        self.inner.internal_timers.cleanup(&mut ctx);
        self.inner.user_timers.cleanup(&mut ctx);

        // hooks may hold handles to this client
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        drop(hooks);
        self.inner.main_poller.wakeup();

        info!("Client shut down");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.shutdown();
        }
    }
}
