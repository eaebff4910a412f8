//! # Ratelimiter (ratelimit.rs)
//!
//! Maps route keys to buckets, learns bucket state from response headers and
//! decides which bucket may send next. Only the REST thread touches it.
//!
//! ## Route Matching
//!
//! ```text
//!     key unknown ──► Null ──first response──┬─ no x-ratelimit-bucket ──► Miss
//!                                            │
//!                                            └─ x-ratelimit-bucket: H ──► Bucket(H)
//!                                                      │
//!                 other Null requests with the same key ┘ follow it
//! ```
//!
//! ## Selection (once per tick)
//!
//! ```text
//!     for bucket in pending:
//!         busy (in flight or timed out) ─► requeue
//!         remaining == 0 ────────────────► TimedOut + wake timer at
//!                                          max(global, reset), requeue
//!         otherwise ─────────────────────► send head, requeue if more queued
//! ```

use crate::rest::bucket::{Bucket, BucketId, BucketSnapshot, Busy, UNLIMITED};
use crate::rest::request::Request;
use crate::rest::timer::Timers;
use crate::rest::transport::Headers;
use crate::rest::utils::{current_subsec_ms, current_time_ms, parse_header_f64};
use ahash::RandomState;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Published bucket views, readable from any thread.
pub(crate) type BucketViews = Arc<DashMap<BucketId, BucketSnapshot, RandomState>>;

/// Parses a `strtol`-style integer header (fractions are truncated).
fn parse_long(value: Option<&str>) -> Option<i64> {
    let value = value?.trim();
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|v| v as i64))
}

/// Parses an HTTP `date` header into epoch milliseconds.
fn parse_date_ms(value: Option<&str>) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value?.trim())
        .ok()
        .map(|date| date.timestamp_millis())
}

pub(crate) struct Ratelimiter {
    routes: HashMap<String, BucketId, RandomState>,
    hashes: HashMap<String, usize, RandomState>,
    buckets: Vec<Bucket>,
    null: Bucket,
    miss: Bucket,
    global_wait_ms: u64,
    pending: VecDeque<BucketId>,
    views: BucketViews,
}

impl std::fmt::Debug for Ratelimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ratelimiter")
            .field("routes", &self.routes.len())
            .field("buckets", &self.buckets.len())
            .field("global_wait_ms", &self.global_wait_ms)
            .field("pending", &self.pending)
            .finish()
    }
}

impl Ratelimiter {
    pub(crate) fn new() -> Self {
        Self::with_views(Arc::new(DashMap::with_hasher(RandomState::new())))
    }

    pub(crate) fn with_views(views: BucketViews) -> Self {
        let rl = Self {
            routes: HashMap::with_hasher(RandomState::new()),
            hashes: HashMap::with_hasher(RandomState::new()),
            buckets: Vec::new(),
            null: Bucket::new("null", 1),
            miss: Bucket::new("miss", UNLIMITED),
            global_wait_ms: 0,
            pending: VecDeque::new(),
            views,
        };
        rl.publish(BucketId::Null);
        rl.publish(BucketId::Miss);
        rl
    }

    pub(crate) fn bucket(&self, id: BucketId) -> &Bucket {
        match id {
            BucketId::Null => &self.null,
            BucketId::Miss => &self.miss,
            BucketId::Bounded(n) => &self.buckets[n],
        }
    }

    pub(crate) fn bucket_mut(&mut self, id: BucketId) -> &mut Bucket {
        match id {
            BucketId::Null => &mut self.null,
            BucketId::Miss => &mut self.miss,
            BucketId::Bounded(n) => &mut self.buckets[n],
        }
    }

    fn publish(&self, id: BucketId) {
        self.views.insert(id, self.bucket(id).snapshot(id));
    }

    pub(crate) fn snapshot(&self, id: BucketId) -> BucketSnapshot {
        self.bucket(id).snapshot(id)
    }

    pub(crate) fn global_wait_ms(&self) -> u64 {
        self.global_wait_ms
    }

    /// Discovered buckets, singletons excluded.
    pub(crate) fn known_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn pending_buckets(&self) -> impl Iterator<Item = BucketId> + '_ {
        self.pending.iter().copied()
    }

    /// Bucket currently matched to `key`; `Null` when unknown.
    pub(crate) fn get(&self, key: &str) -> BucketId {
        match self.routes.get(key) {
            Some(&id) => {
                trace!("[{}] Found a bucket match for '{}'!", self.bucket(id).tag(), key);
                id
            }
            None => {
                trace!("[null] Couldn't match known buckets to '{}'", key);
                BucketId::Null
            }
        }
    }

    /// Queues `req` in bucket `id` and marks the bucket as pending.
    pub(crate) fn insert(&mut self, id: BucketId, mut req: Request, high_priority: bool) {
        req.bucket = Some(id);
        let bucket = self.bucket_mut(id);
        bucket.push(req, high_priority);
        if !bucket.in_pending {
            bucket.in_pending = true;
            self.pending.push_front(id);
        }
        self.publish(id);
    }

    fn remove_pending(&mut self, id: BucketId) {
        let bucket = self.bucket_mut(id);
        if bucket.in_pending {
            bucket.in_pending = false;
            self.pending.retain(|pending| *pending != id);
        }
    }

    /// Updates bucket `id` from a response to `key`, resolving `Null` first.
    ///
    /// Returns the bucket `key` is matched to afterwards.
    pub(crate) fn build(&mut self, id: BucketId, key: &str, headers: &Headers) -> BucketId {
        let id = if id == BucketId::Null {
            self.get_match(key, headers)
        } else {
            id
        };
        self.populate(id, headers, current_time_ms());
        id
    }

    fn get_match(&mut self, key: &str, headers: &Headers) -> BucketId {
        let id = match self.routes.get(key) {
            Some(&id) => id,
            None => {
                let id = match headers.get("x-ratelimit-bucket").filter(|hash| !hash.is_empty()) {
                    // not part of a ratelimiting group
                    None => BucketId::Miss,
                    Some(hash) => match self.hashes.get(hash) {
                        Some(&n) => BucketId::Bounded(n),
                        None => {
                            let limit = parse_long(headers.get("x-ratelimit-limit")).unwrap_or(UNLIMITED);
                            let n = self.buckets.len();
                            self.buckets.push(Bucket::new(hash, limit));
                            self.hashes.insert(hash.to_string(), n);
                            BucketId::Bounded(n)
                        }
                    },
                };
                self.routes.insert(key.to_string(), id);
                id
            }
        };

        debug!("[{}] Match '{}' to bucket", self.bucket(id).tag(), key);

        self.null_filter(id, key);
        id
    }

    /// Moves `Null` requests sharing `key` into the bucket it resolved to.
    fn null_filter(&mut self, id: BucketId, key: &str) {
        if id == BucketId::Null {
            return;
        }
        let queue = std::mem::take(&mut self.null.queue);
        for req in queue {
            let target = if req.key == key { id } else { BucketId::Null };
            self.insert(target, req, false);
        }
        if self.null.queue.is_empty() && self.null.is_idle() {
            self.remove_pending(BucketId::Null);
        }
        self.publish(BucketId::Null);
    }

    fn populate(&mut self, id: BucketId, headers: &Headers, now_ms: u64) {
        let remaining = parse_long(headers.get("x-ratelimit-remaining")).unwrap_or(1);
        let reset_after = parse_header_f64(headers.get("x-ratelimit-reset-after"));
        let reset = parse_header_f64(headers.get("x-ratelimit-reset"));
        let global = headers.contains("x-ratelimit-global");

        let mut global_wait = None;
        {
            let bucket = self.bucket_mut(id);
            bucket.remaining = remaining;

            if let Some(reset_after) = reset_after {
                let reset_ms = now_ms.saturating_add((1000.0 * reset_after).max(0.0) as u64);
                if global {
                    // lock all buckets
                    global_wait = Some(reset_ms);
                } else {
                    bucket.reset_ms = reset_ms;
                }
            } else if let Some(reset) = reset {
                // provider clock plus the sub-second part lost by `date`
                let offset = parse_date_ms(headers.get("date"))
                    .map(|server| server + current_subsec_ms() as i64)
                    .unwrap_or(now_ms as i64);
                let reset_ms = now_ms as i64 + ((1000.0 * reset) as i64 - offset);
                bucket.reset_ms = reset_ms.max(0) as u64;
            }

            debug!(
                "[{}] Remaining = {} | Reset = {}",
                bucket.tag(),
                bucket.remaining,
                bucket.reset_ms
            );
        }

        if let Some(wait) = global_wait {
            self.global_wait_ms = wait;
        }
        self.publish(id);
    }

    /// Exhausts bucket `id` for `wait_ms`.
    pub(crate) fn set_timeout(&mut self, id: BucketId, wait_ms: u64) {
        self.bucket_mut(id).set_timeout(current_time_ms(), wait_ms);
        self.publish(id);
    }

    /// Blocks every bucket for `wait_ms`, starting with `id`.
    pub(crate) fn set_global_timeout(&mut self, id: BucketId, wait_ms: u64) {
        let now = current_time_ms();
        self.global_wait_ms = now.saturating_add(wait_ms);
        self.bucket_mut(id).set_timeout(now, wait_ms);
        self.publish(id);
    }

    /// Wake timer callback: the window of bucket `id` should have reset.
    pub(crate) fn wake(&mut self, id: BucketId) {
        let bucket = self.bucket_mut(id);
        bucket.wake();
        trace!("[{}] Woken up", bucket.tag());
        self.publish(id);
    }

    fn try_timeout(&mut self, id: BucketId, timers: &Timers<Ratelimiter>) {
        let global = self.global_wait_ms;
        let bucket = self.bucket_mut(id);
        let wait_ms = global.max(bucket.reset_ms).saturating_sub(current_time_ms());
        bucket.busy = Busy::TimedOut;

        timers.timer(move |rl: &mut Ratelimiter, _| rl.wake(id), wait_ms as i64);

        info!("[{}] RATELIMITING (wait {} ms)", self.bucket(id).tag(), wait_ms);
    }

    /// Sends the next request of every eligible pending bucket.
    ///
    /// `send` gets the request right before it becomes the bucket's busy one.
    pub(crate) fn request_selector<F>(&mut self, timers: &Timers<Ratelimiter>, mut send: F)
    where
        F: FnMut(BucketId, &mut Request),
    {
        let pending = std::mem::take(&mut self.pending);

        for id in pending {
            let bucket = self.bucket_mut(id);

            if !bucket.is_idle() {
                self.pending.push_back(id);
                continue;
            }

            if bucket.remaining == 0 {
                self.try_timeout(id, timers);
                self.pending.push_back(id);
                self.publish(id);
                continue;
            }

            let Some(mut req) = bucket.queue.pop_front() else {
                bucket.in_pending = false;
                continue;
            };
            send(id, &mut req);
            bucket.busy = Busy::InFlight(Box::new(req));

            if bucket.queue.is_empty() {
                bucket.in_pending = false;
            } else {
                self.pending.push_back(id);
            }
            self.publish(id);
        }
    }

    /// Releases the busy request of bucket `id`.
    ///
    /// # Panics
    ///
    /// If bucket `id` has no request in flight.
    pub(crate) fn request_unselect(&mut self, id: BucketId) -> Request {
        let bucket = self.bucket_mut(id);
        let req = match std::mem::replace(&mut bucket.busy, Busy::Idle) {
            Busy::InFlight(req) => *req,
            other => {
                bucket.busy = other;
                panic!("Internal error: unselecting a bucket with no request in flight");
            }
        };
        if bucket.queue.is_empty() {
            self.remove_pending(id);
        }
        self.publish(id);
        req
    }

    /// Takes the request identified by `req_id` out of whatever bucket holds it.
    pub(crate) fn remove_request(&mut self, req_id: u64) -> Option<Request> {
        let ids: Vec<BucketId> = [BucketId::Null, BucketId::Miss]
            .into_iter()
            .chain((0..self.buckets.len()).map(BucketId::Bounded))
            .collect();

        for id in ids {
            let bucket = self.bucket_mut(id);
            if let Some(pos) = bucket.queue.iter().position(|req| req.id == req_id) {
                let req = bucket.queue.remove(pos);
                if bucket.queue.is_empty() && bucket.is_idle() {
                    self.remove_pending(id);
                }
                self.publish(id);
                return req;
            }
            if matches!(&bucket.busy, Busy::InFlight(req) if req.id == req_id) {
                return Some(self.request_unselect(id));
            }
        }
        None
    }

    /// Empties every bucket (in-flight requests included) for shutdown.
    pub(crate) fn drain_all(&mut self) -> Vec<Request> {
        let mut drained = Vec::new();
        let ids: Vec<BucketId> = [BucketId::Null, BucketId::Miss]
            .into_iter()
            .chain((0..self.buckets.len()).map(BucketId::Bounded))
            .collect();

        for id in ids {
            let bucket = self.bucket_mut(id);
            if let Busy::InFlight(req) = std::mem::replace(&mut bucket.busy, Busy::Idle) {
                drained.push(*req);
            }
            drained.extend(bucket.queue.drain(..));
            bucket.in_pending = false;
            self.publish(id);
        }
        self.pending.clear();
        drained
    }
}
