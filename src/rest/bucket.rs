//! # Buckets (bucket.rs)
//!
//! A bucket is the unit of ratelimit accounting for one group of routes. It
//! owns the requests waiting for that group and at most one request in flight.
//!
//! ```text
//!     ┌──────────────────────────────────────────┐
//!     │ Bucket "abcd1234"                        │
//!     │   limit: 5   remaining: 0   reset: T+2.5s│
//!     │   busy:  TimedOut ◄── wake timer @ reset │
//!     │   queue: [req7] [req8] [req9]            │ FIFO, retries at head
//!     └──────────────────────────────────────────┘
//! ```
//!
//! Two singletons exist besides discovered buckets: `Null` (routes never
//! answered yet) and `Miss` (routes the provider does not group).

use crate::rest::request::Request;
use std::collections::VecDeque;
use std::fmt;

/// Sentinel for an unknown limit.
pub const UNLIMITED: i64 = i64::MAX;

/// Identity of a bucket inside the ratelimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketId {
    /// Routes whose group is not known yet; one request at a time.
    Null,
    /// Routes the provider does not ratelimit by group.
    Miss,
    /// A bucket discovered from `x-ratelimit-bucket`.
    Bounded(usize),
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketId::Null => f.write_str("null"),
            BucketId::Miss => f.write_str("miss"),
            BucketId::Bounded(n) => write!(f, "#{}", n),
        }
    }
}

/// The busy slot of a bucket.
pub(crate) enum Busy {
    Idle,
    InFlight(Box<Request>),
    /// Exhausted; a wake timer is pending.
    TimedOut,
}

/// Public view of the busy slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyState {
    /// Nothing in flight.
    Idle,
    /// One request in flight.
    InFlight,
    /// Waiting for the window to reset.
    TimedOut,
}

impl Busy {
    pub(crate) fn state(&self) -> BusyState {
        match self {
            Busy::Idle => BusyState::Idle,
            Busy::InFlight(_) => BusyState::InFlight,
            Busy::TimedOut => BusyState::TimedOut,
        }
    }
}

/// Read-only copy of a bucket's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Bucket identity.
    pub id: BucketId,
    /// Provider-assigned group hash (`null` / `miss` for singletons).
    pub hash: String,
    /// Requests per window; [`UNLIMITED`] when unknown.
    pub limit: i64,
    /// Requests left in the current window.
    pub remaining: i64,
    /// Window reset, epoch milliseconds.
    pub reset_ms: u64,
    /// Requests waiting in the queue.
    pub queued: usize,
    /// Busy slot state.
    pub busy: BusyState,
}

pub(crate) struct Bucket {
    pub(crate) hash: String,
    pub(crate) limit: i64,
    pub(crate) remaining: i64,
    pub(crate) reset_ms: u64,
    pub(crate) busy: Busy,
    pub(crate) queue: VecDeque<Request>,
    pub(crate) in_pending: bool,
}

impl Bucket {
    pub(crate) fn new(hash: impl Into<String>, limit: i64) -> Self {
        Self {
            hash: hash.into(),
            limit,
            remaining: 1,
            reset_ms: 0,
            busy: Busy::Idle,
            queue: VecDeque::new(),
            in_pending: false,
        }
    }

    /// Short hash prefix used in log lines.
    pub(crate) fn tag(&self) -> &str {
        let end = self.hash.char_indices().nth(4).map_or(self.hash.len(), |(i, _)| i);
        &self.hash[..end]
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.busy, Busy::Idle)
    }

    pub(crate) fn push(&mut self, req: Request, high_priority: bool) {
        if high_priority {
            self.queue.push_front(req);
        } else {
            self.queue.push_back(req);
        }
    }

    /// Exhausts the bucket until `now + wait_ms`.
    pub(crate) fn set_timeout(&mut self, now_ms: u64, wait_ms: u64) {
        self.remaining = 0;
        self.reset_ms = now_ms.saturating_add(wait_ms);
    }

    /// Wake-up after a timeout: assume a single slot until a response says otherwise.
    pub(crate) fn wake(&mut self) {
        if matches!(self.busy, Busy::TimedOut) {
            self.busy = Busy::Idle;
        }
        self.remaining = 1;
    }

    pub(crate) fn snapshot(&self, id: BucketId) -> BucketSnapshot {
        BucketSnapshot {
            id,
            hash: self.hash.clone(),
            limit: self.limit,
            remaining: self.remaining,
            reset_ms: self.reset_ms,
            queued: self.queue.len(),
            busy: self.busy.state(),
        }
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("hash", &self.hash)
            .field("limit", &self.limit)
            .field("remaining", &self.remaining)
            .field("reset_ms", &self.reset_ms)
            .field("busy", &self.busy.state())
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: u64) -> Request {
        let mut req = Request::new();
        req.id = id;
        req
    }

    #[test]
    fn test_fifo_and_priority() {
        let mut bucket = Bucket::new("abcd", 5);
        bucket.push(req(1), false);
        bucket.push(req(2), false);
        bucket.push(req(3), true);

        let order: Vec<u64> = bucket.queue.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn test_timeout_and_wake() {
        let mut bucket = Bucket::new("abcd", 5);
        bucket.remaining = 4;
        bucket.set_timeout(1_000, 250);
        assert_eq!(bucket.remaining, 0);
        assert_eq!(bucket.reset_ms, 1_250);

        bucket.busy = Busy::TimedOut;
        bucket.wake();
        assert!(bucket.is_idle());
        assert_eq!(bucket.remaining, 1);
    }

    #[test]
    fn test_wake_keeps_in_flight() {
        let mut bucket = Bucket::new("abcd", 5);
        bucket.busy = Busy::InFlight(Box::new(req(9)));
        bucket.wake();
        assert_eq!(bucket.busy.state(), BusyState::InFlight);
    }

    #[test]
    fn test_tag_and_snapshot() {
        let bucket = Bucket::new("41f9cd5d28af77da04563bcb1d67fdfd", UNLIMITED);
        assert_eq!(bucket.tag(), "41f9");
        assert_eq!(Bucket::new("ab", 1).tag(), "ab");

        let snap = bucket.snapshot(BucketId::Bounded(3));
        assert_eq!(snap.limit, UNLIMITED);
        assert_eq!(snap.remaining, 1);
        assert_eq!(snap.busy, BusyState::Idle);
        assert_eq!(snap.id.to_string(), "#3");
    }
}
