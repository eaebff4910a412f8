//! # REST Metrics (metrics.rs)
//!
//! Counters updated by the REST thread and the dispatching thread, and the
//! [`RestMetrics`] snapshot built from them.
//!
//! ```text
//!     submitted ──► sent ──┬──► succeeded
//!                          ├──► retried ──► sent ...
//!                          ├──► failed
//!                          └──► ratelimited (429, also counted as retried/failed)
//!     canceled: dropped at shutdown, never dispatched
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Live counters shared between threads.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    submitted: AtomicU64,
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    ratelimited: AtomicU64,
    global_ratelimits: AtomicU64,
    canceled: AtomicU64,
    consecutive_failures: AtomicU32,
    known_buckets: AtomicUsize,
}

impl MetricsRecorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ratelimited(&self, global: bool) {
        self.ratelimited.fetch_add(1, Ordering::Relaxed);
        if global {
            self.global_ratelimits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_outcome(&self, ok: bool) {
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_known_buckets(&self, count: usize) {
        self.known_buckets.store(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RestMetrics {
        RestMetrics {
            submitted: self.submitted.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            ratelimited: self.ratelimited.load(Ordering::Relaxed),
            global_ratelimits: self.global_ratelimits.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            known_buckets: self.known_buckets.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a client's REST activity.
///
/// # Example
///
/// ```rust
/// use winecord::{Client, RestConfig};
///
/// let client = Client::new(RestConfig::webhook()).unwrap();
/// let metrics = client.metrics();
/// assert_eq!(metrics.submitted, 0);
/// println!("{}", metrics.summary());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestMetrics {
    /// Requests accepted by `begin`.
    pub submitted: u64,
    /// Transfers started, retries included.
    pub sent: u64,
    /// Requests finished with a 2xx and a decodable body.
    pub succeeded: u64,
    /// Requests finished with an error.
    pub failed: u64,
    /// Transfers requeued for another attempt.
    pub retried: u64,
    /// 429 responses received.
    pub ratelimited: u64,
    /// 429 responses flagged as global.
    pub global_ratelimits: u64,
    /// Requests dropped by cancellation or shutdown.
    pub canceled: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Buckets discovered from response headers.
    pub known_buckets: usize,
}

impl RestMetrics {
    /// Fraction of finished requests that succeeded, `1.0` before any finished.
    #[inline]
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            1.0
        } else {
            self.succeeded as f64 / total as f64
        }
    }

    /// Fraction of transfers that were retries.
    #[inline]
    pub fn retry_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.retried as f64 / self.sent as f64
        }
    }

    /// Fraction of transfers answered with 429.
    #[inline]
    pub fn ratelimit_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.ratelimited as f64 / self.sent as f64
        }
    }

    /// Requests submitted but not finished or canceled yet.
    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.submitted
            .saturating_sub(self.succeeded + self.failed + self.canceled)
    }

    /// Half the requests fail, or more than one transfer in ten hits a 429.
    pub fn is_under_pressure(&self) -> bool {
        self.success_rate() < 0.5 || self.ratelimit_rate() > 0.1
    }

    /// A failure streak, or failures above 30%.
    pub fn is_under_sustained_pressure(&self) -> bool {
        self.consecutive_failures > 10 || self.success_rate() < 0.7
    }

    /// Three-level assessment of the client.
    pub fn health_status(&self) -> HealthStatus {
        if self.is_under_sustained_pressure() {
            HealthStatus::Critical
        } else if self.is_under_pressure() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Human-readable report.
    ///
    /// ```text
    /// REST Metrics:
    /// ├─ Requests:
    /// │  ├─ Submitted: 120
    /// │  ├─ Outstanding: 3
    /// │  ├─ Succeeded: 110
    /// │  ├─ Failed: 2
    /// │  └─ Canceled: 5
    /// ...
    /// ```
    pub fn summary(&self) -> String {
        format!(
            "REST Metrics:\n\
             ├─ Requests:\n\
             │  ├─ Submitted: {}\n\
             │  ├─ Outstanding: {}\n\
             │  ├─ Succeeded: {}\n\
             │  ├─ Failed: {}\n\
             │  └─ Canceled: {}\n\
             ├─ Transfers:\n\
             │  ├─ Sent: {}\n\
             │  ├─ Retried: {} ({:.2}%)\n\
             │  ├─ Ratelimited: {} ({:.2}%)\n\
             │  └─ Global Cooldowns: {}\n\
             ├─ Buckets: {}\n\
             └─ Health:\n\
                ├─ Status: {:?}\n\
                ├─ Success Rate: {:.2}%\n\
                └─ Consecutive Failures: {}",
            self.submitted,
            self.outstanding(),
            self.succeeded,
            self.failed,
            self.canceled,
            self.sent,
            self.retried,
            self.retry_rate() * 100.0,
            self.ratelimited,
            self.ratelimit_rate() * 100.0,
            self.global_ratelimits,
            self.known_buckets,
            self.health_status(),
            self.success_rate() * 100.0,
            self.consecutive_failures,
        )
    }
}

impl fmt::Display for RestMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Health of a client's REST traffic.
///
/// ```text
///     Healthy ──────► requests succeed, few 429s
///        │
///     Degraded ─────► frequent 429s or failures, monitor
///        │
///     Critical ─────► failure streak, check token and payloads
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Frequent ratelimits or failures.
    Degraded,
    /// Sustained failures.
    Critical,
}

impl HealthStatus {
    /// Returns true for anything but `Healthy`.
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, Self::Healthy)
    }

    /// Operator guidance for the status.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Healthy => "No action needed",
            Self::Degraded => "Monitor closely, consider spreading requests over time",
            Self::Critical => "Immediate action required: check credentials and payloads",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "✅ Healthy"),
            Self::Degraded => write!(f, "⚠️ Degraded"),
            Self::Critical => write!(f, "🔴 Critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_snapshot() {
        let recorder = MetricsRecorder::new();
        recorder.record_submitted();
        recorder.record_submitted();
        recorder.record_sent();
        recorder.record_sent();
        recorder.record_sent();
        recorder.record_retried();
        recorder.record_ratelimited(true);
        recorder.record_outcome(true);
        recorder.record_canceled();
        recorder.set_known_buckets(4);

        let metrics = recorder.snapshot();
        assert_eq!(metrics.submitted, 2);
        assert_eq!(metrics.sent, 3);
        assert_eq!(metrics.retried, 1);
        assert_eq!(metrics.ratelimited, 1);
        assert_eq!(metrics.global_ratelimits, 1);
        assert_eq!(metrics.succeeded, 1);
        assert_eq!(metrics.canceled, 1);
        assert_eq!(metrics.outstanding(), 0);
        assert_eq!(metrics.known_buckets, 4);
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let recorder = MetricsRecorder::new();
        for _ in 0..5 {
            recorder.record_outcome(false);
        }
        assert_eq!(recorder.snapshot().consecutive_failures, 5);
        recorder.record_outcome(true);
        assert_eq!(recorder.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_rates() {
        let metrics = RestMetrics {
            submitted: 100,
            sent: 120,
            succeeded: 90,
            failed: 10,
            retried: 20,
            ratelimited: 6,
            ..Default::default()
        };
        assert_eq!(metrics.success_rate(), 0.9);
        assert!((metrics.retry_rate() - 20.0 / 120.0).abs() < 1e-9);
        assert_eq!(metrics.ratelimit_rate(), 0.05);
        assert_eq!(metrics.health_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_empty_metrics_are_healthy() {
        let metrics = RestMetrics::default();
        assert_eq!(metrics.success_rate(), 1.0);
        assert_eq!(metrics.retry_rate(), 0.0);
        assert_eq!(metrics.health_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_health_levels() {
        let degraded = RestMetrics {
            sent: 10,
            succeeded: 10,
            ratelimited: 3,
            ..Default::default()
        };
        assert_eq!(degraded.health_status(), HealthStatus::Degraded);

        let critical = RestMetrics {
            succeeded: 5,
            failed: 20,
            consecutive_failures: 12,
            ..Default::default()
        };
        assert_eq!(critical.health_status(), HealthStatus::Critical);
        assert!(critical.health_status().is_unhealthy());
        assert!(critical.health_status().suggested_action().contains("Immediate"));
    }

    #[test]
    fn test_display() {
        let metrics = RestMetrics {
            submitted: 3,
            sent: 3,
            succeeded: 3,
            ..Default::default()
        };
        let text = format!("{}", metrics);
        assert!(text.contains("REST Metrics"));
        assert!(text.contains("Submitted: 3"));
        assert!(format!("{}", HealthStatus::Degraded).contains("Degraded"));
    }
}
