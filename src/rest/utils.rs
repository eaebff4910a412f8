//! # Utility Functions (utils.rs)
//!
//! Clock and wakeup helpers shared by the REST thread and the main loop.
//!
//! ## Time Base
//!
//! ```text
//!     process start ──► capture (Instant, epoch ms) once
//!                            │
//!     now() ─────────────────┴──► epoch ms + Instant::elapsed()
//!
//!     Wall-clock jumps after start do not move 'now' backwards;
//!     ratelimit deadlines and timer triggers stay monotonic.
//! ```
//!
//! ## Poller
//!
//! Both threads block in [`Poller::wait`] until the nearest deadline, and any
//! other thread can cut that wait short with [`Poller::wakeup`] (new pending
//! request, finished transfer, timer change).

use parking_lot::{Condvar, Mutex};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// Wall-clock epoch at process start, advanced with a monotonic Instant.
static START_TIME_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

#[inline(always)]
fn time_base() -> &'static (Instant, u64) {
    START_TIME_BASE.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        (Instant::now(), epoch_ms)
    })
}

/// Returns the current time in milliseconds since UNIX epoch.
///
/// Bucket reset timestamps and the global cooldown are kept in this unit.
///
/// # Example
///
/// ```rust
/// use winecord::current_time_ms;
///
/// let now = current_time_ms();
/// println!("Current timestamp: {} ms", now);
/// ```
#[inline(always)]
pub fn current_time_ms() -> u64 {
    let (start, base_ms) = time_base();
    base_ms.saturating_add(start.elapsed().as_millis() as u64)
}

/// Returns the current time in microseconds since UNIX epoch.
///
/// Timer triggers are stored with this precision.
///
/// # Example
///
/// ```rust
/// use winecord::current_time_us;
///
/// let start = current_time_us();
/// // ... some operation ...
/// let elapsed = current_time_us() - start;
/// println!("Operation took {} microseconds", elapsed);
/// ```
#[inline(always)]
pub fn current_time_us() -> u64 {
    let (start, base_ms) = time_base();
    base_ms
        .saturating_mul(1000)
        .saturating_add(start.elapsed().as_micros() as u64)
}

/// Sub-second milliseconds of the current time (0..1000).
///
/// Used to correct the provider's second-granular `date` header.
#[inline]
pub(crate) fn current_subsec_ms() -> u64 {
    current_time_ms() % 1000
}

/// Wakeup primitive a thread blocks on between loop iterations.
///
/// A wakeup delivered while nobody waits is remembered, so the next
/// [`wait`](Poller::wait) returns immediately instead of sleeping through it.
#[derive(Debug, Default)]
pub struct Poller {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl Poller {
    /// Creates a poller with no pending wakeup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupts the current (or next) wait.
    pub fn wakeup(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.cond.notify_all();
    }

    /// Blocks for at most `timeout`.
    ///
    /// Returns `true` if a wakeup arrived, `false` if the full timeout elapsed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut woken = self.woken.lock();
        while !*woken {
            if self.cond.wait_until(&mut woken, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *woken, false)
    }
}

/// Parses a decimal header value, tolerating surrounding whitespace.
pub(crate) fn parse_header_f64(value: Option<&str>) -> Option<f64> {
    value.and_then(|v| v.trim().parse::<f64>().ok())
}
