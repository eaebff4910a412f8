//! # REST Manager Thread (manager.rs)
//!
//! A dedicated thread drives the [`RestWorker`](crate::rest::requestor::RestWorker):
//!
//! ```text
//!     loop while running:
//!         perform()                       drain completions, start pending
//!         wait = next ratelimit timer     capped at max_poll_wait_ms
//!         poller.wait(wait)               cut short by wakeup()
//!         if not woken and the next timer is under 1 ms away: sleep it off
//!         run due ratelimit timers
//!     cleanup()                           cancel every request and timer
//! ```
//!
//! Shutdown clears the running flag and arms a 1 ms repeating timer so the
//! thread notices promptly even while transfers are outstanding.

use crate::rest::error::{RestError, Result};
use crate::rest::ratelimit::Ratelimiter;
use crate::rest::requestor::RestWorker;
use crate::rest::timer::{Timer, Timers};
use crate::rest::utils::{current_time_us, Poller};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wait below which the thread sleeps instead of polling.
const SPIN_THRESHOLD_US: u64 = 1000;

/// Handle to the running REST thread.
pub(crate) struct RestManager {
    running: Arc<AtomicBool>,
    poller: Arc<Poller>,
    timers: Arc<Timers<Ratelimiter>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for RestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestManager")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("joined", &self.handle.is_none())
            .finish()
    }
}

impl RestManager {
    /// Spawns the REST thread around `worker`.
    pub(crate) fn start(worker: RestWorker, poller: Arc<Poller>, max_poll_wait_ms: u64) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let timers = Arc::clone(worker.timers());

        let flag = Arc::clone(&running);
        let thread_poller = Arc::clone(&poller);
        let handle = thread::Builder::new()
            .name("winecord-rest".to_string())
            .spawn(move || rest_loop(worker, flag, thread_poller, max_poll_wait_ms))
            .map_err(|err| RestError::Transport {
                message: format!("couldn't spawn the REST thread: {}", err),
                retryable: false,
            })?;

        Ok(Self {
            running,
            poller,
            timers,
            handle: Some(handle),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::Acquire)
    }

    /// Stops the thread and waits for its cleanup to finish.
    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.running.store(false, Ordering::Release);
        // wake up every ms until the thread exits
        self.timers.ctl(Timer::new().with_delay(0).with_interval(1, -1));
        self.poller.wakeup();

        if handle.join().is_err() {
            warn!("REST thread panicked before shutdown");
        }
        debug!("REST thread joined");
    }
}

impl Drop for RestManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn rest_loop(mut worker: RestWorker, running: Arc<AtomicBool>, poller: Arc<Poller>, max_poll_wait_ms: u64) {
    let max_wait_us = max_poll_wait_ms.saturating_mul(1000);
    info!("REST thread started (max poll wait: {}ms)", max_poll_wait_ms);

    while running.load(Ordering::Acquire) {
        worker.perform();

        let wait_us = worker.next_trigger(current_time_us(), max_wait_us);
        let woken = wait_us > 0 && poller.wait(Duration::from_micros(wait_us));

        if !woken {
            let wait_us = worker.next_trigger(current_time_us(), SPIN_THRESHOLD_US);
            if wait_us > 0 && wait_us < SPIN_THRESHOLD_US {
                thread::sleep(Duration::from_micros(wait_us));
            }
        }
        worker.run_timers();
    }

    worker.cleanup();
    info!("REST thread stopped");
}
