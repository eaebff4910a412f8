//! # Timer Queue (timer.rs)
//!
//! A priority queue of scheduled callbacks ordered by absolute trigger time
//! (microseconds). The REST thread uses one group to wake exhausted buckets;
//! the client owns an internal and a user group for its main loop.
//!
//! ## Ordering
//!
//! ```text
//!     trigger:   0      1_000   42_000   ...   -1 (disabled)
//!               ┌──┐   ┌──┐    ┌──┐           ┌──┐
//!     queue:    │t3│ ─►│t1│ ─► │t7│ ─► ... ─► │t2│   never fires
//!               └──┘   └──┘    └──┘           └──┘
//!                ▲
//!                └── peek / run-pass starts here
//! ```
//!
//! ## Run Pass
//!
//! ```text
//!     while head.trigger <= now (bounded: 100 000 iterations, 10 ms):
//!         CANCELED | DELETE set ─► on_status_changed (and remove if DELETE)
//!         otherwise            ─► repeat -= 1, on_tick
//!         callback mutated its own timer through the queue?
//!             yes ─► keep the queue's version, skip reschedule
//!             no  ─► reschedule at (now | trigger if fixed) + interval,
//!                    or disable (-1) / delete when exhausted
//! ```
//!
//! Callbacks run with the queue lock released, so a callback may create,
//! update or cancel timers of the same group (including itself). Other
//! threads that touch the group during a run pass wait until it finishes.

use crate::rest::utils::{current_time_us, Poller};
use ahash::RandomState;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::trace;

/// Maximum timers processed by one run pass.
const MAX_ITERATIONS: u32 = 100_000;

/// Wall time budget of one run pass, in microseconds.
const RUN_BUDGET_US: u64 = 10_000;

/// Timer behavior flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TimerFlags(u32);

impl TimerFlags {
    /// `delay` and `interval` are milliseconds (the default).
    pub const MILLISECONDS: TimerFlags = TimerFlags(0);
    /// `delay` and `interval` are microseconds.
    pub const MICROSECONDS: TimerFlags = TimerFlags(1 << 0);
    /// Remove the timer on the next run pass.
    pub const DELETE: TimerFlags = TimerFlags(1 << 1);
    /// Remove the timer once canceled or out of repeats.
    pub const DELETE_AUTO: TimerFlags = TimerFlags(1 << 2);
    /// The timer was canceled; its status callback fires on the next pass.
    pub const CANCELED: TimerFlags = TimerFlags(1 << 3);
    /// Reschedule relative to the previous trigger instead of now (no drift).
    pub const INTERVAL_FIXED: TimerFlags = TimerFlags(1 << 4);
    /// Set while `on_tick` runs.
    pub const TICK: TimerFlags = TimerFlags(1 << 5);

    const ALLOWED: TimerFlags = TimerFlags(
        Self::MICROSECONDS.0 | Self::DELETE.0 | Self::DELETE_AUTO.0 | Self::INTERVAL_FIXED.0,
    );
    const STATUS: TimerFlags = TimerFlags(Self::CANCELED.0 | Self::DELETE.0);

    /// No flags set.
    pub const fn empty() -> Self {
        TimerFlags(0)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every flag in `other` is set.
    pub const fn contains(self, other: TimerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if any flag in `other` is set.
    pub const fn intersects(self, other: TimerFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Sets `other`.
    pub fn insert(&mut self, other: TimerFlags) {
        self.0 |= other.0;
    }

    /// Clears `other`.
    pub fn remove(&mut self, other: TimerFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for TimerFlags {
    type Output = TimerFlags;
    fn bitor(self, rhs: TimerFlags) -> TimerFlags {
        TimerFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TimerFlags {
    fn bitor_assign(&mut self, rhs: TimerFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TimerFlags {
    type Output = TimerFlags;
    fn bitand(self, rhs: TimerFlags) -> TimerFlags {
        TimerFlags(self.0 & rhs.0)
    }
}

impl BitAndAssign for TimerFlags {
    fn bitand_assign(&mut self, rhs: TimerFlags) {
        self.0 &= rhs.0;
    }
}

impl Not for TimerFlags {
    type Output = TimerFlags;
    fn not(self) -> TimerFlags {
        TimerFlags(!self.0)
    }
}

impl fmt::Debug for TimerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TimerFlags, &str); 6] = [
            (TimerFlags::MICROSECONDS, "MICROSECONDS"),
            (TimerFlags::DELETE, "DELETE"),
            (TimerFlags::DELETE_AUTO, "DELETE_AUTO"),
            (TimerFlags::CANCELED, "CANCELED"),
            (TimerFlags::INTERVAL_FIXED, "INTERVAL_FIXED"),
            (TimerFlags::TICK, "TICK"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{}", name));
            }
        }
        list.finish()
    }
}

/// Identifier of a timer within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u32);

impl TimerId {
    /// Raw value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback fired by a run pass. `C` is the context the group is run with.
pub type TimerCallback<C> = Arc<dyn Fn(&mut C, &mut Timer<C>) + Send + Sync>;

/// A scheduled unit of work.
///
/// # Example
///
/// ```rust
/// use winecord::{Timer, TimerFlags, Timers};
///
/// let timers: Timers<Vec<&'static str>> = Timers::new("demo");
/// let id = timers
///     .ctl(
///         Timer::new()
///             .with_delay(0)
///             .with_flags(TimerFlags::DELETE_AUTO)
///             .on_tick(|log: &mut Vec<&'static str>, _| log.push("tick")),
///     )
///     .unwrap();
///
/// let mut log = Vec::new();
/// timers.run(&mut log);
/// assert_eq!(log, vec!["tick"]);
/// assert!(timers.get(id).is_none());
/// ```
pub struct Timer<C> {
    /// Assigned by the group; `None` creates a new timer on [`Timers::ctl`].
    pub id: Option<TimerId>,
    /// Behavior flags.
    pub flags: TimerFlags,
    /// Delay before the first trigger; negative disables the timer.
    pub delay: i64,
    /// Interval between triggers; negative disables rescheduling.
    pub interval: i64,
    /// Remaining ticks; negative repeats forever, 0 stops after this tick.
    pub repeat: i64,
    /// Fired on every tick.
    pub on_tick: Option<TimerCallback<C>>,
    /// Fired when the timer is canceled or deleted.
    pub on_status_changed: Option<TimerCallback<C>>,
}

impl<C> Timer<C> {
    /// One-shot timer firing immediately, with no callbacks.
    pub fn new() -> Self {
        Self {
            id: None,
            flags: TimerFlags::empty(),
            delay: 0,
            interval: 0,
            repeat: 0,
            on_tick: None,
            on_status_changed: None,
        }
    }

    /// Sets the delay before the first trigger.
    pub fn with_delay(mut self, delay: i64) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the interval and repeat count.
    pub fn with_interval(mut self, interval: i64, repeat: i64) -> Self {
        self.interval = interval;
        self.repeat = repeat;
        self
    }

    /// Adds flags.
    pub fn with_flags(mut self, flags: TimerFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the tick callback.
    pub fn on_tick<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C, &mut Timer<C>) + Send + Sync + 'static,
    {
        self.on_tick = Some(Arc::new(f));
        self
    }

    /// Sets the status callback.
    pub fn on_status_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C, &mut Timer<C>) + Send + Sync + 'static,
    {
        self.on_status_changed = Some(Arc::new(f));
        self
    }

    fn scale(&self, value: i64) -> i64 {
        if self.flags.contains(TimerFlags::MICROSECONDS) {
            value
        } else {
            value.saturating_mul(1000)
        }
    }
}

impl<C> Default for Timer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Clone for Timer<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            flags: self.flags,
            delay: self.delay,
            interval: self.interval,
            repeat: self.repeat,
            on_tick: self.on_tick.clone(),
            on_status_changed: self.on_status_changed.clone(),
        }
    }
}

impl<C> fmt::Debug for Timer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("delay", &self.delay)
            .field("interval", &self.interval)
            .field("repeat", &self.repeat)
            .field("on_tick", &self.on_tick.is_some())
            .field("on_status_changed", &self.on_status_changed.is_some())
            .finish()
    }
}

/// Who is running the group right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running {
        thread: ThreadId,
        current: Option<TimerId>,
        /// The current timer was modified through the queue by its own callback.
        diverted: bool,
    },
}

/// Puts a group back to `Idle` when a callback unwinds out of a run pass.
struct RunReset<'a, C> {
    timers: &'a Timers<C>,
    armed: bool,
}

impl<C> Drop for RunReset<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.timers.state.lock().run = RunState::Idle;
            self.timers.idle.notify_all();
        }
    }
}

struct Entry<C> {
    trigger: i64,
    timer: Timer<C>,
}

/// Disabled timers (-1) sort after every enabled one.
#[inline]
fn order_key(trigger: i64) -> u64 {
    if trigger < 0 {
        u64::MAX
    } else {
        trigger as u64
    }
}

struct TimerState<C> {
    entries: HashMap<TimerId, Entry<C>, RandomState>,
    order: BTreeSet<(u64, TimerId)>,
    next_id: u32,
    run: RunState,
}

impl<C> TimerState<C> {
    fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(RandomState::new()),
            order: BTreeSet::new(),
            next_id: 1,
            run: RunState::Idle,
        }
    }

    fn push(&mut self, trigger: i64, mut timer: Timer<C>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        timer.id = Some(id);
        self.order.insert((order_key(trigger), id));
        self.entries.insert(id, Entry { trigger, timer });
        id
    }

    fn update(&mut self, id: TimerId, trigger: i64, mut timer: Timer<C>) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        self.order.remove(&(order_key(entry.trigger), id));
        self.order.insert((order_key(trigger), id));
        timer.id = Some(id);
        entry.trigger = trigger;
        entry.timer = timer;
        true
    }

    fn del(&mut self, id: TimerId) -> Option<Entry<C>> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&(order_key(entry.trigger), id));
        Some(entry)
    }

    fn peek(&self) -> Option<(TimerId, i64)> {
        let &(_, id) = self.order.iter().next()?;
        self.entries.get(&id).map(|entry| (id, entry.trigger))
    }

    fn pop(&mut self) -> Option<Entry<C>> {
        let (id, _) = self.peek()?;
        self.del(id)
    }

    fn divert_if_active(&mut self, id: TimerId) {
        if let RunState::Running { current: Some(current), diverted, .. } = &mut self.run {
            if *current == id {
                *diverted = true;
            }
        }
    }

    fn ctl(&mut self, timer: Timer<C>) -> Option<TimerId> {
        if let Some(id) = timer.id {
            if !self.entries.contains_key(&id) {
                return None;
            }
        }
        let (trigger, timer) = Self::arm(timer);

        match timer.id {
            None => Some(self.push(trigger, timer)),
            Some(id) => {
                self.divert_if_active(id);
                self.update(id, trigger, timer).then_some(id)
            }
        }
    }

    fn create(&mut self, mut timer: Timer<C>) -> TimerId {
        timer.id = None;
        let (trigger, timer) = Self::arm(timer);
        self.push(trigger, timer)
    }

    /// Computes the trigger for a freshly set timer.
    fn arm(mut timer: Timer<C>) -> (i64, Timer<C>) {
        let mut trigger = -1;
        if timer.delay >= 0 {
            trigger = (current_time_us() as i64).saturating_add(timer.scale(timer.delay));
        }
        if timer.flags.intersects(TimerFlags::STATUS) {
            trigger = 0;
        }
        timer.flags &= TimerFlags::ALLOWED | TimerFlags::CANCELED;
        (trigger, timer)
    }
}

/// A group of timers sharing one queue.
///
/// `C` is the context handed to callbacks by [`run`](Timers::run); the REST
/// thread runs its group with the ratelimiter, the client with itself.
pub struct Timers<C> {
    name: &'static str,
    state: Mutex<TimerState<C>>,
    idle: Condvar,
    poller: Option<Arc<Poller>>,
}

impl<C> fmt::Debug for Timers<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timers")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

impl<C> Timers<C> {
    /// Creates an empty group.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(TimerState::new()),
            idle: Condvar::new(),
            poller: None,
        }
    }

    /// Creates an empty group whose modifications wake `poller`.
    pub(crate) fn with_poller(name: &'static str, poller: Arc<Poller>) -> Self {
        Self {
            poller: Some(poller),
            ..Self::new(name)
        }
    }

    /// Locks the queue, waiting out a run pass owned by another thread.
    fn lock(&self) -> MutexGuard<'_, TimerState<C>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.run {
                RunState::Running { thread, .. } if thread != me => self.idle.wait(&mut state),
                _ => return state,
            }
        }
    }

    /// Releases the queue and wakes the owning loop if it may be sleeping.
    fn unlock(&self, state: MutexGuard<'_, TimerState<C>>) {
        let should_wakeup = state.run == RunState::Idle;
        drop(state);
        if should_wakeup {
            if let Some(poller) = &self.poller {
                poller.wakeup();
            }
        }
    }

    /// Creates (`timer.id == None`) or updates a timer.
    ///
    /// The trigger becomes `now + delay`; a negative delay disables the timer
    /// and `CANCELED`/`DELETE` make it due immediately.
    ///
    /// Returns `None` when updating a timer that no longer exists.
    pub fn ctl(&self, timer: Timer<C>) -> Option<TimerId> {
        let mut state = self.lock();
        let id = state.ctl(timer);
        self.unlock(state);
        id
    }

    /// One-shot timer deleted after it fires.
    pub fn timer<F>(&self, on_tick: F, delay: i64) -> TimerId
    where
        F: Fn(&mut C, &mut Timer<C>) + Send + Sync + 'static,
    {
        let timer = Timer::new()
            .with_delay(delay)
            .with_flags(TimerFlags::DELETE_AUTO)
            .on_tick(on_tick);
        let mut state = self.lock();
        let id = state.create(timer);
        self.unlock(state);
        id
    }

    /// Repeating timer deleted once `repeat` ticks have fired.
    pub fn timer_interval<F>(&self, on_tick: F, delay: i64, interval: i64, repeat: i64) -> TimerId
    where
        F: Fn(&mut C, &mut Timer<C>) + Send + Sync + 'static,
    {
        let timer = Timer::new()
            .with_delay(delay)
            .with_interval(interval, repeat)
            .with_flags(TimerFlags::DELETE_AUTO)
            .on_tick(on_tick);
        let mut state = self.lock();
        let id = state.create(timer);
        self.unlock(state);
        id
    }

    /// Copy of a timer's current settings.
    pub fn get(&self, id: TimerId) -> Option<Timer<C>> {
        let state = self.lock();
        let timer = state.entries.get(&id).map(|entry| entry.timer.clone());
        self.unlock(state);
        timer
    }

    /// Trigger of a timer, `-1` when disabled.
    pub fn trigger_of(&self, id: TimerId) -> Option<i64> {
        let state = self.lock();
        let trigger = state.entries.get(&id).map(|entry| entry.trigger);
        self.unlock(state);
        trigger
    }

    /// Re-arms a timer at `now + delay`; a negative delay is clamped to 0.
    pub fn start(&self, id: TimerId) -> bool {
        let mut state = self.lock();
        state.divert_if_active(id);
        let result = match state.entries.get(&id).map(|entry| entry.timer.clone()) {
            Some(mut timer) => {
                if timer.delay < 0 {
                    timer.delay = 0;
                }
                state.ctl(timer).is_some()
            }
            None => false,
        };
        self.unlock(state);
        result
    }

    /// Disables a timer without removing it.
    pub fn stop(&self, id: TimerId) -> bool {
        let mut state = self.lock();
        state.divert_if_active(id);
        let result = match state.entries.get(&id).map(|entry| entry.timer.clone()) {
            Some(timer) => state.update(id, -1, timer),
            None => false,
        };
        self.unlock(state);
        result
    }

    fn add_flags(&self, id: TimerId, flags: TimerFlags) -> bool {
        let mut state = self.lock();
        state.divert_if_active(id);
        let result = match state.entries.get(&id).map(|entry| entry.timer.clone()) {
            Some(mut timer) => {
                timer.flags |= flags;
                state.update(id, 0, timer)
            }
            None => false,
        };
        self.unlock(state);
        result
    }

    /// Cancels a timer; its status callback fires on the next run pass.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.add_flags(id, TimerFlags::CANCELED)
    }

    /// Deletes a timer on the next run pass.
    pub fn delete(&self, id: TimerId) -> bool {
        self.add_flags(id, TimerFlags::DELETE)
    }

    /// Cancels and deletes a timer on the next run pass.
    pub fn cancel_and_delete(&self, id: TimerId) -> bool {
        self.add_flags(id, TimerFlags::CANCELED | TimerFlags::DELETE)
    }

    /// Number of allocated timers, enabled or not.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if the group holds no timers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Microseconds until the soonest enabled timer, capped at `max_us`.
    ///
    /// Returns 0 when a timer is already due or the group is busy.
    pub fn next_trigger(&self, now_us: u64, max_us: u64) -> u64 {
        if max_us == 0 {
            return 0;
        }
        let Some(state) = self.state.try_lock() else {
            return 0;
        };
        match state.peek() {
            Some((_, trigger)) if trigger >= 0 => {
                let trigger = trigger as u64;
                if trigger <= now_us {
                    0
                } else {
                    max_us.min(trigger - now_us)
                }
            }
            _ => max_us,
        }
    }

    /// Fires every due timer.
    pub fn run(&self, ctx: &mut C) {
        self.run_at(ctx, current_time_us());
    }

    /// Fires every timer due at `now_us`.
    pub(crate) fn run_at(&self, ctx: &mut C, now_us: u64) {
        let wall_start = current_time_us();
        let mut now = now_us as i64;

        let mut reset = RunReset { timers: self, armed: true };
        let mut state = self.state.lock();
        state.run = RunState::Running {
            thread: thread::current().id(),
            current: None,
            diverted: false,
        };

        let mut iterations = MAX_ITERATIONS;
        while iterations > 0 {
            iterations -= 1;

            let Some((id, trigger)) = state.peek() else {
                break;
            };

            if (iterations + 1) & 0x1F == 0 {
                now = now.max(current_time_us() as i64);
                if current_time_us().saturating_sub(wall_start) > RUN_BUDGET_US {
                    break;
                }
            }

            if trigger > now || trigger < 0 {
                break;
            }

            let Some(mut timer) = state.entries.get(&id).map(|entry| entry.timer.clone()) else {
                break;
            };
            if let RunState::Running { current, diverted, .. } = &mut state.run {
                *current = Some(id);
                *diverted = false;
            }

            let mut prev_flags = timer.flags;
            let mut deleted = false;
            loop {
                let cb = if timer.flags.intersects(TimerFlags::STATUS) {
                    if timer.flags.contains(TimerFlags::DELETE) {
                        Self::delete_now(&mut state, ctx, &mut timer, id);
                        deleted = true;
                        break;
                    }
                    timer.on_status_changed.clone()
                } else {
                    if timer.repeat > 0 {
                        timer.repeat -= 1;
                    }
                    timer.flags |= TimerFlags::TICK;
                    timer.on_tick.clone()
                };

                prev_flags = timer.flags;
                if let Some(cb) = cb {
                    MutexGuard::unlocked(&mut state, || cb(ctx, &mut timer));
                }
                timer.flags.remove(TimerFlags::TICK);

                let newly_canceled = !prev_flags.contains(TimerFlags::CANCELED)
                    && timer.flags.contains(TimerFlags::CANCELED);
                if newly_canceled && !Self::is_diverted(&state) {
                    continue;
                }
                break;
            }
            if deleted {
                continue;
            }

            if Self::is_diverted(&state) {
                trace!("[timers:{}] timer {} updated by its own callback", self.name, id);
                continue;
            }

            if (timer.flags.contains(TimerFlags::CANCELED) || timer.repeat == 0)
                && timer.flags.contains(TimerFlags::DELETE_AUTO)
            {
                timer.flags |= TimerFlags::DELETE;
            }

            // canceled on the previous round, only report the deletion
            if timer.flags.contains(TimerFlags::DELETE) && prev_flags.contains(TimerFlags::CANCELED) {
                timer.flags.remove(TimerFlags::CANCELED);
            }
            if timer.flags.contains(TimerFlags::DELETE) {
                Self::delete_now(&mut state, ctx, &mut timer, id);
                continue;
            }

            let mut next = -1;
            if timer.delay != -1
                && timer.interval >= 0
                && timer.repeat != 0
                && !timer.flags.contains(TimerFlags::CANCELED)
            {
                let base = if timer.flags.contains(TimerFlags::INTERVAL_FIXED) { trigger } else { now };
                next = base.saturating_add(timer.scale(timer.interval));
            }
            timer.flags &= TimerFlags::ALLOWED;
            state.update(id, next, timer);
        }

        state.run = RunState::Idle;
        drop(state);
        self.idle.notify_all();
        reset.armed = false;
    }

    fn is_diverted(state: &TimerState<C>) -> bool {
        matches!(state.run, RunState::Running { diverted: true, .. })
    }

    fn delete_now(state: &mut MutexGuard<'_, TimerState<C>>, ctx: &mut C, timer: &mut Timer<C>, id: TimerId) {
        state.del(id);
        if let Some(cb) = timer.on_status_changed.clone() {
            MutexGuard::unlocked(state, || cb(ctx, timer));
        }
        if let RunState::Running { diverted, .. } = &mut state.run {
            *diverted = false;
        }
    }

    /// Removes every timer, firing status callbacks with `CANCELED | DELETE`.
    pub fn cleanup(&self, ctx: &mut C) {
        loop {
            let Some(entry) = self.lock().pop() else {
                break;
            };
            let mut timer = entry.timer;
            timer.flags |= TimerFlags::CANCELED | TimerFlags::DELETE;
            if let Some(cb) = timer.on_status_changed.clone() {
                cb(ctx, &mut timer);
            }
        }
    }
}
