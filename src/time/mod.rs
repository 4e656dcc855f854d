//! Time sources and the timer driver.
//!
//! The crate never reads the system clock directly. Everything that needs
//! "now" goes through a [`TimeSource`], so tests can substitute a
//! [`VirtualClock`] and advance time deterministically while production
//! code uses [`WallClock`].
//!
//! The [`TimerDriver`] is a passive deadline registry: futures register a
//! `(deadline, Waker)` pair and the embedding event loop calls
//! [`TimerDriver::process_timers`] to fire everything due. There is no
//! background thread; if nobody turns the driver, no timer fires.
//!
//! # Cancel Safety
//!
//! Dropping a [`Sleep`] future cancels its timer entry. A cancelled entry
//! never wakes anyone.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::{Duration, Instant};

use tracing::trace;

/// A point on the driver's timeline, in nanoseconds since an arbitrary epoch.
///
/// `Time` is a plain count, not a wall-clock date: two `Time` values are
/// only comparable when they come from the same [`TimeSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The epoch itself.
    pub const ZERO: Self = Self(0);

    /// Constructs a time from raw nanoseconds.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Constructs a time from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Constructs a time from whole seconds.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Raw nanoseconds since the epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whole milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Advances by `duration`, saturating at the far end of the timeline.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Elapsed span since `earlier`, or `None` if `earlier` is later.
    #[must_use]
    pub fn checked_duration_since(self, earlier: Self) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_nanos)
    }
}

/// Something that can report the current [`Time`].
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// The current instant on this source's timeline.
    fn now(&self) -> Time;
}

/// Monotonic wall-clock source anchored at construction.
#[derive(Debug)]
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    /// Creates a source whose epoch is "now".
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Time {
        let elapsed = self.epoch.elapsed();
        Time::from_nanos(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Time only moves when the test says so. `advance` past a registered
/// deadline does not fire anything by itself; the test still calls
/// [`TimerDriver::process_timers`] to deliver the wakeups, which keeps
/// firing order visible in the test body.
#[derive(Debug, Default)]
pub struct VirtualClock {
    nanos: AtomicU64,
}

impl VirtualClock {
    /// Creates a clock parked at [`Time::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Moves the clock forward to `target` if it is ahead of the current
    /// reading; a target in the past is ignored (time never runs backward).
    pub fn advance_to(&self, target: Time) {
        self.nanos.fetch_max(target.as_nanos(), Ordering::SeqCst);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Identifies one registered timer entry.
///
/// Handles are cheap value types; cancelling through a stale handle (the
/// entry already fired or was already cancelled) is a no-op that reports
/// `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    deadline: Time,
    id: u64,
}

impl TimerHandle {
    /// The deadline this entry was registered for.
    #[must_use]
    pub const fn deadline(&self) -> Time {
        self.deadline
    }
}

#[derive(Debug, Default)]
struct TimerQueue {
    // Keyed by (deadline, id): iteration order is firing order, and the id
    // disambiguates entries sharing a deadline.
    entries: BTreeMap<(Time, u64), Waker>,
    next_id: u64,
}

/// Deadline registry turned by the embedding event loop.
#[derive(Debug)]
pub struct TimerDriver {
    clock: Arc<dyn TimeSource>,
    queue: StdMutex<TimerQueue>,
}

impl TimerDriver {
    /// Creates a driver over the given source.
    #[must_use]
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            clock,
            queue: StdMutex::new(TimerQueue::default()),
        }
    }

    /// Convenience constructor over a fresh [`WallClock`].
    #[must_use]
    pub fn wall_clock() -> Self {
        Self::new(Arc::new(WallClock::new()))
    }

    /// The current instant on the driver's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Registers `waker` to be woken once the clock reaches `deadline`.
    pub fn register(&self, deadline: Time, waker: Waker) -> TimerHandle {
        let mut queue = self.queue.lock().expect("timer queue lock poisoned");
        let id = queue.next_id;
        queue.next_id += 1;
        queue.entries.insert((deadline, id), waker);
        trace!(deadline = deadline.as_nanos(), id, "timer registered");
        TimerHandle { deadline, id }
    }

    /// Removes a registered entry. Returns `true` if the entry was still
    /// pending, `false` if it had already fired or been cancelled.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let mut queue = self.queue.lock().expect("timer queue lock poisoned");
        let removed = queue.entries.remove(&(handle.deadline, handle.id)).is_some();
        if removed {
            trace!(id = handle.id, "timer cancelled");
        }
        removed
    }

    /// Fires every entry whose deadline is at or before the clock's current
    /// reading. Returns the number of wakers invoked.
    pub fn process_timers(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<Waker> = {
            let mut queue = self.queue.lock().expect("timer queue lock poisoned");
            let boundary = (Time::from_nanos(now.as_nanos().saturating_add(1)), 0);
            let not_due = queue.entries.split_off(&boundary);
            let due = std::mem::replace(&mut queue.entries, not_due);
            due.into_values().collect()
        };
        let fired = due.len();
        if fired > 0 {
            trace!(fired, now = now.as_nanos(), "timers fired");
        }
        for waker in due {
            waker.wake();
        }
        fired
    }

    /// The earliest pending deadline, if any. Event loops use this to size
    /// their park timeout.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Time> {
        let queue = self.queue.lock().expect("timer queue lock poisoned");
        queue.entries.keys().next().map(|(time, _)| *time)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn pending(&self) -> usize {
        let queue = self.queue.lock().expect("timer queue lock poisoned");
        queue.entries.len()
    }

    /// Future that resolves once `duration` has elapsed on this driver.
    #[must_use]
    pub fn sleep(self: &Arc<Self>, duration: Duration) -> Sleep {
        self.sleep_until(self.now().saturating_add(duration))
    }

    /// Future that resolves once the clock reaches `deadline`.
    #[must_use]
    pub fn sleep_until(self: &Arc<Self>, deadline: Time) -> Sleep {
        Sleep {
            driver: Arc::clone(self),
            deadline,
            handle: None,
        }
    }
}

/// Future returned by [`TimerDriver::sleep`] and [`TimerDriver::sleep_until`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    driver: Arc<TimerDriver>,
    deadline: Time,
    handle: Option<TimerHandle>,
}

impl Sleep {
    /// The absolute deadline this sleep resolves at.
    #[must_use]
    pub const fn deadline(&self) -> Time {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.driver.now() >= this.deadline {
            if let Some(handle) = this.handle.take() {
                this.driver.cancel(&handle);
            }
            return Poll::Ready(());
        }
        // Re-register with the current waker; the previous entry (if any)
        // may hold a stale waker from an earlier poll.
        if let Some(handle) = this.handle.take() {
            this.driver.cancel(&handle);
        }
        this.handle = Some(this.driver.register(this.deadline, cx.waker().clone()));
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.driver.cancel(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;
    use std::task::Wake;

    struct NoopWaker;

    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    fn noop_waker() -> Waker {
        Waker::from(Arc::new(NoopWaker))
    }

    fn poll_once<F: Future>(future: Pin<&mut F>) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = TaskContext::from_waker(&waker);
        future.poll(&mut cx)
    }

    #[test]
    fn time_arithmetic() {
        let t = Time::from_millis(5);
        assert_eq!(t.as_nanos(), 5_000_000);
        assert_eq!(t.saturating_add(Duration::from_millis(3)).as_millis(), 8);
        assert_eq!(
            Time::from_secs(1).checked_duration_since(Time::from_millis(400)),
            Some(Duration::from_millis(600))
        );
        assert_eq!(Time::ZERO.checked_duration_since(Time::from_nanos(1)), None);
    }

    #[test]
    fn virtual_clock_never_runs_backward() {
        let clock = VirtualClock::new();
        clock.advance(Duration::from_millis(10));
        clock.advance_to(Time::from_millis(4));
        assert_eq!(clock.now(), Time::from_millis(10));
        clock.advance_to(Time::from_millis(25));
        assert_eq!(clock.now(), Time::from_millis(25));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let clock = Arc::new(VirtualClock::new());
        let driver = TimerDriver::new(clock.clone());
        driver.register(Time::from_millis(20), noop_waker());
        driver.register(Time::from_millis(10), noop_waker());
        assert_eq!(driver.next_deadline(), Some(Time::from_millis(10)));
        assert_eq!(driver.process_timers(), 0);

        clock.advance(Duration::from_millis(10));
        assert_eq!(driver.process_timers(), 1);
        assert_eq!(driver.next_deadline(), Some(Time::from_millis(20)));

        clock.advance(Duration::from_millis(10));
        assert_eq!(driver.process_timers(), 1);
        assert_eq!(driver.next_deadline(), None);
    }

    #[test]
    fn cancel_reports_pending_state() {
        let clock = Arc::new(VirtualClock::new());
        let driver = TimerDriver::new(clock.clone());
        let handle = driver.register(Time::from_millis(5), noop_waker());
        assert!(driver.cancel(&handle));
        assert!(!driver.cancel(&handle));

        let handle = driver.register(Time::from_millis(5), noop_waker());
        clock.advance(Duration::from_millis(5));
        assert_eq!(driver.process_timers(), 1);
        assert!(!driver.cancel(&handle));
    }

    #[test]
    fn sleep_resolves_after_advance() {
        let clock = Arc::new(VirtualClock::new());
        let driver = Arc::new(TimerDriver::new(clock.clone()));
        let mut sleep = pin!(driver.sleep(Duration::from_millis(3)));
        assert!(poll_once(sleep.as_mut()).is_pending());
        assert_eq!(driver.pending(), 1);

        clock.advance(Duration::from_millis(3));
        driver.process_timers();
        assert!(poll_once(sleep.as_mut()).is_ready());
        assert_eq!(driver.pending(), 0);
    }

    #[test]
    fn dropping_sleep_cancels_its_entry() {
        let clock = Arc::new(VirtualClock::new());
        let driver = Arc::new(TimerDriver::new(clock));
        {
            let mut sleep = Box::pin(driver.sleep(Duration::from_millis(3)));
            assert!(poll_once(sleep.as_mut()).is_pending());
            assert_eq!(driver.pending(), 1);
        }
        assert_eq!(driver.pending(), 0);
    }
}
