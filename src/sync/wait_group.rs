//! Completion barrier counter.
//!
//! A [`WaitGroup`] counts outstanding units of work. [`add`](WaitGroup::add)
//! and [`done`](WaitGroup::done) move the counter; [`wait`](WaitGroup::wait)
//! suspends until it reaches zero (and resolves immediately if it already
//! is). Driving the counter negative is a usage error and panics.
//!
//! [`guard`](WaitGroup::guard) is the preferred way to track a spawned
//! unit: it increments on creation and decrements on drop, on both the
//! success and panic paths.
//!
//! The group is reusable: after reaching zero the counter may grow again,
//! and later `wait` calls observe the new round.
//!
//! # Cancel Safety
//!
//! Dropping a wait future deregisters its waiter and never perturbs the
//! counter.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context as TaskContext, Poll, Waker};

use tracing::trace;

struct WgState {
    count: i64,
    waiters: Vec<(u64, Waker)>,
    next_waiter_id: u64,
}

struct WgShared {
    state: StdMutex<WgState>,
}

/// Counter of outstanding work units. Cloning shares the counter.
#[derive(Clone)]
pub struct WaitGroup {
    shared: Arc<WgShared>,
}

impl fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitGroup")
            .field("count", &self.count())
            .finish()
    }
}

impl WaitGroup {
    /// Creates a group with a zero counter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WgShared {
                state: StdMutex::new(WgState {
                    count: 0,
                    waiters: Vec::new(),
                    next_waiter_id: 0,
                }),
            }),
        }
    }

    /// Moves the counter by `delta` (which may be negative). Wakes every
    /// waiter when the counter reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the counter would go negative.
    pub fn add(&self, delta: i64) {
        let wakers: Vec<Waker> = {
            let mut state = self.shared.state.lock().expect("wait group state poisoned");
            state.count += delta;
            assert!(
                state.count >= 0,
                "wait group counter driven negative ({})",
                state.count
            );
            if state.count == 0 && !state.waiters.is_empty() {
                trace!(waiters = state.waiters.len(), "wait group reached zero");
                state.waiters.drain(..).map(|(_, waker)| waker).collect()
            } else {
                Vec::new()
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Marks one unit complete; equivalent to `add(-1)`.
    ///
    /// # Panics
    ///
    /// Panics if called more times than units were added.
    pub fn done(&self) {
        self.add(-1);
    }

    /// Current counter value.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.shared
            .state
            .lock()
            .expect("wait group state poisoned")
            .count
    }

    /// Future that resolves when the counter reaches zero.
    #[must_use]
    pub fn wait(&self) -> WaitGroupFuture<'_> {
        WaitGroupFuture {
            group: self,
            waiter_id: None,
        }
    }

    /// Tracks one unit with RAII: `add(1)` now, `done()` when the guard
    /// drops — including on the panic path.
    #[must_use]
    pub fn guard(&self) -> WaitGroupGuard {
        self.add(1);
        WaitGroupGuard {
            group: self.clone(),
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`WaitGroup::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct WaitGroupFuture<'a> {
    group: &'a WaitGroup,
    waiter_id: Option<u64>,
}

impl Future for WaitGroupFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut state = this
            .group
            .shared
            .state
            .lock()
            .expect("wait group state poisoned");
        if state.count == 0 {
            if let Some(id) = this.waiter_id.take() {
                state.waiters.retain(|(wid, _)| *wid != id);
            }
            return Poll::Ready(());
        }
        match this.waiter_id {
            Some(id) => {
                if let Some(slot) = state.waiters.iter_mut().find(|(wid, _)| *wid == id) {
                    slot.1 = cx.waker().clone();
                } else {
                    state.waiters.push((id, cx.waker().clone()));
                }
            }
            None => {
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push((id, cx.waker().clone()));
                this.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for WaitGroupFuture<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            let mut state = self
                .group
                .shared
                .state
                .lock()
                .expect("wait group state poisoned");
            state.waiters.retain(|(wid, _)| *wid != id);
        }
    }
}

/// RAII work-unit tracker returned by [`WaitGroup::guard`].
#[must_use = "the unit completes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct WaitGroupGuard {
    group: WaitGroup,
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        self.group.done();
    }
}
