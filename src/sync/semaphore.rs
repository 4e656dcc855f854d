//! Counting semaphore with direct permit hand-off.
//!
//! A semaphore created with `N` permits admits at most `N` concurrent
//! holders. Waiters are served strictly in arrival order: a released permit
//! is handed to the head waiter rather than returned to the pool, so a
//! late [`try_acquire`](Semaphore::try_acquire) can never jump the queue.
//!
//! Permits are RAII by default ([`SemaphorePermit`] releases on drop);
//! [`SemaphorePermit::forget`] plus [`Semaphore::release`] support manual
//! accounting. Releasing more permits than the semaphore was created with
//! is a usage error and panics.
//!
//! # Cancel Safety
//!
//! Dropping an [`AcquireFuture`] deregisters its waiter; if a permit was
//! already handed to it, the permit passes on to the next waiter.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::{Context as TaskContext, Poll, Waker};

use tracing::trace;

struct SemWaiter {
    id: u64,
    waker: Waker,
    granted: bool,
}

struct SemState {
    permits: usize,
    waiters: VecDeque<SemWaiter>,
    next_waiter_id: u64,
}

/// FIFO counting semaphore.
pub struct Semaphore {
    state: StdMutex<SemState>,
    max_permits: usize,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available_permits())
            .field("max", &self.max_permits)
            .finish()
    }
}

/// Error returned by [`Semaphore::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryAcquireError;

impl fmt::Display for TryAcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no permits available")
    }
}

impl std::error::Error for TryAcquireError {}

impl Semaphore {
    /// Creates a semaphore with `permits` available, which is also its
    /// permanent maximum.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            state: StdMutex::new(SemState {
                permits,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
            max_permits: permits,
        }
    }

    /// Future that acquires one permit, suspending behind earlier arrivals.
    pub fn acquire(&self) -> AcquireFuture<'_> {
        AcquireFuture {
            semaphore: self,
            waiter_id: None,
        }
    }

    /// Acquires a permit immediately or fails. Fails while waiters are
    /// queued, preserving FIFO order.
    ///
    /// # Errors
    ///
    /// [`TryAcquireError`] when acquisition would have to wait.
    pub fn try_acquire(&self) -> Result<SemaphorePermit<'_>, TryAcquireError> {
        let mut state = self.state.lock().expect("semaphore state poisoned");
        if state.permits == 0 || !state.waiters.is_empty() {
            return Err(TryAcquireError);
        }
        state.permits -= 1;
        drop(state);
        Ok(SemaphorePermit {
            semaphore: self,
            released: false,
        })
    }

    /// Returns one permit, handing it to the head waiter if any.
    ///
    /// # Panics
    ///
    /// Panics if the return would push the pool beyond the semaphore's
    /// configured maximum.
    pub fn release(&self) {
        let waker = {
            let mut state = self.state.lock().expect("semaphore state poisoned");
            match state.waiters.iter_mut().find(|w| !w.granted) {
                Some(waiter) => {
                    waiter.granted = true;
                    trace!(id = waiter.id, "permit handed to head waiter");
                    Some(waiter.waker.clone())
                }
                None => {
                    assert!(
                        state.permits < self.max_permits,
                        "semaphore released beyond its maximum of {} permits",
                        self.max_permits
                    );
                    state.permits += 1;
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Permits currently available in the pool.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.state
            .lock()
            .expect("semaphore state poisoned")
            .permits
    }

    /// The permit count the semaphore was created with.
    #[must_use]
    pub const fn max_permits(&self) -> usize {
        self.max_permits
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state
            .lock()
            .expect("semaphore state poisoned")
            .waiters
            .len()
    }
}

/// Future returned by [`Semaphore::acquire`].
#[must_use = "futures do nothing unless polled"]
pub struct AcquireFuture<'a> {
    semaphore: &'a Semaphore,
    waiter_id: Option<u64>,
}

impl<'a> Future for AcquireFuture<'a> {
    type Output = SemaphorePermit<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this
            .semaphore
            .state
            .lock()
            .expect("semaphore state poisoned");

        if let Some(id) = this.waiter_id {
            if let Some(idx) = state.waiters.iter().position(|w| w.id == id) {
                if state.waiters[idx].granted {
                    state.waiters.remove(idx);
                    this.waiter_id = None;
                    drop(state);
                    return Poll::Ready(SemaphorePermit {
                        semaphore: this.semaphore,
                        released: false,
                    });
                }
                state.waiters[idx].waker = cx.waker().clone();
                return Poll::Pending;
            }
            this.waiter_id = None;
        }

        if state.permits > 0 && state.waiters.is_empty() {
            state.permits -= 1;
            drop(state);
            return Poll::Ready(SemaphorePermit {
                semaphore: this.semaphore,
                released: false,
            });
        }
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.waiters.push_back(SemWaiter {
            id,
            waker: cx.waker().clone(),
            granted: false,
        });
        this.waiter_id = Some(id);
        Poll::Pending
    }
}

impl Drop for AcquireFuture<'_> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let granted = {
            let mut state = self
                .semaphore
                .state
                .lock()
                .expect("semaphore state poisoned");
            match state.waiters.iter().position(|w| w.id == id) {
                Some(idx) => {
                    let granted = state.waiters[idx].granted;
                    state.waiters.remove(idx);
                    granted
                }
                None => false,
            }
        };
        if granted {
            // The permit was already ours; pass it on.
            self.semaphore.release();
        }
    }
}

/// RAII permit; returns itself to the semaphore on drop.
#[must_use = "the permit is released as soon as it is dropped"]
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
    released: bool,
}

impl SemaphorePermit<'_> {
    /// Detaches the permit from RAII accounting: drop becomes a no-op and
    /// the caller takes over via [`Semaphore::release`].
    pub fn forget(mut self) {
        self.released = true;
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.semaphore.release();
        }
    }
}
