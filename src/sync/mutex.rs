//! FIFO mutual-exclusion lock.
//!
//! Waiters acquire strictly in arrival order. Releasing hands the lock
//! directly to the head waiter rather than returning it to a free pool, so
//! a late arrival can never barge past a queued one. For the same reason
//! [`Mutex::try_lock`] fails while anyone is queued, even at the exact
//! moment the lock is free.
//!
//! Release is tied to the [`MutexGuard`]'s drop; releasing without holding
//! is not expressible.
//!
//! # Cancel Safety
//!
//! Dropping a [`LockFuture`] deregisters its waiter. If the future is
//! dropped after the lock was already handed to it, the grant passes on to
//! the next waiter; the lock is never stranded.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::task::{Context as TaskContext, Poll, Waker};

use tracing::trace;

struct LockWaiter {
    id: u64,
    waker: Waker,
    granted: bool,
}

struct MutexState {
    locked: bool,
    waiters: VecDeque<LockWaiter>,
    next_waiter_id: u64,
}

/// Asynchronous mutex with strict FIFO acquisition order.
pub struct Mutex<T> {
    // Data lives behind its own lock so guards need no unsafe projection.
    data: StdRwLock<T>,
    state: StdMutex<MutexState>,
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Error returned by [`Mutex::try_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryLockError;

impl fmt::Display for TryLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("mutex is held or contended")
    }
}

impl std::error::Error for TryLockError {}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex around `value`.
    pub fn new(value: T) -> Self {
        Self {
            data: StdRwLock::new(value),
            state: StdMutex::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Future that acquires the lock, suspending behind earlier arrivals.
    pub fn lock(&self) -> LockFuture<'_, T> {
        LockFuture {
            mutex: self,
            waiter_id: None,
        }
    }

    /// Acquires immediately or fails. Fails while the lock is held *or*
    /// while waiters are queued, preserving FIFO order.
    ///
    /// # Errors
    ///
    /// [`TryLockError`] when acquisition would have to wait.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, TryLockError> {
        let mut state = self.state.lock().expect("mutex state poisoned");
        if state.locked || !state.waiters.is_empty() {
            return Err(TryLockError);
        }
        state.locked = true;
        drop(state);
        Ok(self.guard())
    }

    /// Returns true while the lock is held.
    pub fn is_locked(&self) -> bool {
        self.state.lock().expect("mutex state poisoned").locked
    }

    /// Number of queued waiters.
    pub fn waiter_count(&self) -> usize {
        self.state
            .lock()
            .expect("mutex state poisoned")
            .waiters
            .len()
    }

    /// Direct access through exclusive ownership; no locking involved.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consumes the mutex and returns the value.
    pub fn into_inner(self) -> T {
        self.data
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn guard(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            mutex: self,
            data: self.data.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Hands the lock to the head waiter, or frees it when nobody waits.
    fn unlock(&self) {
        let waker = {
            let mut state = self.state.lock().expect("mutex state poisoned");
            match state.waiters.iter_mut().find(|w| !w.granted) {
                Some(waiter) => {
                    waiter.granted = true;
                    trace!(id = waiter.id, "lock handed to head waiter");
                    Some(waiter.waker.clone())
                }
                None => {
                    state.locked = false;
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Future returned by [`Mutex::lock`].
#[must_use = "futures do nothing unless polled"]
pub struct LockFuture<'a, T> {
    mutex: &'a Mutex<T>,
    waiter_id: Option<u64>,
}

impl<T> Unpin for LockFuture<'_, T> {}

impl<'a, T> Future for LockFuture<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.mutex.state.lock().expect("mutex state poisoned");

        if let Some(id) = this.waiter_id {
            if let Some(idx) = state.waiters.iter().position(|w| w.id == id) {
                if state.waiters[idx].granted {
                    state.waiters.remove(idx);
                    this.waiter_id = None;
                    drop(state);
                    return Poll::Ready(this.mutex.guard());
                }
                state.waiters[idx].waker = cx.waker().clone();
                return Poll::Pending;
            }
            this.waiter_id = None;
        }

        if !state.locked && state.waiters.is_empty() {
            state.locked = true;
            drop(state);
            return Poll::Ready(this.mutex.guard());
        }
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.waiters.push_back(LockWaiter {
            id,
            waker: cx.waker().clone(),
            granted: false,
        });
        this.waiter_id = Some(id);
        Poll::Pending
    }
}

impl<T> Drop for LockFuture<'_, T> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let waker = {
            let mut state = self.mutex.state.lock().expect("mutex state poisoned");
            let Some(idx) = state.waiters.iter().position(|w| w.id == id) else {
                return;
            };
            let granted = state.waiters[idx].granted;
            state.waiters.remove(idx);
            if !granted {
                return;
            }
            // The lock was already handed to us; pass it on.
            match state.waiters.iter_mut().find(|w| !w.granted) {
                Some(next) => {
                    next.granted = true;
                    Some(next.waker.clone())
                }
                None => {
                    state.locked = false;
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// RAII guard; releases the lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    data: std::sync::RwLockWriteGuard<'a, T>,
}

impl<'a, T> MutexGuard<'a, T> {
    pub(crate) fn owner(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
