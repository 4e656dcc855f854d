//! Arrival-order read/write lock.
//!
//! Any number of readers may hold the lock together; a writer holds it
//! alone. Requests queue in one FIFO regardless of kind, and grants never
//! reorder it: a reader arriving after a queued writer waits behind that
//! writer, so writers cannot starve behind a continuous stream of readers.
//! When a writer releases, the queue head is promoted — consecutive
//! readers at the head are granted together as a batch.
//!
//! The `try_` variants keep the same strictness as [`Mutex`]: they fail
//! whenever anyone is queued, even if the requested mode is compatible
//! with the current holders.
//!
//! # Cancel Safety
//!
//! Dropping a [`ReadFuture`] or [`WriteFuture`] deregisters its waiter; a
//! future dropped after its grant undoes the grant and re-promotes the
//! queue.
//!
//! [`Mutex`]: crate::sync::Mutex

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::task::{Context as TaskContext, Poll, Waker};

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessKind {
    Read,
    Write,
}

struct RwWaiter {
    id: u64,
    kind: AccessKind,
    waker: Waker,
    granted: bool,
}

struct RwState {
    readers: usize,
    writer_active: bool,
    queue: VecDeque<RwWaiter>,
    next_waiter_id: u64,
}

/// Grants whatever the queue head allows: one writer, or a batch of
/// consecutive readers. Returns the wakers to invoke after unlocking.
fn promote(state: &mut RwState) -> Vec<Waker> {
    let RwState {
        readers,
        writer_active,
        queue,
        ..
    } = state;
    let mut wakers = Vec::new();
    for waiter in queue.iter_mut() {
        if waiter.granted {
            continue;
        }
        match waiter.kind {
            AccessKind::Read => {
                if *writer_active {
                    break;
                }
                waiter.granted = true;
                *readers += 1;
                wakers.push(waiter.waker.clone());
            }
            AccessKind::Write => {
                if !*writer_active && *readers == 0 {
                    waiter.granted = true;
                    *writer_active = true;
                    wakers.push(waiter.waker.clone());
                }
                break;
            }
        }
    }
    wakers
}

/// Asynchronous read/write lock with a single arrival-order queue.
pub struct RwLock<T> {
    data: StdRwLock<T>,
    state: StdMutex<RwState>,
}

impl<T: fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("rwlock state poisoned");
        f.debug_struct("RwLock")
            .field("readers", &state.readers)
            .field("writer_active", &state.writer_active)
            .finish_non_exhaustive()
    }
}

/// Error returned by [`RwLock::try_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryReadError;

impl fmt::Display for TryReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("rwlock is write-held or contended")
    }
}

impl std::error::Error for TryReadError {}

/// Error returned by [`RwLock::try_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryWriteError;

impl fmt::Display for TryWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("rwlock is held or contended")
    }
}

impl std::error::Error for TryWriteError {}

impl<T> RwLock<T> {
    /// Creates an unlocked lock around `value`.
    pub fn new(value: T) -> Self {
        Self {
            data: StdRwLock::new(value),
            state: StdMutex::new(RwState {
                readers: 0,
                writer_active: false,
                queue: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Future that acquires shared access.
    pub fn read(&self) -> ReadFuture<'_, T> {
        ReadFuture {
            lock: self,
            waiter_id: None,
        }
    }

    /// Future that acquires exclusive access.
    pub fn write(&self) -> WriteFuture<'_, T> {
        WriteFuture {
            lock: self,
            waiter_id: None,
        }
    }

    /// Immediate shared acquisition; fails if a writer holds the lock or
    /// anyone is queued.
    ///
    /// # Errors
    ///
    /// [`TryReadError`] when acquisition would have to wait.
    pub fn try_read(&self) -> Result<ReadGuard<'_, T>, TryReadError> {
        let mut state = self.state.lock().expect("rwlock state poisoned");
        if state.writer_active || !state.queue.is_empty() {
            return Err(TryReadError);
        }
        state.readers += 1;
        drop(state);
        Ok(self.read_guard())
    }

    /// Immediate exclusive acquisition; fails if anyone holds the lock or
    /// is queued.
    ///
    /// # Errors
    ///
    /// [`TryWriteError`] when acquisition would have to wait.
    pub fn try_write(&self) -> Result<WriteGuard<'_, T>, TryWriteError> {
        let mut state = self.state.lock().expect("rwlock state poisoned");
        if state.writer_active || state.readers > 0 || !state.queue.is_empty() {
            return Err(TryWriteError);
        }
        state.writer_active = true;
        drop(state);
        Ok(self.write_guard())
    }

    /// Number of readers currently holding the lock.
    pub fn reader_count(&self) -> usize {
        self.state.lock().expect("rwlock state poisoned").readers
    }

    /// Returns true while a writer holds the lock.
    pub fn has_writer(&self) -> bool {
        self.state
            .lock()
            .expect("rwlock state poisoned")
            .writer_active
    }

    /// Number of queued waiters, readers and writers combined.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().expect("rwlock state poisoned").queue.len()
    }

    /// Direct access through exclusive ownership; no locking involved.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consumes the lock and returns the value.
    pub fn into_inner(self) -> T {
        self.data
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_guard(&self) -> ReadGuard<'_, T> {
        ReadGuard {
            lock: self,
            data: self.data.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn write_guard(&self) -> WriteGuard<'_, T> {
        WriteGuard {
            lock: self,
            data: self.data.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn release_read(&self) {
        let wakers = {
            let mut state = self.state.lock().expect("rwlock state poisoned");
            state.readers = state.readers.saturating_sub(1);
            if state.readers == 0 {
                promote(&mut state)
            } else {
                Vec::new()
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }

    fn release_write(&self) {
        let wakers = {
            let mut state = self.state.lock().expect("rwlock state poisoned");
            state.writer_active = false;
            trace!("writer released");
            promote(&mut state)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Removes a waiter (cancelled future), undoing its grant if needed.
    fn abandon_waiter(&self, id: u64) {
        let wakers = {
            let mut state = self.state.lock().expect("rwlock state poisoned");
            let Some(idx) = state.queue.iter().position(|w| w.id == id) else {
                return;
            };
            let Some(waiter) = state.queue.remove(idx) else {
                return;
            };
            if waiter.granted {
                match waiter.kind {
                    AccessKind::Read => state.readers = state.readers.saturating_sub(1),
                    AccessKind::Write => state.writer_active = false,
                }
            }
            promote(&mut state)
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Future returned by [`RwLock::read`].
#[must_use = "futures do nothing unless polled"]
pub struct ReadFuture<'a, T> {
    lock: &'a RwLock<T>,
    waiter_id: Option<u64>,
}

impl<T> Unpin for ReadFuture<'_, T> {}

impl<'a, T> Future for ReadFuture<'a, T> {
    type Output = ReadGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.lock.state.lock().expect("rwlock state poisoned");

        if let Some(id) = this.waiter_id {
            if let Some(idx) = state.queue.iter().position(|w| w.id == id) {
                if state.queue[idx].granted {
                    state.queue.remove(idx);
                    this.waiter_id = None;
                    drop(state);
                    return Poll::Ready(this.lock.read_guard());
                }
                state.queue[idx].waker = cx.waker().clone();
                return Poll::Pending;
            }
            this.waiter_id = None;
        }

        if !state.writer_active && state.queue.is_empty() {
            state.readers += 1;
            drop(state);
            return Poll::Ready(this.lock.read_guard());
        }
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.queue.push_back(RwWaiter {
            id,
            kind: AccessKind::Read,
            waker: cx.waker().clone(),
            granted: false,
        });
        this.waiter_id = Some(id);
        Poll::Pending
    }
}

impl<T> Drop for ReadFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            self.lock.abandon_waiter(id);
        }
    }
}

/// Future returned by [`RwLock::write`].
#[must_use = "futures do nothing unless polled"]
pub struct WriteFuture<'a, T> {
    lock: &'a RwLock<T>,
    waiter_id: Option<u64>,
}

impl<T> Unpin for WriteFuture<'_, T> {}

impl<'a, T> Future for WriteFuture<'a, T> {
    type Output = WriteGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.lock.state.lock().expect("rwlock state poisoned");

        if let Some(id) = this.waiter_id {
            if let Some(idx) = state.queue.iter().position(|w| w.id == id) {
                if state.queue[idx].granted {
                    state.queue.remove(idx);
                    this.waiter_id = None;
                    drop(state);
                    return Poll::Ready(this.lock.write_guard());
                }
                state.queue[idx].waker = cx.waker().clone();
                return Poll::Pending;
            }
            this.waiter_id = None;
        }

        if !state.writer_active && state.readers == 0 && state.queue.is_empty() {
            state.writer_active = true;
            drop(state);
            return Poll::Ready(this.lock.write_guard());
        }
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.queue.push_back(RwWaiter {
            id,
            kind: AccessKind::Write,
            waker: cx.waker().clone(),
            granted: false,
        });
        this.waiter_id = Some(id);
        Poll::Pending
    }
}

impl<T> Drop for WriteFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            self.lock.abandon_waiter(id);
        }
    }
}

/// RAII shared-access guard; releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    data: std::sync::RwLockReadGuard<'a, T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// RAII exclusive-access guard; releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
    data: std::sync::RwLockWriteGuard<'a, T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for WriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
