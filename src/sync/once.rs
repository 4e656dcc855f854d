//! Run-once memoizing guard.
//!
//! [`Once::call`] runs its initializer at most once per instance; every
//! caller — first or late — resolves with a reference to the same memoized
//! value. Callers that arrive while the initializer is running suspend
//! until it finishes.
//!
//! A panicking initializer settles the instance too: the running caller
//! observes the panic directly, and every other caller panics with the
//! memoized panic message. The initializer is never retried.
//!
//! # Cancel Safety
//!
//! Dropping a suspended [`CallFuture`] deregisters its waiter. The future
//! whose poll is running the initializer cannot be dropped mid-run; the
//! initializer call is synchronous inside that poll.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock};
use std::task::{Context as TaskContext, Poll, Waker};

use tracing::trace;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

struct OnceWaiters {
    entries: Vec<(u64, Waker)>,
    next_id: u64,
}

/// One-shot memoizing cell; the initializer is supplied at the call site.
pub struct Once<T> {
    phase: AtomicU8,
    value: OnceLock<T>,
    panic_note: OnceLock<String>,
    waiters: StdMutex<OnceWaiters>,
}

impl<T: fmt::Debug> fmt::Debug for Once<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Once")
            .field("done", &self.is_done())
            .field("value", &self.get())
            .finish()
    }
}

impl<T> Once<T> {
    /// Creates an empty instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(IDLE),
            value: OnceLock::new(),
            panic_note: OnceLock::new(),
            waiters: StdMutex::new(OnceWaiters {
                entries: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Future that runs `init` if nobody has, or waits for the running
    /// initializer, and resolves with the memoized value.
    ///
    /// # Panics (on await)
    ///
    /// Re-raises if the winning initializer panicked: the winner unwinds
    /// with the original payload, later callers with the memoized message.
    pub fn call<F>(&self, init: F) -> CallFuture<'_, T, F>
    where
        F: FnOnce() -> T,
    {
        CallFuture {
            once: self,
            init: Some(init),
            waiter_id: None,
        }
    }

    /// The memoized value, if initialization has completed successfully.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Returns true once the initializer has finished, by value or panic.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.phase.load(Ordering::Acquire) == DONE
    }

    fn finish(&self) -> &T {
        match self.value.get() {
            Some(value) => value,
            None => panic!(
                "once initializer panicked: {}",
                self.panic_note
                    .get()
                    .map_or("unknown panic", String::as_str)
            ),
        }
    }

    fn wake_all(&self) {
        let wakers: Vec<Waker> = {
            let mut waiters = self.waiters.lock().expect("once waiters poisoned");
            waiters.entries.drain(..).map(|(_, waker)| waker).collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> Default for Once<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_note(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Future returned by [`Once::call`].
#[must_use = "futures do nothing unless polled"]
pub struct CallFuture<'a, T, F> {
    once: &'a Once<T>,
    init: Option<F>,
    waiter_id: Option<u64>,
}

impl<T, F> Unpin for CallFuture<'_, T, F> {}

impl<'a, T, F> Future for CallFuture<'a, T, F>
where
    F: FnOnce() -> T,
{
    type Output = &'a T;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if this.once.phase.load(Ordering::Acquire) == DONE {
                return Poll::Ready(this.once.finish());
            }
            if this
                .once
                .phase
                .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let init = this
                    .init
                    .take()
                    .expect("call future polled after completion");
                trace!("running once initializer");
                match catch_unwind(AssertUnwindSafe(init)) {
                    Ok(value) => {
                        let _ = this.once.value.set(value);
                        this.once.phase.store(DONE, Ordering::Release);
                        this.once.wake_all();
                        return Poll::Ready(this.once.finish());
                    }
                    Err(payload) => {
                        let _ = this.once.panic_note.set(panic_note(payload.as_ref()));
                        this.once.phase.store(DONE, Ordering::Release);
                        this.once.wake_all();
                        resume_unwind(payload);
                    }
                }
            }
            // Initializer is running elsewhere: register, re-checking the
            // phase under the waiters lock so the DONE wakeup cannot be
            // missed.
            let mut waiters = this.once.waiters.lock().expect("once waiters poisoned");
            if this.once.phase.load(Ordering::Acquire) == DONE {
                drop(waiters);
                continue;
            }
            match this.waiter_id {
                Some(id) => {
                    if let Some(slot) = waiters.entries.iter_mut().find(|(wid, _)| *wid == id) {
                        slot.1 = cx.waker().clone();
                    } else {
                        waiters.entries.push((id, cx.waker().clone()));
                    }
                }
                None => {
                    let id = waiters.next_id;
                    waiters.next_id += 1;
                    waiters.entries.push((id, cx.waker().clone()));
                    this.waiter_id = Some(id);
                }
            }
            return Poll::Pending;
        }
    }
}

impl<T, F> Drop for CallFuture<'_, T, F> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            let mut waiters = self.once.waiters.lock().expect("once waiters poisoned");
            waiters.entries.retain(|(wid, _)| *wid != id);
        }
    }
}
