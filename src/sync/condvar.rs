//! Condition variable paired with the async [`Mutex`].
//!
//! [`Condvar::wait`] consumes a held [`MutexGuard`]: at its first poll the
//! future registers as a waiter and *then* releases the mutex, so a
//! notification sent under the mutex can never slip between the two steps.
//! Once notified, the future reacquires the mutex (queueing like any other
//! locker) before resolving with a fresh guard.
//!
//! `notify_one` and `notify_all` only mark waiters and wake them; the
//! woken code runs at its next poll, after the notifier has released the
//! mutex. Calling `notify_*` while holding the paired mutex is the
//! intended discipline but is not runtime-checked.
//!
//! Spurious wakeups do not occur, but the waited condition may have
//! changed by the time the mutex is reacquired; callers re-check their
//! predicate in a loop all the same.
//!
//! # Cancel Safety
//!
//! Dropping a waiting future deregisters it. If it had already been
//! notified, the notification passes on to the next waiter instead of
//! evaporating.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::{Context as TaskContext, Poll, Waker};

use tracing::trace;

use crate::sync::mutex::{LockFuture, Mutex, MutexGuard};

struct CondWaiter {
    id: u64,
    waker: Waker,
    notified: bool,
}

struct CondState {
    waiters: VecDeque<CondWaiter>,
    next_waiter_id: u64,
}

/// Condition variable; pair each instance with one [`Mutex`].
pub struct Condvar {
    state: StdMutex<CondState>,
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

impl Condvar {
    /// Creates a condition variable with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(CondState {
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Future that atomically releases `guard`, waits for a notification,
    /// and reacquires the mutex before resolving with a new guard.
    ///
    /// The release happens at the future's first poll, after the waiter is
    /// registered.
    pub fn wait<'a, T>(&'a self, guard: MutexGuard<'a, T>) -> WaitFuture<'a, T> {
        let mutex = guard.owner();
        WaitFuture {
            condvar: self,
            mutex,
            phase: Phase::Init(Some(guard)),
        }
    }

    /// Marks the oldest unnotified waiter and wakes it.
    pub fn notify_one(&self) {
        let waker = {
            let mut state = self.state.lock().expect("condvar state poisoned");
            state.waiters.iter_mut().find(|w| !w.notified).map(|waiter| {
                waiter.notified = true;
                trace!(id = waiter.id, "condvar waiter notified");
                waiter.waker.clone()
            })
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Marks every waiter and wakes them all.
    pub fn notify_all(&self) {
        let wakers: Vec<Waker> = {
            let mut state = self.state.lock().expect("condvar state poisoned");
            state
                .waiters
                .iter_mut()
                .filter(|w| !w.notified)
                .map(|waiter| {
                    waiter.notified = true;
                    waiter.waker.clone()
                })
                .collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Number of registered waiters, notified or not.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state
            .lock()
            .expect("condvar state poisoned")
            .waiters
            .len()
    }

    /// Removes a cancelled waiter, forwarding its notification if it had
    /// one.
    fn abandon(&self, id: u64) {
        let waker = {
            let mut state = self.state.lock().expect("condvar state poisoned");
            let Some(idx) = state.waiters.iter().position(|w| w.id == id) else {
                return;
            };
            let notified = state.waiters[idx].notified;
            state.waiters.remove(idx);
            if !notified {
                None
            } else {
                state.waiters.iter_mut().find(|w| !w.notified).map(|next| {
                    next.notified = true;
                    next.waker.clone()
                })
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn register(&self, waker: Waker) -> u64 {
        let mut state = self.state.lock().expect("condvar state poisoned");
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.waiters.push_back(CondWaiter {
            id,
            waker,
            notified: false,
        });
        id
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

enum Phase<'a, T> {
    /// Holding the guard, not yet registered.
    Init(Option<MutexGuard<'a, T>>),
    /// Registered and unlocked; waiting for a notification.
    Parked(u64),
    /// Notified; queued to take the mutex back.
    Relocking(LockFuture<'a, T>),
    /// Resolved.
    Done,
}

/// Future returned by [`Condvar::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct WaitFuture<'a, T> {
    condvar: &'a Condvar,
    mutex: &'a Mutex<T>,
    phase: Phase<'a, T>,
}

impl<'a, T> Future for WaitFuture<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.phase, Phase::Done) {
                Phase::Init(mut guard) => {
                    let id = this.condvar.register(cx.waker().clone());
                    // Registered first, unlocked second: a notify sent
                    // under the mutex always finds this waiter.
                    drop(guard.take());
                    this.phase = Phase::Parked(id);
                    return Poll::Pending;
                }
                Phase::Parked(id) => {
                    let mut state = this.condvar.state.lock().expect("condvar state poisoned");
                    let Some(idx) = state.waiters.iter().position(|w| w.id == id) else {
                        drop(state);
                        this.phase = Phase::Relocking(this.mutex.lock());
                        continue;
                    };
                    if state.waiters[idx].notified {
                        state.waiters.remove(idx);
                        drop(state);
                        this.phase = Phase::Relocking(this.mutex.lock());
                        continue;
                    }
                    state.waiters[idx].waker = cx.waker().clone();
                    drop(state);
                    this.phase = Phase::Parked(id);
                    return Poll::Pending;
                }
                Phase::Relocking(mut lock) => {
                    return match Pin::new(&mut lock).poll(cx) {
                        Poll::Ready(guard) => Poll::Ready(guard),
                        Poll::Pending => {
                            this.phase = Phase::Relocking(lock);
                            Poll::Pending
                        }
                    };
                }
                Phase::Done => panic!("wait future polled after completion"),
            }
        }
    }
}

impl<T> Drop for WaitFuture<'_, T> {
    fn drop(&mut self) {
        if let Phase::Parked(id) = self.phase {
            self.condvar.abandon(id);
        }
        // Init drops the guard (releasing the mutex) and Relocking drops
        // the lock future (deregistering from the mutex) on their own.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;
    use std::sync::Arc;
    use std::task::Wake;

    struct NoopWaker;

    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    fn poll_once<F: Future>(future: Pin<&mut F>) -> Poll<F::Output> {
        let waker = Waker::from(Arc::new(NoopWaker));
        let mut cx = TaskContext::from_waker(&waker);
        future.poll(&mut cx)
    }

    #[test]
    fn wait_releases_the_mutex() {
        let mutex = Mutex::new(0);
        let cond = Condvar::new();
        let guard = mutex.try_lock().unwrap();

        let mut wait = pin!(cond.wait(guard));
        assert!(poll_once(wait.as_mut()).is_pending());
        // The mutex is free while we wait.
        assert!(mutex.try_lock().is_ok());
        assert_eq!(cond.waiter_count(), 1);
    }

    #[test]
    fn notify_one_wakes_in_fifo_order() {
        let mutex = Mutex::new(0);
        let cond = Condvar::new();

        let mut first = pin!(cond.wait(mutex.try_lock().unwrap()));
        assert!(poll_once(first.as_mut()).is_pending());
        let mut second = pin!(cond.wait(mutex.try_lock().unwrap()));
        assert!(poll_once(second.as_mut()).is_pending());

        cond.notify_one();
        let Poll::Ready(guard) = poll_once(first.as_mut()) else {
            panic!("oldest waiter not notified");
        };
        assert!(poll_once(second.as_mut()).is_pending());
        drop(guard);
        cond.notify_one();
        assert!(poll_once(second.as_mut()).is_ready());
    }

    #[test]
    fn notified_waiter_requeues_for_the_mutex() {
        let mutex = Mutex::new(0);
        let cond = Condvar::new();

        let mut wait = pin!(cond.wait(mutex.try_lock().unwrap()));
        assert!(poll_once(wait.as_mut()).is_pending());

        let blocker = mutex.try_lock().unwrap();
        cond.notify_one();
        // Notified, but the mutex is held elsewhere: still pending.
        assert!(poll_once(wait.as_mut()).is_pending());
        drop(blocker);
        assert!(poll_once(wait.as_mut()).is_ready());
    }

    #[test]
    fn notify_all_reaches_every_waiter() {
        let mutex = Mutex::new(0);
        let cond = Condvar::new();

        let mut first = pin!(cond.wait(mutex.try_lock().unwrap()));
        assert!(poll_once(first.as_mut()).is_pending());
        let mut second = pin!(cond.wait(mutex.try_lock().unwrap()));
        assert!(poll_once(second.as_mut()).is_pending());

        cond.notify_all();
        let Poll::Ready(guard) = poll_once(first.as_mut()) else {
            panic!("first waiter not woken");
        };
        // Second reacquires once the first lets go.
        assert!(poll_once(second.as_mut()).is_pending());
        drop(guard);
        assert!(poll_once(second.as_mut()).is_ready());
    }

    #[test]
    fn notify_with_no_waiters_is_lost() {
        let mutex = Mutex::new(0);
        let cond = Condvar::new();
        cond.notify_one();

        let mut wait = pin!(cond.wait(mutex.try_lock().unwrap()));
        assert!(poll_once(wait.as_mut()).is_pending());
        assert!(poll_once(wait.as_mut()).is_pending());
    }

    #[test]
    fn cancelled_waiter_forwards_its_notification() {
        let mutex = Mutex::new(0);
        let cond = Condvar::new();

        let mut abandoned = Box::pin(cond.wait(mutex.try_lock().unwrap()));
        assert!(poll_once(abandoned.as_mut()).is_pending());
        let mut survivor = Box::pin(cond.wait(mutex.try_lock().unwrap()));
        assert!(poll_once(survivor.as_mut()).is_pending());

        cond.notify_one(); // lands on `abandoned`
        drop(abandoned);
        assert!(poll_once(survivor.as_mut()).is_ready());
    }
}
