//! Bounded channel with rendezvous support.
//!
//! A [`Channel`] carries values of one type through a FIFO buffer of fixed
//! capacity. Capacity zero makes the channel a rendezvous: every transfer
//! is a direct hand-off between one sender and one receiver.
//!
//! There is a single clonable handle type; any clone may send, receive, or
//! [`close`](Channel::close). Closing is idempotent and ends the channel's
//! life in one direction only: sends fail immediately (the value comes back
//! inside [`SendError`]), while receives drain whatever was buffered and
//! then resolve `None`.
//!
//! Blocked senders are serviced strictly in arrival order: when a receive
//! frees buffer space, the oldest waiting sender's value is pulled forward
//! into the buffer at that moment, so the buffer order always matches send
//! order.
//!
//! # Cancel Safety
//!
//! Dropping a [`SendFuture`] or [`RecvFuture`] deregisters its waiter. A
//! receive future dropped *after* a value was handed to it passes the value
//! on to the next waiting receiver (or back into the buffer) so nothing is
//! lost.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context as TaskContext, Poll, Waker};

use tracing::{debug, trace};

/// Error returned when sending on a closed channel. Carries the value back
/// to the caller.
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// Recovers the value that could not be sent.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sending on a closed channel")
    }
}

impl<T> Error for SendError<T> {}

/// Error returned by [`Channel::try_send`].
pub enum TrySendError<T> {
    /// The buffer is full (or no receiver is waiting, for capacity zero).
    Full(T),
    /// The channel is closed.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recovers the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) => value,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("channel is full"),
            Self::Closed(_) => f.write_str("sending on a closed channel"),
        }
    }
}

impl<T> Error for TrySendError<T> {}

/// Error returned by [`Channel::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing available right now; the channel is still open.
    Empty,
    /// The channel is closed and fully drained.
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("channel is empty"),
            Self::Closed => f.write_str("channel is closed and drained"),
        }
    }
}

impl Error for TryRecvError {}

enum SendSlot<T> {
    /// Value still owned by the queued sender.
    Pending(T),
    /// Value was pulled forward (or handed off); the send succeeded.
    Accepted,
    /// Channel closed while queued; the value comes back as an error.
    Rejected(T),
}

struct SendWaiter<T> {
    id: u64,
    waker: Waker,
    slot: SendSlot<T>,
}

enum RecvSlot<T> {
    Waiting,
    Delivered(T),
    Closed,
}

struct RecvWaiter<T> {
    id: u64,
    waker: Waker,
    slot: RecvSlot<T>,
}

struct State<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    closed: bool,
    senders: VecDeque<SendWaiter<T>>,
    receivers: VecDeque<RecvWaiter<T>>,
    next_waiter_id: u64,
}

impl<T> State<T> {
    /// Hands `value` to the oldest waiting receiver, returning its waker,
    /// or gives the value back if nobody is waiting.
    fn deliver_to_receiver(&mut self, value: T) -> Result<Waker, T> {
        match self
            .receivers
            .iter_mut()
            .find(|w| matches!(w.slot, RecvSlot::Waiting))
        {
            Some(waiter) => {
                waiter.slot = RecvSlot::Delivered(value);
                Ok(waiter.waker.clone())
            }
            None => Err(value),
        }
    }

    /// Moves queued senders' values into freed buffer space, oldest first.
    fn pull_forward(&mut self, wakers: &mut Vec<Waker>) {
        while self.buffer.len() < self.capacity {
            let Some(idx) = self
                .senders
                .iter()
                .position(|w| matches!(w.slot, SendSlot::Pending(_)))
            else {
                break;
            };
            let (value, waker) = {
                let waiter = &mut self.senders[idx];
                match std::mem::replace(&mut waiter.slot, SendSlot::Accepted) {
                    SendSlot::Pending(value) => (value, waiter.waker.clone()),
                    other => {
                        waiter.slot = other;
                        break;
                    }
                }
            };
            self.buffer.push_back(value);
            wakers.push(waker);
        }
    }

    /// Takes the oldest queued sender's value directly (rendezvous path).
    fn take_from_sender(&mut self) -> Option<(T, Waker)> {
        let idx = self
            .senders
            .iter()
            .position(|w| matches!(w.slot, SendSlot::Pending(_)))?;
        let waiter = &mut self.senders[idx];
        match std::mem::replace(&mut waiter.slot, SendSlot::Accepted) {
            SendSlot::Pending(value) => Some((value, waiter.waker.clone())),
            other => {
                waiter.slot = other;
                None
            }
        }
    }
}

struct Shared<T> {
    state: StdMutex<State<T>>,
}

/// Bounded FIFO channel handle. Cloning shares the channel.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().expect("channel state poisoned");
        f.debug_struct("Channel")
            .field("capacity", &state.capacity)
            .field("len", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Channel<T> {
    /// Creates a channel with the given buffer capacity. Capacity zero is a
    /// rendezvous channel.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: StdMutex::new(State {
                    capacity,
                    buffer: VecDeque::with_capacity(capacity),
                    closed: false,
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                    next_waiter_id: 0,
                }),
            }),
        }
    }

    /// Future that delivers `value`, suspending until buffer space or a
    /// waiting receiver is available.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            channel: self,
            value: Some(value),
            waiter_id: None,
        }
    }

    /// Future that receives the next value; resolves `None` once the
    /// channel is closed and drained.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture {
            channel: self,
            waiter_id: None,
        }
    }

    /// Non-suspending send attempt.
    ///
    /// # Errors
    ///
    /// `Full` if the value cannot be placed right now, `Closed` if the
    /// channel is closed; both return the value.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let wake;
        {
            let mut state = self.shared.state.lock().expect("channel state poisoned");
            if state.closed {
                return Err(TrySendError::Closed(value));
            }
            match state.deliver_to_receiver(value) {
                Ok(waker) => wake = waker,
                Err(value) => {
                    return if state.buffer.len() < state.capacity {
                        state.buffer.push_back(value);
                        Ok(())
                    } else {
                        Err(TrySendError::Full(value))
                    };
                }
            }
        }
        wake.wake();
        Ok(())
    }

    /// Non-suspending receive attempt.
    ///
    /// # Errors
    ///
    /// `Empty` if nothing is available on an open channel, `Closed` once
    /// the channel is closed and drained.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let (value, wakers);
        {
            let mut state = self.shared.state.lock().expect("channel state poisoned");
            if let Some(buffered) = state.buffer.pop_front() {
                let mut freed = Vec::new();
                state.pull_forward(&mut freed);
                value = buffered;
                wakers = freed;
            } else if let Some((direct, waker)) = state.take_from_sender() {
                value = direct;
                wakers = vec![waker];
            } else if state.closed {
                return Err(TryRecvError::Closed);
            } else {
                return Err(TryRecvError::Empty);
            }
        }
        for waker in wakers {
            waker.wake();
        }
        Ok(value)
    }

    /// Closes the channel. Idempotent.
    ///
    /// Queued senders fail with [`SendError`] carrying their value back;
    /// waiting receivers resolve `None`; buffered values stay receivable.
    pub fn close(&self) {
        let wakers: Vec<Waker> = {
            let mut state = self.shared.state.lock().expect("channel state poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            let mut wakers = Vec::new();
            for waiter in &mut state.senders {
                let slot = std::mem::replace(&mut waiter.slot, SendSlot::Accepted);
                waiter.slot = match slot {
                    SendSlot::Pending(value) => {
                        wakers.push(waiter.waker.clone());
                        SendSlot::Rejected(value)
                    }
                    other => other,
                };
            }
            for waiter in &mut state.receivers {
                if matches!(waiter.slot, RecvSlot::Waiting) {
                    waiter.slot = RecvSlot::Closed;
                    wakers.push(waiter.waker.clone());
                }
            }
            debug!(buffered = state.buffer.len(), "channel closed");
            wakers
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("channel state poisoned")
            .closed
    }

    /// Number of values currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("channel state poisoned")
            .buffer
            .len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured buffer capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("channel state poisoned")
            .capacity
    }
}

/// Future returned by [`Channel::send`].
#[must_use = "futures do nothing unless polled"]
pub struct SendFuture<'a, T> {
    channel: &'a Channel<T>,
    value: Option<T>,
    waiter_id: Option<u64>,
}

impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this
            .channel
            .shared
            .state
            .lock()
            .expect("channel state poisoned");

        if let Some(id) = this.waiter_id {
            if let Some(idx) = state.senders.iter().position(|w| w.id == id) {
                if matches!(state.senders[idx].slot, SendSlot::Pending(_)) {
                    state.senders[idx].waker = cx.waker().clone();
                    return Poll::Pending;
                }
                this.waiter_id = None;
                return match state.senders.remove(idx).map(|w| w.slot) {
                    Some(SendSlot::Accepted) => Poll::Ready(Ok(())),
                    Some(SendSlot::Rejected(value)) => Poll::Ready(Err(SendError(value))),
                    // Settled entries are Accepted or Rejected only.
                    _ => Poll::Pending,
                };
            }
            this.waiter_id = None;
        }

        let value = this
            .value
            .take()
            .expect("send future polled after completion");
        if state.closed {
            return Poll::Ready(Err(SendError(value)));
        }
        match state.deliver_to_receiver(value) {
            Ok(waker) => {
                drop(state);
                waker.wake();
                Poll::Ready(Ok(()))
            }
            Err(value) => {
                if state.buffer.len() < state.capacity {
                    state.buffer.push_back(value);
                    return Poll::Ready(Ok(()));
                }
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.senders.push_back(SendWaiter {
                    id,
                    waker: cx.waker().clone(),
                    slot: SendSlot::Pending(value),
                });
                this.waiter_id = Some(id);
                trace!(id, "sender queued");
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            let mut state = self
                .channel
                .shared
                .state
                .lock()
                .expect("channel state poisoned");
            if let Some(idx) = state.senders.iter().position(|w| w.id == id) {
                state.senders.remove(idx);
            }
        }
    }
}

/// Future returned by [`Channel::recv`].
#[must_use = "futures do nothing unless polled"]
pub struct RecvFuture<'a, T> {
    channel: &'a Channel<T>,
    waiter_id: Option<u64>,
}

impl<T> Unpin for RecvFuture<'_, T> {}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this
            .channel
            .shared
            .state
            .lock()
            .expect("channel state poisoned");

        if let Some(id) = this.waiter_id {
            if let Some(idx) = state.receivers.iter().position(|w| w.id == id) {
                if matches!(state.receivers[idx].slot, RecvSlot::Waiting) {
                    state.receivers[idx].waker = cx.waker().clone();
                    return Poll::Pending;
                }
                this.waiter_id = None;
                return match state.receivers.remove(idx).map(|w| w.slot) {
                    Some(RecvSlot::Delivered(value)) => Poll::Ready(Some(value)),
                    Some(RecvSlot::Closed) => Poll::Ready(None),
                    // Settled entries are Delivered or Closed only.
                    _ => Poll::Pending,
                };
            }
            this.waiter_id = None;
        }

        if let Some(value) = state.buffer.pop_front() {
            let mut wakers = Vec::new();
            state.pull_forward(&mut wakers);
            drop(state);
            for waker in wakers {
                waker.wake();
            }
            return Poll::Ready(Some(value));
        }
        if let Some((value, waker)) = state.take_from_sender() {
            drop(state);
            waker.wake();
            return Poll::Ready(Some(value));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.receivers.push_back(RecvWaiter {
            id,
            waker: cx.waker().clone(),
            slot: RecvSlot::Waiting,
        });
        this.waiter_id = Some(id);
        trace!(id, "receiver queued");
        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let mut redeliver = None;
        {
            let mut state = self
                .channel
                .shared
                .state
                .lock()
                .expect("channel state poisoned");
            if let Some(idx) = state.receivers.iter().position(|w| w.id == id) {
                if let Some(waiter) = state.receivers.remove(idx) {
                    if let RecvSlot::Delivered(value) = waiter.slot {
                        // A value was handed to us but never observed; pass
                        // it on rather than drop it.
                        match state.deliver_to_receiver(value) {
                            Ok(waker) => redeliver = Some(waker),
                            // May transiently exceed capacity; the next
                            // receive restores the bound.
                            Err(value) => state.buffer.push_front(value),
                        }
                    }
                }
            }
        }
        if let Some(waker) = redeliver {
            waker.wake();
        }
    }
}
