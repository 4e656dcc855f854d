//! Multiplexed selection over channel operations.
//!
//! [`Select`] races any number of send and receive cases and runs exactly
//! one action — the one belonging to the first case that becomes ready.
//! Each case maps its outcome into a common output type, so the whole
//! selection is itself a future producing one value.
//!
//! Evaluation order: a non-suspending readiness pass runs over the cases in
//! registration order first. If one is ready, its action runs and nothing
//! suspends. If none is ready and a [`default`](Select::default) case was
//! given, the default runs instead. Otherwise all cases suspend and race;
//! when several become ready together, the first-registered case wins.
//!
//! # Cancel Safety
//!
//! Losing cases are plain futures dropped when the selection resolves,
//! which deregisters their waiters from the channels involved. A dropped
//! `Select` deregisters everything.
//!
//! ```ignore
//! let out = Select::new()
//!     .recv(&data, |v| Event::Data(v))
//!     .recv(&quit, |_| Event::Quit)
//!     .default(|| Event::Idle)
//!     .await;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use crate::channel::{Channel, RecvFuture, SendError, SendFuture, TryRecvError, TrySendError};

trait Case<O> {
    /// Non-suspending readiness probe; runs the action on success.
    fn try_ready(&mut self) -> Option<O>;
    /// Suspending path; registers with the case's channel.
    fn poll_case(&mut self, cx: &mut TaskContext<'_>) -> Poll<O>;
}

struct RecvCase<'a, T, O, F>
where
    F: FnOnce(Option<T>) -> O,
{
    channel: &'a Channel<T>,
    future: Option<RecvFuture<'a, T>>,
    action: Option<F>,
}

impl<T, O, F> Case<O> for RecvCase<'_, T, O, F>
where
    F: FnOnce(Option<T>) -> O,
{
    fn try_ready(&mut self) -> Option<O> {
        let outcome = match self.channel.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Closed) => None,
            Err(TryRecvError::Empty) => return None,
        };
        let action = self.action.take().expect("select case resolved twice");
        Some(action(outcome))
    }

    fn poll_case(&mut self, cx: &mut TaskContext<'_>) -> Poll<O> {
        let channel = self.channel;
        let future = self.future.get_or_insert_with(|| channel.recv());
        match Pin::new(future).poll(cx) {
            Poll::Ready(outcome) => {
                let action = self.action.take().expect("select case resolved twice");
                Poll::Ready(action(outcome))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct SendCase<'a, T, O, F>
where
    F: FnOnce(Result<(), SendError<T>>) -> O,
{
    channel: &'a Channel<T>,
    value: Option<T>,
    future: Option<SendFuture<'a, T>>,
    action: Option<F>,
}

impl<T, O, F> Case<O> for SendCase<'_, T, O, F>
where
    F: FnOnce(Result<(), SendError<T>>) -> O,
{
    fn try_ready(&mut self) -> Option<O> {
        let value = self.value.take()?;
        let outcome = match self.channel.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(value)) => {
                self.value = Some(value);
                return None;
            }
            Err(TrySendError::Closed(value)) => Err(SendError(value)),
        };
        let action = self.action.take().expect("select case resolved twice");
        Some(action(outcome))
    }

    fn poll_case(&mut self, cx: &mut TaskContext<'_>) -> Poll<O> {
        if self.future.is_none() {
            let value = self.value.take().expect("select case resolved twice");
            self.future = Some(self.channel.send(value));
        }
        let Some(future) = self.future.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(future).poll(cx) {
            Poll::Ready(outcome) => {
                let action = self.action.take().expect("select case resolved twice");
                Poll::Ready(action(outcome))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Builder and future for a multiplexed channel selection.
#[must_use = "futures do nothing unless polled"]
pub struct Select<'a, O> {
    cases: Vec<Box<dyn Case<O> + 'a>>,
    default_action: Option<Box<dyn FnOnce() -> O + 'a>>,
    probed: bool,
}

impl<O> Unpin for Select<'_, O> {}

impl<'a, O: 'a> Select<'a, O> {
    /// Starts an empty selection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default_action: None,
            probed: false,
        }
    }

    /// Adds a receive case. `action` sees `Some(value)` for a delivery and
    /// `None` for closed-and-drained.
    pub fn recv<T>(mut self, channel: &'a Channel<T>, action: impl FnOnce(Option<T>) -> O + 'a) -> Self
    where
        T: 'a,
    {
        self.cases.push(Box::new(RecvCase {
            channel,
            future: None,
            action: Some(action),
        }));
        self
    }

    /// Adds a send case for `value`. `action` sees the send outcome.
    pub fn send<T>(
        mut self,
        channel: &'a Channel<T>,
        value: T,
        action: impl FnOnce(Result<(), SendError<T>>) -> O + 'a,
    ) -> Self
    where
        T: 'a,
    {
        self.cases.push(Box::new(SendCase {
            channel,
            value: Some(value),
            future: None,
            action: Some(action),
        }));
        self
    }

    /// Adds a default case: if no other case is ready at the first poll,
    /// `action` runs immediately and nothing suspends.
    pub fn default(mut self, action: impl FnOnce() -> O + 'a) -> Self {
        self.default_action = Some(Box::new(action));
        self
    }
}

impl<'a, O: 'a> Default for Select<'a, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Future for Select<'_, O> {
    type Output = O;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<O> {
        let this = self.get_mut();
        if !this.probed {
            this.probed = true;
            for case in &mut this.cases {
                if let Some(output) = case.try_ready() {
                    return Poll::Ready(output);
                }
            }
            if let Some(action) = this.default_action.take() {
                return Poll::Ready(action());
            }
        }
        for case in &mut this.cases {
            if let Poll::Ready(output) = case.poll_case(cx) {
                return Poll::Ready(output);
            }
        }
        Poll::Pending
    }
}
