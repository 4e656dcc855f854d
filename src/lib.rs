//! Cooperative concurrency coordination for event-loop runtimes.
//!
//! `coopsync` provides the coordination layer of a cooperative runtime
//! without providing the runtime itself: every primitive is a hand-rolled
//! [`std::future::Future`] with an explicit FIFO waiter queue, driven by
//! whatever executor embeds it.
//!
//! The pieces:
//!
//! - [`context`] — a cancellation tree. A [`Context`](context::Context)
//!   completes at most once, carries a [`Cause`](error::Cause), and
//!   completing a parent completes every descendant. Deadlines, external
//!   cancel signals, and mirrored futures all plug into the same tree.
//! - [`channel`] — a bounded FIFO channel (capacity zero = rendezvous)
//!   with [`select`](crate::select::Select) multiplexing over any number
//!   of send and receive cases.
//! - [`sync`] — mutex, read/write lock, semaphore, condition variable,
//!   wait group, and a run-once cell, all strictly FIFO-fair with direct
//!   hand-off on release.
//! - [`time`] — a pluggable clock ([`WallClock`](time::WallClock) /
//!   [`VirtualClock`](time::VirtualClock)) and the passive
//!   [`TimerDriver`](time::TimerDriver) the deadline machinery runs on.
//!
//! Cancellation is cooperative and value-based: nothing unwinds, waiters
//! deregister on drop, and a grant handed to a dropped waiter passes on to
//! the next one rather than getting lost.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod channel;
pub mod context;
pub mod error;
pub mod select;
pub mod sync;
pub mod test_utils;
pub mod time;

pub use channel::{Channel, RecvFuture, SendError, SendFuture, TryRecvError, TrySendError};
pub use context::{
    background, bind, CallbackHandle, CancelSignal, CancelSource, Completion, Context, Done,
    Mirror,
};
pub use error::Cause;
pub use select::Select;
pub use sync::{
    Condvar, Mutex, MutexGuard, Once, RwLock, Semaphore, SemaphorePermit, WaitGroup,
    WaitGroupGuard,
};
pub use time::{Sleep, Time, TimeSource, TimerDriver, TimerHandle, VirtualClock, WallClock};
