//! FIFO-fair coordination primitives.
//!
//! Everything here shares one shape: waiters queue in arrival order, a
//! release hands its grant directly to the head waiter (no barging), and
//! dropping a pending future deregisters it. See each module's Cancel
//! Safety notes.

pub mod condvar;
pub mod mutex;
pub mod once;
pub mod rwlock;
pub mod semaphore;
pub mod wait_group;

pub use condvar::{Condvar, WaitFuture};
pub use mutex::{LockFuture, Mutex, MutexGuard, TryLockError};
pub use once::{CallFuture, Once};
pub use rwlock::{
    ReadFuture, ReadGuard, RwLock, TryReadError, TryWriteError, WriteFuture, WriteGuard,
};
pub use semaphore::{AcquireFuture, Semaphore, SemaphorePermit, TryAcquireError};
pub use wait_group::{WaitGroup, WaitGroupFuture, WaitGroupGuard};
