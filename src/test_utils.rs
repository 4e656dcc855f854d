//! Shared test helpers: logging setup, a minimal future driver, and the
//! structured assertion macros used across the test suites.
//!
//! The crate itself is executor-agnostic, so tests bring their own driver:
//! [`block_on`] polls a future on the current thread, parking between
//! wakeups.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Wake, Waker};
use std::thread::{self, Thread};

use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;

/// Initializes test logging exactly once per process.
///
/// Uses the test writer so output is captured per test and shown only on
/// failure.
pub fn init_test_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Logging init plus a banner naming the test.
pub fn init_test(name: &str) {
    init_test_logging();
    info!(test = name, "=== TEST START ===");
}

struct ThreadWaker {
    thread: Thread,
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.thread.unpark();
    }
}

/// Drives `future` to completion on the current thread, parking between
/// wakeups. Suitable for tests only; a future that is never woken parks
/// forever.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = Box::pin(future);
    let waker = Waker::from(Arc::new(ThreadWaker {
        thread: thread::current(),
    }));
    let mut cx = TaskContext::from_waker(&waker);
    loop {
        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => thread::park(),
        }
    }
}

/// Logs the start of a named test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = $name, "=== PHASE ===");
    };
}

/// Logs a finer-grained section within a phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = $name, "--- section ---");
    };
}

/// Logs test completion; place at the end of every logged test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Asserts `cond`, logging the checked value either way.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $what:expr, $actual:expr) => {
        if $cond {
            tracing::debug!(check = $what, actual = ?$actual, "check passed");
        } else {
            tracing::error!(check = $what, actual = ?$actual, "check FAILED");
            panic!("check failed: {}", $what);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_ready_future() {
        assert_eq!(block_on(std::future::ready(5)), 5);
    }

    #[test]
    fn block_on_crosses_threads() {
        init_test("block_on_crosses_threads");
        let ch = crate::channel::Channel::new(0);
        let sender = ch.clone();
        let handle = thread::spawn(move || {
            block_on(sender.send(41)).unwrap();
        });
        let got = block_on(ch.recv());
        handle.join().unwrap();
        assert_with_log!(got == Some(41), "rendezvous value crossed threads", got);
        test_complete!("block_on_crosses_threads");
    }
}
