//! Cancellation context tree.
//!
//! A [`Context`] is a completion signal for a unit of work. It starts
//! `Active`, transitions to `Done` at most once, and carries an optional
//! [`Cause`] explaining why. Contexts form a tree: completing a parent
//! completes every descendant, while completing a child never touches its
//! parent.
//!
//! Completion is observed three ways:
//!
//! - [`Context::done`] — a future that resolves exactly once;
//! - [`Context::completion`] / [`Context::cause`] — synchronous inspection;
//! - [`Context::run_after_completion`] — a fire-and-forget callback with a
//!   [`CallbackHandle`] that can stop it before it runs.
//!
//! External abort sources plug in through [`CancelSource`] /
//! [`CancelSignal`], and [`Context::mirror`] settles a context with the
//! outcome of an arbitrary future.
//!
//! # Cancel Safety
//!
//! Every observer deregisters on drop: an abandoned [`Done`] future, a
//! stopped callback, or a child completed ahead of its parent leaves no
//! live hook behind. Cancelling is idempotent; the first cause wins and
//! later calls are no-ops.
//!
//! ```ignore
//! let ctx = coopsync::context::background().child();
//! let worker = ctx.child();
//! ctx.cancel();
//! assert!(worker.is_done());
//! ```

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::task::{Context as TaskContext, Poll, Wake, Waker};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::Cause;
use crate::time::{Time, TimerDriver, TimerHandle};

/// Completion state of a [`Context`].
///
/// `Done(None)` means the scope finished without error; `Done(Some(_))`
/// carries the cause. Both are terminal and distinct from `Active`.
#[derive(Debug, Clone)]
pub enum Completion {
    /// The scope is still running.
    Active,
    /// The scope has completed, with an optional cause.
    Done(Option<Cause>),
}

impl Completion {
    /// Returns true once the scope has completed.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    /// The completion cause, if the scope completed with one.
    #[must_use]
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Done(Some(cause)) => Some(cause),
            _ => None,
        }
    }
}

// Callback lifecycle flags. PENDING entries can still be stopped; the CAS
// in `CallbackHandle::stop` decides the race against `complete`.
const CB_PENDING: u8 = 0;
const CB_RUNNING: u8 = 1;
const CB_FINISHED: u8 = 2;
const CB_STOPPED: u8 = 3;

type CallbackFn = Box<dyn FnOnce(Option<Cause>) + Send>;

struct CallbackEntry {
    id: u64,
    flag: Arc<AtomicU8>,
    run: CallbackFn,
}

struct Inner {
    completion: Completion,
    waiters: Vec<(u64, Waker)>,
    callbacks: Vec<CallbackEntry>,
    // Hooks this context registered on *other* contexts (its parent, a
    // bound signal). Stopped when this context completes first.
    unhooks: Vec<CallbackHandle>,
    timer: Option<(Arc<TimerDriver>, TimerHandle)>,
    next_id: u64,
}

struct Shared {
    inner: StdMutex<Inner>,
}

/// A node in the cancellation tree. Cloning shares the node.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("completion", &self.completion())
            .finish()
    }
}

/// The process-wide root context. Never completes and is never torn down.
pub fn background() -> &'static Context {
    static BACKGROUND: OnceLock<Context> = OnceLock::new();
    BACKGROUND.get_or_init(Context::new_root)
}

impl Context {
    fn new_root() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: StdMutex::new(Inner {
                    completion: Completion::Active,
                    waiters: Vec::new(),
                    callbacks: Vec::new(),
                    unhooks: Vec::new(),
                    timer: None,
                    next_id: 0,
                }),
            }),
        }
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Derives a child that completes when this context does.
    ///
    /// If this context is already done, the child adopts the cause
    /// synchronously: it is born `Done` and never observed `Active`.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new_root();
        let target = Arc::downgrade(&child.shared);
        match self.register_hook(Box::new(move |cause| {
            if let Some(shared) = target.upgrade() {
                Self::from_shared(shared).complete(cause);
            }
        })) {
            Ok(hook) => child.attach_unhook(hook),
            Err((cause, _)) => {
                child.complete(cause);
            }
        }
        child
    }

    /// Derives a child that additionally completes with
    /// [`Cause::DeadlineExceeded`] once `timeout` elapses on `driver`.
    ///
    /// The timer entry is disarmed the moment the child completes for any
    /// other reason; a disarmed deadline never fires.
    #[must_use]
    pub fn with_deadline(&self, driver: &Arc<TimerDriver>, timeout: Duration) -> Self {
        self.with_deadline_at(driver, driver.now().saturating_add(timeout))
    }

    /// Deadline variant taking an absolute [`Time`].
    #[must_use]
    pub fn with_deadline_at(&self, driver: &Arc<TimerDriver>, deadline: Time) -> Self {
        let child = self.child();
        if child.is_done() {
            return child;
        }
        let alarm = Waker::from(Arc::new(DeadlineAlarm {
            target: Arc::downgrade(&child.shared),
        }));
        let handle = driver.register(deadline, alarm);
        {
            let mut inner = child.shared.inner.lock().expect("context state poisoned");
            if inner.completion.is_done() {
                drop(inner);
                driver.cancel(&handle);
            } else {
                inner.timer = Some((Arc::clone(driver), handle));
            }
        }
        child
    }

    /// Derives a child that also completes when `signal` fires, adopting
    /// the signal's cause.
    #[must_use]
    pub fn with_signal(&self, signal: &CancelSignal) -> Self {
        let child = self.child();
        if child.is_done() {
            return child;
        }
        let target = Arc::downgrade(&child.shared);
        match signal.ctx.register_hook(Box::new(move |cause| {
            if let Some(shared) = target.upgrade() {
                Self::from_shared(shared).complete(cause);
            }
        })) {
            Ok(hook) => child.attach_unhook(hook),
            Err((cause, _)) => {
                child.complete(cause);
            }
        }
        child
    }

    /// Derives a child driven by an arbitrary future's outcome.
    ///
    /// The returned [`Mirror`] must be polled by the caller; when the inner
    /// future resolves, `Ok(())` finishes the child cleanly and `Err(e)`
    /// completes it with `e`'s cause. If the child completes first (parent
    /// cancel, explicit cancel), the mirror resolves without effect.
    #[must_use]
    pub fn mirror<F, E>(&self, future: F) -> (Self, Mirror<F>)
    where
        F: Future<Output = Result<(), E>> + Unpin,
        E: Into<Cause>,
    {
        let child = self.child();
        let mirror = Mirror {
            ctx: child.clone(),
            done: child.done(),
            future,
        };
        (child, mirror)
    }

    /// Requests cancellation with [`Cause::Cancelled`]. Idempotent.
    pub fn cancel(&self) {
        self.complete(Some(Cause::Cancelled));
    }

    /// Requests cancellation with an explicit cause. Idempotent; the first
    /// cause wins and later calls are no-ops.
    pub fn cancel_with(&self, cause: Cause) {
        self.complete(Some(cause));
    }

    /// Current completion state.
    #[must_use]
    pub fn completion(&self) -> Completion {
        self.shared
            .inner
            .lock()
            .expect("context state poisoned")
            .completion
            .clone()
    }

    /// The completion cause, if completed with one.
    #[must_use]
    pub fn cause(&self) -> Option<Cause> {
        match self.completion() {
            Completion::Done(cause) => cause,
            Completion::Active => None,
        }
    }

    /// Returns true once the context has completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared
            .inner
            .lock()
            .expect("context state poisoned")
            .completion
            .is_done()
    }

    /// Future that resolves when the context completes. Resolves exactly
    /// once and stays ready on later polls; never fails.
    #[must_use]
    pub fn done(&self) -> Done {
        Done {
            shared: Arc::clone(&self.shared),
            waiter_id: None,
            finished: false,
        }
    }

    /// Registers `f` to run when the context completes; runs immediately
    /// (on the calling thread) if it already has. Panics inside `f` are
    /// caught and swallowed.
    ///
    /// The returned handle's [`stop`](CallbackHandle::stop) prevents the
    /// callback iff invoked strictly before it begins running.
    pub fn run_after_completion<F>(&self, f: F) -> CallbackHandle
    where
        F: FnOnce(Option<Cause>) + Send + 'static,
    {
        match self.register_hook(Box::new(f)) {
            Ok(handle) => handle,
            Err((cause, run)) => {
                if catch_unwind(AssertUnwindSafe(move || run(cause))).is_err() {
                    debug!("completion callback panicked; panic swallowed");
                }
                CallbackHandle {
                    owner: Weak::new(),
                    id: u64::MAX,
                    flag: Arc::new(AtomicU8::new(CB_FINISHED)),
                }
            }
        }
    }

    /// Registers a raw hook, or hands it back with the cause if already
    /// done.
    #[allow(clippy::type_complexity)]
    fn register_hook(
        &self,
        run: CallbackFn,
    ) -> Result<CallbackHandle, (Option<Cause>, CallbackFn)> {
        let mut inner = self.shared.inner.lock().expect("context state poisoned");
        match &inner.completion {
            Completion::Done(cause) => Err((cause.clone(), run)),
            Completion::Active => {
                let id = inner.next_id;
                inner.next_id += 1;
                let flag = Arc::new(AtomicU8::new(CB_PENDING));
                inner.callbacks.push(CallbackEntry {
                    id,
                    flag: Arc::clone(&flag),
                    run,
                });
                Ok(CallbackHandle {
                    owner: Arc::downgrade(&self.shared),
                    id,
                    flag,
                })
            }
        }
    }

    /// Remembers a hook held on another context, to be stopped when this
    /// context completes first.
    fn attach_unhook(&self, hook: CallbackHandle) {
        let mut inner = self.shared.inner.lock().expect("context state poisoned");
        if inner.completion.is_done() {
            drop(inner);
            hook.stop();
        } else {
            inner.unhooks.push(hook);
        }
    }

    /// Transitions to `Done(cause)`. Returns false if already done.
    pub(crate) fn complete(&self, cause: Option<Cause>) -> bool {
        let (waiters, callbacks, unhooks, timer) = {
            let mut inner = self.shared.inner.lock().expect("context state poisoned");
            if inner.completion.is_done() {
                return false;
            }
            inner.completion = Completion::Done(cause.clone());
            (
                std::mem::take(&mut inner.waiters),
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.unhooks),
                inner.timer.take(),
            )
        };
        trace!(cause = ?cause, "context completed");
        if let Some((driver, handle)) = timer {
            driver.cancel(&handle);
        }
        for hook in unhooks {
            hook.stop();
        }
        for entry in callbacks {
            if entry
                .flag
                .compare_exchange(CB_PENDING, CB_RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let run = entry.run;
            let cb_cause = cause.clone();
            if catch_unwind(AssertUnwindSafe(move || run(cb_cause))).is_err() {
                debug!("completion callback panicked; panic swallowed");
            }
            entry.flag.store(CB_FINISHED, Ordering::Release);
        }
        for (_, waker) in waiters {
            waker.wake();
        }
        true
    }
}

/// Wakes a context into `DeadlineExceeded` when its timer entry fires.
struct DeadlineAlarm {
    target: Weak<Shared>,
}

impl Wake for DeadlineAlarm {
    fn wake(self: Arc<Self>) {
        if let Some(shared) = self.target.upgrade() {
            Context::from_shared(shared).complete(Some(Cause::DeadlineExceeded));
        }
    }
}

/// Handle to a registered completion callback.
///
/// Dropping the handle does *not* stop the callback; only
/// [`stop`](Self::stop) does.
#[derive(Debug)]
pub struct CallbackHandle {
    owner: Weak<Shared>,
    id: u64,
    flag: Arc<AtomicU8>,
}

impl CallbackHandle {
    /// Prevents the callback from running. Returns `true` iff it had not
    /// yet started; once it begins (or has finished), `stop` returns
    /// `false` and has no effect.
    pub fn stop(&self) -> bool {
        if self
            .flag
            .compare_exchange(CB_PENDING, CB_STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(shared) = self.owner.upgrade() {
            let mut inner = shared.inner.lock().expect("context state poisoned");
            inner.callbacks.retain(|entry| entry.id != self.id);
        }
        true
    }
}

/// Future returned by [`Context::done`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Done {
    shared: Arc<Shared>,
    waiter_id: Option<u64>,
    finished: bool,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("context::Shared")
    }
}

impl Future for Done {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(());
        }
        let mut inner = this.shared.inner.lock().expect("context state poisoned");
        if inner.completion.is_done() {
            if let Some(id) = this.waiter_id.take() {
                inner.waiters.retain(|(wid, _)| *wid != id);
            }
            drop(inner);
            this.finished = true;
            return Poll::Ready(());
        }
        match this.waiter_id {
            Some(id) => {
                if let Some(slot) = inner.waiters.iter_mut().find(|(wid, _)| *wid == id) {
                    slot.1 = cx.waker().clone();
                } else {
                    inner.waiters.push((id, cx.waker().clone()));
                }
            }
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.waiters.push((id, cx.waker().clone()));
                this.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(id) = self.waiter_id.take() {
            let mut inner = self.shared.inner.lock().expect("context state poisoned");
            inner.waiters.retain(|(wid, _)| *wid != id);
        }
    }
}

/// Driver future returned by [`Context::mirror`].
///
/// Resolves when either the mirrored future settles (settling the context)
/// or the context completes first (in which case the inner future is
/// abandoned).
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Mirror<F> {
    ctx: Context,
    done: Done,
    future: F,
}

impl<F, E> Future for Mirror<F>
where
    F: Future<Output = Result<(), E>> + Unpin,
    E: Into<Cause>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let this = self.get_mut();
        if Pin::new(&mut this.done).poll(cx).is_ready() {
            return Poll::Ready(());
        }
        match Pin::new(&mut this.future).poll(cx) {
            Poll::Ready(Ok(())) => {
                this.ctx.complete(None);
                Poll::Ready(())
            }
            Poll::Ready(Err(error)) => {
                this.ctx.complete(Some(error.into()));
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Owner side of an external abort mechanism.
///
/// The source is kept by whoever may abort; [`CancelSignal`]s are handed to
/// the scopes that should observe the abort.
#[derive(Debug)]
pub struct CancelSource {
    ctx: Context,
}

impl CancelSource {
    /// Creates an un-fired source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctx: Context::new_root(),
        }
    }

    /// Fires the source with [`Cause::Cancelled`]. Idempotent.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Fires the source with an explicit cause. Idempotent.
    pub fn cancel_with(&self, cause: Cause) {
        self.ctx.cancel_with(cause);
    }

    /// Returns true once the source has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_done()
    }

    /// A clonable signal observing this source.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            ctx: self.ctx.clone(),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`CancelSource`].
#[derive(Debug, Clone)]
pub struct CancelSignal {
    ctx: Context,
}

impl CancelSignal {
    /// Returns true once the source has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_done()
    }

    /// The firing cause, if fired.
    #[must_use]
    pub fn cause(&self) -> Option<Cause> {
        self.ctx.cause()
    }

    /// Future resolving when the source fires.
    #[must_use]
    pub fn fired(&self) -> Done {
        self.ctx.done()
    }
}

/// Binds a source and a context two ways: firing the source completes the
/// context, and the context completing fires the source. Each direction
/// propagates exactly once; both hooks are deregistered after the first
/// fire.
pub fn bind(source: &CancelSource, ctx: &Context) {
    let target = Arc::downgrade(&ctx.shared);
    match source.ctx.register_hook(Box::new(move |cause| {
        if let Some(shared) = target.upgrade() {
            Context::from_shared(shared).complete(Some(cause.unwrap_or(Cause::Cancelled)));
        }
    })) {
        Ok(hook) => ctx.attach_unhook(hook),
        Err((cause, _)) => {
            ctx.complete(Some(cause.unwrap_or(Cause::Cancelled)));
            return;
        }
    }
    let target = Arc::downgrade(&source.ctx.shared);
    match ctx.register_hook(Box::new(move |cause| {
        if let Some(shared) = target.upgrade() {
            Context::from_shared(shared).complete(Some(cause.unwrap_or(Cause::Cancelled)));
        }
    })) {
        Ok(hook) => source.ctx.attach_unhook(hook),
        Err((cause, _)) => {
            source.ctx.complete(Some(cause.unwrap_or(Cause::Cancelled)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::VirtualClock;
    use std::pin::pin;
    use std::sync::atomic::AtomicUsize;

    struct NoopWaker;

    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    fn noop_waker() -> Waker {
        Waker::from(Arc::new(NoopWaker))
    }

    fn poll_once<F: Future>(future: Pin<&mut F>) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = TaskContext::from_waker(&waker);
        future.poll(&mut cx)
    }

    #[test]
    fn cancel_is_idempotent_and_first_cause_wins() {
        let ctx = background().child();
        assert!(!ctx.is_done());
        ctx.cancel_with(Cause::DeadlineExceeded);
        ctx.cancel();
        ctx.cancel_with(Cause::message("late"));
        assert!(ctx.is_done());
        assert!(ctx.cause().is_some_and(|c| c.is_deadline_exceeded()));
    }

    #[test]
    fn parent_completion_reaches_children() {
        let parent = background().child();
        let child = parent.child();
        let grandchild = child.child();
        parent.cancel();
        assert!(child.is_done());
        assert!(grandchild.is_done());
        assert!(grandchild.cause().is_some_and(|c| c.is_cancelled()));
    }

    #[test]
    fn child_completion_never_touches_parent() {
        let parent = background().child();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[test]
    fn child_of_done_parent_adopts_synchronously() {
        let parent = background().child();
        parent.cancel_with(Cause::message("shutdown"));
        let child = parent.child();
        assert!(child.is_done());
        assert_eq!(child.cause().map(|c| c.to_string()), Some("shutdown".into()));
    }

    #[test]
    fn done_resolves_once_and_stays_ready() {
        let ctx = background().child();
        let mut done = pin!(ctx.done());
        assert!(poll_once(done.as_mut()).is_pending());
        assert!(poll_once(done.as_mut()).is_pending());
        ctx.cancel();
        assert!(poll_once(done.as_mut()).is_ready());
        assert!(poll_once(done.as_mut()).is_ready());
    }

    #[test]
    fn dropping_done_deregisters_waiter() {
        let ctx = background().child();
        {
            let mut done = pin!(ctx.done());
            assert!(poll_once(done.as_mut()).is_pending());
        }
        let inner = ctx.shared.inner.lock().unwrap();
        assert!(inner.waiters.is_empty());
    }

    #[test]
    fn callback_runs_on_completion_with_cause() {
        let ctx = background().child();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        ctx.run_after_completion(move |cause| {
            assert!(cause.is_some_and(|c| c.is_cancelled()));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        ctx.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_on_done_context_runs_immediately() {
        let ctx = background().child();
        ctx.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let handle = ctx.run_after_completion(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!handle.stop());
    }

    #[test]
    fn stop_before_completion_prevents_callback() {
        let ctx = background().child();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let handle = ctx.run_after_completion(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.stop());
        assert!(!handle.stop());
        ctx.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_after_completion_reports_false() {
        let ctx = background().child();
        let handle = ctx.run_after_completion(|_| {});
        ctx.cancel();
        assert!(!handle.stop());
    }

    #[test]
    fn callback_panic_is_swallowed() {
        let ctx = background().child();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        ctx.run_after_completion(|_| panic!("boom"));
        ctx.run_after_completion(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        ctx.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(ctx.is_done());
    }

    #[test]
    fn deadline_fires_with_deadline_exceeded() {
        let clock = Arc::new(VirtualClock::new());
        let driver = Arc::new(TimerDriver::new(clock.clone()));
        let ctx = background().child().with_deadline(&driver, Duration::from_millis(50));
        clock.advance(Duration::from_millis(49));
        driver.process_timers();
        assert!(!ctx.is_done());
        clock.advance(Duration::from_millis(1));
        driver.process_timers();
        assert!(ctx.cause().is_some_and(|c| c.is_deadline_exceeded()));
    }

    #[test]
    fn completing_first_disarms_the_deadline() {
        let clock = Arc::new(VirtualClock::new());
        let driver = Arc::new(TimerDriver::new(clock.clone()));
        let ctx = background().child().with_deadline(&driver, Duration::from_millis(50));
        ctx.cancel();
        assert_eq!(driver.pending(), 0);
        clock.advance(Duration::from_millis(100));
        driver.process_timers();
        assert!(ctx.cause().is_some_and(|c| c.is_cancelled()));
    }

    #[test]
    fn deadline_on_done_parent_registers_no_timer() {
        let clock = Arc::new(VirtualClock::new());
        let driver = Arc::new(TimerDriver::new(clock));
        let parent = background().child();
        parent.cancel();
        let ctx = parent.with_deadline(&driver, Duration::from_millis(50));
        assert!(ctx.is_done());
        assert_eq!(driver.pending(), 0);
    }

    #[test]
    fn signal_firing_completes_bound_child() {
        let source = CancelSource::new();
        let ctx = background().child().with_signal(&source.signal());
        assert!(!ctx.is_done());
        source.cancel_with(Cause::message("sigint"));
        assert_eq!(ctx.cause().map(|c| c.to_string()), Some("sigint".into()));
    }

    #[test]
    fn fired_signal_completes_child_at_construction() {
        let source = CancelSource::new();
        source.cancel();
        let ctx = background().child().with_signal(&source.signal());
        assert!(ctx.is_done());
    }

    #[test]
    fn bind_propagates_both_directions_once() {
        let source = CancelSource::new();
        let ctx = background().child();
        bind(&source, &ctx);
        source.cancel();
        assert!(ctx.is_done());
        assert!(source.is_cancelled());

        let source = CancelSource::new();
        let ctx = background().child();
        bind(&source, &ctx);
        ctx.cancel();
        assert!(source.is_cancelled());
        assert!(source.signal().cause().is_some_and(|c| c.is_cancelled()));
    }

    #[test]
    fn mirror_settles_context_with_future_outcome() {
        let parent = background().child();
        let (ctx, mirror) = parent.mirror(std::future::ready(Ok::<(), Cause>(())));
        let mut mirror = pin!(mirror);
        assert!(poll_once(mirror.as_mut()).is_ready());
        assert!(ctx.is_done());
        assert!(ctx.cause().is_none());

        let (ctx, mirror) = parent.mirror(std::future::ready(Err::<(), _>("bad handshake")));
        let mut mirror = pin!(mirror);
        assert!(poll_once(mirror.as_mut()).is_ready());
        assert_eq!(ctx.cause().map(|c| c.to_string()), Some("bad handshake".into()));
    }

    #[test]
    fn mirror_stops_when_context_completes_first() {
        let parent = background().child();
        let (ctx, mirror) = parent.mirror(std::future::pending::<Result<(), Cause>>());
        let mut mirror = pin!(mirror);
        assert!(poll_once(mirror.as_mut()).is_pending());
        ctx.cancel();
        assert!(poll_once(mirror.as_mut()).is_ready());
        assert!(ctx.cause().is_some_and(|c| c.is_cancelled()));
    }
}
