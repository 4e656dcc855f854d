//! Conformance tests for the cancellation context tree.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coopsync::context::{background, bind, CancelSource};
use coopsync::test_utils::{block_on, init_test};
use coopsync::{assert_with_log, test_complete, test_phase};
use coopsync::{Cause, TimerDriver, VirtualClock};

#[test]
fn cancellation_is_idempotent_and_first_cause_wins() {
    init_test("cancellation_is_idempotent_and_first_cause_wins");
    let ctx = background().child();

    test_phase!("first cancel settles the cause");
    ctx.cancel_with(Cause::message("operator abort"));
    assert_with_log!(ctx.is_done(), "context done after cancel", ctx.completion());

    test_phase!("later cancels are no-ops");
    ctx.cancel();
    ctx.cancel_with(Cause::DeadlineExceeded);
    let cause = ctx.cause().map(|c| c.to_string());
    assert_with_log!(
        cause.as_deref() == Some("operator abort"),
        "first cause preserved",
        cause
    );
    test_complete!("cancellation_is_idempotent_and_first_cause_wins");
}

#[test]
fn completion_reaches_every_descendant() {
    init_test("completion_reaches_every_descendant");
    let root = background().child();
    let left = root.child();
    let right = root.child();
    let grandchild = left.child();

    root.cancel();
    for (name, ctx) in [("left", &left), ("right", &right), ("grandchild", &grandchild)] {
        assert_with_log!(ctx.is_done(), name, ctx.completion());
        assert_with_log!(
            ctx.cause().is_some_and(|c| c.is_cancelled()),
            "descendant adopted the cause",
            ctx.cause()
        );
    }
    test_complete!("completion_reaches_every_descendant");
}

#[test]
fn child_of_completed_parent_is_born_done() {
    init_test("child_of_completed_parent_is_born_done");
    let parent = background().child();
    parent.cancel_with(Cause::message("already over"));

    // Adoption is synchronous: no polling step may observe Active.
    let child = parent.child();
    assert_with_log!(child.is_done(), "child born done", child.completion());
    let cause = child.cause().map(|c| c.to_string());
    assert_with_log!(
        cause.as_deref() == Some("already over"),
        "cause adopted at construction",
        cause
    );
    test_complete!("child_of_completed_parent_is_born_done");
}

#[test]
fn done_future_observed_across_threads() {
    init_test("done_future_observed_across_threads");
    let ctx = background().child();
    let observer = ctx.clone();
    let handle = std::thread::spawn(move || {
        block_on(observer.done());
        observer.cause().is_some_and(|c| c.is_cancelled())
    });

    std::thread::sleep(Duration::from_millis(20));
    ctx.cancel();
    let saw_cancel = handle.join().unwrap();
    assert_with_log!(saw_cancel, "waiter observed the cancellation", saw_cancel);
    test_complete!("done_future_observed_across_threads");
}

#[test]
fn callbacks_fire_once_and_stop_prevents_execution() {
    init_test("callbacks_fire_once_and_stop_prevents_execution");
    let ctx = background().child();
    let fired = Arc::new(AtomicUsize::new(0));

    test_phase!("a stopped callback never runs");
    let stopped = {
        let fired = Arc::clone(&fired);
        ctx.run_after_completion(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert_with_log!(stopped.stop(), "stop before completion", true);

    test_phase!("a live callback runs exactly once");
    let live = {
        let fired = Arc::clone(&fired);
        ctx.run_after_completion(move |cause| {
            assert!(cause.is_some());
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    ctx.cancel();
    ctx.cancel();
    assert_with_log!(
        fired.load(Ordering::SeqCst) == 1,
        "exactly one callback ran",
        fired.load(Ordering::SeqCst)
    );
    assert_with_log!(!live.stop(), "stop after the callback ran", false);
    test_complete!("callbacks_fire_once_and_stop_prevents_execution");
}

#[test]
fn source_and_context_bind_two_ways() {
    init_test("source_and_context_bind_two_ways");

    test_phase!("source fires first");
    let source = CancelSource::new();
    let ctx = background().child();
    bind(&source, &ctx);
    source.cancel_with(Cause::message("external abort"));
    assert_with_log!(ctx.is_done(), "context followed the source", ctx.completion());

    test_phase!("context fires first");
    let source = CancelSource::new();
    let ctx = background().child();
    bind(&source, &ctx);
    ctx.cancel();
    assert_with_log!(source.is_cancelled(), "source followed the context", true);
    test_complete!("source_and_context_bind_two_ways");
}

#[test]
fn signal_cause_is_mirrored_into_derived_contexts() {
    init_test("signal_cause_is_mirrored_into_derived_contexts");
    let source = CancelSource::new();
    let ctx = background().child().with_signal(&source.signal());

    source.cancel_with(Cause::message("sigterm"));
    let cause = ctx.cause().map(|c| c.to_string());
    assert_with_log!(cause.as_deref() == Some("sigterm"), "cause mirrored", cause);
    test_complete!("signal_cause_is_mirrored_into_derived_contexts");
}

#[test]
fn explicit_cancel_beats_a_later_deadline() {
    init_test("explicit_cancel_beats_a_later_deadline");
    let clock = Arc::new(VirtualClock::new());
    let driver = Arc::new(TimerDriver::new(clock.clone()));
    let ctx = background()
        .child()
        .with_deadline(&driver, Duration::from_millis(50));

    test_phase!("cancel at t=10ms");
    clock.advance(Duration::from_millis(10));
    driver.process_timers();
    ctx.cancel();
    assert_with_log!(
        ctx.cause().is_some_and(|c| c.is_cancelled()),
        "cancel cause recorded",
        ctx.cause()
    );
    assert_with_log!(driver.pending() == 0, "deadline disarmed", driver.pending());

    test_phase!("the dead timer stays dead past t=50ms");
    clock.advance(Duration::from_millis(100));
    let fired = driver.process_timers();
    assert_with_log!(fired == 0, "nothing left to fire", fired);
    assert_with_log!(
        ctx.cause().is_some_and(|c| c.is_cancelled()),
        "cause unchanged",
        ctx.cause()
    );
    test_complete!("explicit_cancel_beats_a_later_deadline");
}

#[test]
fn deadline_wins_when_nobody_cancels() {
    init_test("deadline_wins_when_nobody_cancels");
    let clock = Arc::new(VirtualClock::new());
    let driver = Arc::new(TimerDriver::new(clock.clone()));
    let ctx = background()
        .child()
        .with_deadline(&driver, Duration::from_millis(50));

    clock.advance(Duration::from_millis(49));
    driver.process_timers();
    assert_with_log!(!ctx.is_done(), "still active just before the deadline", ctx.completion());

    clock.advance(Duration::from_millis(1));
    driver.process_timers();
    assert_with_log!(
        ctx.cause().is_some_and(|c| c.is_deadline_exceeded()),
        "deadline cause recorded",
        ctx.cause()
    );
    test_complete!("deadline_wins_when_nobody_cancels");
}

#[test]
fn mirrored_future_outcome_settles_the_context() {
    init_test("mirrored_future_outcome_settles_the_context");
    let parent = background().child();

    test_phase!("clean outcome");
    let (ctx, mirror) = parent.mirror(std::future::ready(Ok::<(), Cause>(())));
    block_on(mirror);
    assert_with_log!(ctx.is_done(), "context settled", ctx.completion());
    assert_with_log!(ctx.cause().is_none(), "no cause for clean finish", ctx.cause());

    test_phase!("error outcome");
    let (ctx, mirror) = parent.mirror(std::future::ready(Err::<(), _>("connection reset")));
    block_on(mirror);
    let cause = ctx.cause().map(|c| c.to_string());
    assert_with_log!(
        cause.as_deref() == Some("connection reset"),
        "error propagated as the cause",
        cause
    );
    test_complete!("mirrored_future_outcome_settles_the_context");
}
