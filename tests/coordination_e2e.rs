//! End-to-end scenarios combining contexts, channels, and the sync
//! primitives across real threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coopsync::context::background;
use coopsync::test_utils::{block_on, init_test};
use coopsync::{assert_with_log, test_complete, test_phase};
use coopsync::{Channel, Condvar, Mutex, RwLock, Semaphore, WaitGroup};

#[test]
fn mutex_serializes_concurrent_increments() {
    init_test("mutex_serializes_concurrent_increments");
    let total = Arc::new(Mutex::new(0_u64));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let total = Arc::clone(&total);
        handles.push(std::thread::spawn(move || {
            for _ in 0..100 {
                let mut guard = block_on(total.lock());
                *guard += 1;
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    let observed = *block_on(total.lock());
    assert_with_log!(observed == 800, "no increment lost", observed);
    test_complete!("mutex_serializes_concurrent_increments");
}

#[test]
fn semaphore_caps_concurrency() {
    init_test("semaphore_caps_concurrency");
    let sem = Arc::new(Semaphore::new(2));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sem = Arc::clone(&sem);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        handles.push(std::thread::spawn(move || {
            let permit = block_on(sem.acquire());
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    let peak = peak.load(Ordering::SeqCst);
    assert_with_log!(peak <= 2, "at most two holders at once", peak);
    assert_with_log!(
        sem.available_permits() == 2,
        "all permits returned",
        sem.available_permits()
    );
    test_complete!("semaphore_caps_concurrency");
}

#[test]
fn condvar_hands_a_predicate_change_to_a_waiter() {
    init_test("condvar_hands_a_predicate_change_to_a_waiter");
    let shared = Arc::new((Mutex::new(false), Condvar::new()));
    let waiter = Arc::clone(&shared);

    let consumer = std::thread::spawn(move || {
        let (mutex, cond) = &*waiter;
        let mut guard = block_on(mutex.lock());
        while !*guard {
            guard = block_on(cond.wait(guard));
        }
        true
    });

    std::thread::sleep(Duration::from_millis(20));
    let (mutex, cond) = &*shared;
    {
        let mut guard = block_on(mutex.lock());
        *guard = true;
    }
    cond.notify_one();

    let woke = consumer.join().unwrap();
    assert_with_log!(woke, "consumer observed the predicate", woke);
    test_complete!("condvar_hands_a_predicate_change_to_a_waiter");
}

#[test]
fn rwlock_writer_completes_under_reader_pressure() {
    init_test("rwlock_writer_completes_under_reader_pressure");
    let lock = Arc::new(RwLock::new(0_u32));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let lock = Arc::clone(&lock);
        readers.push(std::thread::spawn(move || loop {
            {
                let guard = block_on(lock.read());
                if *guard == 1 {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }));
    }

    std::thread::sleep(Duration::from_millis(10));
    {
        let mut guard = block_on(lock.write());
        *guard = 1;
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert_with_log!(
        lock.waiter_count() == 0,
        "queue fully drained",
        lock.waiter_count()
    );
    test_complete!("rwlock_writer_completes_under_reader_pressure");
}

#[test]
fn wait_group_gates_worker_shutdown() {
    init_test("wait_group_gates_worker_shutdown");
    let wg = WaitGroup::new();
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let guard = wg.guard();
        let finished = Arc::clone(&finished);
        std::thread::spawn(move || {
            let _guard = guard;
            std::thread::sleep(Duration::from_millis(5));
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    block_on(wg.wait());
    let finished = finished.load(Ordering::SeqCst);
    assert_with_log!(finished == 5, "wait returned only after all units", finished);
    test_complete!("wait_group_gates_worker_shutdown");
}

#[test]
fn cancelled_pipeline_drains_and_shuts_down() {
    init_test("cancelled_pipeline_drains_and_shuts_down");
    let ctx = background().child();
    let jobs = Channel::<u32>::new(4);
    let results = Channel::<u32>::new(64);
    let wg = WaitGroup::new();

    test_phase!("bridge the context into the job channel");
    let jobs_hook = jobs.clone();
    ctx.run_after_completion(move |_| jobs_hook.close());

    test_phase!("start workers");
    for _ in 0..3 {
        let jobs = jobs.clone();
        let results = results.clone();
        let guard = wg.guard();
        std::thread::spawn(move || {
            let _guard = guard;
            while let Some(job) = block_on(jobs.recv()) {
                block_on(results.send(job * 2)).unwrap();
            }
        });
    }

    test_phase!("submit work, then cancel");
    for job in 0..10 {
        block_on(jobs.send(job)).unwrap();
    }
    ctx.cancel();

    test_phase!("workers drain the buffer and exit");
    block_on(wg.wait());
    assert_with_log!(jobs.is_closed(), "job channel closed by the hook", true);

    results.close();
    let mut outputs = Vec::new();
    while let Some(value) = block_on(results.recv()) {
        outputs.push(value);
    }
    outputs.sort_unstable();
    let expected: Vec<u32> = (0..10).map(|v| v * 2).collect();
    assert_with_log!(outputs == expected, "every accepted job was processed", outputs);
    test_complete!("cancelled_pipeline_drains_and_shuts_down");
}
