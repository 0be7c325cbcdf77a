#![allow(missing_docs)]
//! End-to-end pool behavior: worker creation policy, blocking
//! compensation, idle reclamation, and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use corepool::{DispatchError, PoolConfig, Scheduler, TaskMode};

/// Polls `condition` until it holds or the deadline expires.
fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn cpu_bound_load_uses_only_core_workers() {
    let pool = Scheduler::new(PoolConfig::new(2, 4)).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let completed = Arc::clone(&completed);
        pool.dispatch(TaskMode::NonBlocking, move || {
            thread::sleep(Duration::from_millis(1));
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert!(
        wait_until(Duration::from_secs(30), || completed.load(Ordering::SeqCst) == 100),
        "all tasks should complete, got {}",
        completed.load(Ordering::SeqCst)
    );
    assert_eq!(
        pool.created_workers(),
        2,
        "pure CPU load must not grow the pool past the core size"
    );
    assert_eq!(pool.blocking_tasks(), 0);
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn blocking_task_does_not_stall_cpu_work() {
    let pool = Scheduler::new(PoolConfig::new(1, 4)).unwrap();
    let (release_tx, release_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    // The blocking task occupies their only core worker's thread until the
    // CPU task has run; without compensation this would deadlock.
    let blocking_done = done_tx.clone();
    pool.dispatch(TaskMode::ProbablyBlocking, move || {
        release_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("the CPU task should have released us");
        blocking_done.send("blocking").unwrap();
    })
    .unwrap();
    pool.dispatch(TaskMode::NonBlocking, move || {
        release_tx.send(()).unwrap();
        done_tx.send("cpu").unwrap();
    })
    .unwrap();

    assert_eq!(
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        "cpu",
        "the CPU task must run while the blocking task is still parked on the channel"
    );
    assert_eq!(
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        "blocking"
    );
    assert!(
        wait_until(Duration::from_secs(10), || pool.blocking_tasks() == 0),
        "the blocking counter must return to zero"
    );
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn blocking_dispatch_defers_growth_until_a_cpu_permit_frees() {
    let pool = Scheduler::new(PoolConfig::new(1, 4)).unwrap();
    let (release_tx, release_rx) = mpsc::channel();
    let blocking_ran = Arc::new(AtomicUsize::new(0));

    // Pin the only CPU permit with a gated task.
    pool.dispatch(TaskMode::NonBlocking, move || {
        release_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("the gate should be opened");
    })
    .unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || pool.available_cpu_permits() == 0),
        "the gated task should hold the permit"
    );

    let ran = Arc::clone(&blocking_ran);
    pool.dispatch(TaskMode::ProbablyBlocking, move || {
        ran.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        pool.created_workers(),
        1,
        "the pool must not grow while every CPU permit is held"
    );
    assert_eq!(
        blocking_ran.load(Ordering::SeqCst),
        0,
        "the blocking task has no thread to run on yet"
    );

    release_tx.send(()).unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            blocking_ran.load(Ordering::SeqCst) == 1
        }),
        "the freed permit should let the blocking task through"
    );
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn blocking_load_grows_past_core_and_retires_back() {
    let mut config = PoolConfig::new(1, 8);
    config.idle_worker_keep_alive = Duration::from_millis(20);
    let pool = Scheduler::new(config).unwrap();

    let gate = Arc::new(std::sync::Barrier::new(4));
    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let gate = Arc::clone(&gate);
        let completed = Arc::clone(&completed);
        pool.dispatch(TaskMode::ProbablyBlocking, move || {
            // All four must be in flight at once to pass the barrier.
            gate.wait();
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert!(
        wait_until(Duration::from_secs(10), || completed.load(Ordering::SeqCst) == 4),
        "concurrent blocking tasks require compensation workers"
    );
    assert!(
        pool.created_workers() >= 4,
        "expected at least 4 workers, got {}",
        pool.created_workers()
    );
    assert!(
        wait_until(Duration::from_secs(30), || pool.created_workers() == 1),
        "surplus workers should retire after the keep-alive, {} remain",
        pool.created_workers()
    );
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn shutdown_runs_every_submitted_task_exactly_once() {
    let pool = Scheduler::new(PoolConfig::new(2, 4)).unwrap();
    let executed = Arc::new(AtomicUsize::new(0));
    for i in 0..256 {
        let executed = Arc::clone(&executed);
        let mode = if i % 3 == 0 {
            TaskMode::ProbablyBlocking
        } else {
            TaskMode::NonBlocking
        };
        pool.dispatch(mode, move || {
            executed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    pool.shutdown(Duration::from_secs(5));
    assert!(pool.is_terminated());
    assert_eq!(
        executed.load(Ordering::SeqCst),
        256,
        "shutdown must run every already-accepted task"
    );
}

#[test]
fn dispatch_after_shutdown_is_rejected() {
    let pool = Scheduler::new(PoolConfig::new(1, 2)).unwrap();
    pool.dispatch(TaskMode::NonBlocking, || {}).unwrap();
    pool.shutdown(Duration::from_secs(5));
    let result = pool.dispatch(TaskMode::NonBlocking, || {
        panic!("must never run");
    });
    match result {
        Err(DispatchError::Terminated { name }) => assert_eq!(name, "corepool"),
        Ok(()) => panic!("dispatch after shutdown should be rejected"),
    }
}

#[test]
fn shutdown_is_idempotent() {
    let pool = Scheduler::new(PoolConfig::new(1, 2)).unwrap();
    pool.dispatch(TaskMode::NonBlocking, || {}).unwrap();
    pool.shutdown(Duration::from_secs(5));
    pool.shutdown(Duration::from_secs(5));
    assert!(pool.is_terminated());
}

#[test]
fn display_reports_pool_shape() {
    let pool = Scheduler::new(PoolConfig::new(2, 6)).unwrap();
    let rendered = pool.to_string();
    assert!(
        rendered.contains("core = 2") && rendered.contains("max = 6"),
        "unexpected diagnostics: {rendered}"
    );
    pool.shutdown(Duration::from_secs(5));
}
