//! Worker threads and their shared, externally visible state.
//!
//! Each worker owns a [`WorkQueue`] and a parker, and publishes a small set
//! of atomics that the pool reads and writes from other threads: the slot
//! index in the worker array, the intrusive link of the parked-worker stack,
//! the lifecycle state, and the two flags that close the race between
//! parking and being signalled.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::scheduler::global_queue::GlobalQueue;
use crate::scheduler::pool::Pool;
use crate::scheduler::work_queue::{Steal, WorkQueue};
use crate::task::{Task, TaskMode};
use crate::tracing_compat::{debug, error, trace};
use crate::util::clock;
use crate::util::DetRng;

/// Sentinel for `next_parked`: the worker is not linked into the parked
/// stack. Distinct from `0`, which terminates a chain.
pub(crate) const NOT_IN_STACK: usize = usize::MAX;

/// Lifecycle of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WorkerState {
    /// Holds a CPU permit and may run tasks of either mode.
    CpuAcquired = 0,
    /// Executing a probably-blocking task without a CPU permit.
    Blocking = 1,
    /// Out of work and parked (or about to park).
    Parking = 2,
    /// Between states: just created, or just finished a blocking task.
    Retiring = 3,
    /// Permanently stopped.
    Terminated = 4,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::CpuAcquired,
            1 => Self::Blocking,
            2 => Self::Parking,
            3 => Self::Retiring,
            _ => Self::Terminated,
        }
    }
}

/// Tri-state guarding the park/terminate race. A parked worker may only be
/// reclaimed while `ALLOWED`; an unparker forbids termination before relying
/// on the worker, and a terminating worker claims itself exactly once.
pub(crate) const TERMINATION_ALLOWED: u8 = 0;
pub(crate) const TERMINATION_FORBIDDEN: u8 = 1;
pub(crate) const TERMINATION_TERMINATED: u8 = 2;

/// Blocks and wakes a single worker thread.
///
/// A stored permit makes unpark-before-park not lose the wakeup, and the
/// waiting flag lets `unpark` skip the lock and condvar notify entirely when
/// the worker is running.
pub(crate) struct Parker {
    notified: AtomicBool,
    waiting: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            notified: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until unparked or the timeout elapses. Consumes a pending
    /// permit immediately if one is stored.
    pub(crate) fn park_timeout(&self, timeout: Duration) {
        if self
            .notified
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        let mut guard = self.lock.lock();
        self.waiting.store(true, Ordering::SeqCst);
        // Re-check under the lock: an unpark may have stored the permit
        // between the fast path and taking the lock.
        if self
            .notified
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.waiting.store(false, Ordering::SeqCst);
            return;
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let timed_out = self
                .condvar
                .wait_until(&mut guard, deadline)
                .timed_out();
            if self
                .notified
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                || timed_out
            {
                break;
            }
        }
        self.waiting.store(false, Ordering::SeqCst);
    }

    /// Wakes the parked thread, or stores a permit for the next park.
    pub(crate) fn unpark(&self) {
        self.notified.store(true, Ordering::SeqCst);
        if self.waiting.load(Ordering::SeqCst) {
            let _guard = self.lock.lock();
            self.condvar.notify_one();
        }
    }
}

/// State of one worker, shared between its thread and the pool.
pub(crate) struct Worker {
    /// Slot in the pool's worker array. `0` once terminated; slots are
    /// compacted, so the index of a live worker can change under the
    /// pool lock.
    pub(crate) index_in_array: AtomicUsize,
    /// Intrusive link for the parked-worker stack.
    pub(crate) next_parked: AtomicUsize,
    state: AtomicU8,
    termination_state: AtomicU8,
    /// Closest steal-retry deadline observed by the last failed scan,
    /// in nanoseconds. Zero when a plain park is fine.
    pub(crate) min_delay_until_stealable: AtomicU64,
    /// True from the moment the worker decides to park until an unparker
    /// claims it. An unparker clearing this flag cancels the park.
    pub(crate) parking_allowed: AtomicBool,
    /// True only while the worker is inside its parking sequence, so that
    /// unparkers elsewhere in the loop do not pay for a wakeup.
    pub(crate) signalling_allowed: AtomicBool,
    pub(crate) local_queue: WorkQueue,
    pub(crate) parker: Parker,
    pub(crate) join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index_in_array: AtomicUsize::new(index),
            next_parked: AtomicUsize::new(NOT_IN_STACK),
            state: AtomicU8::new(WorkerState::Retiring as u8),
            termination_state: AtomicU8::new(TERMINATION_FORBIDDEN),
            min_delay_until_stealable: AtomicU64::new(0),
            parking_allowed: AtomicBool::new(false),
            signalling_allowed: AtomicBool::new(false),
            local_queue: WorkQueue::new(),
            parker: Parker::new(),
            join_handle: Mutex::new(None),
        }
    }

    /// Reinitializes a retired worker for reuse in a new slot. Called only
    /// under the pool's creation lock, after the previous thread has
    /// permanently stopped touching this object.
    pub(crate) fn reset(&self, index: usize) {
        debug_assert_eq!(self.local_queue.size(), 0, "retired worker kept queued work");
        self.index_in_array.store(index, Ordering::SeqCst);
        self.next_parked.store(NOT_IN_STACK, Ordering::SeqCst);
        self.state
            .store(WorkerState::Retiring as u8, Ordering::SeqCst);
        self.termination_state
            .store(TERMINATION_FORBIDDEN, Ordering::SeqCst);
        self.min_delay_until_stealable.store(0, Ordering::SeqCst);
        self.parking_allowed.store(false, Ordering::SeqCst);
        self.signalling_allowed.store(false, Ordering::SeqCst);
        // A stale unpark aimed at the previous occupant must not wake the
        // new one early.
        self.parker.notified.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Claims a parked worker on behalf of an unparker. Fails if the worker
    /// already claimed itself for termination.
    pub(crate) fn try_forbid_termination(&self) -> bool {
        self.termination_state
            .compare_exchange(
                TERMINATION_ALLOWED,
                TERMINATION_FORBIDDEN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Claims this worker for termination. Only the worker thread itself
    /// attempts this.
    pub(crate) fn try_claim_termination(&self) -> bool {
        self.termination_state
            .compare_exchange(
                TERMINATION_ALLOWED,
                TERMINATION_TERMINATED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    #[inline]
    pub(crate) fn allow_termination(&self) {
        self.termination_state
            .store(TERMINATION_ALLOWED, Ordering::SeqCst);
    }

    /// A worker may not terminate while probably-blocking work is queued
    /// globally with nobody awake to run it. Pulls one such task into the
    /// local queue instead; returns false if it did.
    pub(crate) fn blocking_quiescence(&self, global: &GlobalQueue) -> bool {
        if let Some(task) = global.remove_first_with_mode(TaskMode::ProbablyBlocking) {
            let not_added = self.local_queue.add(task);
            debug_assert!(not_added.is_none(), "idle worker queue must accept a task");
            return false;
        }
        true
    }

    /// Releases the CPU permit back to the pool if this worker holds one,
    /// then transitions to `new_state`. Returns whether a permit was held.
    pub(crate) fn try_release_cpu(&self, pool: &Pool, new_state: WorkerState) -> bool {
        let previous = self.state();
        let had_permit = previous == WorkerState::CpuAcquired;
        if had_permit {
            pool.release_cpu_permit();
        }
        if previous != new_state {
            self.set_state(new_state);
        }
        had_permit
    }
}

struct CurrentWorker {
    pool: Weak<Pool>,
    worker: Arc<Worker>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<CurrentWorker>> = const { RefCell::new(None) };
}

/// Returns the calling thread's worker, if it belongs to `pool`.
pub(crate) fn current_worker(pool: &Pool) -> Option<Arc<Worker>> {
    CURRENT_WORKER.with(|current| {
        let current = current.borrow();
        let current = current.as_ref()?;
        if std::ptr::eq(Weak::as_ptr(&current.pool), std::ptr::from_ref(pool)) {
            Some(Arc::clone(&current.worker))
        } else {
            None
        }
    })
}

struct CurrentWorkerGuard;

impl CurrentWorkerGuard {
    fn bind(pool: &Arc<Pool>, worker: &Arc<Worker>) -> Self {
        CURRENT_WORKER.with(|current| {
            *current.borrow_mut() = Some(CurrentWorker {
                pool: Arc::downgrade(pool),
                worker: Arc::clone(worker),
            });
        });
        Self
    }
}

impl Drop for CurrentWorkerGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|current| current.take());
    }
}

/// Entry point of a worker thread.
pub(crate) fn run(pool: Arc<Pool>, worker: Arc<Worker>) {
    let _guard = CurrentWorkerGuard::bind(&pool, &worker);
    let seed = worker.index_in_array.load(Ordering::SeqCst) as u64 + 1;
    let mut thread = WorkerThread {
        rng: DetRng::new(seed),
        termination_deadline: 0,
        pool,
        worker,
    };
    thread.run_loop();
}

/// Per-thread worker driver. Holds the state only the worker thread itself
/// touches: the steal victim selector and the idle-termination deadline.
struct WorkerThread {
    pool: Arc<Pool>,
    worker: Arc<Worker>,
    rng: DetRng,
    /// Absolute time after which an idle worker may reclaim itself.
    /// Zero while the worker has work.
    termination_deadline: u64,
}

impl WorkerThread {
    fn run_loop(&mut self) {
        trace!(index = self.worker.index_in_array.load(Ordering::SeqCst), "worker started");
        while !self.pool.is_terminated() {
            if let Some(task) = self.find_task() {
                self.execute_task(task);
                continue;
            }
            // Out of work. Publish on the parked stack first, then re-scan:
            // a task dispatched between the failed find and the push would
            // otherwise be stranded until the keep-alive wakeup.
            self.worker.parking_allowed.store(true, Ordering::SeqCst);
            if self.pool.parked_workers_stack_push(&self.worker) {
                continue;
            }
            self.worker.signalling_allowed.store(true, Ordering::SeqCst);
            if self.worker.parking_allowed.load(Ordering::SeqCst) {
                self.worker
                    .try_release_cpu(&self.pool, WorkerState::Parking);
                let min_delay = self.worker.min_delay_until_stealable.load(Ordering::SeqCst);
                if min_delay == 0 {
                    if self.park() {
                        // Reclaimed. The worker object may already belong
                        // to a newly created thread; it must not be
                        // touched again from here.
                        return;
                    }
                } else {
                    // Every victim had only too-fresh work. Nap just long
                    // enough for the closest task to become stealable.
                    self.worker
                        .parker
                        .park_timeout(Duration::from_nanos(min_delay));
                    self.worker.min_delay_until_stealable.store(0, Ordering::SeqCst);
                }
            }
            self.worker.signalling_allowed.store(false, Ordering::SeqCst);
        }
        self.worker
            .try_release_cpu(&self.pool, WorkerState::Terminated);
        trace!("worker stopped");
    }

    /// Returns true when the worker reclaimed itself past its keep-alive.
    fn park(&mut self) -> bool {
        self.worker.allow_termination();
        let keep_alive = self.pool.keep_alive_ns();
        if self.termination_deadline == 0 {
            self.termination_deadline = clock::nanotime() + keep_alive;
        }
        if !self.do_park(keep_alive) {
            return false;
        }
        if clock::nanotime() >= self.termination_deadline {
            self.termination_deadline = 0;
            return self.pool.try_terminate_worker(&self.worker);
        }
        false
    }

    /// Returns false if parking was abandoned because globally queued
    /// blocking work was claimed instead.
    fn do_park(&self, keep_alive_ns: u64) -> bool {
        if !self.worker.blocking_quiescence(&self.pool.global) {
            return false;
        }
        self.worker
            .parker
            .park_timeout(Duration::from_nanos(keep_alive_ns));
        true
    }

    fn execute_task(&mut self, task: Box<Task>) {
        let mode = task.mode();
        self.idle_reset(mode);
        self.before_task(mode);
        run_safely(task);
        self.after_task(mode);
    }

    fn idle_reset(&mut self, mode: TaskMode) {
        self.termination_deadline = 0;
        if self.worker.state() == WorkerState::Parking {
            // Only possible when blocking_quiescence stashed a task into
            // the local queue of an already-parking worker.
            debug_assert_eq!(mode, TaskMode::ProbablyBlocking);
            self.worker.set_state(WorkerState::Blocking);
        }
    }

    fn before_task(&self, mode: TaskMode) {
        if mode == TaskMode::NonBlocking {
            return;
        }
        // Release the permit before a potentially long syscall so another
        // worker can take over CPU-bound work immediately.
        if self.worker.try_release_cpu(&self.pool, WorkerState::Blocking) {
            self.pool.signal_cpu_work();
        }
    }

    fn after_task(&self, mode: TaskMode) {
        if mode == TaskMode::NonBlocking {
            return;
        }
        self.pool.decrement_blocking_tasks();
        let state = self.worker.state();
        if state != WorkerState::Terminated {
            debug_assert_eq!(state, WorkerState::Blocking, "expected a blocking worker");
            self.worker.set_state(WorkerState::Retiring);
        }
    }

    fn find_task(&mut self) -> Option<Box<Task>> {
        if self.try_acquire_cpu_permit() {
            return self.find_task_with_cpu_permit();
        }
        // No permit: only the local queue and globally queued blocking work
        // are eligible.
        self.worker
            .local_queue
            .poll()
            .or_else(|| {
                self.pool
                    .global
                    .remove_first_with_mode(TaskMode::ProbablyBlocking)
            })
    }

    fn try_acquire_cpu_permit(&self) -> bool {
        if self.worker.state() == WorkerState::CpuAcquired {
            return true;
        }
        if self.pool.try_acquire_cpu_permit() {
            self.worker.set_state(WorkerState::CpuAcquired);
            true
        } else {
            false
        }
    }

    fn find_task_with_cpu_permit(&mut self) -> Option<Box<Task>> {
        // Poll the global queue first once in a while, or local work could
        // starve external submitters indefinitely.
        let global_first = self
            .rng
            .next_usize(2 * self.pool.config.core_pool_size)
            == 0;
        if global_first {
            if let Some(task) = self.pool.global.remove_first_with_mode(TaskMode::NonBlocking) {
                return Some(task);
            }
        }
        if let Some(task) = self.worker.local_queue.poll() {
            return Some(task);
        }
        if !global_first {
            if let Some(task) = self.pool.global.remove_first() {
                return Some(task);
            }
        }
        self.try_steal()
    }

    /// Scans every other worker once, starting from a random victim, and
    /// records the closest retry deadline when all work was too fresh.
    fn try_steal(&mut self) -> Option<Box<Task>> {
        debug_assert_eq!(self.worker.local_queue.size(), 0, "stealing with local work");
        let created = self.pool.created_workers();
        if created < 2 {
            return None;
        }
        let resolution = self.pool.steal_resolution_ns();
        let mut victim_index = self.rng.next_usize(created);
        let mut min_delay = u64::MAX;
        for _ in 0..created {
            victim_index += 1;
            if victim_index > created {
                victim_index = 1;
            }
            let Some(victim) = self.pool.worker_at(victim_index) else {
                continue;
            };
            if std::ptr::eq(victim, &*self.worker) {
                continue;
            }
            match self
                .worker
                .local_queue
                .try_steal_from(&victim.local_queue, resolution)
            {
                Steal::Success => {
                    trace!(victim = victim_index, "stole a task");
                    return self.worker.local_queue.poll();
                }
                Steal::Retry(delay) => min_delay = min_delay.min(delay),
                Steal::Empty => {}
            }
        }
        self.worker.min_delay_until_stealable.store(
            if min_delay == u64::MAX { 0 } else { min_delay },
            Ordering::SeqCst,
        );
        None
    }
}

/// Runs a task, containing panics so a misbehaving payload cannot take the
/// worker thread down with it.
pub(crate) fn run_safely(task: Box<Task>) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run()));
    if result.is_err() {
        error!("task panicked; worker continues");
    } else {
        debug!("task completed");
    }
}
