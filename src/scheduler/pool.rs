//! Pool coordination: the packed control word, the parked-worker stack,
//! dispatch, worker creation and reclamation, and shutdown.
//!
//! All counters live in one 64-bit control word so that the CPU-permit
//! check and the created/blocking bookkeeping stay mutually consistent
//! without a lock. Parked workers form an intrusive Treiber stack whose
//! links are array indices; the top carries a version stamp bumped on
//! every mutation, which is what makes index reuse after worker
//! termination safe.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::PoolConfig;
use crate::error::{ConfigError, DispatchError};
use crate::scheduler::global_queue::GlobalQueue;
use crate::scheduler::worker::{self, Worker, WorkerState};
use crate::task::{Task, TaskMode};
use crate::tracing_compat::{debug, error, trace};

// Layout of the control word: | cpu permits | blocking tasks | created |
// with 21 bits per field.
const COUNTER_SHIFT: u32 = 21;
const CREATED_MASK: u64 = (1 << COUNTER_SHIFT) - 1;
const BLOCKING_SHIFT: u32 = COUNTER_SHIFT;
const BLOCKING_MASK: u64 = CREATED_MASK << BLOCKING_SHIFT;
const CPU_PERMITS_SHIFT: u32 = 2 * COUNTER_SHIFT;
const CPU_PERMITS_MASK: u64 = CREATED_MASK << CPU_PERMITS_SHIFT;

// The parked-worker stack top packs | version | index | in the same 21-bit
// index field.
const PARKED_INDEX_MASK: u64 = CREATED_MASK;
const PARKED_VERSION_MASK: u64 = !PARKED_INDEX_MASK;
const PARKED_VERSION_INC: u64 = 1 << COUNTER_SHIFT;

const fn created_workers_in(state: u64) -> usize {
    (state & CREATED_MASK) as usize
}

const fn blocking_tasks_in(state: u64) -> usize {
    ((state & BLOCKING_MASK) >> BLOCKING_SHIFT) as usize
}

const fn cpu_permits_in(state: u64) -> usize {
    ((state & CPU_PERMITS_MASK) >> CPU_PERMITS_SHIFT) as usize
}

/// How long [`Scheduler::drop`] waits per worker before giving up on a
/// thread that is stuck in a task.
const DROP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owner of every worker allocation. Hot paths read raw pointers out of the
/// worker array without a lock, so an allocation must stay alive for the
/// pool's lifetime even after its worker retires; retired workers are
/// reused by the next creation, which keeps the total allocation count at
/// or below `max_pool_size`.
#[derive(Default)]
struct WorkerRegistry {
    live: Vec<Arc<Worker>>,
    retired: Vec<Arc<Worker>>,
}

pub(crate) struct Pool {
    pub(crate) config: PoolConfig,
    keep_alive_ns: u64,
    steal_resolution_ns: u64,
    pub(crate) global: GlobalQueue,
    control_state: AtomicU64,
    parked_workers_stack: AtomicU64,
    /// Slot 0 is a permanent sentinel; live workers occupy `1..=created`
    /// contiguously. Slots are raw pointers so the hot find/steal paths
    /// read them without a lock; the `registry` below keeps every pointee
    /// alive for the pool's lifetime.
    workers: Box<[AtomicPtr<Worker>]>,
    /// Creation/termination lock and owner of every worker allocation.
    registry: Mutex<WorkerRegistry>,
    terminated: AtomicBool,
    /// Self-reference for handing an owning pointer to spawned workers.
    handle: Weak<Pool>,
}

impl Pool {
    fn new(config: PoolConfig, handle: Weak<Pool>) -> Self {
        let slots = config.max_pool_size + 1;
        let workers = (0..slots)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            keep_alive_ns: config.idle_worker_keep_alive.as_nanos() as u64,
            steal_resolution_ns: config.steal_time_resolution.as_nanos() as u64,
            global: GlobalQueue::new(),
            control_state: AtomicU64::new((config.core_pool_size as u64) << CPU_PERMITS_SHIFT),
            parked_workers_stack: AtomicU64::new(0),
            workers,
            registry: Mutex::new(WorkerRegistry::default()),
            terminated: AtomicBool::new(false),
            handle,
            config,
        }
    }

    #[inline]
    pub(crate) fn keep_alive_ns(&self) -> u64 {
        self.keep_alive_ns
    }

    #[inline]
    pub(crate) fn steal_resolution_ns(&self) -> u64 {
        self.steal_resolution_ns
    }

    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn created_workers(&self) -> usize {
        created_workers_in(self.control_state.load(Ordering::SeqCst))
    }

    pub(crate) fn blocking_tasks(&self) -> usize {
        blocking_tasks_in(self.control_state.load(Ordering::SeqCst))
    }

    pub(crate) fn available_cpu_permits(&self) -> usize {
        cpu_permits_in(self.control_state.load(Ordering::SeqCst))
    }

    /// Returns the count after the increment.
    fn increment_created_workers(&self) -> usize {
        created_workers_in(self.control_state.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Returns the count before the decrement.
    fn decrement_created_workers(&self) -> usize {
        created_workers_in(self.control_state.fetch_sub(1, Ordering::SeqCst))
    }

    /// Returns the whole control word after the increment, for the
    /// caller's create-worker decision.
    fn increment_blocking_tasks(&self) -> u64 {
        self.control_state
            .fetch_add(1 << BLOCKING_SHIFT, Ordering::SeqCst)
            + (1 << BLOCKING_SHIFT)
    }

    pub(crate) fn decrement_blocking_tasks(&self) {
        self.control_state
            .fetch_sub(1 << BLOCKING_SHIFT, Ordering::SeqCst);
    }

    pub(crate) fn try_acquire_cpu_permit(&self) -> bool {
        loop {
            let state = self.control_state.load(Ordering::SeqCst);
            if cpu_permits_in(state) == 0 {
                return false;
            }
            if self
                .control_state
                .compare_exchange(
                    state,
                    state - (1 << CPU_PERMITS_SHIFT),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn release_cpu_permit(&self) {
        self.control_state
            .fetch_add(1 << CPU_PERMITS_SHIFT, Ordering::SeqCst);
    }

    /// Dereferences the worker slot at `index`. The reference stays valid
    /// for the pool's lifetime because the registry retains every worker.
    pub(crate) fn worker_at(&self, index: usize) -> Option<&Worker> {
        let slot = self.workers.get(index)?;
        let ptr = slot.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// Pushes a worker onto the parked stack. Returns false if the worker
    /// is already linked.
    pub(crate) fn parked_workers_stack_push(&self, worker: &Worker) -> bool {
        if worker.next_parked.load(Ordering::SeqCst) != worker::NOT_IN_STACK {
            return false;
        }
        loop {
            let top = self.parked_workers_stack.load(Ordering::SeqCst);
            let index = worker.index_in_array.load(Ordering::SeqCst);
            debug_assert_ne!(index, 0, "a terminated worker must not park");
            let next = (top & PARKED_INDEX_MASK) as usize;
            let updated =
                (top.wrapping_add(PARKED_VERSION_INC) & PARKED_VERSION_MASK) | index as u64;
            worker.next_parked.store(next, Ordering::SeqCst);
            if self
                .parked_workers_stack
                .compare_exchange(top, updated, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Pops the most recently parked worker, unlinking it.
    pub(crate) fn parked_workers_stack_pop(&self) -> Option<&Worker> {
        loop {
            let top = self.parked_workers_stack.load(Ordering::SeqCst);
            let index = (top & PARKED_INDEX_MASK) as usize;
            if index == 0 {
                return None;
            }
            let worker = self.worker_at(index)?;
            let Some(next) = self.parked_workers_stack_next_index(worker) else {
                // The link was concurrently severed; re-read the top.
                continue;
            };
            let updated = (top.wrapping_add(PARKED_VERSION_INC) & PARKED_VERSION_MASK) | next;
            if self
                .parked_workers_stack
                .compare_exchange(top, updated, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                worker.next_parked.store(worker::NOT_IN_STACK, Ordering::SeqCst);
                return Some(worker);
            }
        }
    }

    /// Resolves the index that should replace `worker` at the stack top.
    ///
    /// `None` means the chain is being mutated concurrently and the caller
    /// must restart from a fresh top. The resolution follows links through
    /// terminated workers (index 0) to whatever live, still-linked worker
    /// comes next; if a link leads to a slot whose occupant is not linked
    /// into the stack, the slot was recycled and the rest of the chain is
    /// unreachable, so the chain truncates to empty. Any interleaving that
    /// would make the truncation wrong also bumped the version, failing
    /// the caller's CAS.
    fn parked_workers_stack_next_index(&self, worker: &Worker) -> Option<u64> {
        let mut next = worker.next_parked.load(Ordering::SeqCst);
        loop {
            if next == worker::NOT_IN_STACK {
                return None;
            }
            if next == 0 {
                return Some(0);
            }
            let Some(next_worker) = self.worker_at(next) else {
                return Some(0);
            };
            let index = next_worker.index_in_array.load(Ordering::SeqCst);
            if index != 0 {
                if next_worker.next_parked.load(Ordering::SeqCst) == worker::NOT_IN_STACK {
                    return Some(0);
                }
                return Some(index as u64);
            }
            // Terminated worker still linked in the chain: skip over it.
            next = next_worker.next_parked.load(Ordering::SeqCst);
        }
    }

    /// Rewrites any stack-top reference to `old_index` during index
    /// compaction. Always bumps the version so in-flight pops fail their
    /// CAS and re-read.
    fn parked_workers_stack_top_update(&self, worker: &Worker, old_index: usize, new_index: usize) {
        loop {
            let top = self.parked_workers_stack.load(Ordering::SeqCst);
            let index = (top & PARKED_INDEX_MASK) as usize;
            let version = top.wrapping_add(PARKED_VERSION_INC) & PARKED_VERSION_MASK;
            let updated_index = if index == old_index {
                if new_index == 0 {
                    match self.parked_workers_stack_next_index(worker) {
                        Some(next) => next,
                        None => continue,
                    }
                } else {
                    new_index as u64
                }
            } else {
                index as u64
            };
            if self
                .parked_workers_stack
                .compare_exchange(top, version | updated_index, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Wakes one parked worker. Returns false when the stack is drained
    /// without finding a worker that can still be relied on.
    fn try_unpark(&self) -> bool {
        loop {
            let Some(worker) = self.parked_workers_stack_pop() else {
                return false;
            };
            // A worker napping on a steal-retry deadline wakes up on its
            // own shortly; it does not count as a delivered signal.
            let napping = worker.min_delay_until_stealable.load(Ordering::SeqCst) != 0;
            // Cancel an in-progress park; wake the thread only if it got
            // as far as actually parking.
            worker.parking_allowed.store(false, Ordering::SeqCst);
            if !napping && worker.signalling_allowed.load(Ordering::SeqCst) {
                worker.parker.unpark();
            }
            if !napping && worker.try_forbid_termination() {
                return true;
            }
        }
    }

    pub(crate) fn signal_cpu_work(&self) {
        if self.try_unpark() {
            return;
        }
        if self.available_cpu_permits() == 0 {
            return;
        }
        if self.try_create_worker(self.control_state.load(Ordering::SeqCst)) {
            return;
        }
        // A permit may have been released between the first unpark attempt
        // and the failed creation.
        let _ = self.try_unpark();
    }

    fn signal_blocking_work(&self, skip_unpark: bool) {
        let state = self.increment_blocking_tasks();
        if skip_unpark {
            return;
        }
        if self.try_unpark() {
            return;
        }
        if self.try_create_worker(state) {
            return;
        }
        let _ = self.try_unpark();
    }

    fn try_create_worker(&self, state: u64) -> bool {
        let created = created_workers_in(state);
        let blocking = blocking_tasks_in(state);
        let cpu_workers = created.saturating_sub(blocking);
        if cpu_workers < self.config.core_pool_size {
            let new_cpu_workers = self.create_new_worker();
            // The first worker has nobody to steal from; eagerly create a
            // second one so spinning up the pool is not serialized.
            if new_cpu_workers == Some(1) && self.config.core_pool_size > 1 {
                let _ = self.create_new_worker();
            }
            if new_cpu_workers.is_some() {
                return true;
            }
        }
        false
    }

    /// Registers and starts one worker under the creation lock. Returns
    /// the number of CPU workers after the creation, or `None` if no
    /// worker was created.
    fn create_new_worker(&self) -> Option<usize> {
        let mut registry = self.registry.lock();
        if self.is_terminated() {
            return None;
        }
        // The upgrade only fails while the last external handle is being
        // dropped, and Scheduler::drop shuts the pool down first.
        let Some(pool) = self.handle.upgrade() else {
            return None;
        };
        let state = self.control_state.load(Ordering::SeqCst);
        let created = created_workers_in(state);
        let blocking = blocking_tasks_in(state);
        let cpu_workers = created.saturating_sub(blocking);
        // Double check for overprovision under the lock. A pool with no
        // free CPU permit does not grow either; the next permit release
        // re-signals.
        if cpu_workers >= self.config.core_pool_size {
            return None;
        }
        if created >= self.config.max_pool_size || self.available_cpu_permits() == 0 {
            return None;
        }
        let new_index = created + 1;
        debug_assert!(
            self.workers[new_index].load(Ordering::SeqCst).is_null(),
            "worker slot {new_index} should be free"
        );
        let new_worker = registry.retired.pop().map_or_else(
            || Arc::new(Worker::new(new_index)),
            |recycled| {
                recycled.reset(new_index);
                recycled
            },
        );
        self.workers[new_index].store(
            Arc::as_ptr(&new_worker).cast_mut(),
            Ordering::Release,
        );
        registry.live.push(Arc::clone(&new_worker));
        let incremented = self.increment_created_workers();
        debug_assert_eq!(incremented, new_index, "worker indices must stay contiguous");
        let thread_worker = Arc::clone(&new_worker);
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{new_index}", self.config.name))
            .spawn(move || worker::run(pool, thread_worker))
            .expect("failed to spawn worker thread");
        // Publish the handle while still holding the creation lock, so a
        // shutdown snapshot taken later always sees it.
        *new_worker.join_handle.lock() = Some(handle);
        trace!(index = new_index, "created worker");
        Some(cpu_workers + 1)
    }

    /// Lets an idle worker reclaim itself once its keep-alive expired.
    /// The vacated slot is compacted by moving the last worker into it,
    /// keeping live indices contiguous.
    ///
    /// Returns true when the worker was reclaimed. Its allocation moves to
    /// the retired list for reuse, so after a true return the calling
    /// thread must stop touching the worker object.
    pub(crate) fn try_terminate_worker(&self, worker: &Worker) -> bool {
        let mut registry = self.registry.lock();
        if self.is_terminated() {
            return false;
        }
        if self.created_workers() <= self.config.core_pool_size {
            return false;
        }
        // A worker with pending global blocking work must stay.
        if !worker.blocking_quiescence(&self.global) {
            return false;
        }
        if !worker.try_claim_termination() {
            return false;
        }
        let old_index = worker.index_in_array.load(Ordering::SeqCst);
        worker.index_in_array.store(0, Ordering::SeqCst);
        self.parked_workers_stack_top_update(worker, old_index, 0);
        let last_index = self.decrement_created_workers();
        debug_assert!(last_index >= 1, "terminating from an empty pool");
        if last_index != old_index {
            let last_ptr = self.workers[last_index].load(Ordering::Acquire);
            debug_assert!(!last_ptr.is_null(), "last worker slot must be occupied");
            self.workers[old_index].store(last_ptr, Ordering::Release);
            let moved = unsafe { &*last_ptr };
            moved.index_in_array.store(old_index, Ordering::SeqCst);
            self.parked_workers_stack_top_update(moved, last_index, old_index);
        }
        self.workers[last_index].store(ptr::null_mut(), Ordering::Release);
        worker.set_state(WorkerState::Terminated);
        let position = registry
            .live
            .iter()
            .position(|live| ptr::eq(Arc::as_ptr(live), ptr::from_ref(worker)));
        debug_assert!(position.is_some(), "terminating an unregistered worker");
        if let Some(position) = position {
            let retired = registry.live.swap_remove(position);
            registry.retired.push(retired);
        }
        trace!("idle worker reclaimed");
        true
    }

    /// Offers a task to the calling thread's own queue. Returns the task
    /// back when the caller is not a live worker of this pool, or the task
    /// is not eligible for its current state, or the queue is full.
    fn submit_to_local_queue(&self, task: Box<Task>, fair: bool) -> Option<Box<Task>> {
        let Some(current) = worker::current_worker(self) else {
            return Some(task);
        };
        let state = current.state();
        if state == WorkerState::Terminated {
            return Some(task);
        }
        // A blocking worker holds no CPU permit, so CPU-bound work queued
        // behind it could stall arbitrarily long.
        if task.mode() == TaskMode::NonBlocking && state == WorkerState::Blocking {
            return Some(task);
        }
        if fair {
            current.local_queue.add_last(task)
        } else {
            current.local_queue.add(task)
        }
    }
}

/// Work-stealing thread pool with separate accounting for CPU-bound and
/// probably-blocking tasks.
///
/// At most `core_pool_size` workers run CPU-bound work concurrently;
/// blocking tasks release their CPU permit up front and extra workers, up
/// to `max_pool_size`, compensate for them. Idle workers beyond the core
/// retire after a keep-alive period.
pub struct Scheduler {
    inner: Arc<Pool>,
}

impl Scheduler {
    /// Creates a pool. No threads are started until the first dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is inconsistent.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new_cyclic(|handle| Pool::new(config, handle.clone())),
        })
    }

    /// Dispatches a closure for execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool has been shut down.
    pub fn dispatch<F>(&self, mode: TaskMode, payload: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch_task(Box::new(Task::new(mode, payload)), false)
    }

    /// Dispatches a prepared task. With `fair` set, the task goes to the
    /// back of the queue instead of the front, and a dispatch from a
    /// worker thread does not wake another worker for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool has been shut down.
    pub fn dispatch_task(&self, mut task: Box<Task>, fair: bool) -> Result<(), DispatchError> {
        task.restamp();
        let mode = task.mode();
        let skip_unpark = fair && worker::current_worker(&self.inner).is_some();
        if let Some(task) = self.inner.submit_to_local_queue(task, fair) {
            if self.inner.global.add_last(task).is_err() {
                debug!(scheduler = %self.inner.config.name, "dispatch after shutdown rejected");
                return Err(DispatchError::Terminated {
                    name: self.inner.config.name.clone(),
                });
            }
        }
        match mode {
            TaskMode::NonBlocking => {
                if !skip_unpark {
                    self.inner.signal_cpu_work();
                }
            }
            TaskMode::ProbablyBlocking => self.inner.signal_blocking_work(skip_unpark),
        }
        Ok(())
    }

    /// Stops the pool and runs every task already submitted, inline on the
    /// calling thread if need be. Waits up to `timeout_per_worker` for
    /// each worker thread to stop. Idempotent; concurrent and repeated
    /// calls return immediately.
    #[allow(clippy::too_many_lines)]
    pub fn shutdown(&self, timeout_per_worker: Duration) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(scheduler = %self.inner.config.name, "shutting down");
        let current = worker::current_worker(&self.inner);
        // Serializes against in-flight creation and termination; after the
        // terminated flag both bail out, so indices are stable from here.
        let created = {
            let _registry = self.inner.registry.lock();
            self.inner.created_workers()
        };
        let mut all_joined = true;
        let mut pending: SmallVec<[&Worker; 8]> = SmallVec::new();
        for index in 1..=created {
            let Some(target) = self.inner.worker_at(index) else {
                continue;
            };
            if let Some(current) = &current {
                if ptr::eq::<Worker>(&**current, target) {
                    continue;
                }
            }
            pending.push(target);
        }
        for target in pending {
            let handle = target.join_handle.lock().take();
            if let Some(handle) = handle {
                let deadline = Instant::now() + timeout_per_worker;
                while !handle.is_finished() && Instant::now() < deadline {
                    target.parker.unpark();
                    thread::sleep(Duration::from_millis(1));
                }
                if handle.is_finished() {
                    if handle.join().is_err() {
                        error!("worker thread panicked during shutdown");
                    }
                    debug_assert_eq!(target.state(), WorkerState::Terminated);
                } else {
                    all_joined = false;
                    debug!("worker did not stop within the shutdown timeout");
                }
            }
            // Anything still queued locally is handed back for the inline
            // drain below.
            target.local_queue.offload_all_work_to(&self.inner.global);
        }
        self.inner.global.close();
        loop {
            let task = current
                .as_ref()
                .and_then(|current| current.local_queue.poll())
                .or_else(|| self.inner.global.remove_first());
            match task {
                Some(task) => worker::run_safely(task),
                // A dispatcher racing the close may still be between its
                // reservation and its push; its task counts as accepted,
                // so wait for the pending count to settle.
                None if self.inner.global.len() == 0 => break,
                None => thread::yield_now(),
            }
        }
        if let Some(current) = &current {
            current.try_release_cpu(&self.inner, WorkerState::Terminated);
        }
        if all_joined {
            debug_assert!(
                self.inner.global.is_empty(),
                "the inline drain must empty the global queue"
            );
            debug_assert_eq!(
                self.inner.available_cpu_permits(),
                self.inner.config.core_pool_size,
                "all CPU permits must be returned after shutdown"
            );
        }
        self.inner.parked_workers_stack.store(0, Ordering::SeqCst);
        self.inner.control_state.store(0, Ordering::SeqCst);
    }

    /// Number of worker threads ever started and not yet reclaimed.
    #[must_use]
    pub fn created_workers(&self) -> usize {
        self.inner.created_workers()
    }

    /// Number of probably-blocking tasks currently submitted or running.
    #[must_use]
    pub fn blocking_tasks(&self) -> usize {
        self.inner.blocking_tasks()
    }

    /// CPU permits not currently held by a worker.
    #[must_use]
    pub fn available_cpu_permits(&self) -> usize {
        self.inner.available_cpu_permits()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown(DROP_SHUTDOWN_TIMEOUT);
    }
}

impl fmt::Display for Scheduler {
    /// One-line utilization snapshot, racy by nature and meant for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = &self.inner;
        let mut parked = 0;
        let mut blocking = 0;
        let mut cpu_acquired = 0;
        let mut retiring = 0;
        let mut terminated = 0;
        let mut queue_sizes: SmallVec<[String; 8]> = SmallVec::new();
        for index in 1..pool.workers.len() {
            let Some(target) = pool.worker_at(index) else {
                continue;
            };
            let queued = target.local_queue.size();
            match target.state() {
                WorkerState::Parking => parked += 1,
                WorkerState::Blocking => {
                    blocking += 1;
                    queue_sizes.push(format!("{queued}b"));
                }
                WorkerState::CpuAcquired => {
                    cpu_acquired += 1;
                    queue_sizes.push(format!("{queued}c"));
                }
                WorkerState::Retiring => {
                    retiring += 1;
                    if queued > 0 {
                        queue_sizes.push(format!("{queued}r"));
                    }
                }
                WorkerState::Terminated => terminated += 1,
            }
        }
        let state = pool.control_state.load(Ordering::SeqCst);
        write!(
            f,
            "{}@{:p}[Pool Size {{core = {}, max = {}}}, \
             Worker States {{CPU = {cpu_acquired}, blocking = {blocking}, parked = {parked}, \
             retiring = {retiring}, terminated = {terminated}}}, \
             running workers queues = {:?}, global queue size = {}, \
             Control State {{created = {}, blocking = {}, cpu permits = {}}}]",
            pool.config.name,
            Arc::as_ptr(&self.inner),
            pool.config.core_pool_size,
            pool.config.max_pool_size,
            queue_sizes,
            pool.global.len(),
            created_workers_in(state),
            blocking_tasks_in(state),
            cpu_permits_in(state),
        )
    }
}

#[cfg(test)]
impl Pool {
    /// Registers a worker slot without spawning a thread, for tests that
    /// exercise the parked stack and index compaction directly.
    fn register_test_worker(&self) -> Arc<Worker> {
        let mut registry = self.registry.lock();
        let new_index = self.created_workers() + 1;
        let new_worker = Arc::new(Worker::new(new_index));
        self.workers[new_index].store(Arc::as_ptr(&new_worker).cast_mut(), Ordering::Release);
        registry.live.push(Arc::clone(&new_worker));
        let incremented = self.increment_created_workers();
        assert_eq!(incremented, new_index);
        new_worker
    }

    /// Total worker allocations the pool retains, live and retired.
    fn worker_allocations(&self) -> usize {
        let registry = self.registry.lock();
        registry.live.len() + registry.retired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(core: usize, max: usize) -> Arc<Pool> {
        let config = PoolConfig::new(core, max);
        assert!(config.validate().is_ok());
        Arc::new_cyclic(|handle| Pool::new(config, handle.clone()))
    }

    #[test]
    fn control_word_counts_workers_blocking_and_permits() {
        let pool = test_pool(4, 8);
        assert_eq!(pool.available_cpu_permits(), 4);
        assert_eq!(pool.created_workers(), 0);
        assert_eq!(pool.blocking_tasks(), 0);

        assert_eq!(pool.increment_created_workers(), 1);
        assert_eq!(pool.increment_created_workers(), 2);
        let state = pool.increment_blocking_tasks();
        assert_eq!(blocking_tasks_in(state), 1);
        assert_eq!(created_workers_in(state), 2);

        assert!(pool.try_acquire_cpu_permit());
        assert_eq!(pool.available_cpu_permits(), 3);
        // The other counters are unaffected by permit traffic.
        assert_eq!(pool.created_workers(), 2);
        assert_eq!(pool.blocking_tasks(), 1);

        pool.release_cpu_permit();
        assert_eq!(pool.available_cpu_permits(), 4);
        pool.decrement_blocking_tasks();
        assert_eq!(pool.blocking_tasks(), 0);
        assert_eq!(pool.decrement_created_workers(), 2);
    }

    #[test]
    fn cpu_permits_exhaust() {
        let pool = test_pool(2, 4);
        assert!(pool.try_acquire_cpu_permit());
        assert!(pool.try_acquire_cpu_permit());
        assert!(!pool.try_acquire_cpu_permit(), "only core-many permits exist");
        pool.release_cpu_permit();
        assert!(pool.try_acquire_cpu_permit());
    }

    #[test]
    fn parked_stack_is_lifo() {
        let pool = test_pool(5, 8);
        let workers: Vec<_> = (0..5).map(|_| pool.register_test_worker()).collect();
        for target in &workers {
            assert!(pool.parked_workers_stack_push(target));
        }
        for expected in (1..=5).rev() {
            let popped = pool
                .parked_workers_stack_pop()
                .unwrap_or_else(|| panic!("worker {expected} should be on the stack"));
            assert_eq!(popped.index_in_array.load(Ordering::SeqCst), expected);
            assert_eq!(
                popped.next_parked.load(Ordering::SeqCst),
                worker::NOT_IN_STACK,
                "popped worker must be unlinked"
            );
        }
        assert!(pool.parked_workers_stack_pop().is_none(), "stack is empty");
    }

    #[test]
    fn double_push_is_rejected() {
        let pool = test_pool(1, 4);
        let target = pool.register_test_worker();
        assert!(pool.parked_workers_stack_push(&target));
        assert!(
            !pool.parked_workers_stack_push(&target),
            "a linked worker must not be pushed twice"
        );
        assert!(pool.parked_workers_stack_pop().is_some());
        assert!(pool.parked_workers_stack_push(&target), "pushable again after pop");
    }

    #[test]
    fn termination_compacts_worker_indices() {
        let pool = test_pool(1, 4);
        let w1 = pool.register_test_worker();
        let w2 = pool.register_test_worker();
        let w3 = pool.register_test_worker();
        assert_eq!(pool.created_workers(), 3);

        w2.allow_termination();
        assert!(pool.try_terminate_worker(&w2));

        assert_eq!(pool.created_workers(), 2);
        assert_eq!(w2.index_in_array.load(Ordering::SeqCst), 0);
        assert_eq!(w2.state(), WorkerState::Terminated);
        // The last worker moved into the vacated slot.
        assert_eq!(w3.index_in_array.load(Ordering::SeqCst), 2);
        let slot2 = pool.worker_at(2).map(|w| w as *const Worker);
        assert_eq!(slot2, Some(Arc::as_ptr(&w3)));
        assert!(pool.worker_at(3).is_none(), "vacated last slot is cleared");
        assert_eq!(w1.index_in_array.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn termination_refused_at_core_size() {
        let pool = test_pool(2, 4);
        let w1 = pool.register_test_worker();
        let w2 = pool.register_test_worker();
        w1.allow_termination();
        assert!(!pool.try_terminate_worker(&w1));
        assert_eq!(pool.created_workers(), 2, "core workers are never reclaimed");
        assert_ne!(w1.state(), WorkerState::Terminated);
        let _ = w2;
    }

    #[test]
    fn napping_worker_is_not_claimed_by_unpark() {
        let pool = test_pool(1, 4);
        let napping = pool.register_test_worker();
        napping.allow_termination();
        napping.parking_allowed.store(true, Ordering::SeqCst);
        napping.signalling_allowed.store(true, Ordering::SeqCst);
        napping
            .min_delay_until_stealable
            .store(1_000, Ordering::SeqCst);
        assert!(pool.parked_workers_stack_push(&napping));

        assert!(
            !pool.try_unpark(),
            "a worker waiting out a steal-retry delay is no wakeup target"
        );
        assert!(pool.parked_workers_stack_pop().is_none(), "still popped off the stack");
        assert!(
            napping.try_claim_termination(),
            "the skipped worker keeps the right to reclaim itself"
        );

        let parked = pool.register_test_worker();
        parked.allow_termination();
        parked.parking_allowed.store(true, Ordering::SeqCst);
        assert!(pool.parked_workers_stack_push(&parked));
        assert!(pool.try_unpark(), "a plainly parked worker is claimed");
        assert!(
            !parked.try_claim_termination(),
            "the claimed worker must stay alive for the signal"
        );
    }

    #[test]
    fn worker_churn_reuses_retired_allocations() {
        let mut config = PoolConfig::new(1, 4);
        config.idle_worker_keep_alive = Duration::from_millis(10);
        let scheduler = Scheduler::new(config).unwrap();
        for _ in 0..3 {
            let gate = Arc::new(std::sync::Barrier::new(3));
            for _ in 0..3 {
                let gate = Arc::clone(&gate);
                scheduler
                    .dispatch(TaskMode::ProbablyBlocking, move || {
                        gate.wait();
                    })
                    .unwrap();
            }
            let deadline = Instant::now() + Duration::from_secs(30);
            while scheduler.created_workers() > 1 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(scheduler.created_workers(), 1, "surplus workers should retire");
        }
        let allocations = scheduler.inner.worker_allocations();
        assert!(
            allocations <= 4,
            "repeated churn must reuse retired workers, retained {allocations}"
        );
        scheduler.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn termination_of_stack_top_keeps_stack_usable() {
        let pool = test_pool(1, 4);
        let w1 = pool.register_test_worker();
        let w2 = pool.register_test_worker();
        assert!(pool.parked_workers_stack_push(&w1));
        assert!(pool.parked_workers_stack_push(&w2));

        w2.allow_termination();
        assert!(pool.try_terminate_worker(&w2));

        let popped = pool.parked_workers_stack_pop();
        assert_eq!(
            popped.map(|w| w.index_in_array.load(Ordering::SeqCst)),
            Some(1),
            "the surviving worker should still be poppable"
        );
        assert!(pool.parked_workers_stack_pop().is_none());
    }
}
