//! Per-worker bounded work queue.
//!
//! A fixed-capacity ring buffer of task slots plus one privileged
//! "last-scheduled" slot. The queue has exactly one producer (the worker
//! owning it) and any number of consumers (peers trying to steal work).
//!
//! # Fairness
//!
//! The queue provides semi-FIFO order with priority for the most recently
//! submitted task, on the assumption that the current task and the one it
//! just submitted are communicating and sharing state. Submitting
//! `[1, 2, 3, 4]` yields execution order `[4, 1, 2, 3]`: each new submission
//! displaces the previous head to the ring tail rather than dropping it, so
//! the queue never degenerates into a pure stack.
//!
//! # Stealing
//!
//! Ring-buffer tasks are stealable immediately, guarded by a CAS on the
//! consumer index. The last-scheduled slot is time-gated: it can only be
//! stolen once the task's age exceeds the staleness threshold, preserving
//! affinity between tightly-communicating producer/consumer pairs.

use crate::scheduler::global_queue::GlobalQueue;
use crate::task::Task;
use crate::util::clock;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Ring capacity; must be a power of two.
pub(crate) const BUFFER_CAPACITY: usize = 128;
const MASK: u32 = BUFFER_CAPACITY as u32 - 1;

/// Outcome of a steal attempt against a victim queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steal {
    /// A task was moved into the stealing queue.
    Success,
    /// The victim had nothing to steal.
    Empty,
    /// The victim's last-scheduled task is not stale enough yet; retry
    /// after the given number of nanoseconds.
    Retry(u64),
}

/// Single-producer multi-consumer bounded task queue.
///
/// The producer index is incremented only by the owning worker; the consumer
/// index may be advanced by the owner or by any stealing thread via CAS.
/// Reading both indices without synchronization can transiently overestimate
/// the size, which is harmless: steals of fresh work are blocked by the
/// staleness timer anyway.
#[derive(Debug)]
pub struct WorkQueue {
    buffer: Box<[AtomicPtr<Task>; BUFFER_CAPACITY]>,
    last_scheduled: AtomicPtr<Task>,
    producer_index: AtomicU32,
    consumer_index: AtomicU32,
}

// Raw task pointers are only ever owned by exactly one queue slot at a time;
// slot transfers go through swap/CAS.
unsafe impl Send for WorkQueue {}
unsafe impl Sync for WorkQueue {}

impl WorkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Box::new([(); BUFFER_CAPACITY].map(|()| AtomicPtr::new(ptr::null_mut()))),
            last_scheduled: AtomicPtr::new(ptr::null_mut()),
            producer_index: AtomicU32::new(0),
            consumer_index: AtomicU32::new(0),
        }
    }

    /// Number of tasks in the ring buffer (excluding the last-scheduled slot).
    #[inline]
    fn buffer_size(&self) -> u32 {
        self.producer_index
            .load(Ordering::Acquire)
            .wrapping_sub(self.consumer_index.load(Ordering::Acquire))
    }

    /// Total queued tasks, last-scheduled slot included.
    #[must_use]
    pub fn size(&self) -> usize {
        let extra = usize::from(!self.last_scheduled.load(Ordering::Acquire).is_null());
        self.buffer_size() as usize + extra
    }

    /// Adds a task with recency priority.
    ///
    /// The task is swapped into the last-scheduled slot; a task evicted from
    /// that slot is demoted to the ring tail. Returns the task back if the
    /// demotion found the ring full, in which case the caller must route it
    /// to the global queue.
    ///
    /// Invariant: called only by the owning worker.
    pub fn add(&self, task: Box<Task>) -> Option<Box<Task>> {
        let previous = self.last_scheduled.swap(Box::into_raw(task), Ordering::AcqRel);
        if previous.is_null() {
            return None;
        }
        // The swap transferred ownership of the evicted task to us.
        let previous = unsafe { Box::from_raw(previous) };
        self.add_last(previous)
    }

    /// Appends a task to the ring tail.
    ///
    /// Returns the task back (unaccepted) if the ring is full. One slot of
    /// slack is kept so that an add to an empty queue always succeeds.
    ///
    /// Invariant: called only by the owning worker.
    pub fn add_last(&self, task: Box<Task>) -> Option<Box<Task>> {
        if self.buffer_size() == MASK {
            return Some(task);
        }
        let index = (self.producer_index.load(Ordering::Relaxed) & MASK) as usize;
        // A non-null slot here means a slow consumer committed the consumer
        // index but has not yet cleared the slot. Such windows are a few
        // instructions wide; yield instead of giving up the slot.
        while !self.buffer[index].load(Ordering::Acquire).is_null() {
            std::thread::yield_now();
        }
        self.buffer[index].store(Box::into_raw(task), Ordering::Release);
        self.producer_index.fetch_add(1, Ordering::Release);
        None
    }

    /// Retrieves and removes the task at the head of the queue: the
    /// last-scheduled slot if occupied, otherwise the ring head.
    ///
    /// Invariant: called only by the owning worker.
    #[must_use]
    pub fn poll(&self) -> Option<Box<Task>> {
        let last = self.last_scheduled.swap(ptr::null_mut(), Ordering::AcqRel);
        if last.is_null() {
            self.poll_buffer()
        } else {
            Some(unsafe { Box::from_raw(last) })
        }
    }

    /// Tries to steal from `victim` into this queue.
    ///
    /// Invariant: this (the stealing) queue must be empty.
    pub fn try_steal_from(&self, victim: &WorkQueue, resolution_ns: u64) -> Steal {
        debug_assert_eq!(self.buffer_size(), 0, "stealing into a non-empty queue");
        if let Some(task) = victim.poll_buffer() {
            let not_added = self.add(task);
            debug_assert!(not_added.is_none(), "empty queue must accept one task");
            return Steal::Success;
        }
        self.try_steal_last_scheduled(victim, resolution_ns)
    }

    /// Steals the victim's last-scheduled task if it is stale enough.
    ///
    /// Ownership rules force a claim-before-inspect protocol: the pointer
    /// must be CASed out before its timestamp can be read, and a too-fresh
    /// task is CASed back. If the owner published a new last-scheduled task
    /// during that window, the claimed task is kept (stolen) rather than
    /// lost.
    ///
    /// While the claim is held, the slot reads as empty, so the victim's
    /// own poll can transiently miss the task and start parking. The
    /// `Steal::Retry` delay keeps this thief coming back, which bounds how
    /// long the restored task sits unnoticed by the steal resolution
    /// rather than the park keep-alive.
    fn try_steal_last_scheduled(&self, victim: &WorkQueue, resolution_ns: u64) -> Steal {
        loop {
            let last = victim.last_scheduled.load(Ordering::Acquire);
            if last.is_null() {
                return Steal::Empty;
            }
            if victim
                .last_scheduled
                .compare_exchange(last, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Someone else stole it, or the owner executed it and
                // published another one. Retry to avoid missing a task.
                continue;
            }
            let task = unsafe { Box::from_raw(last) };
            let staleness = clock::nanotime().saturating_sub(task.submission_time());
            if staleness < resolution_ns {
                let raw = Box::into_raw(task);
                if victim
                    .last_scheduled
                    .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Steal::Retry(resolution_ns - staleness);
                }
                // Owner replaced the slot while we held the claim; the
                // claimed task has nowhere to go back to, so keep it.
                let task = unsafe { Box::from_raw(raw) };
                let not_added = self.add(task);
                debug_assert!(not_added.is_none(), "empty queue must accept one task");
                return Steal::Success;
            }
            let not_added = self.add(task);
            debug_assert!(not_added.is_none(), "empty queue must accept one task");
            return Steal::Success;
        }
    }

    /// Drains the last-scheduled slot and the whole ring into the global
    /// queue. Used when a worker is forcibly shut down.
    pub fn offload_all_work_to(&self, global: &GlobalQueue) {
        let last = self.last_scheduled.swap(ptr::null_mut(), Ordering::AcqRel);
        if !last.is_null() {
            Self::offload_task(unsafe { Box::from_raw(last) }, global);
        }
        while let Some(task) = self.poll_buffer() {
            Self::offload_task(task, global);
        }
    }

    fn offload_task(task: Box<Task>, global: &GlobalQueue) {
        // The global queue closes only after every worker has been
        // offloaded, so a closed queue here means a broken shutdown
        // sequence. Run the task inline rather than lose it.
        debug_assert!(!global.is_closed(), "global queue closed during offload");
        if let Err(task) = global.add_last(task) {
            task.run();
        }
    }

    /// Removes the task at the ring head.
    ///
    /// Safe to call from any thread; the CAS on the consumer index
    /// guarantees each slot is handed to exactly one caller.
    fn poll_buffer(&self) -> Option<Box<Task>> {
        loop {
            let tail = self.consumer_index.load(Ordering::Acquire);
            if tail == self.producer_index.load(Ordering::Acquire) {
                return None;
            }
            let index = (tail & MASK) as usize;
            if self
                .consumer_index
                .compare_exchange(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The producer stores the slot before publishing the index,
                // so a claimed slot is never observed empty.
                let task = self.buffer[index].swap(ptr::null_mut(), Ordering::AcqRel);
                debug_assert!(!task.is_null(), "claimed ring slot was empty");
                return Some(unsafe { Box::from_raw(task) });
            }
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        let last = self.last_scheduled.swap(ptr::null_mut(), Ordering::AcqRel);
        if !last.is_null() {
            drop(unsafe { Box::from_raw(last) });
        }
        while let Some(task) = self.poll_buffer() {
            drop(task);
        }
    }
}
