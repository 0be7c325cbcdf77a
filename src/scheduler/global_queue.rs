//! Mode-aware global injection queue.
//!
//! Thread-safe injection point for tasks submitted from outside the worker
//! threads and for local-queue overflow. Tasks are routed to a lane per
//! [`TaskMode`] so that permit-less workers can dequeue blocking work
//! without contending for CPU-bound tasks they are not entitled to run.
//!
//! Each lane is FIFO; no ordering is guaranteed across lanes. The queue is
//! closable: closing happens as the very last step of pool shutdown, after
//! which further submissions are rejected.

use crate::task::{Task, TaskMode};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Unbounded, closable multi-producer/multi-consumer task queue.
#[derive(Debug, Default)]
pub struct GlobalQueue {
    /// CPU lane: non-blocking tasks.
    cpu_queue: SegQueue<Box<Task>>,
    /// Blocking lane: probably-blocking tasks.
    blocking_queue: SegQueue<Box<Task>>,
    /// Count of pending tasks across both lanes, incremented before the
    /// closed check so that a task accepted concurrently with a close is
    /// visible to the shutdown drain before it is pushed.
    pending_count: AtomicUsize,
    /// Set once by [`GlobalQueue::close`]; never cleared.
    closed: AtomicBool,
}

impl GlobalQueue {
    /// Creates a new empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task to the lane matching its mode.
    ///
    /// # Errors
    ///
    /// Returns the task back if the queue has been closed.
    pub fn add_last(&self, task: Box<Task>) -> Result<(), Box<Task>> {
        // Reserve before checking the closed flag. A close landing between
        // the check and the push still observes a nonzero pending count,
        // and the shutdown drain keeps going until it reaches zero.
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
            return Err(task);
        }
        match task.mode() {
            TaskMode::NonBlocking => self.cpu_queue.push(task),
            TaskMode::ProbablyBlocking => self.blocking_queue.push(task),
        }
        Ok(())
    }

    /// Removes a task from either lane, CPU lane first.
    #[must_use]
    pub fn remove_first(&self) -> Option<Box<Task>> {
        let task = self.cpu_queue.pop().or_else(|| self.blocking_queue.pop());
        if task.is_some() {
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }

    /// Removes a task of the given mode, or `None` if that lane is empty.
    #[must_use]
    pub fn remove_first_with_mode(&self, mode: TaskMode) -> Option<Box<Task>> {
        let task = match mode {
            TaskMode::NonBlocking => self.cpu_queue.pop(),
            TaskMode::ProbablyBlocking => self.blocking_queue.pop(),
        };
        if task.is_some() {
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }

    /// Closes the queue; subsequent [`GlobalQueue::add_last`] calls fail.
    ///
    /// Tasks already enqueued remain dequeueable: shutdown drains the queue
    /// after closing it until [`GlobalQueue::len`] reaches zero, so a
    /// submission racing with the close is either rejected or executed by
    /// the draining thread.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of tasks pending or reserved by an in-flight submission.
    /// Zero after a close means no accepted task remains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending_count.load(Ordering::SeqCst)
    }

    /// Returns true if both lanes are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpu_queue.is_empty() && self.blocking_queue.is_empty()
    }
}
