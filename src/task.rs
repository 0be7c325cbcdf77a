//! Units of work executed by the pool.

use crate::util::clock;
use std::fmt;

/// Execution mode hint attached to every [`Task`].
///
/// Non-blocking tasks require a CPU permit to run and are bounded by the
/// pool's core size; probably-blocking tasks may hold a thread for a long
/// time (I/O, locking) and are compensated with extra threads up to the
/// pool's max size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskMode {
    /// CPU-bound work; runs under a CPU permit.
    NonBlocking,
    /// Hinted as possibly performing blocking operations; runs without a
    /// CPU permit on a compensation thread when needed.
    ProbablyBlocking,
}

/// A unit of work with an execution mode and a submission timestamp.
///
/// The timestamp is rewritten on every (re)dispatch, so a pooled task object
/// handed back to [`crate::Scheduler::dispatch_task`] always carries the time
/// of its latest submission. Ownership of a task moves between queues; it is
/// never duplicated, and [`Task::run`] consumes it.
pub struct Task {
    mode: TaskMode,
    submission_time: u64,
    payload: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    /// Creates a task around a work item, stamped with the current time.
    pub fn new<F>(mode: TaskMode, payload: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            mode,
            submission_time: clock::nanotime(),
            payload: Box::new(payload),
        }
    }

    /// The execution mode hint.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    /// Monotonic nanosecond timestamp of the latest submission.
    #[inline]
    #[must_use]
    pub fn submission_time(&self) -> u64 {
        self.submission_time
    }

    /// Restamps a reused task on redispatch.
    #[inline]
    pub(crate) fn restamp(&mut self) {
        self.submission_time = clock::nanotime();
    }

    /// Rewrites the execution mode of a pooled task before redispatch.
    #[inline]
    pub fn set_mode(&mut self, mode: TaskMode) {
        self.mode = mode;
    }

    /// Runs the payload, consuming the task.
    #[inline]
    pub fn run(self) {
        (self.payload)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("mode", &self.mode)
            .field("submission_time", &self.submission_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_consumes_and_executes_payload() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let task = Task::new(TaskMode::NonBlocking, move || {
            flag.store(true, Ordering::SeqCst);
        });
        task.run();
        assert!(ran.load(Ordering::SeqCst), "payload should have executed");
    }

    #[test]
    fn restamp_advances_submission_time() {
        let mut task = Task::new(TaskMode::NonBlocking, || {});
        let first = task.submission_time();
        std::thread::sleep(std::time::Duration::from_millis(1));
        task.restamp();
        assert!(task.submission_time() > first, "timestamp should advance");
        task.set_mode(TaskMode::ProbablyBlocking);
        assert_eq!(task.mode(), TaskMode::ProbablyBlocking);
    }
}
