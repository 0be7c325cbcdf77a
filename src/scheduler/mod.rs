//! The work-stealing scheduler: pool coordination, the global overflow
//! queue, per-worker local queues, and the worker threads themselves.

pub(crate) mod global_queue;
pub(crate) mod pool;
pub(crate) mod work_queue;
pub(crate) mod worker;

pub use pool::Scheduler;
pub use work_queue::Steal;
