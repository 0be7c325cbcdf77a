//! A work-stealing thread pool that distinguishes CPU-bound work from
//! probably-blocking work.
//!
//! The pool keeps at most `core_pool_size` workers busy with CPU-bound
//! tasks, each holding one CPU permit. A task flagged as probably
//! blocking releases its worker's permit before running, and the pool
//! compensates by starting extra workers, up to `max_pool_size`, so CPU
//! throughput is not lost to threads stuck in syscalls. Extra workers
//! retire on their own after an idle keep-alive.
//!
//! Each worker owns a bounded local queue with a recency-biased fast
//! slot; overflow and external submissions go to a global queue split by
//! task mode. Idle workers steal from each other, but only tasks old
//! enough that the owner is clearly not about to run them.
//!
//! ```no_run
//! use corepool::{PoolConfig, Scheduler, TaskMode};
//! use std::time::Duration;
//!
//! let pool = Scheduler::new(PoolConfig::new(4, 16))?;
//! pool.dispatch(TaskMode::NonBlocking, || println!("on a pool thread"))?;
//! pool.dispatch(TaskMode::ProbablyBlocking, || {
//!     std::thread::sleep(Duration::from_millis(100));
//! })?;
//! pool.shutdown(Duration::from_secs(1));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod scheduler;
pub mod task;
mod tracing_compat;
mod util;

pub use config::PoolConfig;
pub use error::{ConfigError, DispatchError};
pub use scheduler::{Scheduler, Steal};
pub use task::{Task, TaskMode};
