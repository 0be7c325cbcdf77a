//! Error types for the pool.
//!
//! Errors are explicit and typed. Rejections (dispatch after shutdown) are
//! surfaced synchronously to the caller; task panics are caught at the
//! worker loop boundary and reported, never propagated; scheduler-internal
//! invariant violations are debug assertions, not error values.

use thiserror::Error;

/// Returned when a task could not be accepted by the pool.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The pool has been shut down and its global queue closed.
    #[error("scheduler {name} was terminated")]
    Terminated {
        /// Pool name, for diagnostics.
        name: String,
    },
}

/// Returned by [`crate::PoolConfig::validate`] for out-of-range parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `core_pool_size` must be at least 1.
    #[error("core pool size {0} should be at least 1")]
    CoreSizeTooSmall(usize),
    /// `max_pool_size` must be >= `core_pool_size`.
    #[error("max pool size {max} should be greater than or equal to core pool size {core}")]
    MaxSmallerThanCore {
        /// Configured maximum.
        max: usize,
        /// Configured core size.
        core: usize,
    },
    /// `max_pool_size` exceeds what the packed control word can count.
    #[error("max pool size {0} should not exceed maximal supported number of threads {1}")]
    MaxTooLarge(usize, usize),
    /// `idle_worker_keep_alive` must be positive.
    #[error("idle worker keep alive time must be positive")]
    KeepAliveZero,
}
