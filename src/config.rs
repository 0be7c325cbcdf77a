//! Pool configuration and tuning defaults.

use crate::error::ConfigError;
use std::time::Duration;

/// Maximum number of threads the packed control word can count.
///
/// Each counter field in the control word is 21 bits wide; the top index 0
/// is a sentinel and one slot is reserved so termination reindexing never
/// produces an ambiguous value.
pub const MAX_SUPPORTED_POOL_SIZE: usize = (1 << 21) - 2;

/// Default idle keep-alive before a surplus worker retires itself.
pub const DEFAULT_IDLE_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Default staleness threshold below which the most recently scheduled task
/// of a worker cannot be stolen, preserving producer/consumer affinity.
pub const DEFAULT_STEAL_TIME_RESOLUTION: Duration = Duration::from_micros(100);

/// Construction parameters for a [`crate::Scheduler`].
///
/// The two time tunables are scheduling heuristics, not load-bearing
/// constants: the defaults match long-standing production values, and tests
/// shrink them to make timing-dependent behavior observable.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of threads reserved for non-blocking (CPU-bound) work.
    pub core_pool_size: usize,
    /// Hard cap on total threads, blocking compensation included.
    pub max_pool_size: usize,
    /// How long an idle worker lingers before terminating itself.
    pub idle_worker_keep_alive: Duration,
    /// Minimum age before a worker's last-scheduled task becomes stealable.
    pub steal_time_resolution: Duration,
    /// Pool name used in thread names and diagnostics.
    pub name: String,
}

impl PoolConfig {
    /// Creates a config with the given sizes and default tunables.
    #[must_use]
    pub fn new(core_pool_size: usize, max_pool_size: usize) -> Self {
        Self {
            core_pool_size,
            max_pool_size,
            ..Self::default()
        }
    }

    /// Validates the configuration against the pool's structural limits.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first violated bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_pool_size < 1 {
            return Err(ConfigError::CoreSizeTooSmall(self.core_pool_size));
        }
        if self.max_pool_size < self.core_pool_size {
            return Err(ConfigError::MaxSmallerThanCore {
                max: self.max_pool_size,
                core: self.core_pool_size,
            });
        }
        if self.max_pool_size > MAX_SUPPORTED_POOL_SIZE {
            return Err(ConfigError::MaxTooLarge(
                self.max_pool_size,
                MAX_SUPPORTED_POOL_SIZE,
            ));
        }
        if self.idle_worker_keep_alive.is_zero() {
            return Err(ConfigError::KeepAliveZero);
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(2, usize::from);
        Self {
            core_pool_size: parallelism,
            max_pool_size: MAX_SUPPORTED_POOL_SIZE.min(parallelism * 128),
            idle_worker_keep_alive: DEFAULT_IDLE_KEEP_ALIVE,
            steal_time_resolution: DEFAULT_STEAL_TIME_RESOLUTION,
            name: "corepool".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_core_size() {
        let config = PoolConfig::new(0, 4);
        assert_eq!(config.validate(), Err(ConfigError::CoreSizeTooSmall(0)));
    }

    #[test]
    fn rejects_max_below_core() {
        let config = PoolConfig::new(4, 2);
        assert_eq!(
            config.validate(),
            Err(ConfigError::MaxSmallerThanCore { max: 2, core: 4 })
        );
    }

    #[test]
    fn rejects_oversized_max() {
        let config = PoolConfig::new(1, MAX_SUPPORTED_POOL_SIZE + 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MaxTooLarge(..))
        ));
    }

    #[test]
    fn rejects_zero_keep_alive() {
        let mut config = PoolConfig::new(1, 2);
        config.idle_worker_keep_alive = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::KeepAliveZero));
    }
}
