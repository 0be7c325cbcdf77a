//! Process-monotonic nanosecond clock.
//!
//! Task submission timestamps and steal staleness checks need a cheap
//! monotonic time source shared by every thread in the process. All values
//! are nanoseconds elapsed since the first call, so differences between any
//! two readings are meaningful regardless of which thread took them.

use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Returns monotonic nanoseconds since the process clock anchor.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn nanotime() -> u64 {
    // u64 nanoseconds overflow after ~584 years of uptime.
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
