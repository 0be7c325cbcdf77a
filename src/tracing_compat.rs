//! Thin indirection over the `tracing` macros.
//!
//! Scheduler modules import log macros from here rather than from `tracing`
//! directly, keeping the crate's logging surface swappable in one place.

pub(crate) use tracing::{debug, error, trace};
