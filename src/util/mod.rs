//! Small internal utilities.

pub mod clock;
pub mod rng;

pub use rng::DetRng;
