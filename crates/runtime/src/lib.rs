//! Runtime primitives shared by the shepherd primary and workers.
//!
//! * [`TaskClass`] and [`spawn`]: classified task spawning for observability
//! * [`GenerationClock`]: monotonic ids for worker slots
//! * [`Throttle`]: leading + trailing edge rate limiting for broadcasts
//! * [`panic_message`]: readable panic payloads for fault-isolation boundaries

mod class;
mod clock;
mod panic;
mod spawn;
pub mod throttle;

pub use class::TaskClass;
pub use clock::GenerationClock;
pub use panic::{join_error_panic_message, panic_message};
pub use spawn::spawn;
pub use throttle::Throttle;
