//! Resolution side of the correlation core.
//!
//! - `timer` -- cancellable delayed action calls
//! - `output` -- channel emission with the at-most-once guard
//! - `engine` -- the exactly-once claim shared by every resolution path

pub mod engine;
pub mod output;
pub mod timer;

pub use engine::{Resolution, ResolutionEngine, ResolutionError};
pub use output::{OutputError, OutputRouter};
pub use timer::TimerScheduler;
