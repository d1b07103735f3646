//! Step capability set, registry and built-in generic step types.

pub mod builtin;
pub mod capability;
pub mod registry;

pub use capability::{BoxStepType, StepError, StepType};
pub use registry::{StepRegistry, StepRegistryError};
