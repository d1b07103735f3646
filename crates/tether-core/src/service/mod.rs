//! Application-facing facade over the correlation core.

pub mod correlation;

pub use correlation::{CorrelationService, ServiceError, ServiceSettings};
