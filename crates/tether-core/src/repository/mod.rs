//! Repository trait definitions (ports).
//!
//! The infrastructure layer (tether-infra) implements these with SQLite.
//! `memory` provides DashMap-backed implementations used by tests and by
//! deployments that do not need durability.

pub mod execution;
pub mod memory;
pub mod subscription;

pub use execution::ExecutionRepository;
pub use memory::{InMemoryExecutionRepository, InMemorySubscriptionRepository};
pub use subscription::SubscriptionRepository;
