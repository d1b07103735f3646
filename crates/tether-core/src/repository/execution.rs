//! Execution repository trait.
//!
//! The three mutating transitions (`try_claim`, `try_cancel`,
//! `record_emission`) are compare-and-set operations: implementations must
//! make the check and the write a single atomic step so that concurrent
//! callers observe exactly one winner.

use tether_types::error::RepositoryError;
use tether_types::execution::{ClaimOutcome, Execution, ResolutionOutcome};
use uuid::Uuid;

/// Storage for suspended step executions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    /// Insert a new execution record.
    fn create(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Replace the step-owned metadata document. Reserved fields are untouched.
    fn update_metadata(
        &self,
        id: &Uuid,
        metadata: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Atomic transitions
    // -----------------------------------------------------------------------

    /// Suspended -> Resolved, recording `outcome`. Only the first caller wins.
    fn try_claim(
        &self,
        id: &Uuid,
        outcome: &ResolutionOutcome,
    ) -> impl std::future::Future<Output = Result<ClaimOutcome, RepositoryError>> + Send;

    /// Suspended -> Cancelled. Only the first caller wins.
    fn try_cancel(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<ClaimOutcome, RepositoryError>> + Send;

    /// Record the emitted channel. Returns `false` if one was already recorded.
    fn record_emission(
        &self,
        id: &Uuid,
        channel: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// The suspended execution of `node_id` waiting on `correlation_key`.
    fn find_suspended_by_correlation(
        &self,
        node_id: &str,
        correlation_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// The most recent execution of `node_id` carrying `correlation_key`,
    /// in any state. Distinguishes redeliveries from unknown keys.
    fn find_latest_by_correlation(
        &self,
        node_id: &str,
        correlation_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// All suspended executions (timer recovery).
    fn list_suspended(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Delete an execution. Returns `true` if it existed.
    fn delete(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
