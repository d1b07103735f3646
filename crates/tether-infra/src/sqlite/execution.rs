//! SQLite execution repository implementation.
//!
//! The step-owned metadata document and the resolution columns live side by
//! side in the `executions` table. Each terminal transition is a single
//! conditional `UPDATE ... WHERE state = 'suspended'`; `rows_affected` tells
//! the caller whether it won.

use chrono::Utc;
use sqlx::Row;
use tether_core::repository::execution::ExecutionRepository;
use tether_types::error::RepositoryError;
use tether_types::execution::{
    ClaimOutcome, Execution, ExecutionState, PendingTimer, ResolutionOutcome,
};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{
    format_datetime, from_json, is_unique_violation, parse_datetime, parse_uuid, query_err,
    to_json,
};

const SELECT_COLUMNS: &str = "SELECT id, node_id, step_type, state, metadata, output_channels, \
     correlation_key, pending_timer, outcome, emitted_channel, created_at, updated_at \
     FROM executions";

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Current state of `id`, read through the writer so it observes the
    /// transition that just lost.
    async fn current_state(&self, id: &Uuid) -> Result<Option<ExecutionState>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let state: String = row.try_get("state").map_err(query_err)?;
                state
                    .parse::<ExecutionState>()
                    .map(Some)
                    .map_err(RepositoryError::Query)
            }
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        id: &Uuid,
        to: ExecutionState,
        outcome: Option<&ResolutionOutcome>,
    ) -> Result<ClaimOutcome, RepositoryError> {
        let outcome_json = outcome.map(to_json).transpose()?;

        let result = sqlx::query(
            "UPDATE executions
             SET state = ?, outcome = COALESCE(?, outcome), updated_at = ?
             WHERE id = ? AND state = 'suspended'",
        )
        .bind(to.to_string())
        .bind(&outcome_json)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 1 {
            return Ok(ClaimOutcome::Claimed);
        }
        match self.current_state(id).await? {
            Some(state) => Ok(ClaimOutcome::AlreadyTerminal(state)),
            None => Err(RepositoryError::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    node_id: String,
    step_type: String,
    state: String,
    metadata: String,
    output_channels: String,
    correlation_key: Option<String>,
    pending_timer: Option<String>,
    outcome: Option<String>,
    emitted_channel: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            step_type: row.try_get("step_type")?,
            state: row.try_get("state")?,
            metadata: row.try_get("metadata")?,
            output_channels: row.try_get("output_channels")?,
            correlation_key: row.try_get("correlation_key")?,
            pending_timer: row.try_get("pending_timer")?,
            outcome: row.try_get("outcome")?,
            emitted_channel: row.try_get("emitted_channel")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let state = self
            .state
            .parse::<ExecutionState>()
            .map_err(RepositoryError::Query)?;

        let pending_timer: Option<PendingTimer> = self
            .pending_timer
            .as_deref()
            .map(|s| from_json("pending_timer", s))
            .transpose()?;

        let outcome: Option<ResolutionOutcome> = self
            .outcome
            .as_deref()
            .map(|s| from_json("outcome", s))
            .transpose()?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            node_id: self.node_id,
            step_type: self.step_type,
            state,
            metadata: from_json("metadata", &self.metadata)?,
            output_channels: from_json("output_channels", &self.output_channels)?,
            correlation_key: self.correlation_key,
            pending_timer,
            outcome,
            emitted_channel: self.emitted_channel,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<Execution, RepositoryError> {
    ExecutionRow::from_row(row)
        .map_err(query_err)?
        .into_execution()
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let pending_timer = execution.pending_timer.as_ref().map(to_json).transpose()?;
        let outcome = execution.outcome.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO executions
               (id, node_id, step_type, state, metadata, output_channels, correlation_key,
                pending_timer, outcome, emitted_channel, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.node_id)
        .bind(&execution.step_type)
        .bind(execution.state.to_string())
        .bind(to_json(&execution.metadata)?)
        .bind(to_json(&execution.output_channels)?)
        .bind(&execution.correlation_key)
        .bind(&pending_timer)
        .bind(&outcome)
        .bind(&execution.emitted_channel)
        .bind(format_datetime(&execution.created_at))
        .bind(format_datetime(&execution.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            ))),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(decode).transpose()
    }

    async fn update_metadata(
        &self,
        id: &Uuid,
        metadata: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE executions SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(metadata)?)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn try_claim(
        &self,
        id: &Uuid,
        outcome: &ResolutionOutcome,
    ) -> Result<ClaimOutcome, RepositoryError> {
        self.transition(id, ExecutionState::Resolved, Some(outcome))
            .await
    }

    async fn try_cancel(&self, id: &Uuid) -> Result<ClaimOutcome, RepositoryError> {
        self.transition(id, ExecutionState::Cancelled, None).await
    }

    async fn record_emission(&self, id: &Uuid, channel: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE executions SET emitted_channel = ?, updated_at = ?
             WHERE id = ? AND emitted_channel IS NULL",
        )
        .bind(channel)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.current_state(id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_suspended_by_correlation(
        &self,
        node_id: &str,
        correlation_key: &str,
    ) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE node_id = ? AND correlation_key = ? AND state = 'suspended' \
             ORDER BY id ASC LIMIT 1"
        ))
        .bind(node_id)
        .bind(correlation_key)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.as_ref().map(decode).transpose()
    }

    async fn find_latest_by_correlation(
        &self,
        node_id: &str,
        correlation_key: &str,
    ) -> Result<Option<Execution>, RepositoryError> {
        // UUIDv7 ids sort by creation time.
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE node_id = ? AND correlation_key = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(node_id)
        .bind(correlation_key)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.as_ref().map(decode).transpose()
    }

    async fn list_suspended(&self) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE state = 'suspended' ORDER BY id ASC"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(decode).collect()
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }
}
