//! Output channel emission.
//!
//! The single place a terminal payload leaves the correlation core. An
//! emission must name a channel the execution declared, and an execution
//! emits at most once: the repository records the first channel and
//! refuses any later one.

use std::sync::Arc;

use serde_json::Value;
use tether_types::error::RepositoryError;
use tether_types::event::CorrelationEvent;
use tether_types::execution::Execution;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::ExecutionRepository;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("execution {execution_id} does not declare output channel '{channel}'")]
    UndeclaredChannel { execution_id: Uuid, channel: String },

    #[error("execution {execution_id} already emitted; '{channel}' dropped")]
    AlreadyEmitted { execution_id: Uuid, channel: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Routes terminal payloads onto declared channels and the event bus.
pub struct OutputRouter<E: ExecutionRepository> {
    executions: Arc<E>,
    bus: EventBus,
}

impl<E: ExecutionRepository> OutputRouter<E> {
    pub fn new(executions: Arc<E>, bus: EventBus) -> Self {
        Self { executions, bus }
    }

    /// Emit `payload` on `channel` for `execution`.
    pub async fn emit(
        &self,
        execution: &Execution,
        channel: &str,
        payload: Value,
    ) -> Result<(), OutputError> {
        if !execution.declares_channel(channel) {
            tracing::error!(
                execution_id = %execution.id,
                step_type = %execution.step_type,
                channel,
                "emission on undeclared channel rejected"
            );
            return Err(OutputError::UndeclaredChannel {
                execution_id: execution.id,
                channel: channel.to_string(),
            });
        }

        if !self.executions.record_emission(&execution.id, channel).await? {
            tracing::warn!(execution_id = %execution.id, channel, "duplicate emission suppressed");
            return Err(OutputError::AlreadyEmitted {
                execution_id: execution.id,
                channel: channel.to_string(),
            });
        }

        tracing::info!(execution_id = %execution.id, node_id = %execution.node_id, channel, "output emitted");
        self.bus.publish(CorrelationEvent::OutputEmitted {
            execution_id: execution.id,
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }
}
