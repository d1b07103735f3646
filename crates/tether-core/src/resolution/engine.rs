//! Exactly-once resolution of suspended executions.
//!
//! Every resolution path (a routed delivery, an expired timer, a direct
//! `invoke_action` call) goes through `try_resolve`, which funnels into one
//! atomic claim on the execution. The caller that wins the claim:
//! 1. cancels the execution's remaining timers
//! 2. publishes `ExecutionResolved`
//! 3. asks the step type for the terminal payload
//! 4. emits it through the `OutputRouter`
//!
//! Every other caller gets `Resolution::AlreadyResolved` and has no effect.
//! Once the claim is won the outcome is permanent: a failure in steps 3 or
//! 4 is logged and reported as `Resolution::WonWithoutOutput`, never as an
//! error.

use std::sync::Arc;

use serde_json::Value;
use tether_types::error::RepositoryError;
use tether_types::event::CorrelationEvent;
use tether_types::execution::{ClaimOutcome, ExecutionState, ResolutionOutcome, ResolutionSource};
use tether_types::timer::{FiredTimer, TimerHandle, TimerRequest};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::output::OutputRouter;
use super::timer::TimerScheduler;
use crate::event::EventBus;
use crate::repository::ExecutionRepository;
use crate::step::StepRegistry;

// ---------------------------------------------------------------------------
// Error and result types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("unknown step type '{0}'")]
    UnknownStepType(String),

    #[error("step type '{step_type}' has no action '{action}'")]
    UnknownAction { step_type: String, action: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of a resolution attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// This attempt claimed the execution and emitted on `channel`.
    Won { channel: String },
    /// This attempt claimed the execution, but the step or the output
    /// router failed afterwards. The outcome stays recorded.
    WonWithoutOutput { error: String },
    /// The execution was already terminal; nothing happened.
    AlreadyResolved,
}

impl Resolution {
    pub fn is_won(&self) -> bool {
        matches!(self, Resolution::Won { .. } | Resolution::WonWithoutOutput { .. })
    }
}

// ---------------------------------------------------------------------------
// ResolutionEngine
// ---------------------------------------------------------------------------

pub struct ResolutionEngine<E: ExecutionRepository> {
    executions: Arc<E>,
    steps: Arc<StepRegistry>,
    timers: TimerScheduler,
    output: OutputRouter<E>,
    bus: EventBus,
}

impl<E: ExecutionRepository + 'static> ResolutionEngine<E> {
    /// Build an engine and the receiver its expired timers arrive on.
    ///
    /// Pass the receiver to [`ResolutionEngine::spawn_timer_dispatch`].
    pub fn new(
        executions: Arc<E>,
        steps: Arc<StepRegistry>,
        bus: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<FiredTimer>) {
        let (timers, fired) = TimerScheduler::new();
        let output = OutputRouter::new(executions.clone(), bus.clone());
        (
            Self {
                executions,
                steps,
                timers,
                output,
                bus,
            },
            fired,
        )
    }

    pub fn timers(&self) -> &TimerScheduler {
        &self.timers
    }

    /// Arm a deferred action call for an execution.
    pub fn schedule(&self, execution_id: Uuid, request: &TimerRequest) -> TimerHandle {
        self.timers.arm(execution_id, request)
    }

    /// Attempt to resolve `execution_id` with `action`.
    ///
    /// Unknown actions are rejected before the claim, so they can never win.
    /// A step or emission failure after the claim leaves the execution
    /// resolved: the outcome is recorded and will not be retried, and the
    /// attempt still reports the win.
    pub async fn try_resolve(
        &self,
        execution_id: Uuid,
        action: &str,
        parameters: Value,
        source: ResolutionSource,
    ) -> Result<Resolution, ResolutionError> {
        let execution = self
            .executions
            .get(&execution_id)
            .await?
            .ok_or(ResolutionError::NotFound(execution_id))?;

        if execution.is_resolved() {
            tracing::debug!(%execution_id, action, %source, state = %execution.state, "execution already terminal");
            return Ok(Resolution::AlreadyResolved);
        }

        let step = self
            .steps
            .get(&execution.step_type)
            .ok_or_else(|| ResolutionError::UnknownStepType(execution.step_type.clone()))?;
        if step.action_channel(action).is_none() {
            return Err(ResolutionError::UnknownAction {
                step_type: execution.step_type.clone(),
                action: action.to_string(),
            });
        }

        let outcome = ResolutionOutcome::new(action, parameters, source);
        match self.executions.try_claim(&execution_id, &outcome).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyTerminal(state) => {
                tracing::debug!(%execution_id, action, %source, %state, "lost resolution race");
                return Ok(Resolution::AlreadyResolved);
            }
        }

        self.timers.cancel_execution(execution_id);
        tracing::info!(%execution_id, node_id = %execution.node_id, action, %source, "execution resolved");
        self.bus.publish(CorrelationEvent::ExecutionResolved {
            execution_id,
            action: action.to_string(),
            source,
        });

        let mut resolved = execution;
        resolved.state = ExecutionState::Resolved;
        let parameters = outcome.parameters.clone();
        resolved.outcome = Some(outcome);

        let emitted = match step.handle_action(&resolved, action, &parameters) {
            Ok(result) => self
                .output
                .emit(&resolved, &result.channel, result.payload)
                .await
                .map(|()| result.channel)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match emitted {
            Ok(channel) => Ok(Resolution::Won { channel }),
            Err(error) => {
                tracing::error!(%execution_id, action, error = %error, "execution resolved but produced no output");
                Ok(Resolution::WonWithoutOutput { error })
            }
        }
    }

    /// Cancel a suspended execution. Returns false if it was already terminal.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, ResolutionError> {
        match self.executions.try_cancel(&execution_id).await {
            Ok(ClaimOutcome::Claimed) => {
                self.timers.cancel_execution(execution_id);
                tracing::info!(%execution_id, "execution cancelled");
                self.bus
                    .publish(CorrelationEvent::ExecutionCancelled { execution_id });
                Ok(true)
            }
            Ok(ClaimOutcome::AlreadyTerminal(state)) => {
                tracing::debug!(%execution_id, %state, "cancel ignored; execution already terminal");
                Ok(false)
            }
            Err(RepositoryError::NotFound) => Err(ResolutionError::NotFound(execution_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Drain fired timers into `try_resolve`. The task runs for the life of
    /// the runtime.
    pub fn spawn_timer_dispatch(
        self: &Arc<Self>,
        mut fired: mpsc::UnboundedReceiver<FiredTimer>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(timer) = fired.recv().await {
                let execution_id = timer.handle.execution_id;
                let action = timer.handle.action.clone();
                match engine
                    .try_resolve(execution_id, &action, timer.parameters, ResolutionSource::Timer)
                    .await
                {
                    Ok(Resolution::Won { channel }) => {
                        tracing::debug!(%execution_id, action = %action, channel = %channel, "timer resolved execution");
                    }
                    Ok(Resolution::WonWithoutOutput { .. }) => {}
                    Ok(Resolution::AlreadyResolved) => {
                        tracing::debug!(%execution_id, action = %action, "timer fired after resolution; ignored");
                    }
                    Err(ResolutionError::NotFound(_)) => {
                        tracing::debug!(%execution_id, action = %action, "timer fired for deleted execution");
                    }
                    Err(e) => {
                        tracing::error!(%execution_id, action = %action, error = %e, "timer resolution failed");
                    }
                }
            }
            tracing::debug!("timer dispatch stopped");
        })
    }
}
