//! Cancellable delayed action calls.
//!
//! Each armed timer is a spawned task racing a deadline against a
//! `CancellationToken`. A timer that wins the race is removed from the armed
//! set and delivered on an unbounded channel; the resolution engine drains
//! that channel and feeds each fired timer into the same claim as webhooks.
//!
//! At most one timer is armed per `(execution_id, action)`. Arming again
//! cancels the previous timer, and a stale task whose handle was replaced
//! never fires.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tether_types::timer::{FiredTimer, TimerHandle, TimerRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
struct ArmedTimer {
    id: Uuid,
    token: CancellationToken,
}

/// Schedules and cancels deferred action calls.
#[derive(Debug, Clone)]
pub struct TimerScheduler {
    armed: Arc<DashMap<(Uuid, String), ArmedTimer>>,
    fired: mpsc::UnboundedSender<FiredTimer>,
}

impl TimerScheduler {
    /// Create a scheduler and the receiver its expired timers arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FiredTimer>) {
        let (fired, rx) = mpsc::unbounded_channel();
        (
            Self {
                armed: Arc::new(DashMap::new()),
                fired,
            },
            rx,
        )
    }

    /// Arm a timer calling `request.action` on `execution_id` after
    /// `request.delay`, replacing any timer armed for the same pair.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(&self, execution_id: Uuid, request: &TimerRequest) -> TimerHandle {
        let handle = TimerHandle {
            id: Uuid::now_v7(),
            execution_id,
            action: request.action.clone(),
        };
        let key = (execution_id, request.action.clone());
        let token = CancellationToken::new();

        if let Some(previous) = self.armed.insert(
            key.clone(),
            ArmedTimer {
                id: handle.id,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
            tracing::debug!(%execution_id, action = %request.action, "re-armed timer");
        }

        let armed = self.armed.clone();
        let fired = self.fired.clone();
        let delay = request.delay;
        let deadline = tokio::time::Instant::now() + delay;
        let parameters = request.parameters.clone();
        let fired_handle = handle.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let current = armed
                        .remove_if(&key, |_, t| t.id == fired_handle.id)
                        .is_some();
                    if current {
                        tracing::debug!(
                            execution_id = %fired_handle.execution_id,
                            action = %fired_handle.action,
                            "timer fired"
                        );
                        if fired
                            .send(FiredTimer {
                                handle: fired_handle,
                                parameters,
                            })
                            .is_err()
                        {
                            tracing::warn!("timer dispatch channel closed; fired timer dropped");
                        }
                    }
                }
            }
        });

        tracing::debug!(%execution_id, action = %request.action, delay_ms = delay.as_millis() as u64, "armed timer");
        handle
    }

    /// Convenience for `arm` with an explicit action and delay.
    pub fn arm_after(
        &self,
        execution_id: Uuid,
        action: &str,
        delay: Duration,
        parameters: serde_json::Value,
    ) -> TimerHandle {
        let mut request = TimerRequest::new(action, delay);
        request.parameters = parameters;
        self.arm(execution_id, &request)
    }

    /// Cancel one timer. Returns false if it already fired, was cancelled,
    /// or was replaced by a newer timer.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let key = (handle.execution_id, handle.action.clone());
        match self.armed.remove_if(&key, |_, t| t.id == handle.id) {
            Some((_, timer)) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer armed for an execution. Returns how many were cancelled.
    pub fn cancel_execution(&self, execution_id: Uuid) -> usize {
        let keys: Vec<(Uuid, String)> = self
            .armed
            .iter()
            .filter(|entry| entry.key().0 == execution_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some((_, timer)) = self.armed.remove(&key) {
                timer.token.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(%execution_id, cancelled, "cancelled timers");
        }
        cancelled
    }

    /// Whether `handle` is still the armed timer for its pair.
    pub fn is_armed(&self, handle: &TimerHandle) -> bool {
        self.armed
            .get(&(handle.execution_id, handle.action.clone()))
            .is_some_and(|t| t.id == handle.id)
    }

    /// Number of timers currently armed.
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}
