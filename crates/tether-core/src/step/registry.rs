//! Name -> step type lookup with declaration checks at registration time.
//!
//! A step type whose actions point at undeclared channels never reaches
//! the resolution engine: registration rejects it.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::capability::{BoxStepType, StepType};

#[derive(Debug, thiserror::Error)]
pub enum StepRegistryError {
    #[error("step type '{0}' is already registered")]
    Duplicate(String),

    #[error("step type '{0}' declares no output channels")]
    NoChannels(String),

    #[error("step type '{step}' declares channel '{channel}' more than once")]
    DuplicateChannel { step: String, channel: String },

    #[error("step type '{step}' declares action '{action}' more than once")]
    DuplicateAction { step: String, action: String },

    #[error("action '{action}' of step type '{step}' emits on undeclared channel '{channel}'")]
    UndeclaredChannel {
        step: String,
        action: String,
        channel: String,
    },
}

#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: DashMap<String, Arc<BoxStepType>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in generic step types.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for step in super::builtin::all() {
            if let Err(e) = registry.insert(step) {
                tracing::error!(error = %e, "built-in step type rejected");
            }
        }
        registry
    }

    pub fn register<T: StepType + 'static>(&self, step: T) -> Result<(), StepRegistryError> {
        self.insert(BoxStepType::new(step))
    }

    fn insert(&self, step: BoxStepType) -> Result<(), StepRegistryError> {
        validate(&step)?;
        let name = step.name().to_string();
        match self.steps.entry(name.clone()) {
            Entry::Occupied(_) => Err(StepRegistryError::Duplicate(name)),
            Entry::Vacant(slot) => {
                tracing::debug!(step_type = %name, kind = ?step.kind(), "registered step type");
                slot.insert(Arc::new(step));
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxStepType>> {
        self.steps.get(name).map(|s| s.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn validate(step: &BoxStepType) -> Result<(), StepRegistryError> {
    let name = step.name().to_string();
    let channels = step.output_channels();
    if channels.is_empty() {
        return Err(StepRegistryError::NoChannels(name));
    }

    let mut seen = HashSet::new();
    for channel in &channels {
        if !seen.insert(channel.as_str()) {
            return Err(StepRegistryError::DuplicateChannel {
                step: name,
                channel: channel.clone(),
            });
        }
    }

    let mut actions = HashSet::new();
    for action in step.actions() {
        if !actions.insert(action.name.clone()) {
            return Err(StepRegistryError::DuplicateAction {
                step: name,
                action: action.name,
            });
        }
        if !seen.contains(action.channel.as_str()) {
            return Err(StepRegistryError::UndeclaredChannel {
                step: name,
                action: action.name,
                channel: action.channel,
            });
        }
    }
    Ok(())
}
