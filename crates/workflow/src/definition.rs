//! Workflow definitions: the step graph an execution walks.
//!
//! Definitions are authored and validated upstream (acyclicity, required
//! fields). The engine only consumes them; once an execution references a
//! `(id, version)` pair that pair must never change.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Identifier of a workflow definition (stable across versions).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefinitionId(String);

/// Identifier of a step inside a definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

macro_rules! impl_name {
    ($t:ty) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

impl_name!(DefinitionId);
impl_name!(StepId);

/// What happens after a step succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// The workflow completes.
    #[default]
    End,
    /// Continue with a single step.
    Step { step: StepId },
    /// Run every branch concurrently, then continue with `join` (or complete).
    ///
    /// Each branch is a single step; its own `next` is not followed.
    Parallel {
        branches: Vec<StepId>,
        #[serde(default)]
        join: Option<StepId>,
    },
}

/// Declared reversing action for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationSpec {
    /// Handler type resolved in the handler registry.
    pub step_type: String,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// One node of the step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: StepId,
    /// Handler type resolved in the handler registry.
    pub step_type: String,
    #[serde(default)]
    pub next: Transition,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub compensation: Option<CompensationSpec>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: StepId::new(id),
            step_type: step_type.into(),
            next: Transition::End,
            retry: RetryPolicy::default(),
            compensation: None,
        }
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Transition::Step {
            step: StepId::new(next),
        };
        self
    }

    pub fn fan_out<I, S>(mut self, branches: I, join: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next = Transition::Parallel {
            branches: branches.into_iter().map(StepId::new).collect(),
            join: join.map(StepId::from),
        };
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn compensated_by(mut self, step_type: impl Into<String>) -> Self {
        self.compensation = Some(CompensationSpec {
            step_type: step_type.into(),
            retry: RetryPolicy::default(),
        });
        self
    }

    pub fn compensated_with(mut self, spec: CompensationSpec) -> Self {
        self.compensation = Some(spec);
        self
    }
}

/// Definition lookup / consistency errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("definition not found: {id} v{version}")]
    NotFound { id: DefinitionId, version: u32 },
    #[error("definition {0} has no steps")]
    Empty(DefinitionId),
    #[error("step {step} referenced by {referenced_by} does not exist")]
    UnknownStep { step: StepId, referenced_by: String },
    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),
    #[error("no handler registered for step type '{0}'")]
    UnknownStepType(String),
    #[error("definition {id} v{version} is already registered with different content")]
    AlreadyRegistered { id: DefinitionId, version: u32 },
    #[error("definition source unavailable: {0}")]
    Unavailable(String),
}

/// An immutable, versioned workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub version: u32,
    pub entry: StepId,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, version: u32, entry: impl Into<String>) -> Self {
        Self {
            id: DefinitionId::new(id),
            version,
            entry: StepId::new(entry),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &StepId) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn entry_step(&self) -> Option<&StepDefinition> {
        self.step(&self.entry)
    }

    pub fn has_compensation(&self, id: &StepId) -> bool {
        self.step(id).is_some_and(|s| s.compensation.is_some())
    }

    /// Every handler type the definition needs (forward and compensation).
    pub fn step_types(&self) -> BTreeSet<&str> {
        let mut types = BTreeSet::new();
        for step in &self.steps {
            types.insert(step.step_type.as_str());
            if let Some(c) = &step.compensation {
                types.insert(c.step_type.as_str());
            }
        }
        types
    }

    /// Check that every referenced step exists and ids are unique.
    ///
    /// Full validation happens upstream; this is the subset the engine relies
    /// on to never dereference a missing step mid-execution.
    pub fn check_references(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty(self.id.clone()));
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(&step.id) {
                return Err(DefinitionError::DuplicateStep(step.id.clone()));
            }
        }

        let missing = |step: &StepId, referenced_by: &str| {
            if seen.contains(step) {
                Ok(())
            } else {
                Err(DefinitionError::UnknownStep {
                    step: step.clone(),
                    referenced_by: referenced_by.to_string(),
                })
            }
        };

        missing(&self.entry, "entry")?;
        for step in &self.steps {
            match &step.next {
                Transition::End => {}
                Transition::Step { step: next } => missing(next, step.id.as_str())?,
                Transition::Parallel { branches, join } => {
                    for b in branches {
                        missing(b, step.id.as_str())?;
                    }
                    if let Some(j) = join {
                        missing(j, step.id.as_str())?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Source of workflow definitions (`get_definition(id, version)`).
pub trait DefinitionSource: Send + Sync {
    fn get_definition(
        &self,
        id: &DefinitionId,
        version: u32,
    ) -> Result<WorkflowDefinition, DefinitionError>;
}

impl<S> DefinitionSource for std::sync::Arc<S>
where
    S: DefinitionSource + ?Sized,
{
    fn get_definition(
        &self,
        id: &DefinitionId,
        version: u32,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        (**self).get_definition(id, version)
    }
}
