//! Immutable workflow and step definitions

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::{Compensator, Executor};
use crate::retry::RetryPolicy;

use super::value::ValueMap;

/// An immutable, validated workflow definition: a DAG of steps plus
/// identifying metadata.
///
/// Construct with [`WorkflowDefinition::new`] and validate with
/// [`WorkflowDefinition::validate`] (or let
/// [`crate::Engine::register_workflow`] do both).
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub steps: Vec<StepDefinition>,
    pub metadata: ValueMap,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: "0.1.0".to_string(),
            steps,
            metadata: ValueMap::new(),
        }
    }

    /// Look up a step definition by id within this workflow.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("steps", &self.steps.iter().map(|s| &s.id).collect::<Vec<_>>())
            .finish()
    }
}

/// An immutable step definition within a [`WorkflowDefinition`].
#[derive(Clone)]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    pub executor: Arc<dyn Executor>,
    pub compensator: Option<Arc<dyn Compensator>>,
    pub depends_on: Vec<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    pub required: bool,
    pub parallel_eligible: bool,
    pub priority: i32,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            executor,
            compensator: None,
            depends_on: Vec::new(),
            retry_policy: None,
            timeout: None,
            required: true,
            parallel_eligible: false,
            priority: 0,
        }
    }

    pub fn with_dependency(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_dependencies<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_compensator(mut self, compensator: Arc<dyn Compensator>) -> Self {
        self.compensator = Some(compensator);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn parallel_eligible(mut self, parallel_eligible: bool) -> Self {
        self.parallel_eligible = parallel_eligible;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// The effective retry policy: the declared one, or `no_retry` (a single
    /// attempt) when none was declared.
    pub fn effective_retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_else(RetryPolicy::no_retry)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("required", &self.required)
            .field("parallel_eligible", &self.parallel_eligible)
            .field("priority", &self.priority)
            .finish()
    }
}
