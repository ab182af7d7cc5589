//! Workflow lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::ValueMap;

/// A single lifecycle event emitted for auditability.
///
/// Event types are dotted lower-case tokens: `workflow.started`,
/// `workflow.completed`, `workflow.failed`, `step.started`,
/// `step.completed`, `step.failed`, `step.retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: String,
    pub workflow_instance_id: String,
    pub step_instance_id: Option<String>,
    pub event_type: String,
    pub data: ValueMap,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(
        id: impl Into<String>,
        workflow_instance_id: impl Into<String>,
        event_type: impl Into<String>,
        data: ValueMap,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_instance_id: workflow_instance_id.into(),
            step_instance_id: None,
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn for_step(mut self, step_instance_id: impl Into<String>) -> Self {
        self.step_instance_id = Some(step_instance_id.into());
        self
    }
}

/// Event type constants, kept together so callers (and tests) don't have to
/// hand-type the dotted tokens.
pub mod event_types {
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_RETRY: &str = "step.retry";
}
