//! Mutable workflow and step instances, and their status vocabularies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::ValueMap;

/// Workflow instance status. Wire vocabulary is the lower-case variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl WorkflowStatus {
    /// Terminal statuses are `completed`, `failed`, `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// Step instance status. Wire vocabulary is the lower-case variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl StepStatus {
    /// Terminal statuses are `completed`, `failed`, `skipped`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// A running or completed workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub definition_id: String,
    pub status: WorkflowStatus,
    pub input: ValueMap,
    pub output: ValueMap,
    pub context: ValueMap,
    pub metadata: ValueMap,
    pub steps: Vec<StepInstance>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub trace_id: String,
    pub correlation_id: String,
    pub business_id: String,
}

impl WorkflowInstance {
    pub fn new(
        id: impl Into<String>,
        definition_id: impl Into<String>,
        input: ValueMap,
        metadata: ValueMap,
    ) -> Self {
        Self {
            id: id.into(),
            definition_id: definition_id.into(),
            status: WorkflowStatus::Pending,
            input,
            output: ValueMap::new(),
            context: ValueMap::new(),
            metadata,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            retry_count: 0,
            trace_id: String::new(),
            correlation_id: String::new(),
            business_id: String::new(),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepInstance> {
        self.steps.iter().find(|s| s.step_definition_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepInstance> {
        self.steps.iter_mut().find(|s| s.step_definition_id == step_id)
    }
}

/// A step instance mapping one-to-one onto a [`crate::model::StepDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    pub id: String,
    pub step_definition_id: String,
    pub workflow_instance_id: String,
    pub status: StepStatus,
    pub input: ValueMap,
    pub output: ValueMap,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub duration_ms: Option<u64>,
    pub execution_order: usize,
}

impl StepInstance {
    pub fn new(
        id: impl Into<String>,
        step_definition_id: impl Into<String>,
        workflow_instance_id: impl Into<String>,
        execution_order: usize,
    ) -> Self {
        Self {
            id: id.into(),
            step_definition_id: step_definition_id.into(),
            workflow_instance_id: workflow_instance_id.into(),
            status: StepStatus::Pending,
            input: ValueMap::new(),
            output: ValueMap::new(),
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            duration_ms: None,
            execution_order,
        }
    }
}
