//! In-memory [`Store`] implementation backed by `parking_lot` locks.
//!
//! Grounded on the teacher's `persistence/memory.rs` `InMemoryWorkflowEventStore`:
//! one lock per collection rather than a single combined lock (see
//! `DESIGN.md` for the Open Question this resolves), deep-copy on every read
//! and write so callers can never observe or mutate another caller's
//! reference.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::model::{StepInstance, StepStatus, ValueMap, WorkflowEvent, WorkflowInstance, WorkflowStatus};

use super::{Store, StoreError, WorkflowFilter};

/// A non-durable [`Store`] that keeps everything in process memory. Intended
/// for tests and single-process deployments where durability across
/// restarts isn't required.
#[derive(Default)]
pub struct InMemoryStore {
    workflows: RwLock<HashMap<String, WorkflowInstance>>,
    steps: RwLock<HashMap<String, StepInstance>>,
    events: RwLock<HashMap<String, Vec<WorkflowEvent>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_workflow(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
        self.workflows.write().insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowInstance, StoreError> {
        self.workflows
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowInstance>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .filter(|instance| filter.matches(instance))
            .cloned()
            .collect())
    }

    async fn update_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let instance = workflows
            .get_mut(id)
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        instance.status = status;
        if status.is_terminal() {
            instance.completed_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn update_workflow_output(&self, id: &str, output: ValueMap) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let instance = workflows
            .get_mut(id)
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        instance.context = output.clone();
        instance.output = output;
        Ok(())
    }

    async fn update_workflow_error(&self, id: &str, error: String) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let instance = workflows
            .get_mut(id)
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        instance.error = Some(error);
        instance.status = WorkflowStatus::Failed;
        instance.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn save_step(&self, step: StepInstance) -> Result<(), StoreError> {
        self.steps.write().insert(step.id.clone(), step);
        Ok(())
    }

    async fn get_step(&self, id: &str) -> Result<StepInstance, StoreError> {
        self.steps
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::StepNotFound(id.to_string()))
    }

    async fn get_workflow_steps(&self, workflow_instance_id: &str) -> Result<Vec<StepInstance>, StoreError> {
        let mut steps: Vec<StepInstance> = self
            .steps
            .read()
            .values()
            .filter(|s| s.workflow_instance_id == workflow_instance_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.execution_order);
        Ok(steps)
    }

    async fn update_step_status(&self, id: &str, status: StepStatus) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let step = steps
            .get_mut(id)
            .ok_or_else(|| StoreError::StepNotFound(id.to_string()))?;
        step.status = status;
        if status == StepStatus::Running && step.started_at.is_none() {
            step.started_at = Some(chrono::Utc::now());
        }
        if status.is_terminal() {
            let completed_at = chrono::Utc::now();
            if let Some(started_at) = step.started_at {
                step.duration_ms = Some((completed_at - started_at).num_milliseconds().max(0) as u64);
            }
            step.completed_at = Some(completed_at);
        }
        Ok(())
    }

    async fn update_step_output(&self, id: &str, output: ValueMap) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let step = steps
            .get_mut(id)
            .ok_or_else(|| StoreError::StepNotFound(id.to_string()))?;
        step.output = output;
        Ok(())
    }

    async fn update_step_error(&self, id: &str, error: String) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let step = steps
            .get_mut(id)
            .ok_or_else(|| StoreError::StepNotFound(id.to_string()))?;
        step.error = Some(error);
        step.status = StepStatus::Failed;
        step.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn save_event(&self, event: WorkflowEvent) -> Result<(), StoreError> {
        self.events
            .write()
            .entry(event.workflow_instance_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_workflow_events(&self, workflow_instance_id: &str) -> Result<Vec<WorkflowEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .get(workflow_instance_id)
            .cloned()
            .unwrap_or_default())
    }
}
