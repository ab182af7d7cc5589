//! The persistence contract: everything the engine needs durable, expressed
//! as a trait so callers can swap in a relational implementation without
//! touching scheduling or execution code.
//!
//! [`InMemoryStore`] is the only implementation carried in this crate
//! (`memory.rs`); a relational implementation is out of scope (see
//! `SPEC_FULL.md`).
//!
//! Unlike [`crate::Executor`]/[`crate::Compensator`], `Store` methods do not
//! take a `&Scope`: every call here is a single synchronous lock operation
//! against in-memory state with nothing to suspend on, so there is no
//! cancellation-relevant wait to honor. A relational implementation, whose
//! calls can block on network I/O, is exactly where that would change.

mod memory;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::model::{StepInstance, StepStatus, WorkflowEvent, WorkflowInstance, WorkflowStatus};

pub use memory::InMemoryStore;

/// Everything that can go wrong talking to a store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("workflow instance {0:?} not found")]
    WorkflowNotFound(String),

    #[error("step instance {0:?} not found")]
    StepNotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Filter for [`Store::list_workflows`]. All fields are optional; an absent
/// field matches anything.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub definition_id: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    pub business_id: Option<String>,
}

impl WorkflowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition_id(mut self, id: impl Into<String>) -> Self {
        self.definition_id = Some(id.into());
        self
    }

    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_business_id(mut self, business_id: impl Into<String>) -> Self {
        self.business_id = Some(business_id.into());
        self
    }

    fn matches(&self, instance: &WorkflowInstance) -> bool {
        if let Some(id) = &self.definition_id {
            if &instance.definition_id != id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if instance.status != status {
                return false;
            }
        }
        if let Some(trace_id) = &self.trace_id {
            if &instance.trace_id != trace_id {
                return false;
            }
        }
        if let Some(correlation_id) = &self.correlation_id {
            if &instance.correlation_id != correlation_id {
                return false;
            }
        }
        if let Some(business_id) = &self.business_id {
            if &instance.business_id != business_id {
                return false;
            }
        }
        true
    }
}

/// A boxed, `Send` future returning a `Result<(), StoreError>` — the shape a
/// closure handed to [`Store::with_transaction`] must produce.
pub type TransactionFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

/// Durable storage for workflow instances, step instances, and lifecycle
/// events. Implementations must be safe to share across tasks: the engine
/// holds a single `Arc<S>` and calls through it concurrently.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn save_workflow(&self, instance: WorkflowInstance) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: &str) -> Result<WorkflowInstance, StoreError>;

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowInstance>, StoreError>;

    async fn update_workflow_status(
        &self,
        id: &str,
        status: WorkflowStatus,
    ) -> Result<(), StoreError>;

    /// Overwrites both `output` and `context` with the given map. The spec's
    /// data model lists them as distinct fields but exposes only one update
    /// operation; this crate treats a context update as also becoming the
    /// externally visible output (see `DESIGN.md`).
    async fn update_workflow_output(
        &self,
        id: &str,
        output: crate::model::ValueMap,
    ) -> Result<(), StoreError>;

    async fn update_workflow_error(&self, id: &str, error: String) -> Result<(), StoreError>;

    async fn save_step(&self, step: StepInstance) -> Result<(), StoreError>;

    async fn get_step(&self, id: &str) -> Result<StepInstance, StoreError>;

    async fn get_workflow_steps(
        &self,
        workflow_instance_id: &str,
    ) -> Result<Vec<StepInstance>, StoreError>;

    async fn update_step_status(&self, id: &str, status: StepStatus) -> Result<(), StoreError>;

    async fn update_step_output(
        &self,
        id: &str,
        output: crate::model::ValueMap,
    ) -> Result<(), StoreError>;

    async fn update_step_error(&self, id: &str, error: String) -> Result<(), StoreError>;

    async fn save_event(&self, event: WorkflowEvent) -> Result<(), StoreError>;

    async fn get_workflow_events(
        &self,
        workflow_instance_id: &str,
    ) -> Result<Vec<WorkflowEvent>, StoreError>;

    /// Runs `f` as a unit of work. The in-memory implementation has no
    /// meaningful cross-call atomicity to offer beyond its per-map locking,
    /// so the default just awaits `f`; a relational implementation would
    /// wrap this in a real database transaction.
    async fn with_transaction<'a>(
        &'a self,
        f: Box<dyn FnOnce() -> TransactionFuture<'a> + Send + 'a>,
    ) -> Result<(), StoreError> {
        f().await
    }
}
