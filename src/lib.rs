//! A durable, dependency-aware workflow orchestration engine.
//!
//! Workflows are DAGs of steps. Each step wraps an [`Executor`], declares
//! its dependencies, and optionally carries a [`RetryPolicy`], a timeout, a
//! priority, and a compensator. The [`Engine`] validates definitions at
//! registration, schedules ready steps respecting dependency and priority
//! order, runs parallel-eligible steps concurrently, and persists every
//! transition through a [`Store`] so a workflow can be resumed after a
//! crash.
//!
//! ```
//! use durable_flow::{
//!     executor_fn, Engine, InMemoryStore, Scope, StepDefinition, ValueMap, WorkflowDefinition,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let greet = executor_fn(|_scope, input| async move {
//!     let name = input.get("name").and_then(|v| v.as_str()).unwrap_or("world");
//!     Ok([("greeting".to_string(), json!(format!("hello, {name}")))].into_iter().collect())
//! });
//!
//! let definition = WorkflowDefinition::new(
//!     "greet-workflow",
//!     "Greet",
//!     vec![StepDefinition::new("greet", "Greet", greet)],
//! );
//!
//! let engine = Engine::new(InMemoryStore::shared());
//! engine.register_workflow(definition)?;
//!
//! let scope = Scope::new();
//! let input = [("name".to_string(), json!("ferris"))].into_iter().collect();
//! let instance = engine
//!     .start_workflow(&scope, "greet-workflow", input, ValueMap::new())
//!     .await?;
//! assert_eq!(instance.output.get("greeting"), Some(&json!("hello, ferris")));
//! # Ok(())
//! # }
//! ```

mod engine;
mod executor;
mod model;
mod retry;
mod runner;
mod scheduler;
mod store;
mod validation;

pub use engine::{Engine, EngineConfig, EngineError};
pub use executor::{compensator_fn, executor_fn, Compensator, ExecutionError, Executor, Scope};
pub use model::{
    event_types, overlay, StepDefinition, StepInstance, StepStatus, ValueMap, WorkflowDefinition,
    WorkflowEvent, WorkflowInstance, WorkflowStatus,
};
pub use retry::RetryPolicy;
pub use runner::{RunnerError, StepOutcome, StepRun};
pub use scheduler::{NoProgress, ReadyWave};
pub use store::{InMemoryStore, Store, StoreError, WorkflowFilter};
pub use validation::{validate, ValidationError};

/// Curated re-export of the types most callers need, mirroring the
/// teacher's own `prelude` convention.
pub mod prelude {
    pub use crate::{
        compensator_fn, executor_fn, Compensator, Engine, EngineConfig, EngineError,
        ExecutionError, Executor, InMemoryStore, RetryPolicy, Scope, StepDefinition, Store,
        StoreError, ValueMap, WorkflowDefinition, WorkflowFilter, WorkflowInstance,
        WorkflowStatus,
    };
}
