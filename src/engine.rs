//! The public facade: register definitions, start and resume workflows,
//! query status.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{oneshot, Semaphore};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::executor::Scope;
use crate::model::{
    event_types, overlay, StepInstance, StepStatus, ValueMap, WorkflowDefinition, WorkflowEvent,
    WorkflowInstance, WorkflowStatus,
};
use crate::runner::{self, StepOutcome, StepRun};
use crate::scheduler::{self, NoProgress};
use crate::store::{Store, StoreError, WorkflowFilter};
use crate::validation::{self, ValidationError};

/// Tunables for the engine, in the style of the teacher's `ExecutorConfig` /
/// `WorkerPoolConfig`: a plain struct with a `Default` impl and `with_*`
/// setters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many workflows started via [`Engine::start_workflow_async`] may
    /// run concurrently. Blocking [`Engine::start_workflow`] calls are not
    /// subject to this cap.
    pub max_concurrent_detached_workflows: usize,

    /// Safety cap on how many lifecycle events are retained per workflow
    /// instance; further events are still emitted to the store but are
    /// logged at `warn!` once the cap is exceeded, matching the teacher's
    /// `ExecutorConfig::max_events_per_workflow` guard.
    pub max_events_per_workflow: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_detached_workflows: 16,
            max_events_per_workflow: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_detached_workflows(mut self, n: usize) -> Self {
        self.max_concurrent_detached_workflows = n;
        self
    }

    pub fn with_max_events_per_workflow(mut self, n: usize) -> Self {
        self.max_events_per_workflow = n;
        self
    }
}

/// Errors surfaced from the engine facade.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workflow failed: {0}")]
    WorkflowFailed(String),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] NoProgress),
}

/// Looks up `key` in `metadata` first, falling back to the scope's own
/// values, falling back to a fresh id if neither carries it (spec.md §4.5).
fn derive_id(metadata: &ValueMap, scope: &Scope, key: &str) -> String {
    metadata
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| scope.value(key).and_then(|v| v.as_str()).map(str::to_string))
        .unwrap_or_else(|| Uuid::now_v7().to_string())
}

/// Stamp `trace_id`/`correlation_id`/`business_id` on a freshly constructed
/// instance using the metadata-then-scope-values lookup order.
fn apply_derived_ids(instance: &mut WorkflowInstance, metadata: &ValueMap, scope: &Scope) {
    instance.trace_id = derive_id(metadata, scope, "trace_id");
    instance.correlation_id = derive_id(metadata, scope, "correlation_id");
    instance.business_id = derive_id(metadata, scope, "business_id");
}

/// The orchestration engine: a registry of validated definitions plus a
/// store handle, generic over the store implementation the same way the
/// teacher's `WorkflowExecutor<S: WorkflowEventStore>` is.
pub struct Engine<S: Store> {
    store: Arc<S>,
    config: EngineConfig,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    detached_limit: Arc<Semaphore>,
    completions: RwLock<HashMap<String, Vec<oneshot::Sender<WorkflowStatus>>>>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: EngineConfig) -> Self {
        let detached_limit = Arc::new(Semaphore::new(config.max_concurrent_detached_workflows));
        Self {
            store,
            config,
            definitions: RwLock::new(HashMap::new()),
            detached_limit,
            completions: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and register a workflow definition under its own id.
    #[instrument(skip(self, definition), fields(workflow_id = %definition.id))]
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        validation::validate(&definition)?;
        self.definitions
            .write()
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    fn lookup(&self, definition_id: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.definitions
            .read()
            .get(definition_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("workflow definition {definition_id:?}")))
    }

    /// Start a workflow and run it to completion on the caller's task,
    /// returning only once it reaches a terminal status.
    ///
    /// Runs under the caller's own `scope`: cancelling it cancels this
    /// workflow's executor invocations and retry sleeps. `trace_id`,
    /// `correlation_id`, and `business_id` are derived from `metadata`,
    /// falling back to values carried by `scope` (spec.md §4.5).
    #[instrument(skip(self, scope, input, metadata), fields(%definition_id))]
    pub async fn start_workflow(
        &self,
        scope: &Scope,
        definition_id: &str,
        input: ValueMap,
        metadata: ValueMap,
    ) -> Result<WorkflowInstance, EngineError> {
        let definition = self.lookup(definition_id)?;
        let instance_id = Uuid::now_v7().to_string();
        let mut instance = WorkflowInstance::new(instance_id, definition_id, input, metadata.clone());
        apply_derived_ids(&mut instance, &metadata, scope);
        self.run_to_completion(definition, instance, scope.clone()).await
    }

    /// Start a workflow on a detached task, bounded by
    /// [`EngineConfig::max_concurrent_detached_workflows`]. Returns
    /// immediately with the new instance id; poll
    /// [`Engine::get_workflow_status`] or await the returned receiver for
    /// completion.
    ///
    /// `scope` is consulted only for id derivation (same lookup order as
    /// [`Engine::start_workflow`]); the scheduling loop itself runs on a
    /// fresh root scope tied to the spawned task, not the caller's, so the
    /// caller cancelling its own scope after this call returns has no effect
    /// on the detached run.
    #[instrument(skip(self, scope, input, metadata), fields(%definition_id))]
    pub async fn start_workflow_async(
        self: &Arc<Self>,
        scope: &Scope,
        definition_id: &str,
        input: ValueMap,
        metadata: ValueMap,
    ) -> Result<(String, oneshot::Receiver<WorkflowStatus>), EngineError>
    where
        S: 'static,
    {
        let definition = self.lookup(definition_id)?;
        let instance_id = Uuid::now_v7().to_string();
        let mut instance =
            WorkflowInstance::new(instance_id.clone(), definition_id, input, metadata.clone());
        apply_derived_ids(&mut instance, &metadata, scope);

        let (tx, rx) = oneshot::channel();
        self.completions
            .write()
            .entry(instance_id.clone())
            .or_default()
            .push(tx);

        let engine = Arc::clone(self);
        let permit_holder = Arc::clone(&self.detached_limit);
        tokio::spawn(async move {
            let _permit = match permit_holder.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let root_scope = Scope::new();
            if let Err(err) = engine.run_to_completion(definition, instance, root_scope).await {
                error!(error = %err, "detached workflow failed");
            }
        });

        Ok((instance_id, rx))
    }

    /// Resume a previously started workflow instance from its persisted
    /// state, under the given `scope`. `completed` and `cancelled` instances
    /// are genuinely final and are returned as-is, satisfying idempotence. A
    /// `failed` instance is resumable: its failed required step instances
    /// are reset to `pending` and re-attempted, on the premise that whatever
    /// external condition caused the failure may since have been resolved by
    /// the caller.
    #[instrument(skip(self, scope))]
    pub async fn resume_workflow(
        &self,
        scope: &Scope,
        instance_id: &str,
    ) -> Result<WorkflowInstance, EngineError> {
        let mut instance = self.store.get_workflow(instance_id).await?;
        if matches!(instance.status, WorkflowStatus::Completed | WorkflowStatus::Cancelled) {
            return Ok(instance);
        }

        if instance.status == WorkflowStatus::Failed {
            for step in instance.steps.iter_mut() {
                if step.status == StepStatus::Failed {
                    step.status = StepStatus::Pending;
                    step.error = None;
                }
            }
            instance.error = None;
        }

        let definition = self.lookup(&instance.definition_id)?;
        self.run_to_completion(definition, instance, scope.clone()).await
    }

    pub async fn get_workflow_status(&self, instance_id: &str) -> Result<WorkflowStatus, EngineError> {
        Ok(self.store.get_workflow(instance_id).await?.status)
    }

    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.store.list_workflows(filter).await?)
    }

    /// The lifecycle event stream for a workflow instance, ordered by
    /// timestamp ascending.
    pub async fn get_workflow_events(&self, instance_id: &str) -> Result<Vec<WorkflowEvent>, EngineError> {
        Ok(self.store.get_workflow_events(instance_id).await?)
    }

    fn notify_completion(&self, instance_id: &str, status: WorkflowStatus) {
        if let Some(senders) = self.completions.write().remove(instance_id) {
            for sender in senders {
                let _ = sender.send(status);
            }
        }
    }

    #[instrument(skip(self, definition, instance, scope), fields(instance_id = %instance.id))]
    async fn run_to_completion(
        &self,
        definition: Arc<WorkflowDefinition>,
        mut instance: WorkflowInstance,
        scope: Scope,
    ) -> Result<WorkflowInstance, EngineError> {
        let is_new = instance.steps.is_empty();
        if is_new {
            for (order, step) in definition.steps.iter().enumerate() {
                instance
                    .steps
                    .push(StepInstance::new(
                        Uuid::now_v7().to_string(),
                        step.id.clone(),
                        instance.id.clone(),
                        order,
                    ));
            }
        }

        instance.status = WorkflowStatus::Running;
        self.store.save_workflow(instance.clone()).await?;
        if is_new {
            for step in &instance.steps {
                self.store.save_step(step.clone()).await?;
            }
        }
        self.emit_event(&instance.id, event_types::WORKFLOW_STARTED, ValueMap::new())
            .await;
        info!("workflow started");

        loop {
            let wave = match scheduler::next_ready_wave(&definition, &instance.steps) {
                Ok(wave) => wave,
                Err(no_progress) => {
                    let message = no_progress.to_string();
                    instance.status = WorkflowStatus::Failed;
                    instance.error = Some(message.clone());
                    self.persist_terminal(&instance).await?;
                    return Err(EngineError::Scheduler(no_progress));
                }
            };

            if wave.is_empty() {
                break;
            }

            for step_id in &wave.sequential {
                self.run_one_step(&definition, &mut instance, &scope, step_id)
                    .await?;
                if matches!(instance.status, WorkflowStatus::Failed | WorkflowStatus::Cancelled) {
                    self.persist_terminal(&instance).await?;
                    return Ok(instance);
                }
            }

            if !wave.parallel.is_empty() {
                let runs = self
                    .run_parallel_wave(&definition, &mut instance, &scope, &wave.parallel)
                    .await;
                for (step_id, input, run) in runs {
                    self.apply_run(&definition, &mut instance, &step_id, input, run)
                        .await?;
                }
                if matches!(instance.status, WorkflowStatus::Failed | WorkflowStatus::Cancelled) {
                    self.persist_terminal(&instance).await?;
                    return Ok(instance);
                }
            }
        }

        instance.status = WorkflowStatus::Completed;
        instance.output = instance.context.clone();
        self.persist_terminal(&instance).await?;
        info!("workflow completed");
        Ok(instance)
    }

    /// Transition a step instance to `running` both in memory and in the
    /// store, stamping `started_at` on first entry (spec.md §3, §4.4 step 2).
    async fn mark_step_running(
        &self,
        instance: &mut WorkflowInstance,
        step_id: &str,
    ) -> Result<(), EngineError> {
        let id = {
            let step_instance = instance
                .step_mut(step_id)
                .expect("step instance registered at workflow start");
            step_instance.status = StepStatus::Running;
            step_instance.started_at.get_or_insert_with(chrono::Utc::now);
            step_instance.id.clone()
        };
        self.store.update_step_status(&id, StepStatus::Running).await?;
        Ok(())
    }

    async fn run_parallel_wave(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        scope: &Scope,
        step_ids: &[String],
    ) -> Vec<(String, ValueMap, StepRun)> {
        let mut handles = Vec::with_capacity(step_ids.len());
        for step_id in step_ids {
            let step = definition
                .step(step_id)
                .cloned()
                .expect("scheduler only returns known step ids");
            let input = runner::build_step_input(&step, instance)
                .map_err(|err| warn!(error = %err, "failed to build step input"))
                .unwrap_or_default();

            if let Err(err) = self.mark_step_running(instance, step_id).await {
                warn!(step_id, error = %err, "failed to mark step running");
            }
            self.emit_event(&instance.id, event_types::STEP_STARTED, ValueMap::new())
                .await;

            let child_scope = scope.child_token();
            let step_id = step_id.clone();
            let input_for_task = input.clone();
            handles.push(tokio::spawn(async move {
                let run = runner::run_step(&step, &child_scope, input_for_task).await;
                (step_id, input, run)
            }));
        }

        join_all(handles)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect()
    }

    async fn run_one_step(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        scope: &Scope,
        step_id: &str,
    ) -> Result<(), EngineError> {
        let step = definition
            .step(step_id)
            .cloned()
            .expect("scheduler only returns known step ids");
        let input = runner::build_step_input(&step, instance).unwrap_or_default();
        self.mark_step_running(instance, step_id).await?;
        self.emit_event(&instance.id, event_types::STEP_STARTED, ValueMap::new())
            .await;
        let run = runner::run_step(&step, scope, input.clone()).await;
        self.apply_run(definition, instance, step_id, input, run).await
    }

    async fn apply_run(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_id: &str,
        input: ValueMap,
        run: StepRun,
    ) -> Result<(), EngineError> {
        let StepRun { outcome, attempts, duration_ms } = run;
        let retry_count = attempts.saturating_sub(1);

        let mut context_patch: Option<ValueMap> = None;
        let mut new_workflow_status: Option<WorkflowStatus> = None;
        let mut new_workflow_error: Option<String> = None;

        let (step_instance_id, outcome) = {
            let step_instance = instance
                .step_mut(step_id)
                .expect("step instance registered at workflow start");
            step_instance.input = input;
            step_instance.retry_count = retry_count;
            step_instance.duration_ms = Some(duration_ms);

            match &outcome {
                StepOutcome::Completed { output } => {
                    step_instance.output = output.clone();
                    step_instance.status = StepStatus::Completed;
                    context_patch = Some(output.clone());
                    info!(step_id, "step completed");
                }
                StepOutcome::Skipped { error } => {
                    step_instance.status = StepStatus::Skipped;
                    step_instance.error = Some(error.clone());
                    warn!(step_id, error = %error, "optional step skipped after exhausting retries");
                }
                StepOutcome::Failed { error } => {
                    step_instance.status = StepStatus::Failed;
                    step_instance.error = Some(error.clone());
                    error!(step_id, error = %error, "required step failed");

                    let definition_required = definition
                        .step(step_id)
                        .map(|s| s.required)
                        .unwrap_or(true);
                    if definition_required {
                        new_workflow_status = Some(WorkflowStatus::Failed);
                        new_workflow_error = Some(format!("step {step_id:?} failed: {error}"));
                    }
                }
                StepOutcome::Cancelled => {
                    step_instance.status = StepStatus::Failed;
                    step_instance.error = Some("cancelled".to_string());
                    new_workflow_status = Some(WorkflowStatus::Cancelled);
                }
            }

            (step_instance.id.clone(), outcome)
        };

        if let Some(patch) = &context_patch {
            overlay(&mut instance.context, patch);
        }
        if let Some(status) = new_workflow_status {
            instance.status = status;
        }
        if let Some(error) = new_workflow_error {
            instance.error = Some(error);
        }

        let event_data = match &outcome {
            StepOutcome::Completed { output } => (event_types::STEP_COMPLETED, output.clone()),
            StepOutcome::Skipped { error } | StepOutcome::Failed { error } => {
                let mut data = ValueMap::new();
                data.insert("error".to_string(), serde_json::json!(error));
                (event_types::STEP_FAILED, data)
            }
            StepOutcome::Cancelled => (event_types::STEP_FAILED, ValueMap::new()),
        };

        // Drive the terminal transition through the store's own granular
        // operations rather than a bulk save, so `update_step_status`'s
        // `completed_at`/`duration_ms` stamping actually runs (spec.md §4.4
        // step 4). A skipped step is recorded as failed-then-skipped, in
        // that order, matching the spec's literal two-step sequencing.
        match outcome {
            StepOutcome::Completed { output } => {
                self.store.update_step_output(&step_instance_id, output).await?;
                self.store
                    .update_step_status(&step_instance_id, StepStatus::Completed)
                    .await?;
            }
            StepOutcome::Skipped { error } => {
                self.store.update_step_error(&step_instance_id, error).await?;
                self.store
                    .update_step_status(&step_instance_id, StepStatus::Skipped)
                    .await?;
            }
            StepOutcome::Failed { error } => {
                self.store.update_step_error(&step_instance_id, error).await?;
            }
            StepOutcome::Cancelled => {
                self.store
                    .update_step_error(&step_instance_id, "cancelled".to_string())
                    .await?;
            }
        }

        self.store
            .update_workflow_output(&instance.id, instance.context.clone())
            .await?;

        for attempt in 1..=retry_count {
            let mut data = ValueMap::new();
            data.insert("attempt".to_string(), serde_json::json!(attempt + 1));
            self.emit_event(&instance.id, event_types::STEP_RETRY, data).await;
        }
        self.emit_event(&instance.id, event_data.0, event_data.1).await;
        Ok(())
    }

    async fn persist_terminal(&self, instance: &WorkflowInstance) -> Result<(), EngineError> {
        self.store.save_workflow(instance.clone()).await?;
        self.store
            .update_workflow_status(&instance.id, instance.status)
            .await?;
        match instance.status {
            WorkflowStatus::Completed => {
                self.emit_event(&instance.id, event_types::WORKFLOW_COMPLETED, ValueMap::new())
                    .await;
            }
            WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                let mut data = ValueMap::new();
                if let Some(error) = &instance.error {
                    data.insert("error".to_string(), serde_json::json!(error));
                }
                self.emit_event(&instance.id, event_types::WORKFLOW_FAILED, data)
                    .await;
            }
            _ => {}
        }
        self.notify_completion(&instance.id, instance.status);
        Ok(())
    }

    /// Best-effort event emission: failures are logged and swallowed, never
    /// propagated to the caller (spec.md §5, §7).
    async fn emit_event(&self, workflow_instance_id: &str, event_type: &str, data: ValueMap) {
        let existing = self
            .store
            .get_workflow_events(workflow_instance_id)
            .await
            .map(|events| events.len())
            .unwrap_or(0);
        if existing >= self.config.max_events_per_workflow {
            warn!(workflow_instance_id, "event history cap exceeded, still recording");
        }

        let event = WorkflowEvent::new(
            Uuid::now_v7().to_string(),
            workflow_instance_id,
            event_type,
            data,
        );
        if let Err(err) = self.store.save_event(event).await {
            warn!(workflow_instance_id, error = %err, "failed to save lifecycle event");
        }
    }
}
