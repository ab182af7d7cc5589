//! Executes a single step instance to completion: builds its input by
//! overlaying workflow input with upstream outputs, then drives the
//! retry/backoff/timeout attempt loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::executor::{ExecutionError, Scope};
use crate::model::{overlay, StepDefinition, ValueMap, WorkflowInstance};
use crate::retry::RetryPolicy;

/// How a step attempt loop concluded.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed { output: ValueMap },
    Failed { error: String },
    /// An optional step exhausted its attempts; the workflow proceeds as if
    /// it had produced an empty output.
    Skipped { error: String },
    Cancelled,
}

/// Result of running a step's full attempt loop: the outcome plus how many
/// attempts it took, so the caller can stamp `retry_count` and reconstruct
/// `step.retry` events without the runner itself touching a store.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub outcome: StepOutcome,
    pub attempts: u32,
    /// Wall-clock time spent across the whole attempt loop, including
    /// backoff sleeps, regardless of outcome (spec.md §4.4 step 4).
    pub duration_ms: u64,
}

/// Failures intrinsic to running the attempt loop itself, as opposed to the
/// step's own business failure (which is carried inside [`StepOutcome`]).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error("unknown dependency {0:?} referenced while building step input")]
    UnknownDependency(String),
}

/// Build a step's input by overlaying, last-writer-wins:
/// 1. the workflow's original input,
/// 2. each dependency's output, both flattened into the root and nested
///    under the dependency's own id,
/// 3. the workflow's accumulated context.
pub fn build_step_input(
    step: &StepDefinition,
    workflow: &WorkflowInstance,
) -> Result<ValueMap, RunnerError> {
    let mut input = workflow.input.clone();

    for dep_id in &step.depends_on {
        let dep_instance = workflow
            .step(dep_id)
            .ok_or_else(|| RunnerError::UnknownDependency(dep_id.clone()))?;

        overlay(&mut input, &dep_instance.output);

        let mut nested = ValueMap::new();
        nested.insert(
            dep_id.clone(),
            serde_json::to_value(&dep_instance.output).unwrap_or(serde_json::Value::Null),
        );
        overlay(&mut input, &nested);
    }

    overlay(&mut input, &workflow.context);
    Ok(input)
}

/// Run a step's executor through its full retry loop.
///
/// Each attempt gets its own child [`Scope`] so a per-attempt timeout can
/// cancel that attempt alone without tearing down the workflow's scope.
/// Cancellation of the outer scope is never retried, regardless of the
/// step's retry policy.
#[instrument(skip(step, scope, input), fields(step_id = %step.id))]
pub async fn run_step(step: &StepDefinition, scope: &Scope, input: ValueMap) -> StepRun {
    let policy = step.effective_retry_policy();
    let mut attempt: u32 = 0;
    let start = Instant::now();
    let finish = |outcome: StepOutcome, attempts: u32| StepRun {
        outcome,
        attempts,
        duration_ms: start.elapsed().as_millis() as u64,
    };

    loop {
        if scope.is_cancelled() {
            return finish(StepOutcome::Cancelled, attempt + 1);
        }

        let delay = policy.delay_for_attempt(attempt);
        if !delay.is_zero() {
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retry backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scope.cancelled() => return finish(StepOutcome::Cancelled, attempt + 1),
            }
        }

        let attempt_scope = scope.child_token();
        let attempt_result = match step.timeout {
            Some(timeout) => run_with_timeout(step, &attempt_scope, input.clone(), timeout).await,
            None => step.executor.execute(&attempt_scope, input.clone()).await,
        };

        match attempt_result {
            Ok(output) => return finish(StepOutcome::Completed { output }, attempt + 1),
            Err(error) => {
                warn!(attempt, error = %error.message, "step attempt failed");

                if scope.is_cancelled() {
                    return finish(StepOutcome::Cancelled, attempt + 1);
                }

                let retryable = policy.is_retryable(&error.message);
                let has_more = policy.has_attempts_remaining(attempt + 1);

                if retryable && has_more {
                    attempt += 1;
                    continue;
                }

                let outcome = if step.required {
                    StepOutcome::Failed { error: error.message }
                } else {
                    StepOutcome::Skipped { error: error.message }
                };
                return finish(outcome, attempt + 1);
            }
        }
    }
}

async fn run_with_timeout(
    step: &StepDefinition,
    attempt_scope: &Scope,
    input: ValueMap,
    timeout: Duration,
) -> Result<ValueMap, ExecutionError> {
    match tokio::time::timeout(timeout, step.executor.execute(attempt_scope, input)).await {
        Ok(result) => result,
        Err(_) => {
            attempt_scope.cancel();
            Err(ExecutionError::new(format!(
                "step {:?} timed out after {:?}",
                step.id, timeout
            )))
        }
    }
}

/// Total number of attempts a retry policy would allow, useful for tests and
/// callers that want to pre-size tracking structures.
pub fn max_attempts(policy: &RetryPolicy) -> u32 {
    policy.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::executor_fn;
    use crate::model::WorkflowInstance;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn workflow_with(input: ValueMap, context: ValueMap) -> WorkflowInstance {
        let mut wf = WorkflowInstance::new("wf-1", "def", input, ValueMap::new());
        wf.context = context;
        wf
    }

    #[test]
    fn build_step_input_overlays_workflow_input_then_dependency_then_context() {
        let step = StepDefinition::new("b", "B", executor_fn(|_s, i| async move { Ok(i) }))
            .with_dependency("a");

        let mut input = ValueMap::new();
        input.insert("x".to_string(), json!(1));
        input.insert("y".to_string(), json!("input"));

        let mut context = ValueMap::new();
        context.insert("y".to_string(), json!("context"));

        let mut workflow = workflow_with(input, context);
        let mut a = crate::model::StepInstance::new("i-a", "a", "wf-1", 0);
        a.output.insert("y".to_string(), json!("dep-output"));
        a.output.insert("z".to_string(), json!(true));
        workflow.steps.push(a);

        let built = build_step_input(&step, &workflow).unwrap();
        assert_eq!(built.get("x"), Some(&json!(1)));
        assert_eq!(built.get("z"), Some(&json!(true)));
        // context overlays both input and dependency output
        assert_eq!(built.get("y"), Some(&json!("context")));
        // nested dependency output is also available under its own id
        assert!(built.get("a").is_some());
    }

    #[test]
    fn build_step_input_errors_on_unknown_dependency() {
        let step = StepDefinition::new("b", "B", executor_fn(|_s, i| async move { Ok(i) }))
            .with_dependency("ghost");
        let workflow = workflow_with(ValueMap::new(), ValueMap::new());
        assert!(matches!(
            build_step_input(&step, &workflow),
            Err(RunnerError::UnknownDependency(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let step = StepDefinition::new(
            "a",
            "A",
            executor_fn(|_s, _i| async move { Ok(ValueMap::new()) }),
        );
        let scope = Scope::new();
        let run = run_step(&step, &scope, ValueMap::new()).await;
        assert!(matches!(run.outcome, StepOutcome::Completed { .. }));
        assert_eq!(run.attempts, 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_for_closure = calls.clone();
        let executor = executor_fn(move |_s, _i| {
            let calls = calls_for_closure.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ExecutionError::new("transient"))
                } else {
                    Ok(ValueMap::new())
                }
            }
        });
        let step = StepDefinition::new("a", "A", executor).with_retry_policy(
            RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_initial_interval(Duration::from_millis(1))
                .with_max_interval(Duration::from_millis(5))
                .with_multiplier(2.0),
        );
        let scope = Scope::new();
        let run = run_step(&step, &scope, ValueMap::new()).await;
        assert!(matches!(run.outcome, StepOutcome::Completed { .. }));
        assert_eq!(run.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn required_step_exhausting_retries_fails() {
        let executor = executor_fn(|_s, _i| async move { Err(ExecutionError::new("boom")) });
        let step = StepDefinition::new("a", "A", executor)
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(1), 2));
        let scope = Scope::new();
        let run = run_step(&step, &scope, ValueMap::new()).await;
        assert!(matches!(run.outcome, StepOutcome::Failed { .. }));
        assert_eq!(run.attempts, 2);
    }

    #[tokio::test]
    async fn optional_step_exhausting_retries_is_skipped_not_failed() {
        let executor = executor_fn(|_s, _i| async move { Err(ExecutionError::new("boom")) });
        let step = StepDefinition::new("a", "A", executor)
            .required(false)
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(1), 1));
        let scope = Scope::new();
        let run = run_step(&step, &scope, ValueMap::new()).await;
        assert!(matches!(run.outcome, StepOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_for_closure = calls.clone();
        let executor = executor_fn(move |_s, _i| {
            let calls = calls_for_closure.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExecutionError::new("fatal: do not retry"))
            }
        });
        let step = StepDefinition::new("a", "A", executor).with_retry_policy(
            RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_initial_interval(Duration::from_millis(1))
                .with_max_interval(Duration::from_millis(5))
                .with_multiplier(2.0)
                .with_retryable_error("transient"),
        );
        let scope = Scope::new();
        let run = run_step(&step, &scope, ValueMap::new()).await;
        assert!(matches!(run.outcome, StepOutcome::Failed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_cancels_the_attempt_and_is_not_retried_forever() {
        let executor = executor_fn(|scope, _i| async move {
            scope.cancelled().await;
            Err(ExecutionError::new("should not reach here"))
        });
        let step = StepDefinition::new("a", "A", executor)
            .with_timeout(Duration::from_millis(5))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(1), 2));
        let scope = Scope::new();
        let run = run_step(&step, &scope, ValueMap::new()).await;
        assert!(matches!(run.outcome, StepOutcome::Failed { .. }));
    }
}
