//! Executor and compensator capabilities, and the cancellable scope they run in
//!
//! An executor is the unit of work a step performs: it takes a cancellable
//! [`Scope`] and an input mapping, and produces either an output mapping or
//! a failure. A compensator is its caller-invoked inverse, used for
//! saga-style rollback (see [`crate::model::StepDefinition::compensator`]).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::ValueMap;

/// Error returned by a failed executor or compensator invocation.
///
/// Retry eligibility is decided entirely by [`crate::RetryPolicy`] matching
/// substrings against `message` — the error itself carries no retryable
/// flag.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for ExecutionError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ExecutionError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// A cancellable execution scope, optionally carrying caller-supplied values.
///
/// Every executor invocation and retry sleep takes a `&Scope` and must honor
/// its cancellation signal (the `Store` trait does not — see its module
/// doc comment for why). Scopes form a tree: [`Scope::child_token`] produces
/// a scope that is cancelled whenever its parent is, in addition to any
/// cancellation of its own (used to build the per-attempt timeout scope).
/// A scope may also carry a string-keyed value map (e.g. `trace_id`), used
/// by [`crate::Engine::start_workflow`] as a fallback when the same key is
/// absent from the caller-supplied metadata map.
#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
    values: Arc<ValueMap>,
}

impl Scope {
    /// A fresh, unlinked root scope with no values.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            values: Arc::new(ValueMap::new()),
        }
    }

    /// A fresh root scope carrying the given values.
    pub fn with_values(values: ValueMap) -> Self {
        Self {
            token: CancellationToken::new(),
            values: Arc::new(values),
        }
    }

    /// Look up a value carried by this scope.
    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// A child scope: cancelling it does not affect the parent, but
    /// cancelling the parent cancels it too. Inherits the parent's values.
    pub fn child_token(&self) -> Self {
        Self {
            token: self.token.child_token(),
            values: Arc::clone(&self.values),
        }
    }

    /// Request cancellation of this scope (and all its children).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// The unit of work a step performs.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Run the step, producing an output mapping or a failure.
    async fn execute(&self, scope: &Scope, input: ValueMap) -> Result<ValueMap, ExecutionError>;
}

/// A step's caller-invoked rollback operation.
///
/// The core engine never calls this automatically (see spec.md §4.4 and the
/// open question in §9) — it is exposed for saga-style compensation driven
/// by the caller.
#[async_trait]
pub trait Compensator: Send + Sync + 'static {
    /// Undo the effects of a previously-completed step.
    async fn compensate(&self, scope: &Scope, input: ValueMap) -> Result<(), ExecutionError>;
}

/// Adapts a plain async function into an [`Executor`], so callers registering
/// a step inline don't have to hand-write a struct and an `impl Executor`.
struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(Scope, ValueMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ValueMap, ExecutionError>> + Send + 'static,
{
    async fn execute(&self, scope: &Scope, input: ValueMap) -> Result<ValueMap, ExecutionError> {
        (self.f)(scope.clone(), input).await
    }
}

/// Build an [`Executor`] from an async closure.
///
/// # Example
///
/// ```
/// use durable_flow::{executor_fn, ExecutionError};
/// use serde_json::json;
///
/// let step = executor_fn(|_scope, _input| async move {
///     Ok([("r".to_string(), json!("ok"))].into_iter().collect())
/// });
/// ```
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn Executor>
where
    F: Fn(Scope, ValueMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ValueMap, ExecutionError>> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}

/// Build a [`Compensator`] from an async closure, the same way
/// [`executor_fn`] builds an [`Executor`].
struct FnCompensator<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Compensator for FnCompensator<F>
where
    F: Fn(Scope, ValueMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
{
    async fn compensate(&self, scope: &Scope, input: ValueMap) -> Result<(), ExecutionError> {
        (self.f)(scope.clone(), input).await
    }
}

pub fn compensator_fn<F, Fut>(f: F) -> Arc<dyn Compensator>
where
    F: Fn(Scope, ValueMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
{
    Arc::new(FnCompensator { f })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn executor_fn_runs_closure() {
        let exec = executor_fn(|_scope, input| async move {
            let mut out = input;
            out.insert("seen".to_string(), json!(true));
            Ok(out)
        });

        let scope = Scope::new();
        let input: ValueMap = [("x".to_string(), json!(1))].into_iter().collect();
        let output = exec.execute(&scope, input).await.unwrap();

        assert_eq!(output.get("seen"), Some(&json!(true)));
    }

    #[test]
    fn child_scope_inherits_parent_cancellation() {
        let parent = Scope::new();
        let child = parent.child_token();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_does_not_cancel_parent() {
        let parent = Scope::new();
        let child = parent.child_token();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
