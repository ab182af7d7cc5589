//! Pure, I/O-free scheduling decisions over a workflow's step graph.
//!
//! Kept deliberately free of store access and `async`: given the definition
//! and the current instance state, these functions decide which steps are
//! ready to run next. The runner and engine own all I/O.

use crate::model::{StepDefinition, StepInstance, StepStatus, WorkflowDefinition};

/// The scheduler could make no progress: every pending step is blocked on a
/// dependency that will never complete (itself failed or skipped).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("no progress possible: steps {0:?} are blocked on a dependency that did not complete")]
pub struct NoProgress(pub Vec<String>);

/// One wave of steps ready to execute: the sequential ones (in priority
/// order, highest first) followed by the parallel-eligible batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyWave {
    pub sequential: Vec<String>,
    pub parallel: Vec<String>,
}

impl ReadyWave {
    pub fn is_empty(&self) -> bool {
        self.sequential.is_empty() && self.parallel.is_empty()
    }
}

fn dependency_satisfied(status: StepStatus) -> bool {
    matches!(status, StepStatus::Completed | StepStatus::Skipped)
}

fn dependency_dead(status: StepStatus) -> bool {
    matches!(status, StepStatus::Failed)
}

/// A step is ready when it is still `Pending` and every dependency has
/// completed or been skipped.
fn is_ready(step: &StepDefinition, instances: &[StepInstance]) -> bool {
    let own = instances.iter().find(|i| i.step_definition_id == step.id);
    if !matches!(own.map(|i| i.status), None | Some(StepStatus::Pending)) {
        return false;
    }

    step.depends_on.iter().all(|dep_id| {
        instances
            .iter()
            .find(|i| i.step_definition_id == *dep_id)
            .map(|i| dependency_satisfied(i.status))
            .unwrap_or(false)
    })
}

/// A pending step is permanently blocked when any dependency failed (and the
/// dependency chain can never resolve to `Completed`/`Skipped`).
fn is_blocked(step: &StepDefinition, instances: &[StepInstance]) -> bool {
    let own = instances.iter().find(|i| i.step_definition_id == step.id);
    if !matches!(own.map(|i| i.status), None | Some(StepStatus::Pending)) {
        return false;
    }

    step.depends_on.iter().any(|dep_id| {
        instances
            .iter()
            .find(|i| i.step_definition_id == *dep_id)
            .map(|i| dependency_dead(i.status))
            .unwrap_or(false)
    })
}

/// Whether every step has reached a terminal status.
pub fn is_complete(definition: &WorkflowDefinition, instances: &[StepInstance]) -> bool {
    definition.steps.iter().all(|step| {
        instances
            .iter()
            .find(|i| i.step_definition_id == step.id)
            .map(|i| i.status.is_terminal())
            .unwrap_or(false)
    })
}

/// Compute the next ready wave. Sequential steps (in descending priority
/// order, ties broken by definition order) run one at a time; parallel
/// ones are returned together for the caller to fan out.
///
/// Returns `Ok(empty wave)` once every step is terminal. Returns
/// [`NoProgress`] when no step is ready, none is running, and at least one
/// pending step remains — the graph can never finish.
pub fn next_ready_wave(
    definition: &WorkflowDefinition,
    instances: &[StepInstance],
) -> Result<ReadyWave, NoProgress> {
    if is_complete(definition, instances) {
        return Ok(ReadyWave::default());
    }

    let any_running = instances.iter().any(|i| {
        matches!(i.status, StepStatus::Running | StepStatus::Retrying)
    });

    let mut ready: Vec<&StepDefinition> = definition
        .steps
        .iter()
        .filter(|step| is_ready(step, instances))
        .collect();

    if ready.is_empty() {
        if any_running {
            return Ok(ReadyWave::default());
        }

        let blocked: Vec<String> = definition
            .steps
            .iter()
            .filter(|step| is_blocked(step, instances))
            .map(|step| step.id.clone())
            .collect();

        return if blocked.is_empty() {
            Ok(ReadyWave::default())
        } else {
            Err(NoProgress(blocked))
        };
    }

    ready.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut wave = ReadyWave::default();
    for step in ready {
        if step.parallel_eligible {
            wave.parallel.push(step.id.clone());
        } else {
            wave.sequential.push(step.id.clone());
        }
    }
    Ok(wave)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::executor_fn;
    use std::sync::Arc;

    fn noop_executor() -> Arc<dyn crate::executor::Executor> {
        executor_fn(|_scope, _input| async move { Ok(Default::default()) })
    }

    fn def(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "wf", steps)
    }

    fn pending(step_id: &str) -> StepInstance {
        let mut i = StepInstance::new(format!("i-{step_id}"), step_id, "wf-1", 0);
        i.status = StepStatus::Pending;
        i
    }

    fn with_status(step_id: &str, status: StepStatus) -> StepInstance {
        let mut i = pending(step_id);
        i.status = status;
        i
    }

    #[test]
    fn single_root_step_is_ready_immediately() {
        let definition = def(vec![StepDefinition::new("a", "A", noop_executor())]);
        let instances = vec![pending("a")];
        let wave = next_ready_wave(&definition, &instances).unwrap();
        assert_eq!(wave.sequential, vec!["a".to_string()]);
    }

    #[test]
    fn dependent_step_waits_for_completion() {
        let definition = def(vec![
            StepDefinition::new("a", "A", noop_executor()),
            StepDefinition::new("b", "B", noop_executor()).with_dependency("a"),
        ]);
        let instances = vec![pending("a"), pending("b")];
        let wave = next_ready_wave(&definition, &instances).unwrap();
        assert_eq!(wave.sequential, vec!["a".to_string()]);

        let instances = vec![with_status("a", StepStatus::Completed), pending("b")];
        let wave = next_ready_wave(&definition, &instances).unwrap();
        assert_eq!(wave.sequential, vec!["b".to_string()]);
    }

    #[test]
    fn skipped_dependency_unblocks_downstream() {
        let definition = def(vec![
            StepDefinition::new("a", "A", noop_executor()).required(false),
            StepDefinition::new("b", "B", noop_executor()).with_dependency("a"),
        ]);
        let instances = vec![with_status("a", StepStatus::Skipped), pending("b")];
        let wave = next_ready_wave(&definition, &instances).unwrap();
        assert_eq!(wave.sequential, vec!["b".to_string()]);
    }

    #[test]
    fn failed_required_dependency_blocks_forever_and_reports_no_progress() {
        let definition = def(vec![
            StepDefinition::new("a", "A", noop_executor()),
            StepDefinition::new("b", "B", noop_executor()).with_dependency("a"),
        ]);
        let instances = vec![with_status("a", StepStatus::Failed), pending("b")];
        let err = next_ready_wave(&definition, &instances).unwrap_err();
        assert_eq!(err.0, vec!["b".to_string()]);
    }

    #[test]
    fn ready_steps_are_partitioned_by_parallel_eligibility() {
        let definition = def(vec![
            StepDefinition::new("a", "A", noop_executor()),
            StepDefinition::new("b", "B", noop_executor()).parallel_eligible(true),
            StepDefinition::new("c", "C", noop_executor()).parallel_eligible(true),
        ]);
        let instances = vec![pending("a"), pending("b"), pending("c")];
        let wave = next_ready_wave(&definition, &instances).unwrap();
        assert_eq!(wave.sequential, vec!["a".to_string()]);
        assert_eq!(wave.parallel.len(), 2);
        assert!(wave.parallel.contains(&"b".to_string()));
        assert!(wave.parallel.contains(&"c".to_string()));
    }

    #[test]
    fn sequential_steps_ordered_by_descending_priority() {
        let definition = def(vec![
            StepDefinition::new("low", "Low", noop_executor()).with_priority(1),
            StepDefinition::new("high", "High", noop_executor()).with_priority(10),
            StepDefinition::new("mid", "Mid", noop_executor()).with_priority(5),
        ]);
        let instances = vec![pending("low"), pending("high"), pending("mid")];
        let wave = next_ready_wave(&definition, &instances).unwrap();
        assert_eq!(
            wave.sequential,
            vec!["high".to_string(), "mid".to_string(), "low".to_string()]
        );
    }

    #[test]
    fn empty_wave_once_all_steps_terminal() {
        let definition = def(vec![StepDefinition::new("a", "A", noop_executor())]);
        let instances = vec![with_status("a", StepStatus::Completed)];
        let wave = next_ready_wave(&definition, &instances).unwrap();
        assert!(wave.is_empty());
        assert!(is_complete(&definition, &instances));
    }

    #[test]
    fn empty_wave_while_a_step_is_still_running() {
        let definition = def(vec![
            StepDefinition::new("a", "A", noop_executor()),
            StepDefinition::new("b", "B", noop_executor()),
        ]);
        let instances = vec![with_status("a", StepStatus::Running), pending("b")];
        let wave = next_ready_wave(&definition, &instances).unwrap();
        assert_eq!(wave.sequential, vec!["b".to_string()]);

        let definition = def(vec![StepDefinition::new("a", "A", noop_executor())]);
        let instances = vec![with_status("a", StepStatus::Running)];
        let wave = next_ready_wave(&definition, &instances).unwrap();
        assert!(wave.is_empty());
    }
}
