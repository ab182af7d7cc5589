//! Definition validation: acyclicity, reference integrity, required fields
//!
//! Runs once at registration (`spec.md` §4.1, §9 "Cycle prevention"). Since
//! definitions are immutable after registration, the check never needs to be
//! repeated at start.

use std::collections::{HashMap, HashSet};

use crate::model::WorkflowDefinition;

/// A definition failed validation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow identifier must not be empty")]
    EmptyWorkflowId,

    #[error("workflow name must not be empty")]
    EmptyWorkflowName,

    #[error("workflow {0:?} has no steps")]
    NoSteps(String),

    #[error("step identifier must not be empty")]
    EmptyStepId,

    #[error("step name must not be empty: {0:?}")]
    EmptyStepName(String),

    #[error("duplicate step id {0:?}")]
    DuplicateStepId(String),

    #[error("step {0:?} depends on unknown step {1:?}")]
    UnknownDependency(String, String),

    #[error("dependency cycle detected involving step {0:?}")]
    Cycle(String),
}

/// Validate a workflow definition: non-empty identifiers and name, at least
/// one step, unique step ids, dependencies that resolve within the same
/// workflow, and an acyclic dependency graph.
pub fn validate(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    if definition.id.trim().is_empty() {
        return Err(ValidationError::EmptyWorkflowId);
    }
    if definition.name.trim().is_empty() {
        return Err(ValidationError::EmptyWorkflowName);
    }
    if definition.steps.is_empty() {
        return Err(ValidationError::NoSteps(definition.id.clone()));
    }

    let mut seen = HashSet::new();
    for step in &definition.steps {
        if step.id.trim().is_empty() {
            return Err(ValidationError::EmptyStepId);
        }
        if step.name.trim().is_empty() {
            return Err(ValidationError::EmptyStepName(step.id.clone()));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &definition.steps {
        for dep in &step.depends_on {
            if definition.step(dep).is_none() {
                return Err(ValidationError::UnknownDependency(
                    step.id.clone(),
                    dep.clone(),
                ));
            }
        }
    }

    check_acyclic(definition)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Standard DFS-based cycle detection over the dependency graph: white/gray
/// (`Visiting`)/black (`Done`) coloring, reporting the step where a back-edge
/// was found.
fn check_acyclic(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for step in &definition.steps {
        if !marks.contains_key(step.id.as_str()) {
            visit(definition, &step.id, &mut marks)?;
        }
    }

    Ok(())
}

fn visit<'a>(
    definition: &'a WorkflowDefinition,
    step_id: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
) -> Result<(), ValidationError> {
    marks.insert(step_id, Mark::Visiting);

    let step = definition
        .step(step_id)
        .expect("reference integrity already checked");

    for dep in &step.depends_on {
        match marks.get(dep.as_str()) {
            Some(Mark::Visiting) => return Err(ValidationError::Cycle(dep.clone())),
            Some(Mark::Done) => continue,
            None => visit(definition, dep, marks)?,
        }
    }

    marks.insert(step_id, Mark::Done);
    Ok(())
}
