//! Workflow Validation
//!
//! Structural checks on a workflow definition plus step numbering:
//! - every step names an app and has an `output` template key
//! - dependencies and final outputs point at existing steps
//! - step and input names slug to distinct, non-empty folder names
//! - no cyclic dependencies
//! - `number`/`letter` assigned from the shared topological traversal

use std::collections::BTreeMap;

use log::{debug, info};

use super::model::{WorkflowDef, ROOT_DEPEND};
use super::topo::stable_order;
use crate::error::DefinitionError;
use crate::slug::slugify;

/// Returns every structural problem of `workflow`, cycles excluded.
pub fn collect_errors(workflow: &WorkflowDef) -> Vec<DefinitionError> {
    let mut errors = Vec::new();

    if workflow.steps.is_empty() {
        errors.push(DefinitionError::EmptyWorkflow);
        return errors;
    }

    for (name, step) in &workflow.steps {
        if step.app.trim().is_empty() {
            errors.push(DefinitionError::MissingApp { step: name.clone() });
        }

        if !step.template.contains_key("output") {
            errors.push(DefinitionError::MissingOutput { step: name.clone() });
        }

        for depend in &step.depend {
            if depend != ROOT_DEPEND && !workflow.steps.contains_key(depend) {
                errors.push(DefinitionError::MissingDependency {
                    step: name.clone(),
                    depend: depend.clone(),
                });
            }
        }

        if step.dependencies().next().is_none() {
            debug!("Step '{}' is a root step", name);
        }
    }

    for name in &workflow.final_output {
        if !workflow.steps.contains_key(name) {
            errors.push(DefinitionError::UnknownFinalOutput(name.clone()));
        }
    }

    check_folder_names("step", workflow.steps.keys(), &mut errors);
    check_folder_names("input", workflow.inputs.keys(), &mut errors);

    errors
}

/// Names become work folders through [`slugify`]; each must be non-empty
/// and unique within its kind.
fn check_folder_names<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a String>,
    errors: &mut Vec<DefinitionError>,
) {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for name in names {
        let slug = slugify(name);
        if slug.is_empty() {
            errors.push(DefinitionError::EmptySlug {
                kind,
                name: name.clone(),
            });
            continue;
        }
        match seen.get(&slug) {
            Some(first) => errors.push(DefinitionError::SlugCollision {
                kind,
                first: first.to_string(),
                second: name.clone(),
                slug,
            }),
            None => {
                seen.insert(slug, name);
            }
        }
    }
}

/// Validates `workflow` and assigns step numbers and letters.
///
/// Stops at the first structural problem.
pub fn validate_workflow(workflow: &mut WorkflowDef) -> Result<(), DefinitionError> {
    info!(
        "Validating workflow '{}' with {} steps",
        workflow.name,
        workflow.steps.len()
    );

    if let Some(first) = collect_errors(workflow).into_iter().next() {
        return Err(first);
    }

    calculate_step_numbering(workflow)?;

    info!("Workflow '{}' validated", workflow.name);
    Ok(())
}

/// Numbers steps by longest distance from a root (roots are 1).
///
/// Steps sharing a number get letters `a`, `b`, `c`... in name order; a
/// step alone at its number gets no letter.
pub fn calculate_step_numbering(workflow: &mut WorkflowDef) -> Result<(), DefinitionError> {
    let edges: Vec<(&str, &str)> = workflow
        .steps
        .iter()
        .flat_map(|(name, step)| step.dependencies().map(move |d| (d, name.as_str())))
        .collect();

    let sorted = stable_order(workflow.steps.keys().map(|k| k.as_str()), edges)
        .map_err(DefinitionError::Cycle)?;

    let mut by_number: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for name in &sorted.order {
        let level = sorted.levels.get(name).copied().unwrap_or(0);
        by_number.entry(level + 1).or_default().push(name.clone());
    }

    for (number, mut names) in by_number {
        names.sort();
        let lettered = names.len() > 1;
        for (index, name) in names.iter().enumerate() {
            if let Some(step) = workflow.steps.get_mut(name) {
                step.number = number as u32;
                step.letter = if lettered {
                    sibling_letter(index)
                } else {
                    String::new()
                };
                debug!("Step '{}' numbered {}", name, step.label());
            }
        }
    }

    Ok(())
}

/// `0 -> a`, `25 -> z`, `26 -> aa`...
fn sibling_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'a' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}
