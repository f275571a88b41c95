//! Definition Parser
//!
//! Loads workflow, app and job documents from YAML. Missing ids are
//! generated, step names are taken from their mapping keys, and workflows
//! are validated and numbered before being returned.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;
use uuid::Uuid;

use super::model::{AppDef, JobDef, WorkflowDef};
use super::validator::validate_workflow;
use crate::error::DefinitionError;

pub(crate) fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn read(path: &Path, what: &str) -> Result<String, DefinitionError> {
    fs::read_to_string(path).map_err(|e| DefinitionError::Parse {
        what: format!("{} file '{}'", what, path.display()),
        reason: e.to_string(),
    })
}

fn parse_error(what: &str, e: serde_yaml::Error) -> DefinitionError {
    DefinitionError::Parse {
        what: what.to_string(),
        reason: e.to_string(),
    }
}

/// Parses and validates a workflow document.
pub fn parse_workflow(text: &str) -> Result<WorkflowDef, DefinitionError> {
    let mut workflow: WorkflowDef =
        serde_yaml::from_str(text).map_err(|e| parse_error("workflow", e))?;

    if workflow.workflow_id.is_empty() {
        workflow.workflow_id = new_id();
    }

    for (name, step) in workflow.steps.iter_mut() {
        step.name = name.clone();
        if step.step_id.is_empty() {
            step.step_id = new_id();
        }
    }

    for input in workflow.inputs.values_mut() {
        if input.value.is_empty() {
            input.value = input.default.clone();
        }
    }
    for param in workflow.parameters.values_mut() {
        if param.value.is_null() {
            param.value = param.default.clone();
        }
    }

    validate_workflow(&mut workflow)?;
    Ok(workflow)
}

/// Loads a workflow from a YAML file.
///
/// ```rust,no_run
/// use pipeflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("workflow.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDef, DefinitionError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());
    let text = read(path, "workflow")?;
    debug!("Workflow YAML loaded ({} bytes)", text.len());
    parse_workflow(&text)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AppsDocument {
    List(Vec<AppDef>),
    Named(BTreeMap<String, AppDef>),
}

/// Parses app definitions, given either as a list or as a mapping keyed by
/// app name. Returns them keyed by name.
pub fn parse_apps(text: &str) -> Result<BTreeMap<String, AppDef>, DefinitionError> {
    let document: AppsDocument = serde_yaml::from_str(text).map_err(|e| parse_error("apps", e))?;

    let apps: Vec<AppDef> = match document {
        AppsDocument::List(list) => list,
        AppsDocument::Named(named) => named
            .into_iter()
            .map(|(name, mut app)| {
                if app.name.is_empty() {
                    app.name = name;
                }
                app
            })
            .collect(),
    };

    let mut by_name = BTreeMap::new();
    for mut app in apps {
        if app.name.is_empty() {
            return Err(DefinitionError::Parse {
                what: "apps".to_string(),
                reason: "app without a name".to_string(),
            });
        }
        if app.app_id.is_empty() {
            app.app_id = new_id();
        }
        by_name.insert(app.name.clone(), app);
    }
    Ok(by_name)
}

pub fn load_apps(path: impl AsRef<Path>) -> Result<BTreeMap<String, AppDef>, DefinitionError> {
    let path = path.as_ref();
    info!("Loading apps from: {}", path.display());
    parse_apps(&read(path, "apps")?)
}

/// Parses a job document, generating a job id when none is given.
pub fn parse_job(text: &str) -> Result<JobDef, DefinitionError> {
    let mut job: JobDef = serde_yaml::from_str(text).map_err(|e| parse_error("job", e))?;
    if job.job_id.is_empty() {
        job.job_id = new_id();
    }
    if job.name.is_empty() {
        job.name = format!("job-{}", job.short_id());
    }
    Ok(job)
}

pub fn load_job(path: impl AsRef<Path>) -> Result<JobDef, DefinitionError> {
    let path = path.as_ref();
    info!("Loading job from: {}", path.display());
    parse_job(&read(path, "job")?)
}

/// Fails if a step of `workflow` names an app missing from `apps`.
pub fn check_apps(
    workflow: &WorkflowDef,
    apps: &BTreeMap<String, AppDef>,
) -> Result<(), DefinitionError> {
    match workflow.steps.values().find(|s| !apps.contains_key(&s.app)) {
        Some(step) => Err(DefinitionError::UnknownApp(step.app.clone())),
        None => Ok(()),
    }
}
