//! Step Unit
//!
//! One workflow step bound to its execution backend. The driver calls the
//! lifecycle methods in order:
//!
//! 1. [`WorkflowStep::initialize`]: create the output location, check
//!    dependencies, build the back-reference table, parse the map source
//! 2. [`WorkflowStep::iterate_map_uri`]: expand the map source into items
//! 3. [`WorkflowStep::run`]: launch every item
//! 4. [`WorkflowStep::check_running_jobs`] until [`WorkflowStep::all_done`],
//!    with [`WorkflowStep::retry_failed`] when an item failed
//! 5. [`WorkflowStep::clean_up`] then [`WorkflowStep::stage`]
//!
//! Every fatal error goes through one path that persists ERROR with the
//! message before returning the error.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::backend::{ExecBackend, Invocation, ItemStatus, RunRecord};
use super::local::LOG_FOLDER;
use super::registry::ContextRegistry;
use crate::error::{BackendError, DefinitionError, StagingError, StepError};
use crate::logging::LogContext;
use crate::slug::slugify;
use crate::staging::StageableData;
use crate::store::JobStore;
use crate::uri::Uri;
use crate::workflow::model::{AppDef, Status, StepDef};
use crate::workflow::template::{expand_template, parse_reference, references, Reference};

/// Filename of the single item of a step without a map source.
pub const ROOT_ITEM: &str = "root";

/// The only variable a step reference may name.
const OUTPUT_VAR: &str = "output";

/// Job-wide handles shared by every unit of a job.
#[derive(Clone)]
pub struct JobScope {
    pub job_id: String,
    pub registry: Arc<ContextRegistry>,
    pub store: Arc<dyn JobStore>,
    pub log: LogContext,
}

/// Everything the graph builder resolves for one step.
#[derive(Debug, Clone)]
pub struct StepSetup {
    pub step: StepDef,
    pub app: AppDef,
    /// Output location per context; must contain `source_context`
    pub uris: BTreeMap<String, String>,
    pub source_context: String,
    /// Workflow input locations as seen from `source_context`
    pub inputs: BTreeMap<String, Uri>,
    /// Workflow parameters rendered as text
    pub parameters: BTreeMap<String, String>,
    /// Output location of each declared dependency in `source_context`
    pub depend_uris: BTreeMap<String, Uri>,
    /// Remove a pre-existing output location during initialization
    pub clean: bool,
}

/// One unit of fan-out work.
#[derive(Debug)]
pub struct MapItem {
    pub filename: String,
    /// Positional captures, `{1}`, `{2}`...
    pub replace: BTreeMap<String, String>,
    /// Step template with every reference expanded
    pub template: BTreeMap<String, Value>,
    pub status: ItemStatus,
    pub attempt: u32,
    /// One record per attempt, indexed by attempt number
    pub run: Vec<RunRecord>,
}

impl MapItem {
    fn new(filename: impl Into<String>, replace: BTreeMap<String, String>) -> Self {
        Self {
            filename: filename.into(),
            replace,
            template: BTreeMap::new(),
            status: ItemStatus::Pending,
            attempt: 0,
            run: Vec::new(),
        }
    }
}

/// Listing location and filter of a mapped step.
#[derive(Debug, Clone)]
struct MapSource {
    uri: Uri,
    regex: Regex,
}

/// Status summary of a step.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StepStatus {
    pub id: String,
    pub name: String,
    pub map: BTreeMap<String, ItemStatus>,
}

pub struct WorkflowStep {
    step: StepDef,
    app: AppDef,
    staging: StageableData,
    inputs: BTreeMap<String, Uri>,
    parameters: BTreeMap<String, String>,
    depend_uris: BTreeMap<String, Uri>,
    clean: bool,
    exec: Arc<dyn ExecBackend>,
    scope: JobScope,
    log: LogContext,
    replace: BTreeMap<String, String>,
    map_source: Option<MapSource>,
    items: Vec<MapItem>,
    status: Status,
    initialized: bool,
}

impl WorkflowStep {
    /// Binds a step to the backend of its execution context.
    pub fn new(setup: StepSetup, scope: JobScope) -> Result<Self, StepError> {
        let exec = scope.registry.exec(&setup.step.execution.context)?;
        let log = scope.log.child(&slugify(&setup.step.name));
        let staging = StageableData::new(setup.uris, setup.source_context, setup.clean)
            .with_log(log.clone());

        Ok(Self {
            step: setup.step,
            app: setup.app,
            staging,
            inputs: setup.inputs,
            parameters: setup.parameters,
            depend_uris: setup.depend_uris,
            clean: setup.clean,
            exec,
            scope,
            log,
            replace: BTreeMap::new(),
            map_source: None,
            items: Vec::new(),
            status: Status::Pending,
            initialized: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }

    pub fn step(&self) -> &StepDef {
        &self.step
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn items(&self) -> &[MapItem] {
        &self.items
    }

    /// Back-reference table built during initialization.
    pub fn replacements(&self) -> &BTreeMap<String, String> {
        &self.replace
    }

    pub fn get_data_uri(&self, context: &str) -> Result<&Uri, StagingError> {
        self.staging.get_data_uri(context)
    }

    /// Canonical output location.
    pub fn data_uri(&self) -> Result<&Uri, StagingError> {
        self.staging.source_uri()
    }

    pub fn initialize(&mut self) -> Result<(), StepError> {
        let result = self.try_initialize();
        self.guard(result)
    }

    fn try_initialize(&mut self) -> Result<(), StepError> {
        self.staging.initialize()?;
        self.exec.validate(&self.step.name, &self.app)?;
        self.init_data_uri()?;
        self.validate_depend_uris()?;
        self.build_replace()?;
        self.parse_map_uri()?;
        self.initialized = true;

        debug!(
            target: self.log.target(),
            "Step '{}' initialized (app '{}', context '{}', output {})",
            self.step.name,
            self.app.name,
            self.exec.context(),
            self.staging.source_uri()?
        );
        Ok(())
    }

    /// Creates the output location and its log folder.
    fn init_data_uri(&mut self) -> Result<(), StepError> {
        let data_uri = self.staging.source_uri()?.clone();
        if data_uri.scheme() != self.exec.data_scheme() {
            return Err(BackendError::Rejected(format!(
                "output {} of step '{}' is not on scheme '{}' of context '{}'",
                data_uri,
                self.step.name,
                self.exec.data_scheme(),
                self.exec.context()
            ))
            .into());
        }

        let registry = &self.scope.registry;
        if self.clean && registry.exists(&data_uri)? {
            info!(target: self.log.target(), "Removing previous output {}", data_uri);
            if let Err(e) = registry.delete(&data_uri) {
                warn!(target: self.log.target(), "Cannot remove {}: {}", data_uri, e);
            }
        }

        registry.mkdir(&data_uri, true)?;
        registry.mkdir(&data_uri.join(LOG_FOLDER)?, true)?;
        Ok(())
    }

    /// Every declared dependency needs a location on this step's scheme.
    fn validate_depend_uris(&self) -> Result<(), DefinitionError> {
        let expected = self
            .staging
            .source_uri()
            .map(|uri| uri.scheme().to_string())
            .unwrap_or_default();

        for depend in self.step.dependencies() {
            let uri = self
                .depend_uris
                .get(depend)
                .ok_or_else(|| DefinitionError::MissingDependUri {
                    step: self.step.name.clone(),
                    depend: depend.to_string(),
                })?;

            if uri.scheme() != expected {
                return Err(DefinitionError::SchemeMismatch {
                    step: self.step.name.clone(),
                    depend: depend.to_string(),
                    found: uri.scheme().to_string(),
                    expected,
                });
            }
        }
        Ok(())
    }

    fn invalid_reference(&self, reference: &Reference, reason: &str) -> DefinitionError {
        DefinitionError::InvalidReference {
            step: self.step.name.clone(),
            reference: reference.token(),
            reason: reason.to_string(),
        }
    }

    /// Value substituted for one back-reference.
    fn resolve(&self, reference: &Reference) -> Result<String, DefinitionError> {
        if reference.is_workflow() {
            if let Some(uri) = self.inputs.get(&reference.var) {
                return Ok(uri.normalized_uri());
            }
            if let Some(value) = self.parameters.get(&reference.var) {
                return Ok(value.clone());
            }
            return Err(DefinitionError::UnknownVariable {
                step: self.step.name.clone(),
                name: reference.var.clone(),
            });
        }

        if !self.step.depends_on_step(&reference.name) {
            return Err(self.invalid_reference(reference, "step must be listed as a dependency"));
        }
        if reference.var != OUTPUT_VAR {
            return Err(self.invalid_reference(reference, "must reference 'output'"));
        }

        self.depend_uris
            .get(&reference.name)
            .map(Uri::normalized_uri)
            .ok_or_else(|| DefinitionError::MissingDependUri {
                step: self.step.name.clone(),
                depend: reference.name.clone(),
            })
    }

    fn build_replace(&mut self) -> Result<(), DefinitionError> {
        let mut replace = BTreeMap::new();
        for value in self.step.template.values() {
            let Value::String(text) = value else {
                continue;
            };
            for reference in references(text) {
                let resolved = self.resolve(&reference)?;
                replace.insert(reference.token(), resolved);
            }
        }
        self.replace = replace;
        Ok(())
    }

    fn parse_map_uri(&mut self) -> Result<(), DefinitionError> {
        if !self.step.map.is_mapped() {
            self.map_source = None;
            return Ok(());
        }

        let raw = &self.step.map.uri;
        let invalid = || DefinitionError::InvalidMapUri {
            step: self.step.name.clone(),
            uri: raw.clone(),
        };

        let reference = parse_reference(raw).ok_or_else(invalid)?;
        let uri = if reference.is_workflow() {
            self.inputs.get(&reference.var).cloned().ok_or_else(invalid)?
        } else {
            if !self.step.depends_on_step(&reference.name) {
                return Err(self.invalid_reference(&reference, "step must be listed as a dependency"));
            }
            if reference.var != OUTPUT_VAR {
                return Err(self.invalid_reference(&reference, "must reference 'output'"));
            }
            self.depend_uris
                .get(&reference.name)
                .cloned()
                .ok_or_else(|| DefinitionError::MissingDependUri {
                    step: self.step.name.clone(),
                    depend: reference.name.clone(),
                })?
        };

        // names must match from their first character
        let regex = Regex::new(&format!("^(?:{})", self.step.map.regex)).map_err(|e| {
            DefinitionError::InvalidRegex {
                step: self.step.name.clone(),
                regex: self.step.map.regex.clone(),
                reason: e.to_string(),
            }
        })?;

        self.map_source = Some(MapSource { uri, regex });
        Ok(())
    }

    pub fn iterate_map_uri(&mut self) -> Result<(), StepError> {
        let result = self.try_iterate_map_uri();
        self.guard(result)
    }

    fn try_iterate_map_uri(&mut self) -> Result<(), StepError> {
        if !self.initialized {
            return Err(StepError::NotInitialized);
        }

        let mut items = Vec::new();
        match &self.map_source {
            None => items.push(MapItem::new(ROOT_ITEM, BTreeMap::new())),
            Some(source) => {
                let mut names = self.scope.registry.list(&source.uri)?;
                if names.is_empty() {
                    return Err(DefinitionError::EmptyMapSource {
                        step: self.step.name.clone(),
                        uri: source.uri.to_string(),
                    }
                    .into());
                }
                names.sort();

                for name in names {
                    let Some(captures) = source.regex.captures(&name) else {
                        continue;
                    };
                    let replace = captures
                        .iter()
                        .skip(1)
                        .enumerate()
                        .map(|(i, group)| {
                            let text = group.map(|m| m.as_str().to_string()).unwrap_or_default();
                            (format!("{{{}}}", i + 1), text)
                        })
                        .collect();
                    items.push(MapItem::new(name, replace));
                }

                if items.is_empty() {
                    return Err(DefinitionError::NoMatchingItems {
                        step: self.step.name.clone(),
                        uri: source.uri.to_string(),
                        regex: self.step.map.regex.clone(),
                    }
                    .into());
                }
            }
        }

        for item in &mut items {
            let mut table = item.replace.clone();
            table.extend(self.replace.iter().map(|(k, v)| (k.clone(), v.clone())));
            item.template = expand_template(&self.step.template, &table);
        }

        info!(
            target: self.log.target(),
            "Step '{}': {} map item(s)",
            self.step.name,
            items.len()
        );
        self.items = items;
        Ok(())
    }

    /// Launches every map item. A single launch failure fails the step.
    pub fn run(&mut self) -> Result<(), StepError> {
        let result = self.try_run();
        self.guard(result)
    }

    fn try_run(&mut self) -> Result<(), StepError> {
        if self.items.is_empty() {
            return Err(StepError::NotExpanded);
        }
        let data_uri = self.staging.source_uri()?.clone();
        for index in 0..self.items.len() {
            self.launch(index, &data_uri)?;
        }
        self.update_status(Status::Running, "");
        Ok(())
    }

    fn launch(&mut self, index: usize, data_uri: &Uri) -> Result<(), StepError> {
        let item = &self.items[index];
        let invocation = Invocation {
            step: &self.step.name,
            item: &item.filename,
            app: &self.app,
            template: &item.template,
            data_uri,
            method: &self.step.execution.method,
            attempt: item.attempt,
        };

        let record = self
            .exec
            .launch(&invocation)
            .map_err(|source| StepError::Launch {
                item: item.filename.clone(),
                source,
            })?;

        debug!(
            target: self.log.target(),
            "Launched '{}' attempt {} ({})",
            item.filename,
            item.attempt,
            record.status
        );

        let item = &mut self.items[index];
        item.status = record.status;
        item.run.push(record);
        Ok(())
    }

    /// Polls every unsettled item once and persists the result.
    ///
    /// A poll error is recorded as UNKNOWN and the item is polled again.
    pub fn check_running_jobs(&mut self) {
        for item in &mut self.items {
            if item.status.is_terminal() {
                continue;
            }
            let Some(run) = item.run.last_mut() else {
                continue;
            };

            let status = match self.exec.poll(run) {
                Ok(status) => status,
                Err(e) => {
                    warn!(
                        target: self.log.target(),
                        "Cannot poll '{}' attempt {}: {}",
                        item.filename,
                        item.attempt,
                        e
                    );
                    ItemStatus::Unknown
                }
            };

            if status != item.status {
                debug!(
                    target: self.log.target(),
                    "'{}' {} -> {}",
                    item.filename,
                    item.status,
                    status
                );
            }
            run.status = status;
            item.status = status;
        }

        self.update_status(Status::Running, "");
    }

    /// Every item FINISHED, FAILED or STOPPED.
    pub fn all_done(&self) -> bool {
        self.items.iter().all(|item| item.status.is_terminal())
    }

    pub fn all_finished(&self) -> bool {
        self.items
            .iter()
            .all(|item| item.status == ItemStatus::Finished)
    }

    /// Any item FAILED or STOPPED.
    pub fn any_failed(&self) -> bool {
        self.items.iter().any(|item| item.status.is_failure())
    }

    /// Relaunches failed items while their attempt is below the backend's
    /// retry limit; an item at the limit fails the step.
    pub fn retry_failed(&mut self) -> Result<(), StepError> {
        let result = self.try_retry_failed();
        self.guard(result)
    }

    fn try_retry_failed(&mut self) -> Result<(), StepError> {
        let limit = self.exec.retry_limit();
        let data_uri = self.staging.source_uri()?.clone();

        for index in 0..self.items.len() {
            let item = &mut self.items[index];
            if !item.status.is_failure() {
                continue;
            }
            if item.attempt >= limit {
                return Err(StepError::RetryExhausted {
                    item: item.filename.clone(),
                    limit,
                });
            }

            item.attempt += 1;
            item.status = ItemStatus::Pending;
            warn!(
                target: self.log.target(),
                "Retrying '{}' (attempt {} of {})",
                item.filename,
                item.attempt,
                limit
            );
            self.launch(index, &data_uri)?;
        }

        self.update_status(Status::Running, "");
        Ok(())
    }

    /// Backend post-processing, then FINISHED.
    pub fn clean_up(&mut self) -> Result<(), StepError> {
        let result = match self.staging.source_uri() {
            Ok(uri) => self
                .exec
                .clean_up(&self.step.name, uri)
                .map_err(StepError::from),
            Err(e) => Err(e.into()),
        };
        self.guard(result)?;

        info!(target: self.log.target(), "Step '{}' finished", self.step.name);
        self.update_status(Status::Finished, "");
        Ok(())
    }

    /// Copies the output into every other context that needs it.
    pub fn stage(&mut self) -> Result<(), StepError> {
        let result = self
            .staging
            .stage(&self.scope.registry)
            .map_err(StepError::from);
        self.guard(result)
    }

    /// Run history of every item, keyed by filename.
    pub fn detail(&self) -> Value {
        let detail = self
            .items
            .iter()
            .map(|item| {
                let runs = serde_json::to_value(&item.run).unwrap_or(Value::Null);
                (item.filename.clone(), runs)
            })
            .collect();
        Value::Object(detail)
    }

    pub fn status_struct(&self) -> StepStatus {
        StepStatus {
            id: self.step.step_id.get(..8).unwrap_or(&self.step.step_id).to_string(),
            name: self.step.name.clone(),
            map: self
                .items
                .iter()
                .map(|item| (item.filename.clone(), item.status))
                .collect(),
        }
    }

    fn update_status(&mut self, status: Status, msg: &str) {
        self.status = status;
        let detail = self.detail();
        if let Err(e) = self.scope.store.update_job_step_status(
            &self.step.step_id,
            &self.scope.job_id,
            status,
            &detail,
            msg,
        ) {
            warn!(target: self.log.target(), "Cannot update step status: {}", e);
        }
    }

    /// Persists ERROR with the message of `err` and hands the error back.
    fn fail(&mut self, err: StepError) -> StepError {
        error!(target: self.log.target(), "Step '{}': {}", self.step.name, err);
        self.update_status(Status::Error, &err.to_string());
        err
    }

    fn guard<T>(&mut self, result: Result<T, StepError>) -> Result<T, StepError> {
        result.map_err(|e| self.fail(e))
    }
}
