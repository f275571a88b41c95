//! Workflow Data Model
//!
//! Definitions of workflows, steps, apps and jobs, plus the status enums the
//! engine persists.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: align
//! inputs:
//!   reads:
//!     type: directory
//!     default: /data/reads
//! parameters:
//!   threads:
//!     default: 4
//! final_output: [sort]
//! steps:
//!   bwa:
//!     app: bwa-mem
//!     map:
//!       uri: "{workflow->reads}"
//!       regex: '^(.*)\.fastq$'
//!     template:
//!       reads: "{workflow->reads}/{1}.fastq"
//!       threads: "{workflow->threads}"
//!       output: "{1}.sam"
//!   sort:
//!     app: samtools-sort
//!     depend: bwa
//!     template:
//!       input: "{bwa->output}"
//!       output: sorted
//! ```

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dependency sentinel meaning "no parent step".
pub const ROOT_DEPEND: &str = "root";

/// Default execution context of a step.
pub const DEFAULT_CONTEXT: &str = "local";

/// Default execution method of a step.
pub const DEFAULT_METHOD: &str = "auto";

/// Lifecycle status of a job or of a step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Finished,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    File,
    Directory,
    #[default]
    Any,
}

/// A workflow-level input: a location consumed by steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct InputDef {
    pub label: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: InputType,
    /// Location used when the job supplies none
    pub default: String,
    /// Resolved location, filled in from the job
    pub value: String,
}

/// A workflow-level parameter: a plain value, never staged.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ParameterDef {
    pub label: String,
    pub description: String,
    pub default: Value,
    pub value: Value,
}

/// Fan-out source of a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MapDef {
    /// `{workflow->input}` or `{step->output}`; empty for a single invocation
    pub uri: String,
    /// Filter applied to the names listed under `uri`
    pub regex: String,
}

impl MapDef {
    pub fn is_mapped(&self) -> bool {
        !self.uri.trim().is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ExecutionDef {
    /// Backend that runs the step
    pub context: String,
    /// Backend-specific strategy, e.g. container vs. bare metal
    pub method: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

impl Default for ExecutionDef {
    fn default() -> Self {
        Self {
            context: DEFAULT_CONTEXT.to_string(),
            method: DEFAULT_METHOD.to_string(),
            parameters: BTreeMap::new(),
        }
    }
}

/// One processing step wrapping an app.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct StepDef {
    pub step_id: String,

    /// Unique name; filled from the mapping key when loaded from YAML
    pub name: String,

    /// Name of the app this step runs
    pub app: String,

    /// Parent step names; `root` or empty means none
    #[serde(deserialize_with = "single_or_vec")]
    pub depend: Vec<String>,

    /// Longest distance from a root, computed during validation
    pub number: u32,

    /// Sibling letter, empty unless several steps share `number`
    pub letter: String,

    pub map: MapDef,

    /// App arguments; string values may carry `{name->var}` references
    pub template: BTreeMap<String, Value>,

    pub execution: ExecutionDef,
}

/// Deserializes either a single string or a list of strings.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("expected string in depend list")),
            })
            .collect(),
        _ => Err(de::Error::custom("expected string or list of strings")),
    }
}

impl StepDef {
    /// Creates a step running `app`.
    ///
    /// ```
    /// use pipeflow::workflow::StepDef;
    ///
    /// let step = StepDef::new("sort", "samtools-sort")
    ///     .depends_on("align")
    ///     .with_template("input", "{align->output}")
    ///     .with_template("output", "sorted");
    /// assert_eq!(step.dependencies().collect::<Vec<_>>(), vec!["align"]);
    /// ```
    pub fn new(name: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            app: app.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depend.push(step.into());
        self
    }

    pub fn with_template(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.template.insert(key.into(), value.into());
        self
    }

    pub fn with_map(mut self, uri: impl Into<String>, regex: impl Into<String>) -> Self {
        self.map = MapDef {
            uri: uri.into(),
            regex: regex.into(),
        };
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.execution.context = context.into();
        self
    }

    /// Declared parents, without the `root` sentinel.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.depend
            .iter()
            .map(|d| d.as_str())
            .filter(|d| *d != ROOT_DEPEND)
    }

    /// True if this step declares `name` as a parent.
    pub fn depends_on_step(&self, name: &str) -> bool {
        self.dependencies().any(|d| d == name)
    }

    /// Number and letter, e.g. `3b`.
    pub fn label(&self) -> String {
        format!("{}{}", self.number, self.letter)
    }
}

/// A complete workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct WorkflowDef {
    pub workflow_id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub inputs: BTreeMap<String, InputDef>,
    pub parameters: BTreeMap<String, ParameterDef>,
    pub steps: BTreeMap<String, StepDef>,
    /// Steps whose output is copied to the job output location
    pub final_output: Vec<String>,
}

impl WorkflowDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        self.inputs.insert(
            name.into(),
            InputDef {
                default: value.clone(),
                value,
                ..InputDef::default()
            },
        );
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.parameters.insert(
            name.into(),
            ParameterDef {
                default: value.clone(),
                value,
                ..ParameterDef::default()
            },
        );
        self
    }

    pub fn with_step(mut self, step: StepDef) -> Self {
        self.steps.insert(step.name.clone(), step);
        self
    }

    pub fn with_final_output(mut self, step: impl Into<String>) -> Self {
        self.final_output.push(step.into());
        self
    }

    /// Resolved input locations keyed by input name.
    pub fn input_values(&self) -> BTreeMap<String, String> {
        self.inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Resolved parameter values rendered as template text.
    pub fn parameter_values(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(&v.value)))
            .collect()
    }

    /// Injects the concrete values of `job` into this definition.
    ///
    /// Inputs and parameters take the job value, falling back to the
    /// definition default. A non-empty job `final_output` replaces the
    /// definition's. Each step receives the job's per-step execution
    /// context and method, or the job-wide `default` entry.
    pub fn apply_job(&mut self, job: &JobDef) {
        for (name, input) in self.inputs.iter_mut() {
            input.value = job
                .inputs
                .get(name)
                .cloned()
                .unwrap_or_else(|| input.default.clone());
        }

        for (name, param) in self.parameters.iter_mut() {
            param.value = job
                .parameters
                .get(name)
                .cloned()
                .unwrap_or_else(|| param.default.clone());
        }

        if !job.final_output.is_empty() {
            self.final_output = job.final_output.clone();
        }

        for (name, step) in self.steps.iter_mut() {
            step.execution.context = job.execution.context_for(name);
            step.execution.method = job.execution.method_for(name);
        }
    }
}

/// Renders a template value: strings verbatim, null as empty, the rest as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppInput {
    pub label: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: InputType,
    pub default: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppParameter {
    pub label: String,
    pub description: String,
    pub default: Value,
}

/// Shell implementation of an app for the local context.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct LocalImplementation {
    /// Wrapper script invoked with `--key=value` arguments
    pub script: String,
}

/// Per-context implementations of an app.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppImplementation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalImplementation>,
    /// Implementations for other backends, kept opaque
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// A packaged executable wrapped by steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppDef {
    pub app_id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub inputs: BTreeMap<String, AppInput>,
    pub parameters: BTreeMap<String, AppParameter>,
    pub definition: AppImplementation,
}

impl AppDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.definition.local = Some(LocalImplementation {
            script: script.into(),
        });
        self
    }

    pub fn with_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), AppInput::default());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.parameters.insert(
            name.into(),
            AppParameter {
                default: default.into(),
                ..AppParameter::default()
            },
        );
        self
    }
}

/// Per-step execution overrides of a job. `default` applies to every step
/// without its own entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct JobExecution {
    pub context: BTreeMap<String, String>,
    pub method: BTreeMap<String, String>,
}

impl JobExecution {
    pub fn context_for(&self, step: &str) -> String {
        self.context
            .get(step)
            .or_else(|| self.context.get("default"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTEXT.to_string())
    }

    pub fn method_for(&self, step: &str) -> String {
        self.method
            .get(step)
            .or_else(|| self.method.get("default"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_METHOD.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Notification {
    pub url: String,
    pub to: Vec<String>,
}

/// One concrete execution request against a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct JobDef {
    pub job_id: String,
    pub name: String,
    pub workflow_id: String,
    /// Base work location per context, e.g. `local: /scratch/work`
    pub work_uri: BTreeMap<String, String>,
    pub output_uri: String,
    /// Name the output directory after the job only, without the id hash
    pub no_output_hash: bool,
    pub inputs: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, Value>,
    pub final_output: Vec<String>,
    pub execution: JobExecution,
    pub notifications: Vec<Notification>,
}

impl JobDef {
    pub fn new(job_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_work_uri(mut self, context: impl Into<String>, uri: impl Into<String>) -> Self {
        self.work_uri.insert(context.into(), uri.into());
        self
    }

    pub fn with_output_uri(mut self, uri: impl Into<String>) -> Self {
        self.output_uri = uri.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, uri: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), uri.into());
        self
    }

    /// Overrides the execution context of one step, or of every step when
    /// `step` is `default`.
    pub fn with_step_context(mut self, step: impl Into<String>, context: impl Into<String>) -> Self {
        self.execution.context.insert(step.into(), context.into());
        self
    }

    /// Short id used in directory names and log targets.
    pub fn short_id(&self) -> &str {
        self.job_id.get(..8).unwrap_or(&self.job_id)
    }
}
