//! Error Types
//!
//! One error enum per concern. Lower layers convert into higher ones with
//! `#[from]` so the driver can surface a single message per failure.

use thiserror::Error;

/// A location string that cannot be decomposed into scheme/authority/path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriError {
    #[error("invalid uri '{uri}': {reason}")]
    Invalid { uri: String, reason: String },
}

/// Errors raised by data and execution backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no data backend registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("no execution backend registered for context '{0}'")]
    UnknownContext(String),

    #[error("cannot copy from scheme '{from}' to scheme '{to}': no transfer registered")]
    NoTransfer { from: String, to: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{op} failed for {uri}: {source}")]
    Io {
        op: &'static str,
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("credentials rejected: {0}")]
    Unauthorized(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Uri(#[from] UriError),
}

/// Definition errors: detected before any execution side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("step '{step}' has no app reference")]
    MissingApp { step: String },

    #[error("step '{step}' depends on unknown step '{depend}'")]
    MissingDependency { step: String, depend: String },

    #[error("final output references unknown step '{0}'")]
    UnknownFinalOutput(String),

    #[error("step '{step}' template is missing the 'output' key")]
    MissingOutput { step: String },

    #[error("{kind} '{name}' has no letters or digits to name its folder")]
    EmptySlug { kind: &'static str, name: String },

    #[error("{kind}s '{first}' and '{second}' share the folder name '{slug}'")]
    SlugCollision {
        kind: &'static str,
        first: String,
        second: String,
        slug: String,
    },

    #[error("workflow contains a dependency cycle involving: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("step '{step}': invalid template reference {reference}: {reason}")]
    InvalidReference {
        step: String,
        reference: String,
        reason: String,
    },

    #[error("step '{step}': '{name}' is neither a workflow input nor a parameter")]
    UnknownVariable { step: String, name: String },

    #[error("step '{step}': invalid map uri '{uri}'")]
    InvalidMapUri { step: String, uri: String },

    #[error("step '{step}': invalid map regex '{regex}': {reason}")]
    InvalidRegex {
        step: String,
        regex: String,
        reason: String,
    },

    #[error("step '{step}': map source {uri} is empty")]
    EmptyMapSource { step: String, uri: String },

    #[error("step '{step}': no entries of {uri} match '{regex}'")]
    NoMatchingItems {
        step: String,
        uri: String,
        regex: String,
    },

    #[error("step '{step}': no uri provided for dependency '{depend}'")]
    MissingDependUri { step: String, depend: String },

    #[error(
        "step '{step}': dependency '{depend}' lives on scheme '{found}', expected '{expected}'"
    )]
    SchemeMismatch {
        step: String,
        depend: String,
        found: String,
        expected: String,
    },

    #[error("app '{0}' is not defined")]
    UnknownApp(String),

    #[error("cannot parse {what}: {reason}")]
    Parse { what: String, reason: String },
}

/// Failures while mirroring data between contexts.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging uri for context '{context}' points at the root path: {uri}")]
    RootPath { context: String, uri: String },

    #[error("source context '{0}' has no uri")]
    MissingSource(String),

    #[error("unknown context '{0}'")]
    UnknownContext(String),

    #[error("not initialized")]
    NotInitialized,

    #[error(
        "cannot stage data from context '{from_context}' to context '{to_context}' by copying {from} to {to}: {source}"
    )]
    Copy {
        from_context: String,
        to_context: String,
        from: String,
        to: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Uri(#[from] UriError),
}

/// Step Unit failures. Every variant is fatal for the step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error("cannot launch map item '{item}': {source}")]
    Launch {
        item: String,
        #[source]
        source: BackendError,
    },

    #[error("map item '{item}' exhausted {limit} retries")]
    RetryExhausted { item: String, limit: u32 },

    #[error("map items not expanded; call iterate_map_uri first")]
    NotExpanded,

    #[error("step not initialized")]
    NotInitialized,
}

/// Graph Builder failures.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("no work uri configured for context '{0}'")]
    MissingWorkUri(String),

    #[error("cannot create base uri {uri}: {source}")]
    Mkdir {
        uri: String,
        #[source]
        source: BackendError,
    },

    #[error("cannot initialize graph node '{node}': {source}")]
    Node {
        node: String,
        #[source]
        source: Box<StepError>,
    },
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("cannot read state file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write state file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Execution Driver failures. Carries the node being processed when known.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error("cannot create job directory {uri}: {source}")]
    JobDirectory {
        uri: String,
        #[source]
        source: BackendError,
    },

    #[error("node '{node}' failed: {source}")]
    Node {
        node: String,
        #[source]
        source: StepError,
    },

    #[error("engine not initialized")]
    NotInitialized,
}
