//! Backend Contracts
//!
//! A context is served by two halves:
//! - [`DataBackend`]: list/exists/mkdir/delete/copy for one URI scheme
//! - [`ExecBackend`]: launch and poll units of work for one execution context
//!
//! Steps and the graph builder only ever see these traits; concrete backends
//! are registered in a [`ContextRegistry`](super::registry::ContextRegistry).

use std::any::Any;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BackendError;
use crate::uri::Uri;
use crate::workflow::model::AppDef;

/// Status of one map item or of one of its attempts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    #[default]
    Pending,
    Running,
    Finished,
    Failed,
    Stopped,
    Unknown,
}

impl ItemStatus {
    /// FINISHED, FAILED and STOPPED are never left except by a retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Stopped)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// One attempt of a map item.
///
/// The serializable part (`status`, timestamps, backend `fields`) forms the
/// persisted detail blob. `handle` holds backend-local state such as a child
/// process and never leaves the process.
#[derive(Serialize, Debug, Default)]
pub struct RunRecord {
    pub status: ItemStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Backend handle fields, e.g. `pid` or a remote job id
    #[serde(flatten)]
    pub fields: Map<String, Value>,

    #[serde(skip)]
    pub handle: Option<Box<dyn Any + Send>>,
}

impl RunRecord {
    /// A record for a freshly launched attempt.
    pub fn launched(status: ItemStatus) -> Self {
        Self {
            status,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_handle<T: Any + Send>(mut self, handle: T) -> Self {
        self.handle = Some(Box::new(handle));
        self
    }

    /// Mutable access to the handle if it has type `T`.
    pub fn handle_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.handle.as_deref_mut()?.downcast_mut::<T>()
    }
}

/// Everything a backend needs to launch one map item.
#[derive(Debug)]
pub struct Invocation<'a> {
    pub step: &'a str,
    pub item: &'a str,
    pub app: &'a AppDef,
    /// Fully expanded template of the item
    pub template: &'a BTreeMap<String, Value>,
    /// Canonical output location of the step
    pub data_uri: &'a Uri,
    pub method: &'a str,
    pub attempt: u32,
}

/// Storage operations for one URI scheme.
pub trait DataBackend: Send + Sync {
    fn scheme(&self) -> &str;

    /// Names of the immediate children of `uri`.
    fn list(&self, uri: &Uri) -> Result<Vec<String>, BackendError>;

    fn exists(&self, uri: &Uri) -> Result<bool, BackendError>;

    fn mkdir(&self, uri: &Uri, recursive: bool) -> Result<(), BackendError>;

    fn delete(&self, uri: &Uri) -> Result<(), BackendError>;

    /// Copies within this scheme. Copies a file or a whole directory tree.
    fn copy(&self, src: &Uri, dest: &Uri) -> Result<(), BackendError>;

    /// Renews credentials after [`BackendError::Unauthorized`].
    fn refresh(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Copies between two different schemes, e.g. local to remote storage.
pub trait Transfer: Send + Sync {
    fn copy(&self, src: &Uri, dest: &Uri) -> Result<(), BackendError>;
}

/// Execution operations for one context.
pub trait ExecBackend: Send + Sync {
    /// Context name, e.g. `local`.
    fn context(&self) -> &str;

    /// Scheme of the storage this context reads and writes.
    fn data_scheme(&self) -> &str;

    /// Relaunches allowed per map item.
    fn retry_limit(&self) -> u32;

    /// Checks that `app` can run in this context.
    fn validate(&self, step: &str, app: &AppDef) -> Result<(), BackendError>;

    /// Launches one map item.
    fn launch(&self, invocation: &Invocation<'_>) -> Result<RunRecord, BackendError>;

    /// Queries the current status of a launched attempt.
    fn poll(&self, run: &mut RunRecord) -> Result<ItemStatus, BackendError>;

    /// Post-processing once every item of a step has finished, e.g. fetching
    /// remote logs into `data_uri`.
    fn clean_up(&self, _step: &str, _data_uri: &Uri) -> Result<(), BackendError> {
        Ok(())
    }
}
