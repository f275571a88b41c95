//! Job Status Persistence
//!
//! The engine reads definitions and writes job/step status through the
//! [`JobStore`] trait. Every call is its own unit of work: a crash between
//! calls leaves the last written status as the source of truth.
//!
//! [`LocalStore`] keeps everything in memory and, when given a state file,
//! rewrites a JSON snapshot of all job records after each mutation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::workflow::model::{AppDef, JobDef, Status, WorkflowDef};

/// Persistence contract consumed by the engine.
pub trait JobStore: Send + Sync {
    fn get_workflow_def(&self, workflow_id: &str) -> Result<WorkflowDef, StoreError>;

    /// Apps referenced by a workflow, keyed by app name.
    fn get_app_defs_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<BTreeMap<String, AppDef>, StoreError>;

    fn get_job_def(&self, job_id: &str) -> Result<JobDef, StoreError>;

    /// `detail` maps each map item filename to its list of attempt records.
    fn update_job_step_status(
        &self,
        step_id: &str,
        job_id: &str,
        status: Status,
        detail: &Value,
        msg: &str,
    ) -> Result<(), StoreError>;

    fn set_job_started(&self, job_id: &str) -> Result<(), StoreError>;

    fn set_job_finished(&self, job_id: &str) -> Result<(), StoreError>;

    fn update_job_status(&self, job_id: &str, status: Status, msg: &str) -> Result<(), StoreError>;
}

/// Persisted status of one step of a job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub status: Status,
    pub detail: Value,
    pub msg: String,
    pub updated: DateTime<Utc>,
}

/// Persisted status of one job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub name: String,
    pub status: Status,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    pub updated: DateTime<Utc>,
    /// Keyed by step id
    pub steps: BTreeMap<String, StepRecord>,
}

impl JobRecord {
    fn new(job: &JobDef) -> Self {
        Self {
            job_id: job.job_id.clone(),
            name: job.name.clone(),
            status: Status::Pending,
            msg: String::new(),
            started: None,
            finished: None,
            updated: Utc::now(),
            steps: BTreeMap::new(),
        }
    }
}

/// On-disk layout of the state file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub jobs: BTreeMap<String, JobRecord>,
}

impl StoreSnapshot {
    /// Reads a state file written by [`LocalStore`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Default)]
struct StoreState {
    workflows: BTreeMap<String, WorkflowDef>,
    apps: BTreeMap<String, BTreeMap<String, AppDef>>,
    jobs: BTreeMap<String, JobDef>,
    snapshot: StoreSnapshot,
}

/// In-process store with an optional JSON state file.
#[derive(Default)]
pub struct LocalStore {
    state: Mutex<StoreState>,
    state_file: Option<PathBuf>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a snapshot to `path` after every status change.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a workflow and the apps it uses.
    pub fn add_workflow(&self, workflow: WorkflowDef, apps: BTreeMap<String, AppDef>) {
        let mut state = self.lock();
        debug!("Stored workflow '{}' ({})", workflow.name, workflow.workflow_id);
        state.apps.insert(workflow.workflow_id.clone(), apps);
        state.workflows.insert(workflow.workflow_id.clone(), workflow);
    }

    /// Registers a job in PENDING status.
    pub fn add_job(&self, job: JobDef) -> Result<(), StoreError> {
        let mut state = self.lock();
        state
            .snapshot
            .jobs
            .insert(job.job_id.clone(), JobRecord::new(&job));
        state.jobs.insert(job.job_id.clone(), job);
        self.persist(&state)
    }

    pub fn job_record(&self, job_id: &str) -> Option<JobRecord> {
        self.lock().snapshot.jobs.get(job_id).cloned()
    }

    pub fn step_record(&self, job_id: &str, step_id: &str) -> Option<StepRecord> {
        self.lock()
            .snapshot
            .jobs
            .get(job_id)
            .and_then(|job| job.steps.get(step_id))
            .cloned()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.lock().snapshot.clone()
    }

    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&state.snapshot)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|source| StoreError::Write {
                path: path.display().to_string(),
                source,
            })
    }

    /// Applies `update` to a job record and persists the result.
    fn update_job<F>(&self, job_id: &str, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut state = self.lock();
        let record = state
            .snapshot
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        update(record);
        record.updated = Utc::now();
        self.persist(&state)
    }
}

impl JobStore for LocalStore {
    fn get_workflow_def(&self, workflow_id: &str) -> Result<WorkflowDef, StoreError> {
        self.lock()
            .workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn get_app_defs_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<BTreeMap<String, AppDef>, StoreError> {
        self.lock()
            .apps
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn get_job_def(&self, job_id: &str) -> Result<JobDef, StoreError> {
        self.lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    fn update_job_step_status(
        &self,
        step_id: &str,
        job_id: &str,
        status: Status,
        detail: &Value,
        msg: &str,
    ) -> Result<(), StoreError> {
        self.update_job(job_id, |job| {
            job.steps.insert(
                step_id.to_string(),
                StepRecord {
                    status,
                    detail: detail.clone(),
                    msg: msg.to_string(),
                    updated: Utc::now(),
                },
            );
        })
    }

    fn set_job_started(&self, job_id: &str) -> Result<(), StoreError> {
        self.update_job(job_id, |job| {
            job.started.get_or_insert_with(Utc::now);
        })
    }

    fn set_job_finished(&self, job_id: &str) -> Result<(), StoreError> {
        self.update_job(job_id, |job| job.finished = Some(Utc::now()))
    }

    fn update_job_status(&self, job_id: &str, status: Status, msg: &str) -> Result<(), StoreError> {
        info!("Job {} status: {}", job_id, status);
        self.update_job(job_id, |job| {
            job.status = status;
            job.msg = msg.to_string();
        })
    }
}
