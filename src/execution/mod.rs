//! Workflow Execution Module
//!
//! Backends, the step unit and the engine driving a job.
//!
//! # Architecture
//!
//! - [`backend`]: data and execution backend contracts
//! - [`registry`]: backends by context name and data scheme
//! - [`retry`]: retry policy for backend data calls
//! - [`local`]: local filesystem and shell backends
//! - [`step`]: step lifecycle
//! - [`engine`]: job execution driver

pub mod backend;
pub mod engine;
pub mod local;
pub mod registry;
pub mod retry;
pub mod step;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{DataBackend, ExecBackend, ItemStatus, RunRecord, Transfer};
pub use engine::{Engine, EngineStatus};
pub use registry::ContextRegistry;
pub use retry::RetryPolicy;
pub use step::{StepStatus, WorkflowStep};
