//! PipeFlow - Workflow Execution Engine
//!
//! Runs multi-step scientific pipelines described as a DAG of steps. Each
//! step runs an app, optionally fanned out over the entries of a directory,
//! in an execution context with its own storage. Data produced in one
//! context is staged into every other context that consumes it.
//!
//! # Architecture
//!
//! - [`workflow`]: definitions, validation, templates and the graph builder
//! - [`execution`]: backends, the step unit and the execution engine
//! - [`staging`]: copying data between contexts
//! - [`store`]: job and step status persistence
//! - [`monitoring`]: per-node execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pipeflow::config::EngineConfig;
//! use pipeflow::execution::{ContextRegistry, Engine};
//! use pipeflow::store::LocalStore;
//! use pipeflow::workflow::{load_apps, load_job, load_workflow};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = load_workflow("pipeline.yaml")?;
//!     let apps = load_apps("apps.yaml")?;
//!     let job = load_job("job.yaml")?;
//!     let job_id = job.job_id.clone();
//!
//!     let store = Arc::new(LocalStore::new());
//!     store.add_workflow(workflow, apps);
//!     store.add_job(job)?;
//!
//!     let config = EngineConfig::default();
//!     let registry = Arc::new(ContextRegistry::with_local(&config));
//!     let mut engine = Engine::new(job_id, store, registry, config);
//!     engine.initialize()?;
//!     engine.run()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod monitoring;
pub mod slug;
pub mod staging;
pub mod store;
pub mod uri;
pub mod workflow;

// Re-export commonly used types
pub use execution::engine::Engine;
pub use workflow::model::{StepDef, WorkflowDef};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "PipeFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "PipeFlow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = StepDef::new("align", "bwa");
        assert_eq!(step.name, "align");
        assert_eq!(step.app, "bwa");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDef::new("demo");
        assert!(workflow.steps.is_empty());
    }
}
