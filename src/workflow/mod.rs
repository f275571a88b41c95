//! Workflow Definition Module
//!
//! Data structures and utilities for defining, validating and building
//! workflows.
//!
//! # Structure
//!
//! - [`model`]: workflow, step, app and job definitions
//! - [`parser`]: YAML loading
//! - [`validator`]: structural checks and step numbering
//! - [`topo`]: the stable topological order shared by numbering and graph
//! - [`template`]: `{name->var}` back-references and substitution
//! - [`input`]: workflow input units
//! - [`graph`]: the graph builder

pub mod graph;
pub mod input;
pub mod model;
pub mod parser;
pub mod template;
pub mod topo;
pub mod validator;

pub use graph::{GraphNode, GraphSpec, NodeKind, NodeUnit, WorkflowGraph};
pub use model::{AppDef, JobDef, Status, StepDef, WorkflowDef};
pub use parser::{load_apps, load_job, load_workflow};
pub use validator::validate_workflow;
