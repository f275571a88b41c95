//! Graph Builder
//!
//! Turns an injected workflow definition into a validated DAG of input and
//! step nodes. Construction runs in fixed phases:
//!
//! 1. one node per input, sourced in its URI scheme
//! 2. one node per step, sourced in the data scheme of its execution context
//!    (plus the `final` context for final outputs)
//! 3. edges from declared dependencies and `{name->var}` references; each
//!    edge registers the consumer's context on the producer
//! 4. cycle check and stable topological order
//! 5. one URI per node and registered context
//! 6. unit construction and initialization, in order
//!
//! Phases 1-4 have no side effects, so definition errors surface before any
//! backend is touched.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use serde_json::Value;

use super::input::WorkflowInput;
use super::model::{AppDef, StepDef, WorkflowDef};
use super::template::{references, Reference};
use super::topo::stable_order;
use crate::config::EngineConfig;
use crate::error::{DefinitionError, GraphError, StepError};
use crate::execution::step::{JobScope, StepSetup, WorkflowStep};
use crate::slug::slugify;
use crate::uri::Uri;

/// Context receiving copies of final step outputs.
pub const FINAL_CONTEXT: &str = "final";

/// Prefix of the per-input folder in a foreign context's work area.
const INPUT_FOLDER_PREFIX: &str = "_input-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Input,
    Step,
}

/// The runnable unit behind a node.
pub enum NodeUnit {
    Input(WorkflowInput),
    Step(Box<WorkflowStep>),
}

pub struct GraphNode {
    key: String,
    name: String,
    kind: NodeKind,
    source_context: String,
    exec_context: Option<String>,
    /// Contexts in which the node's data is needed
    contexts: BTreeSet<String>,
    uris: BTreeMap<String, Uri>,
    unit: Option<NodeUnit>,
}

impl GraphNode {
    fn new(kind: NodeKind, name: &str, source_context: String, exec_context: Option<String>) -> Self {
        Self {
            key: node_key(kind, name),
            name: name.to_string(),
            kind,
            contexts: BTreeSet::from([source_context.clone()]),
            source_context,
            exec_context,
            uris: BTreeMap::new(),
            unit: None,
        }
    }

    /// `input.<name>` or `step.<name>`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn source_context(&self) -> &str {
        &self.source_context
    }

    pub fn exec_context(&self) -> Option<&str> {
        self.exec_context.as_deref()
    }

    pub fn contexts(&self) -> impl Iterator<Item = &str> {
        self.contexts.iter().map(|c| c.as_str())
    }

    /// Location of the node's data in each context.
    pub fn uris(&self) -> &BTreeMap<String, Uri> {
        &self.uris
    }

    pub fn unit_mut(&mut self) -> Option<&mut NodeUnit> {
        self.unit.as_mut()
    }

    pub fn step(&self) -> Option<&WorkflowStep> {
        match &self.unit {
            Some(NodeUnit::Step(step)) => Some(step),
            _ => None,
        }
    }
}

pub fn node_key(kind: NodeKind, name: &str) -> String {
    match kind {
        NodeKind::Input => format!("input.{}", name),
        NodeKind::Step => format!("step.{}", name),
    }
}

/// Inputs of [`WorkflowGraph::build`].
pub struct GraphSpec<'a> {
    /// Workflow with job values already injected
    pub workflow: &'a WorkflowDef,
    pub apps: &'a BTreeMap<String, AppDef>,
    /// Job work location per data context
    pub work_uris: &'a BTreeMap<String, Uri>,
    /// Job output location, backing the `final` context
    pub output_uri: Option<&'a Uri>,
    pub config: &'a EngineConfig,
}

pub struct WorkflowGraph {
    nodes: BTreeMap<String, GraphNode>,
    edges: BTreeSet<(String, String)>,
    order: Vec<String>,
}

impl WorkflowGraph {
    /// Builds the graph and initializes every node.
    pub fn build(layout: GraphSpec<'_>, scope: &JobScope) -> Result<Self, GraphError> {
        let mut graph = Self::plan(&layout, scope)?;
        graph.resolve_uris(&layout, scope)?;
        graph.init_units(&layout, scope)?;
        info!(
            target: scope.log.target(),
            "Graph built: {} node(s), {} edge(s)",
            graph.nodes.len(),
            graph.edges.len()
        );
        Ok(graph)
    }

    /// Nodes, edges and order, without touching any backend.
    fn plan(layout: &GraphSpec<'_>, scope: &JobScope) -> Result<Self, GraphError> {
        let workflow = layout.workflow;
        let mut nodes = BTreeMap::new();

        for (name, input) in &workflow.inputs {
            let uri = Uri::parse(&input.value)?;
            let node = GraphNode::new(NodeKind::Input, name, uri.scheme().to_string(), None);
            nodes.insert(node.key.clone(), node);
        }

        for (name, step) in &workflow.steps {
            if !layout.apps.contains_key(&step.app) {
                return Err(DefinitionError::UnknownApp(step.app.clone()).into());
            }
            let context = &step.execution.context;
            let source = scope.registry.data_scheme_of(context)?;
            let mut node = GraphNode::new(NodeKind::Step, name, source, Some(context.clone()));
            if workflow.final_output.contains(name) {
                node.contexts.insert(FINAL_CONTEXT.to_string());
            }
            nodes.insert(node.key.clone(), node);
        }

        let mut edges = BTreeSet::new();
        for (name, step) in &workflow.steps {
            let consumer = node_key(NodeKind::Step, name);
            let consumer_context = nodes
                .get(&consumer)
                .map(|n| n.source_context.clone())
                .unwrap_or_default();

            for producer in producers(workflow, name, step)? {
                if let Some(node) = nodes.get_mut(&producer) {
                    node.contexts.insert(consumer_context.clone());
                }
                edges.insert((producer, consumer.clone()));
            }
        }

        let sorted = stable_order(
            nodes.keys().map(|k| k.as_str()),
            edges.iter().map(|(a, b)| (a.as_str(), b.as_str())),
        )
        .map_err(DefinitionError::Cycle)?;

        Ok(Self {
            nodes,
            edges,
            order: sorted.order,
        })
    }

    /// Derives the location of every node in every context it is needed in.
    fn resolve_uris(&mut self, layout: &GraphSpec<'_>, scope: &JobScope) -> Result<(), GraphError> {
        let work_uri = |context: &str| {
            layout.work_uris
                .get(context)
                .ok_or_else(|| GraphError::MissingWorkUri(context.to_string()))
        };

        for key in &self.order {
            let Some(node) = self.nodes.get_mut(key) else {
                continue;
            };
            let slug = slugify(&node.name);

            let mut uris = BTreeMap::new();
            for context in &node.contexts {
                let uri = match node.kind {
                    NodeKind::Input => {
                        let value = layout
                            .workflow
                            .inputs
                            .get(&node.name)
                            .map(|i| i.value.as_str())
                            .unwrap_or_default();
                        if *context == node.source_context {
                            Uri::parse(value)?
                        } else {
                            let base = work_uri(context.as_str())?
                                .join(&format!("{}{}", INPUT_FOLDER_PREFIX, slug))?;
                            scope
                                .registry
                                .mkdir(&base, true)
                                .map_err(|source| GraphError::Mkdir {
                                    uri: base.to_string(),
                                    source,
                                })?;
                            Uri::switch_context(value, &base.normalized_uri())?
                        }
                    }
                    NodeKind::Step if context == FINAL_CONTEXT => layout
                        .output_uri
                        .ok_or_else(|| GraphError::MissingWorkUri(FINAL_CONTEXT.to_string()))?
                        .join(&slug)?,
                    NodeKind::Step => work_uri(context.as_str())?.join(&slug)?,
                };
                debug!(target: scope.log.target(), "{} [{}] -> {}", key, context, uri);
                uris.insert(context.clone(), uri);
            }
            node.uris = uris;
        }
        Ok(())
    }

    /// Creates and initializes every unit in topological order.
    fn init_units(&mut self, layout: &GraphSpec<'_>, scope: &JobScope) -> Result<(), GraphError> {
        let parameters = layout.workflow.parameter_values();

        for key in self.order.clone() {
            let Some(node) = self.nodes.get(&key) else {
                continue;
            };
            let uris: BTreeMap<String, String> = node
                .uris
                .iter()
                .map(|(c, u)| (c.clone(), u.normalized_uri()))
                .collect();

            let unit = match node.kind {
                NodeKind::Input => {
                    let mut input = WorkflowInput::new(
                        node.name.clone(),
                        uris,
                        node.source_context.clone(),
                        scope.log.child(&key),
                    );
                    input.initialize().map_err(|e| node_error(&key, e.into()))?;
                    NodeUnit::Input(input)
                }
                NodeKind::Step => {
                    let setup = self.step_setup(layout, node, uris, &parameters)?;
                    let mut step =
                        WorkflowStep::new(setup, scope.clone()).map_err(|e| node_error(&key, e))?;
                    step.initialize().map_err(|e| node_error(&key, e))?;
                    NodeUnit::Step(Box::new(step))
                }
            };

            if let Some(node) = self.nodes.get_mut(&key) {
                node.unit = Some(unit);
            }
        }
        Ok(())
    }

    fn step_setup(
        &self,
        layout: &GraphSpec<'_>,
        node: &GraphNode,
        uris: BTreeMap<String, String>,
        parameters: &BTreeMap<String, String>,
    ) -> Result<StepSetup, GraphError> {
        let step = layout
            .workflow
            .steps
            .get(&node.name)
            .cloned()
            .ok_or_else(|| DefinitionError::MissingDependency {
                step: node.name.clone(),
                depend: node.name.clone(),
            })?;
        let app = layout
            .apps
            .get(&step.app)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownApp(step.app.clone()))?;
        let source = &node.source_context;

        let inputs = layout
            .workflow
            .inputs
            .keys()
            .filter_map(|name| {
                let input = self.nodes.get(&node_key(NodeKind::Input, name))?;
                Some((name.clone(), input.uris.get(source)?.clone()))
            })
            .collect();

        let depend_uris = step
            .dependencies()
            .filter_map(|depend| {
                let parent = self.nodes.get(&node_key(NodeKind::Step, depend))?;
                Some((depend.to_string(), parent.uris.get(source)?.clone()))
            })
            .collect();

        let clean = node
            .exec_context
            .as_deref()
            .map(|context| layout.config.context(context).clean)
            .unwrap_or(false);

        Ok(StepSetup {
            app,
            uris,
            source_context: source.clone(),
            inputs,
            parameters: parameters.clone(),
            depend_uris,
            clean,
            step,
        })
    }

    /// Node keys, producers before consumers.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn node(&self, key: &str) -> Option<&GraphNode> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: &str) -> Option<&mut GraphNode> {
        self.nodes.get_mut(key)
    }

    /// Step units in topological order.
    pub fn steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.order
            .iter()
            .filter_map(|key| self.nodes.get(key))
            .filter_map(GraphNode::step)
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    /// Adjacency map: node key to its successors.
    pub fn to_dict(&self) -> BTreeMap<String, Vec<String>> {
        let mut dict: BTreeMap<String, Vec<String>> = self
            .nodes
            .keys()
            .map(|key| (key.clone(), Vec::new()))
            .collect();
        for (from, to) in &self.edges {
            dict.entry(from.clone()).or_default().push(to.clone());
        }
        dict
    }
}

fn node_error(key: &str, source: StepError) -> GraphError {
    GraphError::Node {
        node: key.to_string(),
        source: Box::new(source),
    }
}

/// Every back-reference of a step: its map source and string templates.
fn step_references(step: &StepDef) -> Vec<Reference> {
    let mut found = references(&step.map.uri);
    for value in step.template.values() {
        if let Value::String(text) = value {
            found.extend(references(text));
        }
    }
    found
}

/// Keys of the nodes `step` consumes.
///
/// Declared dependencies and `{step->output}` references yield step nodes;
/// `{workflow->input}` yields input nodes. Parameters are plain values and
/// yield nothing.
fn producers(workflow: &WorkflowDef, name: &str, step: &StepDef) -> Result<Vec<String>, DefinitionError> {
    let mut found = Vec::new();

    for depend in step.dependencies() {
        if !workflow.steps.contains_key(depend) {
            return Err(DefinitionError::MissingDependency {
                step: name.to_string(),
                depend: depend.to_string(),
            });
        }
        found.push(node_key(NodeKind::Step, depend));
    }

    for reference in step_references(step) {
        if reference.is_workflow() {
            if workflow.inputs.contains_key(&reference.var) {
                found.push(node_key(NodeKind::Input, &reference.var));
            } else if !workflow.parameters.contains_key(&reference.var) {
                return Err(DefinitionError::UnknownVariable {
                    step: name.to_string(),
                    name: reference.var,
                });
            }
            continue;
        }

        if !workflow.steps.contains_key(&reference.name) {
            return Err(DefinitionError::MissingDependency {
                step: name.to_string(),
                depend: reference.name,
            });
        }
        if !step.depends_on_step(&reference.name) {
            return Err(DefinitionError::InvalidReference {
                step: name.to_string(),
                reference: reference.token(),
                reason: "step must be listed as a dependency".to_string(),
            });
        }
        found.push(node_key(NodeKind::Step, &reference.name));
    }

    Ok(found)
}
