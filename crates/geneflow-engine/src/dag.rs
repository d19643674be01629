//! The workflow graph: one node per workflow input and per step, edges
//! from `depend` lists and from template references to workflow inputs.
//! Construction rejects cycles; traversal order is a deterministic
//! linear extension (ties broken by node name).

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use geneflow_core::definition::{scalar_to_string, WorkflowDef};
use geneflow_core::ParsedUri;

use crate::contexts::Contexts;
use crate::error::{EngineError, Result};
use crate::expressions::TemplateContext;

/// An input node: the input's value URIs plus the per-context folders
/// it is staged into when a context cannot read it in place.
#[derive(Debug, Clone)]
pub struct InputNode {
    pub key: String,
    pub value_uris: Vec<ParsedUri>,
    /// data context -> `<work_uri>/_input/<key>` for contexts whose
    /// scheme differs from the value's own.
    pub staged_uris: BTreeMap<String, ParsedUri>,
}

/// A step node: everything the runtime needs to build an executor.
#[derive(Debug, Clone)]
pub struct StepNode {
    pub name: String,
    pub source_context: String,
    /// data context -> step output folder under that context's work URI.
    pub data_uris: BTreeMap<String, ParsedUri>,
    /// Resolved expression values this step may substitute.
    pub tmpl: TemplateContext,
}

#[derive(Debug, Clone)]
pub enum DagNode {
    Input(InputNode),
    Step(StepNode),
}

#[derive(Debug)]
pub struct WorkflowDag {
    nodes: BTreeMap<String, DagNode>,
    order: Vec<String>,
}

impl WorkflowDag {
    /// Build and order the graph for an injected workflow.
    pub fn build(
        workflow: &WorkflowDef,
        work_uris: &BTreeMap<String, ParsedUri>,
    ) -> Result<WorkflowDag> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut indices: BTreeMap<String, NodeIndex> = BTreeMap::new();
        let mut nodes: BTreeMap<String, DagNode> = BTreeMap::new();

        // input nodes
        for (key, input) in &workflow.inputs {
            let node_name = format!("input.{}", key);
            let mut value_uris = Vec::new();
            for value in &input.value {
                value_uris.push(ParsedUri::parse(value)?);
            }
            let mut staged_uris = BTreeMap::new();
            for (context, work_uri) in work_uris {
                let needs_staging = value_uris
                    .iter()
                    .any(|uri| uri.scheme != *context);
                if needs_staging {
                    staged_uris.insert(
                        context.clone(),
                        work_uri.join(&format!("_input/{}", key))?,
                    );
                }
            }
            let index = graph.add_node(node_name.clone());
            indices.insert(node_name.clone(), index);
            nodes.insert(
                node_name,
                DagNode::Input(InputNode {
                    key: key.clone(),
                    value_uris,
                    staged_uris,
                }),
            );
        }

        // step nodes
        for (step_name, step) in &workflow.steps {
            let node_name = format!("step.{}", step_name);
            let source_context = Contexts::data_scheme_of(&step.execution.context)
                .ok_or_else(|| {
                    EngineError::Workflow(format!(
                        "invalid execution context for step '{}': {}",
                        step_name, step.execution.context
                    ))
                })?
                .to_string();
            if !work_uris.contains_key(&source_context) {
                return Err(EngineError::Workflow(format!(
                    "missing work_uri for context: {}",
                    source_context
                )));
            }

            let mut data_uris = BTreeMap::new();
            for (context, work_uri) in work_uris {
                data_uris.insert(context.clone(), work_uri.join(step_name)?);
            }

            let index = graph.add_node(node_name.clone());
            indices.insert(node_name.clone(), index);
            nodes.insert(
                node_name,
                DagNode::Step(StepNode {
                    name: step_name.clone(),
                    source_context,
                    data_uris,
                    tmpl: TemplateContext::default(),
                }),
            );
        }

        // edges
        for (step_name, step) in &workflow.steps {
            let step_node = format!("step.{}", step_name);
            let step_index = indices[&step_node];

            for dep in &step.depend {
                let dep_node = format!("step.{}", dep);
                let dep_index = *indices.get(&dep_node).ok_or_else(|| {
                    EngineError::Workflow(format!(
                        "step '{}' depends on unknown step '{}'",
                        step_name, dep
                    ))
                })?;
                graph.add_edge(dep_index, step_index, ());
            }

            let mut expressions: Vec<&String> = step.template.values().collect();
            if let Some(map) = &step.map {
                expressions.push(&map.uri);
            }
            for key in workflow.inputs.keys() {
                let reference = format!("workflow.inputs.{}", key);
                if expressions.iter().any(|expr| expr.contains(&reference)) {
                    let input_index = indices[&format!("input.{}", key)];
                    graph.add_edge(input_index, step_index, ());
                }
            }
        }

        let order = deterministic_topological_sort(&graph, &indices)?;
        debug!(?order, "workflow graph ordered");

        // wire per-step template contexts now that the graph is valid
        let mut dag = WorkflowDag { nodes, order };
        dag.wire_template_contexts(workflow)?;
        Ok(dag)
    }

    fn wire_template_contexts(&mut self, workflow: &WorkflowDef) -> Result<()> {
        // resolved input value per data context: in-place when the
        // scheme matches, otherwise the staged copy
        let mut input_values: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for node in self.nodes.values() {
            if let DagNode::Input(input) = node {
                let first = match input.value_uris.first() {
                    Some(uri) => uri,
                    None => continue,
                };
                let mut per_context = BTreeMap::new();
                per_context.insert(first.scheme.clone(), first.chopped_uri.clone());
                for (context, staged) in &input.staged_uris {
                    per_context
                        .entry(context.clone())
                        .or_insert(staged.join(&first.name)?.chopped_uri);
                }
                input_values.insert(input.key.clone(), per_context);
            }
        }

        let mut parameters = BTreeMap::new();
        for (key, param) in &workflow.parameters {
            let value = if param.value.is_null() {
                scalar_to_string(&param.default)
            } else {
                scalar_to_string(&param.value)
            };
            parameters.insert(key.clone(), value);
        }

        for node in self.nodes.values_mut() {
            if let DagNode::Step(step_node) = node {
                let mut tmpl = TemplateContext {
                    parameters: parameters.clone(),
                    ..TemplateContext::default()
                };
                for (key, per_context) in &input_values {
                    if let Some(value) = per_context
                        .get(&step_node.source_context)
                        .or_else(|| per_context.values().next())
                    {
                        tmpl.inputs.insert(key.clone(), value.clone());
                    }
                }
                if let Some(step) = workflow.steps.get(&step_node.name) {
                    for dep in &step.depend {
                        if let Some(uri) = step_node.data_uris.get(&step_node.source_context)
                        {
                            // dependency output folder in this step's
                            // source context
                            let dep_uri = ParsedUri::parse(&uri.folder_uri())?.join(dep)?;
                            tmpl.step_outputs.insert(dep.clone(), dep_uri.chopped_uri);
                        }
                    }
                }
                step_node.tmpl = tmpl;
            }
        }
        Ok(())
    }

    /// Node names in dependency order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn node(&self, name: &str) -> Option<&DagNode> {
        self.nodes.get(name)
    }

    /// Names of step nodes, in traversal order.
    pub fn step_nodes(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| matches!(self.nodes.get(*name), Some(DagNode::Step(_))))
            .cloned()
            .collect()
    }
}

/// Kahn's algorithm with a lexicographic ready set, so equal-rank nodes
/// always order the same way across runs.
fn deterministic_topological_sort(
    graph: &DiGraph<String, ()>,
    indices: &BTreeMap<String, NodeIndex>,
) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();
    for (name, index) in indices {
        in_degree.insert(
            name.clone(),
            graph
                .neighbors_directed(*index, petgraph::Direction::Incoming)
                .count(),
        );
    }

    let mut ready: BTreeSet<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| name.clone())
        .collect();

    let mut order = Vec::with_capacity(indices.len());
    while let Some(name) = ready.iter().next().cloned() {
        ready.remove(&name);
        order.push(name.clone());
        let index = indices[&name];
        for neighbor in graph.neighbors_directed(index, petgraph::Direction::Outgoing) {
            let neighbor_name = &graph[neighbor];
            if let Some(degree) = in_degree.get_mut(neighbor_name) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(neighbor_name.clone());
                }
            }
        }
    }

    if order.len() != indices.len() {
        return Err(EngineError::Workflow(
            "cycle detected in workflow graph".to_string(),
        ));
    }
    Ok(order)
}
