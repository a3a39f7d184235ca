//! Variable Resolver - data propagation between ports
//!
//! Before a node runs, values produced on connected output ports are copied
//! onto its input ports and its config templates are resolved. After it
//! runs, produced values are checked against the declared port types.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::warn;

use super::graph::{GraphNode, WorkflowGraph};
use super::registry::NodeInvocation;
use super::result::ExecutionResult;
use crate::workflow::expressions::{navigate, resolve_value, ValueLookup};
use crate::workflow::{ExecutionContext, VariableMap};

/// Last-resolved input values and produced output values, per node
#[derive(Debug, Clone, Default)]
pub struct PortValues {
    inputs: HashMap<String, HashMap<String, Value>>,
    outputs: HashMap<String, HashMap<String, Value>>,
}

impl PortValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self, node_id: &str, port: &str) -> Option<&Value> {
        self.outputs.get(node_id).and_then(|ports| ports.get(port))
    }

    pub fn outputs_of(&self, node_id: &str) -> Option<&HashMap<String, Value>> {
        self.outputs.get(node_id)
    }

    pub fn inputs_of(&self, node_id: &str) -> Option<&HashMap<String, Value>> {
        self.inputs.get(node_id)
    }

    /// Store produced values on a node's output ports
    pub fn store_outputs(&mut self, node_id: &str, data: &HashMap<String, Value>) {
        let ports = self.outputs.entry(node_id.to_string()).or_default();
        for (port, value) in data {
            ports.insert(port.clone(), value.clone());
        }
    }

    pub fn set_input(&mut self, node_id: &str, port: &str, value: Value) {
        self.inputs
            .entry(node_id.to_string())
            .or_default()
            .insert(port.to_string(), value);
    }

    /// Fold outputs produced by a branch scope into this one
    pub fn merge_outputs(&mut self, other: &PortValues) {
        for (node_id, ports) in &other.outputs {
            self.store_outputs(node_id, ports);
        }
    }
}

/// Lookup over context variables first, then `node_id.port` outputs
pub struct ScopeLookup<'a> {
    variables: VariableMap,
    ports: &'a PortValues,
}

impl<'a> ScopeLookup<'a> {
    pub fn new(variables: VariableMap, ports: &'a PortValues) -> Self {
        Self { variables, ports }
    }
}

impl ValueLookup for ScopeLookup<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.variables.lookup(path) {
            return Some(value);
        }
        let mut parts = path.split('.');
        let node_id = parts.next()?;
        let port = parts.next()?;
        let value = self.ports.output(node_id, port)?;
        navigate(value, parts).cloned()
    }
}

/// Resolves node inputs and validates node outputs against a graph
pub struct VariableResolver<'g> {
    graph: &'g WorkflowGraph,
}

impl<'g> VariableResolver<'g> {
    pub fn new(graph: &'g WorkflowGraph) -> Self {
        Self { graph }
    }

    /// Copy connected source outputs onto every input port of `node_id`.
    ///
    /// When several connections feed one port the last declared one wins.
    /// Sources that have not produced a value leave the port untouched.
    pub fn transfer_inputs_to_node(&self, node_id: &str, ports: &mut PortValues) -> HashMap<String, Value> {
        for conn in self.graph.data_sources(node_id) {
            if let Some(value) = ports.output(&conn.source_node, &conn.source_port).cloned() {
                ports.set_input(node_id, &conn.target_port, value);
            }
        }
        ports.inputs_of(node_id).cloned().unwrap_or_default()
    }

    /// Build the invocation for a node: inputs transferred and config
    /// templates resolved against variables and prior outputs
    pub async fn prepare(
        &self,
        node: &GraphNode,
        ctx: &ExecutionContext,
        ports: &mut PortValues,
    ) -> NodeInvocation {
        let inputs = self.transfer_inputs_to_node(&node.id, ports);
        let lookup = ScopeLookup::new(ctx.variables().snapshot().await, ports);
        let config: Map<String, Value> = node
            .config
            .iter()
            .map(|(k, v)| (k.clone(), resolve_value(v, &lookup)))
            .collect();

        NodeInvocation {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            config,
            inputs,
        }
    }

    /// Check produced values against declared output types (non-fatal).
    ///
    /// Returns the names of mismatched ports.
    pub fn validate_output_ports(&self, node: &GraphNode, result: &ExecutionResult) -> Vec<String> {
        let mut mismatched = Vec::new();
        for port in node.outputs.iter().filter(|p| !p.is_exec()) {
            if let Some(value) = result.data.get(&port.name) {
                if !port.data_type.matches(value) {
                    warn!(
                        node_id = %node.id,
                        port = %port.name,
                        expected = ?port.data_type,
                        "Output value does not match declared port type"
                    );
                    mismatched.push(port.name.clone());
                }
            }
        }
        mismatched
    }
}
