//! Compiled workflow graph
//!
//! A [`WorkflowGraph`] is the immutable per-run view of a
//! [`WorkflowDefinition`]: every node has its task body resolved through the
//! registry, its full port list, and its connections indexed by port. It
//! answers the structural queries the scheduler needs (start nodes, next
//! nodes, loop bodies, run-to-node subgraphs).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use super::error::EngineError;
use super::registry::{TaskBody, TaskRegistry};
use super::result::ExecutionResult;
use crate::workflow::{ConnectionDefinition, PortDefinition, WorkflowDefinition};

/// How the scheduler treats a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeCategory {
    Plain,
    Start,
    End,
    /// `if` / `switch`
    Branch,
    LoopStart,
    LoopEnd,
    /// `break` / `continue`
    LoopControl,
    Fork,
    Join,
    Try,
    Catch,
    ForEach,
}

impl NodeCategory {
    /// Control-flow nodes may execute more than once per run
    pub fn is_control_flow(&self) -> bool {
        !matches!(self, NodeCategory::Plain | NodeCategory::Start | NodeCategory::End)
    }

    /// Catch and join close a try or fork and run once per pass through it
    pub fn closes_scope(&self) -> bool {
        matches!(self, NodeCategory::Catch | NodeCategory::Join)
    }
}

/// A node with its task body resolved
#[derive(Clone)]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
    pub name: Option<String>,
    pub category: NodeCategory,
    pub config: Map<String, Value>,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
    pub task: Arc<dyn TaskBody>,
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("category", &self.category)
            .finish()
    }
}

impl GraphNode {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn input_port(&self, name: &str) -> Option<&PortDefinition> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&PortDefinition> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub fn has_exec_ports(&self) -> bool {
        self.inputs.iter().chain(&self.outputs).any(|p| p.is_exec())
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Merge declared extra ports into the task's defaults, keeping first-seen order
fn merge_ports(defaults: Vec<PortDefinition>, extra: &[PortDefinition]) -> Vec<PortDefinition> {
    let mut ports = defaults;
    for port in extra {
        match ports.iter_mut().find(|p| p.name == port.name) {
            Some(existing) => *existing = port.clone(),
            None => ports.push(port.clone()),
        }
    }
    ports
}

/// Immutable graph for one run
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    name: String,
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    connections: Vec<ConnectionDefinition>,
    /// (source_node, source_port) -> exec targets, in declaration order
    exec_out: HashMap<(String, String), Vec<String>>,
    /// target_node -> data connections feeding it, in declaration order
    data_in: HashMap<String, Vec<ConnectionDefinition>>,
    /// Exec adjacency including implicit control edges (loop end -> loop
    /// start, try -> catch, fork -> join)
    forward: HashMap<String, Vec<String>>,
    backward: HashMap<String, Vec<String>>,
}

impl WorkflowGraph {
    /// Compile and validate a definition
    pub fn build(def: &WorkflowDefinition, registry: &TaskRegistry) -> Result<Self, EngineError> {
        let mut nodes = Vec::with_capacity(def.nodes.len());
        let mut index = HashMap::new();

        for node_def in &def.nodes {
            if index.contains_key(&node_def.id) {
                return Err(EngineError::DuplicateNode(node_def.id.clone()));
            }
            let task = registry
                .create(node_def)
                .ok_or_else(|| EngineError::UnknownNodeType {
                    node_id: node_def.id.clone(),
                    node_type: node_def.node_type.clone(),
                })?
                .map_err(|e| EngineError::TaskConstruction {
                    node_id: node_def.id.clone(),
                    message: e.to_string(),
                })?;

            index.insert(node_def.id.clone(), nodes.len());
            nodes.push(GraphNode {
                id: node_def.id.clone(),
                node_type: node_def.node_type.clone(),
                name: node_def.name.clone(),
                category: task.category(),
                config: node_def.config.clone(),
                inputs: merge_ports(task.input_ports(), &node_def.inputs),
                outputs: merge_ports(task.output_ports(), &node_def.outputs),
                task,
            });
        }

        let mut graph = Self {
            name: def.name.clone(),
            nodes,
            index,
            connections: def.connections.clone(),
            exec_out: HashMap::new(),
            data_in: HashMap::new(),
            forward: HashMap::new(),
            backward: HashMap::new(),
        };

        for conn in &def.connections {
            for endpoint in [&conn.source_node, &conn.target_node] {
                if !graph.index.contains_key(endpoint) {
                    return Err(EngineError::DanglingConnection {
                        node: endpoint.clone(),
                    });
                }
            }
            if graph.is_exec_connection(conn) {
                graph
                    .exec_out
                    .entry((conn.source_node.clone(), conn.source_port.clone()))
                    .or_default()
                    .push(conn.target_node.clone());
                graph.add_edge(&conn.source_node, &conn.target_node);
            } else {
                graph
                    .data_in
                    .entry(conn.target_node.clone())
                    .or_default()
                    .push(conn.clone());
            }
        }

        for (from, to) in graph.implicit_edges() {
            graph.add_edge(&from, &to);
        }

        debug!(
            workflow = %graph.name,
            nodes = graph.nodes.len(),
            connections = graph.connections.len(),
            "Compiled workflow graph"
        );
        Ok(graph)
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        let out = self.forward.entry(from.to_string()).or_default();
        if !out.iter().any(|n| n == to) {
            out.push(to.to_string());
        }
        let back = self.backward.entry(to.to_string()).or_default();
        if !back.iter().any(|n| n == from) {
            back.push(from.to_string());
        }
    }

    /// Control edges implied by node config rather than by connections
    fn implicit_edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for node in &self.nodes {
            match node.category {
                NodeCategory::LoopEnd => {
                    if let Some(start) = node.config_str("loop_start_id") {
                        edges.push((node.id.clone(), start.to_string()));
                    }
                }
                NodeCategory::Catch => {
                    if let Some(try_id) = node.config_str("try_node_id") {
                        edges.push((try_id.to_string(), node.id.clone()));
                    }
                }
                NodeCategory::Fork => {
                    if let Some(join) = self.paired_join(&node.id) {
                        edges.push((node.id.clone(), join));
                    }
                }
                _ => {}
            }
        }
        edges
            .into_iter()
            .filter(|(a, b)| self.index.contains_key(a) && self.index.contains_key(b))
            .collect()
    }

    /// A connection carries control flow iff either endpoint is an exec port
    fn is_exec_connection(&self, conn: &ConnectionDefinition) -> bool {
        let source_exec = self
            .node(&conn.source_node)
            .and_then(|n| n.output_port(&conn.source_port))
            .map(|p| p.is_exec());
        let target_exec = self
            .node(&conn.target_node)
            .and_then(|n| n.input_port(&conn.target_port))
            .map(|p| p.is_exec());
        source_exec == Some(true) || target_exec == Some(true)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn require(&self, id: &str) -> Result<&GraphNode, EngineError> {
        self.node(id)
            .ok_or_else(|| EngineError::NodeNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn connections(&self) -> &[ConnectionDefinition] {
        &self.connections
    }

    /// Data connections feeding a node, in declaration order
    pub fn data_sources(&self, node_id: &str) -> &[ConnectionDefinition] {
        self.data_in.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Targets wired to one exec output port
    pub fn exec_targets(&self, node_id: &str, port: &str) -> Vec<String> {
        self.exec_out
            .get(&(node_id.to_string(), port.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Exec output ports of a node that have at least one connection,
    /// in connection declaration order
    pub fn connected_exec_ports(&self, node_id: &str) -> Vec<String> {
        let mut ports: Vec<String> = Vec::new();
        for conn in &self.connections {
            if conn.source_node == node_id
                && self.is_exec_connection(conn)
                && !ports.contains(&conn.source_port)
            {
                ports.push(conn.source_port.clone());
            }
        }
        ports
    }

    fn has_incoming_exec(&self, node_id: &str) -> bool {
        self.exec_out
            .values()
            .any(|targets| targets.iter().any(|t| t == node_id))
    }

    // ========================================================================
    // Structural queries
    // ========================================================================

    /// Nodes with no incoming exec connection and a plain or start category.
    ///
    /// Start-category nodes come first, the rest in declaration order.
    pub fn find_start_nodes(&self) -> Vec<String> {
        let candidates: Vec<&GraphNode> = self
            .nodes
            .iter()
            .filter(|n| matches!(n.category, NodeCategory::Start | NodeCategory::Plain))
            .filter(|n| n.has_exec_ports())
            .filter(|n| !self.has_incoming_exec(&n.id))
            .collect();

        candidates
            .iter()
            .filter(|n| n.category == NodeCategory::Start)
            .chain(candidates.iter().filter(|n| n.category != NodeCategory::Start))
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn is_control_flow_node(&self, id: &str) -> bool {
        self.node(id)
            .map(|n| n.category.is_control_flow())
            .unwrap_or(false)
    }

    /// Nodes reachable from a port of `from` without crossing any node in
    /// `boundary` (the boundary nodes themselves are excluded)
    pub fn reachable_from_port(&self, from: &str, port: &str, boundary: &[&str]) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = self.exec_targets(from, port).into();

        while let Some(id) = queue.pop_front() {
            if boundary.contains(&id.as_str()) || id == from || !seen.insert(id.clone()) {
                continue;
            }
            for (key, targets) in &self.exec_out {
                if key.0 == id {
                    queue.extend(targets.iter().cloned());
                }
            }
        }
        seen
    }

    /// Every node inside a loop's body, used to clear state for re-iteration
    pub fn find_loop_body_nodes(&self, loop_start_id: &str, loop_end_id: &str) -> HashSet<String> {
        self.reachable_from_port(loop_start_id, "body", &[loop_end_id])
    }

    /// Output ports fired by a result
    pub fn fired_ports(&self, node_id: &str, result: &ExecutionResult) -> Vec<String> {
        if let Some(ports) = &result.next_nodes {
            return ports.clone();
        }
        let Some(node) = self.node(node_id) else {
            return Vec::new();
        };
        if node.output_port("exec_out").is_some() {
            return vec!["exec_out".to_string()];
        }
        if let Some(Value::Bool(flag)) = result.data.get("result") {
            return vec![if *flag { "true" } else { "false" }.to_string()];
        }
        if let Some(case) = result.data.get("matched_case") {
            let port = format!("case_{}", crate::workflow::expressions::display_value(case));
            let known = node.output_port(&port).is_some()
                || !self.exec_targets(node_id, &port).is_empty();
            return vec![if known { port } else { "default".to_string() }];
        }
        Vec::new()
    }

    /// Targets of every fired port; fan-out enqueues all of them
    pub fn get_next_nodes(&self, node_id: &str, result: &ExecutionResult) -> Vec<String> {
        let mut next = Vec::new();
        for port in self.fired_ports(node_id, result) {
            let targets = self.exec_targets(node_id, &port);
            if targets.is_empty() {
                debug!(node_id, port = %port, "Fired port has no connection");
            }
            next.extend(targets);
        }
        next
    }

    /// Transitive exec successors (including implicit control edges)
    pub fn successors(&self, id: &str) -> HashSet<String> {
        Self::closure(&self.forward, id)
    }

    /// Transitive exec predecessors (including implicit control edges)
    pub fn predecessors(&self, id: &str) -> HashSet<String> {
        Self::closure(&self.backward, id)
    }

    fn closure(adjacency: &HashMap<String, Vec<String>>, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            for next in adjacency.get(&current).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    stack.push(next.clone());
                }
            }
        }
        seen
    }

    /// Nodes on some path from `start` to `target`, both included
    pub fn path_nodes(&self, start: &str, target: &str) -> HashSet<String> {
        let mut downstream = self.successors(start);
        downstream.insert(start.to_string());
        if !downstream.contains(target) {
            return HashSet::new();
        }
        let mut upstream = self.predecessors(target);
        upstream.insert(target.to_string());
        downstream.intersection(&upstream).cloned().collect()
    }

    // ========================================================================
    // Control-flow pairing
    // ========================================================================

    /// `loop_end` node closing a loop start
    pub fn paired_loop_end(&self, loop_start_id: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|n| {
                n.category == NodeCategory::LoopEnd
                    && n.config_str("loop_start_id") == Some(loop_start_id)
            })
            .map(|n| n.id.clone())
    }

    /// `catch` node handling errors of a try scope
    pub fn paired_catch(&self, try_node_id: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|n| {
                n.category == NodeCategory::Catch
                    && n.config_str("try_node_id") == Some(try_node_id)
            })
            .map(|n| n.id.clone())
    }

    /// `join` node closing a fork: the fork's `join_node_id`, otherwise a join
    /// whose `fork_node_id` points back at the fork
    pub fn paired_join(&self, fork_node_id: &str) -> Option<String> {
        if let Some(join) = self
            .node(fork_node_id)
            .and_then(|n| n.config_str("join_node_id"))
            .filter(|id| self.contains(id))
        {
            return Some(join.to_string());
        }
        self.nodes
            .iter()
            .find(|n| {
                n.category == NodeCategory::Join
                    && n.config_str("fork_node_id") == Some(fork_node_id)
            })
            .map(|n| n.id.clone())
    }

    /// Nodes inside a try scope's body
    pub fn try_body_nodes(&self, try_node_id: &str) -> HashSet<String> {
        match self.paired_catch(try_node_id) {
            Some(catch) => self.reachable_from_port(try_node_id, "try_body", &[catch.as_str()]),
            None => self.reachable_from_port(try_node_id, "try_body", &[]),
        }
    }
}
