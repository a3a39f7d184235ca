//! Workflow graph definitions
//!
//! This module contains the serializable graph types: nodes with typed ports
//! and the connections between them. A definition is what a graph file
//! (YAML or JSON) deserializes into before the engine compiles it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

// ============================================================================
// Ports
// ============================================================================

/// Declared value type of a data port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Any,
    String,
    Integer,
    Float,
    Boolean,
    List,
    Dict,
}

impl DataType {
    /// Check whether a produced value conforms to this type.
    ///
    /// `null` is accepted for every type; integers satisfy `Float`.
    pub fn matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            DataType::Any => true,
            DataType::String => value.is_string(),
            DataType::Integer => value.is_i64() || value.is_u64(),
            DataType::Float => value.is_number(),
            DataType::Boolean => value.is_boolean(),
            DataType::List => value.is_array(),
            DataType::Dict => value.is_object(),
        }
    }
}

/// Whether a port carries control flow or a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Exec,
    #[default]
    Data,
}

/// A named slot on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: String,

    #[serde(default)]
    pub kind: PortKind,

    #[serde(default)]
    pub data_type: DataType,
}

impl PortDefinition {
    pub fn exec(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Exec,
            data_type: DataType::Any,
        }
    }

    pub fn data(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Data,
            data_type,
        }
    }

    pub fn is_exec(&self) -> bool {
        self.kind == PortKind::Exec
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// A node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique node id within the workflow
    pub id: String,

    /// Task type tag resolved through the task registry
    #[serde(rename = "type")]
    pub node_type: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Static configuration; string values may contain `{{ }}` templates
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Extra input ports on top of the ones the task type declares
    #[serde(default)]
    pub inputs: Vec<PortDefinition>,

    /// Extra output ports on top of the ones the task type declares
    #[serde(default)]
    pub outputs: Vec<PortDefinition>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            config: Map::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_config(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    pub fn with_input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }

    /// Read a string config value
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

// ============================================================================
// Connections
// ============================================================================

/// A directed edge `(source_node, source_port) -> (target_node, target_port)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionDefinition {
    pub source_node: String,
    pub source_port: String,
    pub target_node: String,
    pub target_port: String,
}

impl ConnectionDefinition {
    pub fn new(
        source_node: impl Into<String>,
        source_port: impl Into<String>,
        target_node: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            source_node: source_node.into(),
            source_port: source_port.into(),
            target_node: target_node.into(),
            target_port: target_port.into(),
        }
    }
}

fn split_endpoint(endpoint: &str) -> Option<(String, String)> {
    let (node, port) = endpoint.rsplit_once('.')?;
    if node.is_empty() || port.is_empty() {
        return None;
    }
    Some((node.to_string(), port.to_string()))
}

impl<'de> Deserialize<'de> for ConnectionDefinition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ConnectionHelper {
            Full {
                source_node: String,
                source_port: String,
                target_node: String,
                target_port: String,
            },
            Short {
                from: String,
                to: String,
            },
        }

        match ConnectionHelper::deserialize(deserializer)? {
            ConnectionHelper::Full {
                source_node,
                source_port,
                target_node,
                target_port,
            } => Ok(ConnectionDefinition {
                source_node,
                source_port,
                target_node,
                target_port,
            }),
            ConnectionHelper::Short { from, to } => {
                let (source_node, source_port) = split_endpoint(&from).ok_or_else(|| {
                    serde::de::Error::custom(format!("expected 'node.port', got '{}'", from))
                })?;
                let (target_node, target_port) = split_endpoint(&to).ok_or_else(|| {
                    serde::de::Error::custom(format!("expected 'node.port', got '{}'", to))
                })?;
                Ok(ConnectionDefinition {
                    source_node,
                    source_port,
                    target_node,
                    target_port,
                })
            }
        }
    }
}

// ============================================================================
// Workflow
// ============================================================================

/// A complete workflow graph definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name (required)
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Initial variables seeded into the execution context
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    pub nodes: Vec<NodeDefinition>,

    #[serde(default)]
    pub connections: Vec<ConnectionDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            variables: HashMap::new(),
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(name.to_string(), value.into());
        self
    }

    /// Connect two arbitrary ports
    pub fn connect(mut self, source: &str, source_port: &str, target: &str, target_port: &str) -> Self {
        self.connections
            .push(ConnectionDefinition::new(source, source_port, target, target_port));
        self
    }

    /// Connect `source.exec_out` to `target.exec_in`
    pub fn link(self, source: &str, target: &str) -> Self {
        self.connect(source, "exec_out", target, "exec_in")
    }

    /// Connect a named exec output port of `source` to `target.exec_in`
    pub fn link_port(self, source: &str, port: &str, target: &str) -> Self {
        self.connect(source, port, target, "exec_in")
    }

    pub fn get_node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_short_connection_syntax() {
        let yaml = r#"
name: demo
nodes:
  - id: start
    type: start
  - id: done
    type: end
connections:
  - from: start.exec_out
    to: done.exec_in
"#;
        let workflow: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            workflow.connections[0],
            ConnectionDefinition::new("start", "exec_out", "done", "exec_in")
        );
    }

    #[test]
    fn test_full_connection_syntax() {
        let yaml = r#"
name: demo
nodes: []
connections:
  - source_node: a
    source_port: value
    target_node: b
    target_port: text
"#;
        let workflow: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.connections[0].target_port, "text");
    }

    #[test]
    fn test_bad_endpoint_is_rejected() {
        let yaml = r#"
name: demo
nodes: []
connections:
  - from: start
    to: done.exec_in
"#;
        assert!(serde_yaml::from_str::<WorkflowDefinition>(yaml).is_err());
    }

    #[test]
    fn test_data_type_matching() {
        assert!(DataType::Integer.matches(&json!(3)));
        assert!(!DataType::Integer.matches(&json!(3.5)));
        assert!(DataType::Float.matches(&json!(3)));
        assert!(DataType::String.matches(&Value::Null));
        assert!(!DataType::Dict.matches(&json!([1, 2])));
        assert!(DataType::Any.matches(&json!({"a": 1})));
    }

    #[test]
    fn test_builder() {
        let workflow = WorkflowDefinition::new("built")
            .node(NodeDefinition::new("s", "start"))
            .node(NodeDefinition::new("e", "end").with_config("note", "bye"))
            .link("s", "e");

        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(workflow.get_node("e").unwrap().config_str("note"), Some("bye"));
        assert_eq!(workflow.connections[0].source_port, "exec_out");
    }
}
