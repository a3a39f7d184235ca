//! Task bodies and the type registry
//!
//! Every node delegates its work to a [`TaskBody`] created by a factory
//! registered under the node's type tag. The engine only ever calls
//! [`TaskBody::execute`]; what a task actually does is up to the host.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::graph::NodeCategory;
use super::result::ExecutionResult;
use super::tasks;
use crate::workflow::{ExecutionContext, NodeDefinition, PortDefinition};

/// A resolved invocation of one node
#[derive(Debug, Clone)]
pub struct NodeInvocation {
    pub node_id: String,
    pub node_type: String,
    /// Node config with `{{ }}` templates already substituted
    pub config: Map<String, Value>,
    /// Values transferred onto the node's input ports
    pub inputs: HashMap<String, Value>,
}

impl NodeInvocation {
    pub fn new(node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            config: Map::new(),
            inputs: HashMap::new(),
        }
    }

    /// Look up a parameter: a connected input wins over static config
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.inputs
            .get(key)
            .filter(|v| !v.is_null())
            .or_else(|| self.config.get(key))
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.param(key).and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.param(key).and_then(|v| match v {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    /// Required string parameter
    pub fn require_str(&self, key: &str) -> anyhow::Result<&str> {
        self.param_str(key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("node '{}' requires '{}'", self.node_id, key))
    }
}

/// Polymorphic node implementation
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// How the scheduler treats nodes of this type
    fn category(&self) -> NodeCategory {
        NodeCategory::Plain
    }

    /// Default input ports
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::exec("exec_in")]
    }

    /// Default output ports
    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::exec("exec_out")]
    }

    async fn execute(
        &self,
        node: &NodeInvocation,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionResult>;
}

/// Factory creating a task body for one node definition
pub type TaskFactory =
    Arc<dyn Fn(&NodeDefinition) -> anyhow::Result<Arc<dyn TaskBody>> + Send + Sync>;

/// Registry of task factories keyed by type tag
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in control-flow task
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        tasks::register_builtins(&mut registry);
        registry
    }

    /// Register a factory for a type tag, replacing any previous one
    pub fn register<F>(&mut self, node_type: &str, factory: F) -> &mut Self
    where
        F: Fn(&NodeDefinition) -> anyhow::Result<Arc<dyn TaskBody>> + Send + Sync + 'static,
    {
        self.factories
            .insert(node_type.to_string(), Arc::new(factory));
        self
    }

    /// Register a stateless task constructed with `Default`
    pub fn register_default<T>(&mut self, node_type: &str) -> &mut Self
    where
        T: TaskBody + Default + 'static,
    {
        self.register(node_type, |_| Ok(Arc::new(T::default()) as Arc<dyn TaskBody>))
    }

    /// Register one shared instance for every node of a type
    pub fn register_instance(&mut self, node_type: &str, task: Arc<dyn TaskBody>) -> &mut Self {
        self.register(node_type, move |_| Ok(task.clone()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Create the task body for a node; `None` when the type is unknown
    pub fn create(&self, node: &NodeDefinition) -> Option<anyhow::Result<Arc<dyn TaskBody>>> {
        self.factories.get(&node.node_type).map(|f| f(node))
    }

    /// Registered type tags, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Echo;

    #[async_trait]
    impl TaskBody for Echo {
        async fn execute(
            &self,
            node: &NodeInvocation,
            _ctx: &ExecutionContext,
        ) -> anyhow::Result<ExecutionResult> {
            Ok(ExecutionResult::ok().with_data("echo", node.param("value").cloned().unwrap_or_default()))
        }
    }

    #[test]
    fn test_param_prefers_inputs() {
        let mut node = NodeInvocation::new("n", "echo");
        node.config.insert("value".into(), json!("config"));
        assert_eq!(node.param_str("value"), Some("config"));

        node.inputs.insert("value".into(), json!("wired"));
        assert_eq!(node.param_str("value"), Some("wired"));

        node.inputs.insert("value".into(), Value::Null);
        assert_eq!(node.param_str("value"), Some("config"));
    }

    #[test]
    fn test_param_coercion() {
        let mut node = NodeInvocation::new("n", "x");
        node.config.insert("count".into(), json!("3"));
        node.config.insert("flag".into(), json!("true"));
        assert_eq!(node.param_u64("count"), Some(3));
        assert_eq!(node.param_bool("flag"), Some(true));
        assert!(node.require_str("missing").is_err());
    }

    #[tokio::test]
    async fn test_register_and_create() {
        let mut registry = TaskRegistry::new();
        registry.register_default::<Echo>("echo");
        assert!(registry.contains("echo"));

        let def = NodeDefinition::new("n1", "echo");
        let task = registry.create(&def).unwrap().unwrap();
        assert_eq!(task.category(), NodeCategory::Plain);

        let mut node = NodeInvocation::new("n1", "echo");
        node.config.insert("value".into(), json!(7));
        let result = task.execute(&node, &ExecutionContext::default()).await.unwrap();
        assert_eq!(result.data["echo"], json!(7));

        assert!(registry.create(&NodeDefinition::new("n2", "unknown")).is_none());
    }

    #[test]
    fn test_builtins_registered() {
        let registry = TaskRegistry::with_builtins();
        for tag in ["start", "end", "if", "fork", "join", "try", "catch", "parallel_foreach"] {
            assert!(registry.contains(tag), "missing builtin {}", tag);
        }
    }
}
