//! Execution settings
//!
//! Settings for a single run, loadable from a YAML file:
//!
//! ```yaml
//! node_timeout: 30          # seconds
//! continue_on_error: false
//! target_node_id: save_report
//! single_node: false
//! fail_fast: false
//! foreach_batch_size: 4
//! foreach_item_timeout: 60  # seconds
//! max_parallel: 8           # 0 = unbounded
//! isolate_branch_resources: false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Settings for one run of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Deadline for a single task body
    #[serde(with = "duration_secs")]
    pub node_timeout: Duration,

    /// Keep going after a node fails outside any try scope
    pub continue_on_error: bool,

    /// Execute only `target_node_id`
    pub single_node: bool,

    /// "Run to node": stop once this node has executed
    pub target_node_id: Option<String>,

    /// Default failure policy for forks that do not set one
    pub fail_fast: bool,

    /// Default number of items per parallel foreach batch
    pub foreach_batch_size: usize,

    /// Default deadline for one foreach item
    #[serde(with = "duration_secs")]
    pub foreach_item_timeout: Duration,

    /// Upper bound on concurrently running branches/items (0 = unbounded)
    pub max_parallel: usize,

    /// Give each fork branch and foreach item its own resource handle
    pub isolate_branch_resources: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(120),
            continue_on_error: false,
            single_node: false,
            target_node_id: None,
            fail_fast: false,
            foreach_batch_size: 4,
            foreach_item_timeout: Duration::from_secs(60),
            max_parallel: 0,
            isolate_branch_resources: false,
        }
    }
}

impl ExecutionSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.node_timeout.is_zero() {
            return Err(SettingsError::Invalid("node_timeout must be positive".into()));
        }
        if self.foreach_batch_size == 0 {
            return Err(SettingsError::Invalid(
                "foreach_batch_size must be at least 1".into(),
            ));
        }
        if self.single_node && self.target_node_id.is_none() {
            return Err(SettingsError::Invalid(
                "single_node requires target_node_id".into(),
            ));
        }
        Ok(())
    }

    pub fn node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn target(mut self, node_id: impl Into<String>) -> Self {
        self.target_node_id = Some(node_id.into());
        self
    }

    pub fn single_node(mut self, node_id: impl Into<String>) -> Self {
        self.single_node = true;
        self.target_node_id = Some(node_id.into());
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = ExecutionSettings::default();
        assert_eq!(settings.node_timeout, Duration::from_secs(120));
        assert!(!settings.continue_on_error);
        assert!(settings.target_node_id.is_none());
        assert_eq!(settings.foreach_batch_size, 4);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let settings = ExecutionSettings::from_yaml(
            r#"
node_timeout: 2.5
continue_on_error: true
target_node_id: report
"#,
        )
        .unwrap();

        assert_eq!(settings.node_timeout, Duration::from_millis(2500));
        assert!(settings.continue_on_error);
        assert_eq!(settings.target_node_id.as_deref(), Some("report"));
        assert_eq!(settings.foreach_item_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(
            ExecutionSettings::from_yaml("node_timeout: 0"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            ExecutionSettings::from_yaml("single_node: true"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(ExecutionSettings::from_yaml("node_timeout: -1").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "fail_fast: true\nmax_parallel: 2\n").unwrap();

        let settings = ExecutionSettings::load(&path).unwrap();
        assert!(settings.fail_fast);
        assert_eq!(settings.max_parallel, 2);
    }
}
