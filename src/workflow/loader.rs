//! Workflow file loader
//!
//! Load workflow graphs from YAML or JSON files. The format is chosen by
//! file extension (`.json` is JSON, anything else is YAML).

use std::path::Path;

use super::WorkflowDefinition;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("JSON parse error in {file}: {error}")]
    Json {
        file: String,
        error: serde_json::Error,
    },
}

pub struct WorkflowLoader;

impl WorkflowLoader {
    pub fn load_file(path: &Path) -> Result<WorkflowDefinition, LoadError> {
        let content = std::fs::read_to_string(path)?;
        let file = path.display().to_string();

        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(|error| LoadError::Json { file, error })
        } else {
            serde_yaml::from_str(&content).map_err(|error| LoadError::Yaml { file, error })
        }
    }

    pub fn from_yaml(content: &str) -> Result<WorkflowDefinition, LoadError> {
        serde_yaml::from_str(content).map_err(|error| LoadError::Yaml {
            file: "<inline>".to_string(),
            error,
        })
    }

    /// Load every `.yaml`, `.yml` and `.json` graph in a directory
    pub fn load_directory(dir: &Path) -> Result<Vec<WorkflowDefinition>, LoadError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            // Settings files live next to graphs but are not graphs
            if filename.starts_with("settings.") {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("yaml") | Some("yml") | Some("json")) {
                paths.push(path);
            }
        }
        paths.sort();

        paths.iter().map(|p| Self::load_file(p)).collect()
    }
}
