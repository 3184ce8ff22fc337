//! Node configuration, loadable from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::DEFAULT_FINISHED_HISTORY;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// How long any single receive may wait before the run fails.
    pub session_timeout_secs: u64,
    /// Where run checkpoints are kept. In memory only when unset.
    pub checkpoint_dir: Option<PathBuf>,
    /// Append-only registry journal. In memory only when unset.
    pub journal_path: Option<PathBuf>,
    /// How many finished runs stay inspectable in memory.
    pub finished_run_history: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 30,
            checkpoint_dir: None,
            journal_path: None,
            finished_run_history: DEFAULT_FINISHED_HISTORY,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: NodeConfig =
            serde_json::from_slice(&data).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if config.session_timeout_secs == 0 {
            return Err(ConfigError::Invalid("session_timeout_secs must be positive".into()));
        }
        Ok(config)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "journal_path": "/var/lib/node/mappings.jsonl" }"#).unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.session_timeout(), Duration::from_secs(30));
        assert_eq!(config.checkpoint_dir, None);
        assert_eq!(config.finished_run_history, DEFAULT_FINISHED_HISTORY);
        assert_eq!(config.journal_path, Some(PathBuf::from("/var/lib/node/mappings.jsonl")));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "session_timeout_secs": 0 }"#).unwrap();

        assert!(matches!(NodeConfig::load(&path), Err(ConfigError::Invalid(_))));
    }
}
