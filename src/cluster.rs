//! Cluster topology configuration.
//!
//! Describes the cluster under diagnosis: the SQL endpoint and the nodes
//! reachable over SSH. Loaded from a TOML file passed to the CLI.

use std::path::Path;

use serde::Deserialize;

use crate::infrastructure::connection::db::DbConfig;
use crate::infrastructure::connection::ssh::NodeConfig;

#[derive(Debug, thiserror::Error)]
pub enum ClusterConfigError {
    #[error("failed to read cluster config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse cluster config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("cluster config {path} declares no nodes")]
    NoNodes { path: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub db: DbConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, ClusterConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ClusterConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: ClusterConfig =
            toml::from_str(&raw).map_err(|source| ClusterConfigError::Parse {
                path: display.clone(),
                source,
            })?;
        if config.nodes.is_empty() {
            return Err(ClusterConfigError::NoNodes { path: display });
        }
        Ok(config)
    }
}
