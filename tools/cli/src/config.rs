//! Replica configuration: data directory, remote selection and sync tuning.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use tideline_sync::SyncConfig;

/// Contents of the optional JSON config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Directory holding the replica database.
    pub data_dir: Option<PathBuf>,
    /// Registered remote type, `directory` unless set.
    pub remote: Option<String>,
    /// Options handed to the remote factory.
    pub remote_options: Option<Value>,
    /// Bearer token; anonymous when absent.
    pub token: Option<String>,
    pub sync: SyncConfig,
}

impl CliConfig {
    /// Load `path`, or the default config when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Replica data directory: flag, then config file, then the platform
    /// data directory.
    pub fn resolve_data_dir(&self, flag: Option<&Path>, replica: &str) -> Result<PathBuf> {
        if let Some(dir) = flag.or(self.data_dir.as_deref()) {
            return Ok(dir.to_path_buf());
        }
        let base = dirs::data_dir().context("No data directory on this platform")?;
        Ok(base.join("tideline").join(replica))
    }

    /// Remote type and its factory options.
    ///
    /// A `--hub` flag selects the directory remote rooted there.
    pub fn resolve_remote(&self, hub: Option<&Path>) -> Result<(String, Value)> {
        if let Some(hub) = hub {
            return Ok((
                "directory".to_string(),
                serde_json::json!({ "root": hub.to_string_lossy() }),
            ));
        }

        let name = self.remote.clone().unwrap_or_else(|| "directory".to_string());
        let options = match &self.remote_options {
            Some(options) => options.clone(),
            None if name == "directory" => {
                let base = dirs::data_dir().context("No data directory on this platform")?;
                let root = base.join("tideline").join("hub");
                serde_json::json!({ "root": root.to_string_lossy() })
            }
            None => Value::Null,
        };
        Ok((name, options))
    }
}
