//! Remote registry for resolving a remote by name and configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tideline_common::{Error, Result};

use crate::client::RemoteClient;
use crate::directory::DirectoryRemote;
use crate::memory::MemoryRemote;

/// Factory function type for creating remotes.
pub type RemoteFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RemoteClient>> + Send + Sync>;

/// Registry of remote factories, keyed by name.
pub struct RemoteRegistry {
    factories: HashMap<String, RemoteFactory>,
}

impl RemoteRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a remote factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: RemoteFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Remote '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a remote by name and configuration.
    ///
    /// # Errors
    /// - Remote not found
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteClient>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Remote '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered remote names.
    pub fn remotes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_remote(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the bundled remotes.
///
/// - `memory`: no configuration
/// - `directory`: `{ "root": "<path>", "poll_interval_ms": 500 }`
pub fn create_default_registry() -> RemoteRegistry {
    let mut registry = RemoteRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(MemoryRemote::new()))),
    );

    registry.factories.insert(
        "directory".to_string(),
        Box::new(|config| {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput("Directory remote requires 'root' path".to_string())
                })?;
            let mut remote = DirectoryRemote::new(root)?;
            if let Some(ms) = config.get("poll_interval_ms").and_then(|v| v.as_u64()) {
                remote = remote.with_poll_interval(Duration::from_millis(ms));
            }
            Ok(Arc::new(remote))
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = RemoteRegistry::new();
        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryRemote::new()))))
            .unwrap();

        let remote = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(remote.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = RemoteRegistry::new();
        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryRemote::new()))))
            .unwrap();
        let result = registry.register("test", Box::new(|_| Ok(Arc::new(MemoryRemote::new()))));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = RemoteRegistry::new();
        assert!(matches!(
            registry.resolve("unknown", Value::Null),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_default_registry() {
        let temp = TempDir::new().unwrap();
        let registry = create_default_registry();
        assert_eq!(registry.remotes(), vec!["directory", "memory"]);

        let remote = registry
            .resolve("directory", json!({ "root": temp.path(), "poll_interval_ms": 50 }))
            .unwrap();
        assert_eq!(remote.name(), "directory");

        assert!(registry.resolve("directory", json!({})).is_err());
    }
}
