//! Host key-value store seam.
//!
//! The kernel persists plugin configuration, permission grant tables,
//! plugin storage entries and the installed-manifest list through this
//! trait. The on-disk format belongs to the host; [`MemoryStore`] is the
//! in-process implementation used by tests and embedders without
//! persistence.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Persistent key-value storage provided by the host.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> crate::Result<Option<Value>>;

    fn set(&self, key: &str, value: Value) -> crate::Result<()>;

    /// Removes a key. Returns true if it existed.
    fn remove(&self, key: &str) -> crate::Result<bool>;

    /// All keys starting with `prefix`, in lexicographic order.
    fn keys_with_prefix(&self, prefix: &str) -> crate::Result<Vec<String>>;
}

/// Key layout shared by every subsystem that persists state.
pub mod keys {
    use crate::PluginId;

    /// Installed-plugin manifest list.
    pub const INSTALLED: &str = "kernel:installed";

    #[must_use]
    pub fn plugin_prefix(plugin: &PluginId) -> String {
        format!("plugin:{plugin}:")
    }

    #[must_use]
    pub fn config(plugin: &PluginId) -> String {
        format!("plugin:{plugin}:config")
    }

    #[must_use]
    pub fn permissions(plugin: &PluginId) -> String {
        format!("plugin:{plugin}:permissions")
    }

    #[must_use]
    pub fn storage_prefix(plugin: &PluginId) -> String {
        format!("plugin:{plugin}:storage:")
    }

    #[must_use]
    pub fn storage(plugin: &PluginId, key: &str) -> String {
        format!("plugin:{plugin}:storage:{key}")
    }
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> crate::Result<Option<Value>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: Value) -> crate::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> crate::Result<bool> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> crate::Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefix_scan_is_bounded() {
        let store = MemoryStore::new();
        store.set("plugin:a:storage:x", json!(1)).unwrap();
        store.set("plugin:a:storage:y", json!(2)).unwrap();
        store.set("plugin:ab:storage:z", json!(3)).unwrap();
        store.set("plugin:b:config", json!({})).unwrap();

        let keys = store.keys_with_prefix("plugin:a:").unwrap();
        assert_eq!(keys, vec!["plugin:a:storage:x", "plugin:a:storage:y"]);
    }

    #[test]
    fn remove_reports_presence() {
        let store = MemoryStore::new();
        store.set("k", json!("v")).unwrap();
        assert!(store.remove("k").unwrap());
        assert!(!store.remove("k").unwrap());
        assert!(store.is_empty());
    }
}
