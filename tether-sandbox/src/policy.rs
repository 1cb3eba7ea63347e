//! Kernel policy engine. Reads a `[policy]` table (standalone
//! `policy.toml` or a section of the kernel config) and enforces plugin
//! allow/deny lists, kernel-wide capability denials and quota caps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tether_types::{Capability, CapabilitySet, PluginId};
use tracing::{info, warn};

/// Which plugins may get a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only listed plugins (or plugins signed by a listed key).
    Allowlist,
    /// Every plugin except the denied ones.
    Denylist,
    #[default]
    Unrestricted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginRules {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    /// Hex-encoded signing keys whose packages pass the allowlist.
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityRules {
    /// Capability names (`network`, `api:clipboard`, `domain:x.com`, ...)
    /// stripped from every sandbox.
    pub deny: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaCaps {
    pub max_storage_bytes: Option<u64>,
    pub max_network_rate_per_minute: Option<u32>,
}

/// Policy configuration, the body of a `[policy]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    pub plugins: PluginRules,
    pub capabilities: CapabilityRules,
    pub quotas: QuotaCaps,
}

/// Enforces policy decisions.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
    policy_path: Option<PathBuf>,
}

impl PolicyEngine {
    /// Loads policy from a file if it exists.
    /// Falls back to unrestricted mode with a warning on parse errors.
    pub fn load_from(policy_path: impl AsRef<Path>) -> Self {
        let policy_path = policy_path.as_ref().to_path_buf();
        if !policy_path.exists() {
            info!(path = %policy_path.display(), "No policy file found, running unrestricted");
            return Self::default();
        }

        let config = match std::fs::read_to_string(&policy_path) {
            Ok(contents) => match toml::from_str::<PolicyFile>(&contents) {
                Ok(file) => {
                    info!(path = %policy_path.display(), "Loaded kernel policy");
                    file.policy
                }
                Err(e) => {
                    warn!(
                        path = %policy_path.display(),
                        error = %e,
                        "Failed to parse policy file, falling back to unrestricted mode"
                    );
                    PolicyConfig::default()
                }
            },
            Err(e) => {
                warn!(path = %policy_path.display(), error = %e, "Failed to read policy file");
                PolicyConfig::default()
            }
        };

        Self {
            config,
            policy_path: Some(policy_path),
        }
    }

    /// Creates a policy engine with explicit config.
    #[must_use]
    pub fn with_config(config: PolicyConfig) -> Self {
        Self {
            config,
            policy_path: None,
        }
    }

    /// Check if a plugin may be sandboxed.
    #[must_use]
    pub fn is_plugin_allowed(&self, plugin_id: &PluginId, signing_key: Option<&str>) -> bool {
        let rules = &self.config.plugins;
        match self.config.mode {
            PolicyMode::Unrestricted => true,
            PolicyMode::Allowlist => {
                rules.allow.iter().any(|id| id == plugin_id.as_str())
                    || signing_key.is_some_and(|k| rules.keys.iter().any(|ak| ak == k))
            }
            PolicyMode::Denylist => !rules.deny.iter().any(|id| id == plugin_id.as_str()),
        }
    }

    /// Check if a capability is denied kernel-wide.
    #[must_use]
    pub fn is_capability_denied(&self, capability: &Capability) -> bool {
        self.config.capabilities.deny.contains(&capability.name())
    }

    /// Strips denied capabilities and clamps quotas. Returns the names of
    /// the capabilities that were removed.
    pub fn enforce(&self, caps: &mut CapabilitySet) -> Vec<String> {
        let mut stripped = Vec::new();
        for capability in held_capabilities(caps) {
            if self.is_capability_denied(&capability) {
                caps.revoke(&capability);
                stripped.push(capability.name());
            }
        }
        if let Some(max) = self.config.quotas.max_storage_bytes {
            caps.storage_quota_bytes = caps.storage_quota_bytes.min(max);
        }
        if let Some(max) = self.config.quotas.max_network_rate_per_minute {
            caps.network_rate_per_minute = caps.network_rate_per_minute.min(max);
        }
        stripped
    }

    /// Returns whether a policy file was found.
    #[must_use]
    pub fn has_policy_file(&self) -> bool {
        self.policy_path.is_some()
    }

    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

fn held_capabilities(caps: &CapabilitySet) -> Vec<Capability> {
    let mut held = Vec::new();
    if caps.dom {
        held.push(Capability::Dom);
    }
    if caps.network {
        held.push(Capability::Network);
    }
    if caps.storage {
        held.push(Capability::Storage);
    }
    if caps.messaging {
        held.push(Capability::Messaging);
    }
    held.extend(caps.allowed_apis.iter().cloned().map(Capability::Api));
    held.extend(caps.allowed_domains.iter().cloned().map(Capability::Domain));
    held.extend(caps.custom.iter().cloned().map(Capability::Custom));
    held
}

/// Standalone `policy.toml` layout.
#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policy: PolicyConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn full_caps() -> CapabilitySet {
        CapabilitySet::from_declared(
            &[
                Capability::Network,
                Capability::Storage,
                Capability::Api("clipboard".into()),
                Capability::Domain("example.com".into()),
            ],
            10_000,
            100,
        )
    }

    fn load_policy_from_str(toml_content: &str) -> PolicyEngine {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, toml_content).unwrap();
        PolicyEngine::load_from(path)
    }

    #[test]
    fn unrestricted_allows_all() {
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        assert!(engine.is_plugin_allowed(&PluginId::new("anything"), None));
        assert!(!engine.is_capability_denied(&Capability::Network));
    }

    #[test]
    fn allowlist_mode_id_or_key_sufficient() {
        let config = PolicyConfig {
            mode: PolicyMode::Allowlist,
            plugins: PluginRules {
                allow: vec!["acme.notes".into()],
                keys: vec!["trusted-key".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = PolicyEngine::with_config(config);

        assert!(engine.is_plugin_allowed(&PluginId::new("acme.notes"), None));
        assert!(engine.is_plugin_allowed(&PluginId::new("other"), Some("trusted-key")));
        assert!(!engine.is_plugin_allowed(&PluginId::new("other"), Some("wrong-key")));
        assert!(!engine.is_plugin_allowed(&PluginId::new("other"), None));
    }

    #[test]
    fn denylist_mode_blocks_listed_allows_others() {
        let config = PolicyConfig {
            mode: PolicyMode::Denylist,
            plugins: PluginRules {
                deny: vec!["evil.plugin".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = PolicyEngine::with_config(config);
        assert!(!engine.is_plugin_allowed(&PluginId::new("evil.plugin"), None));
        assert!(engine.is_plugin_allowed(&PluginId::new("good.plugin"), None));
    }

    #[test]
    fn enforce_strips_denied_and_clamps_quotas() {
        let mut config = PolicyConfig::default();
        config.capabilities.deny.insert("network".into());
        config.capabilities.deny.insert("api:clipboard".into());
        config.quotas.max_storage_bytes = Some(4_096);
        let engine = PolicyEngine::with_config(config);

        let mut caps = full_caps();
        let stripped = engine.enforce(&mut caps);

        assert_eq!(stripped, vec!["network".to_string(), "api:clipboard".to_string()]);
        assert!(!caps.network);
        assert!(caps.storage);
        assert!(caps.allowed_apis.is_empty());
        assert_eq!(caps.storage_quota_bytes, 4_096);
        assert_eq!(caps.network_rate_per_minute, 100);
    }

    #[test]
    fn load_from_full_file() {
        let engine = load_policy_from_str(
            r#"
[policy]
mode = "allowlist"

[policy.plugins]
allow = ["acme.notes", "acme.tasks"]
keys = ["official-key"]

[policy.capabilities]
deny = ["dom"]

[policy.quotas]
max_network_rate_per_minute = 10
"#,
        );
        assert!(engine.has_policy_file());
        assert_eq!(engine.config().mode, PolicyMode::Allowlist);
        assert_eq!(engine.config().plugins.allow.len(), 2);
        assert!(engine.is_capability_denied(&Capability::Dom));
        assert_eq!(engine.config().quotas.max_network_rate_per_minute, Some(10));
    }

    #[test]
    fn load_from_missing_file_is_unrestricted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PolicyEngine::load_from(dir.path().join("nonexistent.toml"));
        assert!(!engine.has_policy_file());
        assert!(engine.is_plugin_allowed(&PluginId::new("anything"), None));
    }

    #[test]
    fn load_from_malformed_file_falls_back_unrestricted() {
        let engine = load_policy_from_str("this is not valid toml {{{{");
        assert!(engine.has_policy_file());
        assert_eq!(engine.config(), &PolicyConfig::default());
    }

    #[test]
    fn load_from_unreadable_path_falls_back_unrestricted() {
        // A directory exists but cannot be read as a file.
        let dir = tempfile::tempdir().unwrap();
        let engine = PolicyEngine::load_from(dir.path());
        assert!(engine.is_plugin_allowed(&PluginId::new("anything"), None));
    }

    #[test]
    fn empty_file_defaults_to_unrestricted() {
        let engine = load_policy_from_str("");
        assert_eq!(engine.config().mode, PolicyMode::Unrestricted);
    }
}
