//! Kernel configuration (`tether.toml`).

use crate::{KernelError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tether_bus::BusConfig;
use tether_deps::CheckOptions;
use tether_monitor::MonitorConfig;
use tether_package::VerifyingKey;
use tether_sandbox::{PolicyConfig, SandboxConfig};
use tracing::{info, warn};

/// Package trust settings, the `[packages]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Hex-encoded Ed25519 public keys whose packages may be installed.
    pub trusted_keys: Vec<String>,
    /// Install packages without a trusted signature.
    pub allow_unsigned: bool,
}

impl PackageConfig {
    pub fn verifying_keys(&self) -> Result<Vec<VerifyingKey>> {
        self.trusted_keys
            .iter()
            .map(|k| {
                VerifyingKey::from_hex(k)
                    .map_err(|e| KernelError::Config(format!("trusted key {k:?}: {e}")))
            })
            .collect()
    }
}

/// Every kernel setting. All sections and fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub sandbox: SandboxConfig,
    pub bus: BusConfig,
    pub monitor: MonitorConfig,
    pub dependencies: CheckOptions,
    pub packages: PackageConfig,
    pub policy: PolicyConfig,
}

impl KernelConfig {
    /// Loads configuration from a file.
    /// A missing file means defaults; an unreadable or invalid one falls
    /// back to defaults with a warning.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No kernel config found, using defaults");
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded kernel config");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse kernel config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read kernel config");
                Self::default()
            }
        }
    }

    /// Strict parse. Unknown keys are ignored, bad values are errors.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| KernelError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tether_sandbox::PolicyMode;

    #[test]
    fn partial_sections_keep_defaults() {
        let config = KernelConfig::from_toml_str(
            r#"
[sandbox]
execution_timeout_ms = 250

[bus]
response_timeout_ms = 1000

[dependencies]
auto_install = true

[policy]
mode = "denylist"

[policy.plugins]
deny = ["acme.bad"]
"#,
        )
        .unwrap();

        assert_eq!(config.sandbox.execution_timeout_ms, 250);
        assert_eq!(config.sandbox.max_sandboxes, SandboxConfig::default().max_sandboxes);
        assert_eq!(config.bus.response_timeout_ms, 1000);
        assert!(config.dependencies.auto_install);
        assert!(config.dependencies.check_conflicts);
        assert_eq!(config.policy.mode, PolicyMode::Denylist);
        assert_eq!(config.policy.plugins.deny, vec!["acme.bad".to_string()]);
        assert_eq!(config.monitor, MonitorConfig::default());
        assert!(!config.packages.allow_unsigned);
    }

    #[test]
    fn bad_value_is_a_config_error() {
        let err = KernelConfig::from_toml_str("[sandbox]\nmax_sandboxes = \"many\"").unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn load_from_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(KernelConfig::load_from(dir.path().join("absent.toml")), KernelConfig::default());

        let path = dir.path().join("tether.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"[monitor\nbroken")
            .unwrap();
        assert_eq!(KernelConfig::load_from(&path), KernelConfig::default());

        std::fs::write(&path, "[monitor]\nreport_interval_ms = 10\n").unwrap();
        assert_eq!(KernelConfig::load_from(&path).monitor.report_interval_ms, 10);
    }

    #[test]
    fn trusted_keys_must_be_hex() {
        let config = PackageConfig {
            trusted_keys: vec!["not-a-key".into()],
            allow_unsigned: false,
        };
        assert!(matches!(config.verifying_keys(), Err(KernelError::Config(_))));
    }
}
