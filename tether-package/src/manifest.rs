//! `manifest.toml` inside a plugin package.

use serde::{Deserialize, Serialize};
use tether_types::PluginManifest;

use crate::{PackageError, Result};

/// How the host should load `module.bin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Loader-defined format name, e.g. `"wasm"`.
    pub format: String,
    /// Entry point the loader resolves inside the module.
    pub entry: String,
}

impl ModuleDescriptor {
    #[must_use]
    pub fn new(format: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            entry: entry.into(),
        }
    }
}

/// Top-level package manifest: the plugin manifest plus the module
/// descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub plugin: PluginManifest,
    pub module: ModuleDescriptor,
}

impl PackageManifest {
    #[must_use]
    pub fn new(plugin: PluginManifest, module: ModuleDescriptor) -> Self {
        Self { plugin, module }
    }

    pub fn validate(&self) -> Result<()> {
        self.plugin.validate()?;
        if self.module.format.trim().is_empty() {
            return Err(PackageError::ManifestInvalid("module.format is required".into()));
        }
        if self.module.entry.trim().is_empty() {
            return Err(PackageError::ManifestInvalid("module.entry is required".into()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(s)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tether_types::{Capability, DependencyKind, DependencySpec};

    #[test]
    fn toml_layout() {
        let text = r#"
[plugin]
id = "acme.rss"
name = "RSS Reader"
version = "1.2.0"
description = "Feed reader"
declared_capabilities = [{ kind = "network" }, { kind = "domain", value = "feeds.example.com" }]

[[plugin.dependencies]]
id = "acme.http"
version_range = "^1.0.0"

[[plugin.dependencies]]
id = "acme.legacy-rss"
kind = "CONFLICTS"

[module]
format = "wasm"
entry = "main"
"#;
        let manifest = PackageManifest::from_toml(text).unwrap();
        assert_eq!(manifest.plugin.id.as_str(), "acme.rss");
        assert_eq!(
            manifest.plugin.declared_capabilities,
            vec![Capability::Network, Capability::Domain("feeds.example.com".into())]
        );
        assert_eq!(
            manifest.plugin.dependencies[0],
            DependencySpec::required("acme.http", Some("^1.0.0"))
        );
        assert_eq!(
            manifest.plugin.dependencies[1].effective_kind(),
            DependencyKind::Conflicts
        );
        assert_eq!(manifest.module, ModuleDescriptor::new("wasm", "main"));

        let again = PackageManifest::from_toml(&manifest.to_toml().unwrap()).unwrap();
        assert_eq!(again, manifest);
    }

    #[test]
    fn empty_entry_is_invalid() {
        let manifest = PackageManifest::new(
            PluginManifest::new("acme.a", "A", "1.0.0"),
            ModuleDescriptor::new("wasm", " "),
        );
        assert!(matches!(manifest.validate(), Err(PackageError::ManifestInvalid(_))));
    }
}
