//! Plugin manifest consumed at registration.
//!
//! The kernel only interprets identity, capabilities and dependencies.
//! Config schemas and i18n resources belong to the UI layer; they are
//! stored and forwarded untouched.

use crate::{Capability, PluginId};
use serde::{Deserialize, Serialize};

/// Relationship a dependency edge expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyKind {
    Required,
    Optional,
    /// The two plugins must not be installed together.
    Conflicts,
    Enhances,
    Recommends,
}

impl DependencyKind {
    /// Returns true for edges that take part in traversal and ordering.
    #[must_use]
    pub fn is_traversable(self) -> bool {
        self != Self::Conflicts
    }
}

/// A dependency declared in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub id: PluginId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_range: Option<String>,
    #[serde(default)]
    pub optional: bool,
    /// Explicit edge kind. When absent, `optional` picks between
    /// `Required` and `Optional`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DependencyKind>,
}

impl DependencySpec {
    #[must_use]
    pub fn required(id: impl Into<String>, version_range: Option<&str>) -> Self {
        Self {
            id: PluginId::new(id),
            version_range: version_range.map(str::to_string),
            optional: false,
            kind: None,
        }
    }

    #[must_use]
    pub fn of_kind(id: impl Into<String>, kind: DependencyKind, version_range: Option<&str>) -> Self {
        Self {
            id: PluginId::new(id),
            version_range: version_range.map(str::to_string),
            optional: kind != DependencyKind::Required,
            kind: Some(kind),
        }
    }

    /// The edge kind this declaration produces.
    #[must_use]
    pub fn effective_kind(&self) -> DependencyKind {
        self.kind.unwrap_or(if self.optional {
            DependencyKind::Optional
        } else {
            DependencyKind::Required
        })
    }
}

/// Top-level plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier (e.g. `"acme.notes"`).
    pub id: PluginId,
    /// Human-readable plugin name.
    pub name: String,
    /// Semver-like version string.
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub declared_capabilities: Vec<Capability>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i18n_resources: Option<serde_json::Value>,
}

impl PluginManifest {
    /// Creates a bare manifest with no capabilities or dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: PluginId::new(id),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            declared_capabilities: Vec::new(),
            dependencies: Vec::new(),
            config_schema: None,
            i18n_resources: None,
        }
    }

    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.declared_capabilities.push(capability);
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Validates required fields and id syntax.
    pub fn validate(&self) -> crate::Result<()> {
        PluginId::parse(self.id.as_str())?;
        if self.name.trim().is_empty() {
            return Err(crate::Error::InvalidManifest("name is required".into()));
        }
        if self.version.trim().is_empty() {
            return Err(crate::Error::InvalidManifest("version is required".into()));
        }
        if let Some(dep) = self.dependencies.iter().find(|d| d.id == self.id) {
            return Err(crate::Error::InvalidManifest(format!(
                "plugin '{}' cannot depend on itself",
                dep.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_kind_defaults_from_optional_flag() {
        let mut dep = DependencySpec::required("a", None);
        assert_eq!(dep.effective_kind(), DependencyKind::Required);
        dep.optional = true;
        assert_eq!(dep.effective_kind(), DependencyKind::Optional);
        dep.kind = Some(DependencyKind::Conflicts);
        assert_eq!(dep.effective_kind(), DependencyKind::Conflicts);
    }

    #[test]
    fn validate_rejects_self_dependency() {
        let m = PluginManifest::new("acme.a", "A", "1.0.0")
            .with_dependency(DependencySpec::required("acme.a", None));
        assert!(m.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_version() {
        let m = PluginManifest::new("acme.a", "A", " ");
        assert!(m.validate().is_err());
    }
}
