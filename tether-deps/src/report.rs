//! Dependency check results.

use crate::{DepsError, FetchedPackage, Result};
use tether_types::{DependencyKind, PluginId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatisfiedDependency {
    pub plugin_id: PluginId,
    pub kind: DependencyKind,
    /// Installed version, or the fetched version when auto-installed.
    pub version: String,
    pub auto_installed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsatisfiedReason {
    Missing,
    VersionMismatch { installed: String },
    /// The declared range uses syntax outside the supported subset.
    InvalidRange(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsatisfiedDependency {
    pub plugin_id: PluginId,
    pub kind: DependencyKind,
    pub version_range: Option<String>,
    pub reason: UnsatisfiedReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyConflict {
    pub plugin_id: PluginId,
    pub installed_version: String,
    pub version_range: Option<String>,
}

/// Outcome of [`crate::DependencyResolver::check_dependencies`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyReport {
    pub plugin_id: Option<PluginId>,
    pub success: bool,
    pub satisfied: Vec<SatisfiedDependency>,
    /// Unresolved REQUIRED edges.
    pub unsatisfied: Vec<UnsatisfiedDependency>,
    /// Unresolved optional, recommended and enhancing edges. Informational.
    pub optional_unsatisfied: Vec<UnsatisfiedDependency>,
    pub conflicts: Vec<DependencyConflict>,
    pub cycle: Option<Vec<PluginId>>,
    pub error_message: Option<String>,
    /// Packages fetched by auto-install, ready for the caller to install.
    pub fetched: Vec<FetchedPackage>,
}

impl DependencyReport {
    pub(crate) fn for_plugin(plugin_id: PluginId) -> Self {
        Self {
            plugin_id: Some(plugin_id),
            ..Self::default()
        }
    }

    pub(crate) fn cyclic(plugin_id: PluginId, path: Vec<PluginId>) -> Self {
        let message = DepsError::CyclicDependency { path: path.clone() }.to_string();
        Self {
            plugin_id: Some(plugin_id),
            success: false,
            cycle: Some(path),
            error_message: Some(message),
            ..Self::default()
        }
    }

    /// The error a failed report stands for. A cycle wins over
    /// conflicts, conflicts win over missing dependencies.
    #[must_use]
    pub fn failure(&self) -> Option<DepsError> {
        if self.success {
            return None;
        }
        if let Some(path) = &self.cycle {
            return Some(DepsError::CyclicDependency { path: path.clone() });
        }
        let plugin = self.plugin_id.clone().unwrap_or_else(|| PluginId::new(""));
        if !self.conflicts.is_empty() {
            return Some(DepsError::Conflict {
                plugin,
                with: self.conflicts.iter().map(|c| c.plugin_id.clone()).collect(),
            });
        }
        Some(DepsError::Unsatisfied {
            plugin,
            missing: self.unsatisfied.iter().map(|u| u.plugin_id.clone()).collect(),
        })
    }

    pub fn into_result(self) -> Result<Self> {
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}
