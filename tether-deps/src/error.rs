//! Error types for dependency resolution.

use tether_types::PluginId;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DepsError {
    #[error("plugin not found: {0}")]
    NotRegistered(PluginId),

    #[error("plugin already registered: {0}")]
    AlreadyRegistered(PluginId),

    #[error("invalid version: {0:?}")]
    InvalidVersion(String),

    #[error("unsupported version range: {0:?}")]
    UnsupportedRange(String),

    #[error("circular dependency: {}", render_path(.path))]
    CyclicDependency { path: Vec<PluginId> },

    #[error("plugin '{plugin}' conflicts with: {}", render_list(.with))]
    Conflict { plugin: PluginId, with: Vec<PluginId> },

    #[error("plugin '{plugin}' has unsatisfied dependencies: {}", render_list(.missing))]
    Unsatisfied {
        plugin: PluginId,
        missing: Vec<PluginId>,
    },

    #[error("market error: {0}")]
    Market(String),
}

pub(crate) fn render_path(path: &[PluginId]) -> String {
    path.iter()
        .map(PluginId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn render_list(ids: &[PluginId]) -> String {
    ids.iter()
        .map(PluginId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, DepsError>;
