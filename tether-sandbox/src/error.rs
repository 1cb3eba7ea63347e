//! Error types for the sandbox manager and its facades.

use tether_types::{PluginId, SandboxId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),

    #[error("sandbox {0} is no longer active")]
    Inactive(SandboxId),

    #[error("allocation failed for plugin '{plugin_id}': {reason}")]
    Allocation { plugin_id: PluginId, reason: String },

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("permission denied: plugin '{plugin_id}' lacks '{capability}' capability")]
    CapabilityDenied {
        plugin_id: PluginId,
        capability: String,
    },

    #[error("quota exceeded: {plugin_id}: {detail}")]
    QuotaExceeded { plugin_id: PluginId, detail: String },

    #[error("no module loaded in sandbox {0}")]
    ModuleNotLoaded(SandboxId),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] tether_types::Error),
}

impl SandboxError {
    /// Returns true for quota breaches, which leave the execution running.
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
