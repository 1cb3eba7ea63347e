//! Kernel-level error type wrapping every subsystem's error.

use tether_types::PluginId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("plugin not found: {0}")]
    NotRegistered(PluginId),

    #[error("plugin already registered: {0}")]
    AlreadyRegistered(PluginId),

    #[error(transparent)]
    Sandbox(#[from] tether_sandbox::SandboxError),

    #[error(transparent)]
    Bus(#[from] tether_bus::BusError),

    #[error(transparent)]
    Deps(#[from] tether_deps::DepsError),

    #[error(transparent)]
    Permission(#[from] tether_permissions::PermissionError),

    #[error("package error: {0}")]
    Package(#[from] tether_package::PackageError),

    #[error("store error: {0}")]
    Store(#[from] tether_types::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("module loader error: {0}")]
    Loader(String),
}

impl KernelError {
    /// Returns true if the error means a plugin's sandbox or endpoint is
    /// gone.
    #[must_use]
    pub fn is_unregistered(&self) -> bool {
        matches!(
            self,
            Self::NotRegistered(_)
                | Self::Bus(tether_bus::BusError::PluginUnregistered(_))
                | Self::Sandbox(tether_sandbox::SandboxError::Inactive(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
