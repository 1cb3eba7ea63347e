//! Capability-gated plugin sandboxes.
//!
//! Each plugin gets one sandbox: an effective capability set, usage
//! counters, and an attached [`PluginModule`]. Isolation is logical. Plugin
//! code reaches storage, the network and logging only through the
//! facades of a [`SandboxScope`], which enforce capabilities and quotas on
//! every call.

mod error;
mod manager;
mod module;
pub mod network;
pub mod policy;
mod sandbox;
mod scope;

pub use error::{Result, SandboxError};
pub use manager::{persisted_storage_bytes, SandboxManager};
pub use module::{ExecutionResult, ModuleError, PluginModule, ResourceUsage, EXECUTION_TIMEOUT};
pub use network::{DisabledTransport, NetworkRequest, NetworkResponse, NetworkTransport, ReqwestTransport};
pub use policy::{PolicyConfig, PolicyEngine, PolicyMode};
pub use scope::{entry_size, NetworkFacade, PluginLogger, SandboxScope, StorageFacade};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sandbox settings, read from the `[sandbox]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Live sandboxes the host can provision.
    pub max_sandboxes: usize,
    pub execution_timeout_ms: u64,
    /// Storage quota for plugins that declare storage.
    pub default_storage_quota_bytes: u64,
    pub default_network_rate_per_minute: u32,
    /// Back the network facade with a real HTTP client. Off means every
    /// request is refused unless the host wires its own transport.
    pub http_transport: bool,
}

impl SandboxConfig {
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_sandboxes: 64,
            execution_timeout_ms: 5_000,
            default_storage_quota_bytes: 5 * 1024 * 1024, // 5MB
            default_network_rate_per_minute: 60,
            http_transport: false,
        }
    }
}
