//! Plugin module seam and execution results.
//!
//! The kernel never evaluates source text. A host-side `ModuleLoader`
//! turns the verified bytes of a plugin package into something that
//! implements [`PluginModule`], and the sandbox invokes its entry points.

use crate::{SandboxError, SandboxScope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error text returned when an execution overruns its deadline.
pub const EXECUTION_TIMEOUT: &str = "Execution timeout";

/// Error raised by plugin code. Only its message crosses the sandbox
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ModuleError(pub String);

impl From<SandboxError> for ModuleError {
    fn from(e: SandboxError) -> Self {
        Self(e.to_string())
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<&str> for ModuleError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModuleError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Executable plugin code attached to a sandbox.
#[async_trait]
pub trait PluginModule: Send + Sync {
    /// Runs `entry` with the sandbox's facades and the caller's extra
    /// context.
    async fn invoke(
        &self,
        entry: &str,
        scope: SandboxScope,
        context: Value,
    ) -> Result<Value, ModuleError>;
}

/// Resources consumed by one `execute` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub execution_ms: u64,
    /// Bytes held in the storage namespace after the call.
    pub storage_bytes: u64,
    /// Network requests made during the call.
    pub network_requests: u64,
}

/// Structured outcome of an execution. Plugin failures end up here, never
/// as an `Err` of `execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub resource_usage: ResourceUsage,
}

impl ExecutionResult {
    pub(crate) fn from_outcome(outcome: Result<Value, String>, usage: ResourceUsage) -> Self {
        match outcome {
            Ok(value) => Self {
                success: true,
                result: Some(value),
                error: None,
                resource_usage: usage,
            },
            Err(error) => Self {
                success: false,
                result: None,
                error: Some(error),
                resource_usage: usage,
            },
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(EXECUTION_TIMEOUT)
    }
}
