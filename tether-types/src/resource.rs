//! Resource usage samples fed to the usage monitor.

use crate::{PluginId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A resource dimension the monitor tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Bytes held in the plugin's storage namespace.
    Storage,
    /// Network requests in the current rate window.
    NetworkRequests,
    /// Wall-clock milliseconds spent in one execution.
    ExecutionTime,
    /// Host-reported memory in bytes.
    Memory,
    /// Host-reported CPU share in percent.
    Cpu,
    Custom(String),
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage => f.write_str("storage"),
            Self::NetworkRequests => f.write_str("network_requests"),
            Self::ExecutionTime => f.write_str("execution_time"),
            Self::Memory => f.write_str("memory"),
            Self::Cpu => f.write_str("cpu"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// One observation of a plugin's resource usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub plugin_id: PluginId,
    pub resource: ResourceKind,
    pub value: f64,
    /// Limit in force when the sample was taken, if the reporter knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    pub timestamp: Timestamp,
}

impl UsageSample {
    /// Creates a sample stamped with the current time.
    #[must_use]
    pub fn new(plugin_id: PluginId, resource: ResourceKind, value: f64) -> Self {
        Self {
            plugin_id,
            resource,
            value,
            limit: None,
            timestamp: Timestamp::now(),
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: f64) -> Self {
        self.limit = Some(limit);
        self
    }
}
