//! Error types for the message bus.

use tether_types::{MessageId, PluginId};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("plugin not found: {0}")]
    NotRegistered(PluginId),

    #[error("plugin already registered: {0}")]
    AlreadyRegistered(PluginId),

    #[error("plugin unregistered: {0}")]
    PluginUnregistered(PluginId),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("operation timed out: request {id} got no response within {timeout_ms}ms")]
    Timeout { id: MessageId, timeout_ms: u64 },

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service already registered: {0}")]
    ServiceExists(String),

    #[error("method '{method}' not offered by service '{service}'")]
    MethodNotFound { service: String, method: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("request cancelled: {0}")]
    Cancelled(MessageId),
}

impl BusError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Error returned by a channel handler or service provider. Only its
/// message crosses to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<BusError> for HandlerError {
    fn from(e: BusError) -> Self {
        Self(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
