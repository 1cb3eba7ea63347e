use tether_types::{DenialReason, GrantId};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PermissionError {
    #[error("permission denied: {reason}")]
    Denied { grant: GrantId, reason: DenialReason },

    /// The manager went away before the request was decided.
    #[error("permission request abandoned: {0}")]
    Abandoned(GrantId),

    #[error("store error: {0}")]
    Store(String),
}

impl PermissionError {
    #[must_use]
    pub fn denial(&self) -> Option<&DenialReason> {
        match self {
            Self::Denied { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl From<tether_types::Error> for PermissionError {
    fn from(err: tether_types::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for PermissionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PermissionError>;
