//! Identifier types used throughout the kernel.
//!
//! Plugin ids are author-chosen strings; everything the kernel mints itself
//! uses UUID v7 for time-ordered, globally unique identifiers.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Separator between the sender namespace and the unique part of a message id.
const NAMESPACE_SEPARATOR: char = ':';

/// Unique identifier of a registered plugin (e.g. `"acme.notes"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(String);

impl PluginId {
    /// Creates a plugin id without validation.
    ///
    /// Prefer [`PluginId::parse`] for ids coming from untrusted input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses and validates a plugin id.
    ///
    /// Ids must be non-empty and may not contain whitespace or `:`, which
    /// is reserved for message-id namespacing.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.is_empty()
            || s.chars()
                .any(|c| c.is_whitespace() || c == NAMESPACE_SEPARATOR)
        {
            return Err(crate::Error::InvalidPluginId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PluginId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PluginId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PluginId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier for a sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Creates a new sandbox id with the current timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a sandbox id from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses a sandbox id from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a permission grant request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(Uuid);

impl GrantId {
    /// Creates a new grant id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Parses a grant id from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for GrantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GrantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a message envelope, namespaced by its sender.
///
/// Rendered as `<sender-plugin-id>:<uuid>` so that everything a plugin has
/// in flight can be found (and cancelled) from the plugin id alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Mints a fresh message id in the sender's namespace.
    #[must_use]
    pub fn for_sender(sender: &PluginId) -> Self {
        Self(format!("{sender}{NAMESPACE_SEPARATOR}{}", Uuid::now_v7()))
    }

    /// Returns the sender namespace (the part before the first `:`).
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0
            .split_once(NAMESPACE_SEPARATOR)
            .map_or(self.0.as_str(), |(ns, _)| ns)
    }

    /// Returns true if this id was minted for the given plugin.
    #[must_use]
    pub fn is_namespaced_under(&self, plugin: &PluginId) -> bool {
        self.namespace() == plugin.as_str()
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_id_rejects_separator() {
        assert!(PluginId::parse("acme:notes").is_err());
        assert!(PluginId::parse("").is_err());
        assert!(PluginId::parse("acme notes").is_err());
        assert!(PluginId::parse("acme.notes").is_ok());
    }

    #[test]
    fn message_id_namespace() {
        let sender = PluginId::new("acme.notes");
        let id = MessageId::for_sender(&sender);
        assert_eq!(id.namespace(), "acme.notes");
        assert!(id.is_namespaced_under(&sender));
        assert!(!id.is_namespaced_under(&PluginId::new("acme")));
    }
}
