//! Permission grant data model.
//!
//! A [`PermissionGrant`] is one stored decision about a
//! `(kind, scope, target)` tuple for one plugin. Its status only moves
//! forward: `Pending → Granted | Denied`, and `Granted → Denied` on
//! revocation or expiry. `Partial` exists only as an aggregated read value
//! ([`PermissionStatus`]), never as a stored status.

use crate::{GrantId, PluginId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Target value matching every target of a permission kind.
pub const WILDCARD_TARGET: &str = "*";

/// Kind of permission a plugin may request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Dom,
    Network,
    Storage,
    Messaging,
    Clipboard,
    Notifications,
    /// Host-defined permission the kernel stores but does not interpret.
    Custom(String),
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dom => f.write_str("dom"),
            Self::Network => f.write_str("network"),
            Self::Storage => f.write_str("storage"),
            Self::Messaging => f.write_str("messaging"),
            Self::Clipboard => f.write_str("clipboard"),
            Self::Notifications => f.write_str("notifications"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Scope of a permission. `All` subsumes every other scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Read,
    Write,
    Execute,
    All,
}

impl PermissionScope {
    /// Returns true if a grant with this scope answers a check for `wanted`.
    #[must_use]
    pub fn covers(self, wanted: Self) -> bool {
        self == wanted || self == Self::All
    }
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
            Self::All => "all",
        };
        f.write_str(s)
    }
}

/// What a plugin asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub kind: PermissionKind,
    pub scope: PermissionScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl PermissionDefinition {
    #[must_use]
    pub fn new(kind: PermissionKind, scope: PermissionScope) -> Self {
        Self {
            kind,
            scope,
            target: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Returns true if a stored grant for `self` answers a check for the
    /// given tuple: same kind, scope equal or `All`, target equal or `*`.
    #[must_use]
    pub fn answers(
        &self,
        kind: &PermissionKind,
        scope: PermissionScope,
        target: Option<&str>,
    ) -> bool {
        if self.kind != *kind || !self.scope.covers(scope) {
            return false;
        }
        match self.target.as_deref() {
            Some(WILDCARD_TARGET) => true,
            stored => stored == target,
        }
    }
}

impl fmt::Display for PermissionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.scope)?;
        if let Some(target) = &self.target {
            write!(f, "@{target}")?;
        }
        Ok(())
    }
}

/// Stored status of a grant request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantStatus {
    Pending,
    Granted,
    Denied,
}

/// Aggregated answer of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Partial,
}

/// Why a grant ended up denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum DenialReason {
    /// The consent collaborator refused the request.
    Refused {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A previously granted permission was revoked.
    Revoked,
    /// A time-limited grant ran out.
    Expired,
    /// The plugin's sandbox was torn down while the request was pending.
    Cancelled,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused { reason: Some(r) } => f.write_str(r),
            Self::Refused { reason: None } => f.write_str("denied by user"),
            Self::Revoked => f.write_str("revoked"),
            Self::Expired => f.write_str("expired"),
            Self::Cancelled => f.write_str("sandbox destroyed"),
        }
    }
}

/// One stored grant request and its decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub id: GrantId,
    pub plugin_id: PluginId,
    #[serde(flatten)]
    pub definition: PermissionDefinition,
    /// Reason supplied by the plugin when it asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: GrantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial: Option<DenialReason>,
    pub requested_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
}

impl PermissionGrant {
    /// Creates a new pending request.
    #[must_use]
    pub fn pending(
        plugin_id: PluginId,
        definition: PermissionDefinition,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: GrantId::new(),
            plugin_id,
            definition,
            reason,
            status: GrantStatus::Pending,
            denial: None,
            requested_at: Timestamp::now(),
            responded_at: None,
            expires_at: None,
        }
    }

    /// Moves a pending request to granted. Returns false if not pending.
    pub fn mark_granted(&mut self, now: Timestamp, expires_in: Option<Duration>) -> bool {
        if self.status != GrantStatus::Pending {
            return false;
        }
        self.status = GrantStatus::Granted;
        self.responded_at = Some(now);
        self.expires_at = expires_in.map(|d| now.saturating_add(d));
        true
    }

    /// Moves a pending request to denied. Returns false if not pending.
    pub fn mark_refused(&mut self, now: Timestamp, denial: DenialReason) -> bool {
        if self.status != GrantStatus::Pending {
            return false;
        }
        self.status = GrantStatus::Denied;
        self.responded_at = Some(now);
        self.denial = Some(denial);
        true
    }

    /// Moves a granted permission to denied (revocation or expiry).
    /// Returns false if not currently granted.
    pub fn mark_withdrawn(&mut self, denial: DenialReason) -> bool {
        if self.status != GrantStatus::Granted {
            return false;
        }
        self.status = GrantStatus::Denied;
        self.denial = Some(denial);
        true
    }

    /// Returns true if this is a granted permission whose deadline passed.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.status == GrantStatus::Granted
            && self.expires_at.is_some_and(|at| at.has_passed(now))
    }

    /// Returns true if this grant is for exactly the given definition.
    #[must_use]
    pub fn is_for(&self, definition: &PermissionDefinition) -> bool {
        self.definition == *definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_all_covers_everything() {
        assert!(PermissionScope::All.covers(PermissionScope::Write));
        assert!(PermissionScope::Read.covers(PermissionScope::Read));
        assert!(!PermissionScope::Read.covers(PermissionScope::Write));
    }

    #[test]
    fn wildcard_target_answers_any_target() {
        let def = PermissionDefinition::new(PermissionKind::Network, PermissionScope::Read)
            .with_target(WILDCARD_TARGET);
        assert!(def.answers(&PermissionKind::Network, PermissionScope::Read, Some("a.com")));
        assert!(def.answers(&PermissionKind::Network, PermissionScope::Read, None));
        assert!(!def.answers(&PermissionKind::Storage, PermissionScope::Read, None));
    }

    #[test]
    fn transitions_are_one_directional() {
        let def = PermissionDefinition::new(PermissionKind::Clipboard, PermissionScope::Read);
        let mut grant = PermissionGrant::pending(PluginId::new("p"), def, None);
        let now = Timestamp::from_millis(1_000);
        assert!(grant.mark_granted(now, Some(Duration::from_millis(500))));
        assert!(!grant.mark_refused(now, DenialReason::Refused { reason: None }));
        assert!(!grant.is_expired(Timestamp::from_millis(1_499)));
        assert!(grant.is_expired(Timestamp::from_millis(1_500)));
        assert!(grant.mark_withdrawn(DenialReason::Expired));
        assert!(!grant.mark_withdrawn(DenialReason::Revoked));
        assert_eq!(grant.status, GrantStatus::Denied);
    }
}
