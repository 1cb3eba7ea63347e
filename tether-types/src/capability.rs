//! Capability model for plugin sandboxes.
//!
//! A manifest declares a list of [`Capability`] values; the sandbox manager
//! turns that list into an effective [`CapabilitySet`] and narrows it with
//! whatever the host requests through a [`CapabilityPatch`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single capability a plugin may declare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Capability {
    /// Access to the host document / UI surface.
    Dom,
    /// Outbound network requests through the network facade.
    Network,
    /// Persistent key-value storage through the storage facade.
    Storage,
    /// Inter-plugin communication over the message bus.
    Messaging,
    /// A named host API the plugin may call.
    Api(String),
    /// A network host the plugin may reach.
    Domain(String),
    /// A host-defined capability the kernel does not interpret.
    Custom(String),
}

impl Capability {
    /// Returns a stable name used in logs and policy files.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Dom => "dom".to_string(),
            Self::Network => "network".to_string(),
            Self::Storage => "storage".to_string(),
            Self::Messaging => "messaging".to_string(),
            Self::Api(name) => format!("api:{name}"),
            Self::Domain(host) => format!("domain:{host}"),
            Self::Custom(name) => format!("custom:{name}"),
        }
    }
}

/// Effective capabilities and quotas of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub dom: bool,
    pub network: bool,
    pub storage: bool,
    pub messaging: bool,
    /// Host API names the plugin may call.
    #[serde(default)]
    pub allowed_apis: BTreeSet<String>,
    /// Hosts reachable through the network facade. Empty means any host.
    #[serde(default)]
    pub allowed_domains: BTreeSet<String>,
    /// Host-defined capabilities, carried through untouched.
    #[serde(default)]
    pub custom: BTreeSet<String>,
    /// Maximum bytes the plugin may keep in its storage namespace.
    pub storage_quota_bytes: u64,
    /// Maximum network requests per rolling 60-second window.
    pub network_rate_per_minute: u32,
}

impl CapabilitySet {
    /// A set granting nothing, with zero quotas.
    #[must_use]
    pub fn none() -> Self {
        Self {
            dom: false,
            network: false,
            storage: false,
            messaging: false,
            allowed_apis: BTreeSet::new(),
            allowed_domains: BTreeSet::new(),
            custom: BTreeSet::new(),
            storage_quota_bytes: 0,
            network_rate_per_minute: 0,
        }
    }

    /// Builds the set described by a manifest's declared capabilities.
    #[must_use]
    pub fn from_declared(
        declared: &[Capability],
        storage_quota_bytes: u64,
        network_rate_per_minute: u32,
    ) -> Self {
        let mut set = Self {
            storage_quota_bytes,
            network_rate_per_minute,
            ..Self::none()
        };
        for capability in declared {
            match capability {
                Capability::Dom => set.dom = true,
                Capability::Network => set.network = true,
                Capability::Storage => set.storage = true,
                Capability::Messaging => set.messaging = true,
                Capability::Api(name) => {
                    set.allowed_apis.insert(name.clone());
                }
                Capability::Domain(host) => {
                    set.allowed_domains.insert(normalize_domain(host));
                }
                Capability::Custom(name) => {
                    set.custom.insert(name.clone());
                }
            }
        }
        set
    }

    /// Narrows this (declared) set with a host request.
    ///
    /// The declared set is the ceiling: a requested value only takes effect
    /// where it is more restrictive. Booleans are AND-ed, lists intersected,
    /// quotas take the minimum.
    #[must_use]
    pub fn restrict(&self, requested: &CapabilityPatch) -> Self {
        let mut out = self.clone();
        if let Some(v) = requested.dom {
            out.dom &= v;
        }
        if let Some(v) = requested.network {
            out.network &= v;
        }
        if let Some(v) = requested.storage {
            out.storage &= v;
        }
        if let Some(v) = requested.messaging {
            out.messaging &= v;
        }
        if let Some(apis) = &requested.allowed_apis {
            out.allowed_apis = out.allowed_apis.intersection(apis).cloned().collect();
        }
        if let Some(domains) = &requested.allowed_domains {
            let domains = normalize_domains(domains);
            out.allowed_domains = if out.allowed_domains.is_empty() {
                domains
            } else {
                out.allowed_domains.intersection(&domains).cloned().collect()
            };
        }
        if let Some(quota) = requested.storage_quota_bytes {
            out.storage_quota_bytes = out.storage_quota_bytes.min(quota);
        }
        if let Some(rate) = requested.network_rate_per_minute {
            out.network_rate_per_minute = out.network_rate_per_minute.min(rate);
        }
        out
    }

    /// Merges a live update into this set. Unlike [`CapabilitySet::restrict`]
    /// the patch values replace the current ones.
    pub fn apply(&mut self, patch: &CapabilityPatch) {
        if let Some(v) = patch.dom {
            self.dom = v;
        }
        if let Some(v) = patch.network {
            self.network = v;
        }
        if let Some(v) = patch.storage {
            self.storage = v;
        }
        if let Some(v) = patch.messaging {
            self.messaging = v;
        }
        if let Some(apis) = &patch.allowed_apis {
            self.allowed_apis = apis.clone();
        }
        if let Some(domains) = &patch.allowed_domains {
            self.allowed_domains = normalize_domains(domains);
        }
        if let Some(quota) = patch.storage_quota_bytes {
            self.storage_quota_bytes = quota;
        }
        if let Some(rate) = patch.network_rate_per_minute {
            self.network_rate_per_minute = rate;
        }
    }

    /// Returns true if the set includes the given capability.
    #[must_use]
    pub fn allows(&self, capability: &Capability) -> bool {
        match capability {
            Capability::Dom => self.dom,
            Capability::Network => self.network,
            Capability::Storage => self.storage,
            Capability::Messaging => self.messaging,
            Capability::Api(name) => self.allowed_apis.contains(name),
            Capability::Domain(host) => self.network && self.allows_host(host),
            Capability::Custom(name) => self.custom.contains(name),
        }
    }

    /// Returns true if `host` is reachable under the domain allow-list.
    ///
    /// An entry matches the host itself and any subdomain of it; `*` or an
    /// empty list matches every host.
    #[must_use]
    pub fn allows_host(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_domains.iter().any(|allowed| {
            allowed == "*"
                || *allowed == host
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Removes a capability from the set (used by policy enforcement).
    pub fn revoke(&mut self, capability: &Capability) {
        match capability {
            Capability::Dom => self.dom = false,
            Capability::Network => self.network = false,
            Capability::Storage => self.storage = false,
            Capability::Messaging => self.messaging = false,
            Capability::Api(name) => {
                self.allowed_apis.remove(name);
            }
            Capability::Domain(host) => {
                self.allowed_domains.remove(&normalize_domain(host));
            }
            Capability::Custom(name) => {
                self.custom.remove(name);
            }
        }
    }
}

/// Domains compare case-insensitively and without a trailing dot.
fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

fn normalize_domains(domains: &BTreeSet<String>) -> BTreeSet<String> {
    domains.iter().map(|d| normalize_domain(d)).collect()
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::none()
    }
}

/// A partial capability update. `None` fields leave the target untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messaging: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_apis: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_quota_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_rate_per_minute: Option<u32>,
}

impl CapabilityPatch {
    /// A patch that changes nothing.
    #[must_use]
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Returns true if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
