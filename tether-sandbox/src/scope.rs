//! Capability-scoped facades handed to plugin code.
//!
//! A [`SandboxScope`] is bound to one sandbox. Every facade call checks
//! that the sandbox is still active and reads the *current* capability
//! set, so teardown and live permission updates take effect on the next
//! call.

use crate::network::{NetworkRequest, NetworkResponse, NetworkTransport, NETWORK_WINDOW};
use crate::sandbox::Sandbox;
use crate::{Result, SandboxError};
use serde_json::Value;
use std::sync::Arc;
use tether_monitor::ResourceMonitor;
use tether_types::store::keys;
use tether_types::{
    Capability, CapabilitySet, KeyValueStore, PluginId, ResourceKind, SandboxId, UsageSample,
};
use tracing::{debug, error, info, warn};
use url::Url;

/// Bytes a storage entry counts against the quota: key plus serialized
/// JSON value.
pub fn entry_size(key: &str, value: &Value) -> Result<u64> {
    let value_len = serde_json::to_vec(value)?.len();
    Ok((key.len() + value_len) as u64)
}

/// Handle to one sandbox's facades.
#[derive(Clone)]
pub struct SandboxScope {
    sandbox: Arc<Sandbox>,
    store: Arc<dyn KeyValueStore>,
    monitor: Arc<ResourceMonitor>,
    transport: Arc<dyn NetworkTransport>,
}

impl std::fmt::Debug for SandboxScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxScope")
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl SandboxScope {
    pub(crate) fn new(
        sandbox: Arc<Sandbox>,
        store: Arc<dyn KeyValueStore>,
        monitor: Arc<ResourceMonitor>,
        transport: Arc<dyn NetworkTransport>,
    ) -> Self {
        Self {
            sandbox,
            store,
            monitor,
            transport,
        }
    }

    #[must_use]
    pub fn sandbox_id(&self) -> SandboxId {
        self.sandbox.id()
    }

    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        self.sandbox.plugin_id()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.sandbox.is_active()
    }

    /// Current capability set.
    pub fn capabilities(&self) -> Result<CapabilitySet> {
        self.sandbox.ensure_active()?;
        Ok(self.sandbox.capabilities())
    }

    #[must_use]
    pub fn storage(&self) -> StorageFacade<'_> {
        StorageFacade { scope: self }
    }

    #[must_use]
    pub fn network(&self) -> NetworkFacade<'_> {
        NetworkFacade { scope: self }
    }

    #[must_use]
    pub fn logger(&self) -> PluginLogger<'_> {
        PluginLogger { scope: self }
    }

    /// Checks the sandbox is live and holds `capability`; returns the
    /// capability snapshot the call should work against.
    fn require(&self, capability: &Capability) -> Result<CapabilitySet> {
        self.sandbox.ensure_active()?;
        let caps = self.sandbox.capabilities();
        if !caps.allows(capability) {
            return Err(SandboxError::CapabilityDenied {
                plugin_id: self.plugin_id().clone(),
                capability: capability.name(),
            });
        }
        Ok(caps)
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&self, resource: ResourceKind, value: u64, limit: u64) -> bool {
        self.monitor.record(
            UsageSample::new(self.plugin_id().clone(), resource, value as f64)
                .with_limit(limit as f64),
        )
    }
}

/// Key-value storage namespaced to the plugin.
#[derive(Debug, Clone, Copy)]
pub struct StorageFacade<'a> {
    scope: &'a SandboxScope,
}

impl StorageFacade<'_> {
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.scope.require(&Capability::Storage)?;
        Ok(self
            .scope
            .store
            .get(&keys::storage(self.scope.plugin_id(), key))?)
    }

    /// Writes `value` under `key`. Replacing a key accounts only the size
    /// delta. A write that would push usage above the quota fails with
    /// `QuotaExceeded` and changes nothing.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let caps = self.scope.require(&Capability::Storage)?;
        let plugin_id = self.scope.plugin_id();
        let full_key = keys::storage(plugin_id, key);
        let new_size = entry_size(key, &value)?;
        let quota = caps.storage_quota_bytes;

        let mut counters = self.scope.sandbox.counters();
        let old_size = match self.scope.store.get(&full_key)? {
            Some(old) => entry_size(key, &old)?,
            None => 0,
        };
        let projected = counters
            .storage_bytes
            .saturating_sub(old_size)
            .saturating_add(new_size);

        if projected > quota {
            drop(counters);
            warn!(plugin_id = %plugin_id, key, projected, quota, "Storage quota exceeded");
            self.scope.report(ResourceKind::Storage, projected, quota);
            return Err(SandboxError::QuotaExceeded {
                plugin_id: plugin_id.clone(),
                detail: format!("storage would reach {projected} of {quota} bytes"),
            });
        }

        self.scope.store.set(&full_key, value)?;
        counters.storage_bytes = projected;
        drop(counters);

        debug!(plugin_id = %plugin_id, key, bytes = projected, "Storage write");
        self.scope.report(ResourceKind::Storage, projected, quota);
        Ok(())
    }

    /// Removes `key`. Returns true if it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.scope.require(&Capability::Storage)?;
        let full_key = keys::storage(self.scope.plugin_id(), key);

        let mut counters = self.scope.sandbox.counters();
        let Some(old) = self.scope.store.get(&full_key)? else {
            return Ok(false);
        };
        let old_size = entry_size(key, &old)?;
        self.scope.store.remove(&full_key)?;
        counters.storage_bytes = counters.storage_bytes.saturating_sub(old_size);
        Ok(true)
    }

    /// Keys in the plugin's namespace, in lexicographic order.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.scope.require(&Capability::Storage)?;
        let prefix = keys::storage_prefix(self.scope.plugin_id());
        Ok(self
            .scope
            .store
            .keys_with_prefix(&prefix)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect())
    }

    /// Bytes currently counted against the quota.
    pub fn usage(&self) -> Result<u64> {
        self.scope.sandbox.ensure_active()?;
        Ok(self.scope.sandbox.storage_bytes())
    }
}

/// Outbound requests gated by capability, host allow-list and rate quota.
#[derive(Debug, Clone, Copy)]
pub struct NetworkFacade<'a> {
    scope: &'a SandboxScope,
}

impl NetworkFacade<'_> {
    pub async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse> {
        let caps = self.scope.require(&Capability::Network)?;
        let plugin_id = self.scope.plugin_id();

        let url = Url::parse(&request.url)?;
        let host = url.host_str().ok_or(url::ParseError::EmptyHost)?;
        if !caps.allows_host(host) {
            warn!(plugin_id = %plugin_id, host, "Network host not allowed");
            return Err(SandboxError::CapabilityDenied {
                plugin_id: plugin_id.clone(),
                capability: Capability::Domain(host.to_string()).name(),
            });
        }

        let rate = caps.network_rate_per_minute;
        match self.scope.sandbox.take_network_slot(rate, NETWORK_WINDOW) {
            Ok(count) => {
                self.scope
                    .report(ResourceKind::NetworkRequests, count.into(), rate.into());
            }
            Err(attempted) => {
                warn!(plugin_id = %plugin_id, rate, "Network rate quota exceeded");
                self.scope
                    .report(ResourceKind::NetworkRequests, attempted.into(), rate.into());
                return Err(SandboxError::QuotaExceeded {
                    plugin_id: plugin_id.clone(),
                    detail: format!("more than {rate} network requests per minute"),
                });
            }
        }

        debug!(plugin_id = %plugin_id, method = %request.method, host, "Plugin network request");
        self.scope.transport.fetch(request).await
    }
}

/// Log records tagged with the plugin id.
#[derive(Debug, Clone, Copy)]
pub struct PluginLogger<'a> {
    scope: &'a SandboxScope,
}

impl PluginLogger<'_> {
    pub fn debug(&self, message: &str) -> Result<()> {
        self.scope.sandbox.ensure_active()?;
        debug!(plugin_id = %self.scope.plugin_id(), "{message}");
        Ok(())
    }

    pub fn info(&self, message: &str) -> Result<()> {
        self.scope.sandbox.ensure_active()?;
        info!(plugin_id = %self.scope.plugin_id(), "{message}");
        Ok(())
    }

    pub fn warn(&self, message: &str) -> Result<()> {
        self.scope.sandbox.ensure_active()?;
        warn!(plugin_id = %self.scope.plugin_id(), "{message}");
        Ok(())
    }

    pub fn error(&self, message: &str) -> Result<()> {
        self.scope.sandbox.ensure_active()?;
        error!(plugin_id = %self.scope.plugin_id(), "{message}");
        Ok(())
    }
}
