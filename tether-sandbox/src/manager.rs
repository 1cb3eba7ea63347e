//! Central sandbox lifecycle manager.
//!
//! Owns every live [`Sandbox`], enforces policy at creation and on
//! permission updates, and runs plugin entry points under a wall-clock
//! deadline.

use crate::network::{DisabledTransport, NetworkTransport};
use crate::policy::PolicyEngine;
use crate::sandbox::Sandbox;
use crate::scope::entry_size;
use crate::{
    ExecutionResult, PluginModule, ResourceUsage, Result, SandboxConfig, SandboxError,
    SandboxScope, EXECUTION_TIMEOUT,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_monitor::ResourceMonitor;
use tether_types::store::keys;
use tether_types::{
    CapabilityPatch, CapabilitySet, EventBus, KernelEvent, KeyValueStore, PluginId,
    PluginManifest, ResourceKind, SandboxId, UsageSample,
};
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Registry {
    sandboxes: HashMap<SandboxId, Arc<Sandbox>>,
    by_plugin: HashMap<PluginId, SandboxId>,
}

/// Manages the lifecycle of all plugin sandboxes.
pub struct SandboxManager {
    registry: Mutex<Registry>,
    policy: PolicyEngine,
    config: SandboxConfig,
    store: Arc<dyn KeyValueStore>,
    monitor: Arc<ResourceMonitor>,
    transport: Arc<dyn NetworkTransport>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("config", &self.config)
            .field("sandboxes", &self.len())
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Creates a manager whose network facade refuses every request until
    /// a transport is wired with [`SandboxManager::with_transport`].
    pub fn new(
        config: SandboxConfig,
        policy: PolicyEngine,
        store: Arc<dyn KeyValueStore>,
        monitor: Arc<ResourceMonitor>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            policy,
            config,
            store,
            monitor,
            transport: Arc::new(DisabledTransport),
            events,
        }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn NetworkTransport>) -> Self {
        self.transport = transport;
        self
    }

    // ================================================================
    // Creation / teardown
    // ================================================================

    /// Creates a sandbox for `manifest`, narrowing its declared capabilities
    /// with `requested`.
    pub fn create(&self, manifest: &PluginManifest, requested: &CapabilityPatch) -> Result<SandboxId> {
        self.create_signed(manifest, requested, None)
    }

    /// Like [`SandboxManager::create`], for a package signed by
    /// `signing_key` (hex), which allowlist policies may trust.
    pub fn create_signed(
        &self,
        manifest: &PluginManifest,
        requested: &CapabilityPatch,
        signing_key: Option<&str>,
    ) -> Result<SandboxId> {
        manifest
            .validate()
            .map_err(|e| SandboxError::InvalidManifest(e.to_string()))?;
        let plugin_id = manifest.id.clone();

        if !self.policy.is_plugin_allowed(&plugin_id, signing_key) {
            return Err(SandboxError::PolicyDenied(format!(
                "plugin '{plugin_id}' blocked by policy"
            )));
        }

        let declared = CapabilitySet::from_declared(
            &manifest.declared_capabilities,
            self.config.default_storage_quota_bytes,
            self.config.default_network_rate_per_minute,
        );
        let mut capabilities = declared.restrict(requested);
        let stripped = self.policy.enforce(&mut capabilities);
        if !stripped.is_empty() {
            info!(plugin_id = %plugin_id, ?stripped, "Capabilities removed by policy");
        }

        let storage_bytes = persisted_storage_bytes(self.store.as_ref(), &plugin_id)?;
        let sandbox = Arc::new(Sandbox::new(
            plugin_id.clone(),
            capabilities.clone(),
            storage_bytes,
        ));
        let sandbox_id = sandbox.id();

        {
            let mut registry = self.lock();
            if registry.by_plugin.contains_key(&plugin_id) {
                return Err(SandboxError::Allocation {
                    plugin_id,
                    reason: "plugin already has a live sandbox".into(),
                });
            }
            if registry.sandboxes.len() >= self.config.max_sandboxes {
                return Err(SandboxError::Allocation {
                    plugin_id,
                    reason: format!("sandbox limit ({}) reached", self.config.max_sandboxes),
                });
            }
            registry.by_plugin.insert(plugin_id.clone(), sandbox_id);
            registry.sandboxes.insert(sandbox_id, sandbox);
        }

        self.set_monitor_limits(&plugin_id, &capabilities);
        info!(
            plugin_id = %plugin_id,
            sandbox_id = %sandbox_id,
            storage_bytes,
            "Sandbox created"
        );
        self.events.publish(KernelEvent::SandboxCreated {
            sandbox_id,
            plugin_id,
            capabilities,
        });
        Ok(sandbox_id)
    }

    /// Tears a sandbox down. Returns false for unknown ids.
    ///
    /// Subscribers to `SandboxDestroyed` (bus and permission teardown) have
    /// run by the time this returns.
    pub fn destroy(&self, sandbox_id: SandboxId) -> bool {
        let sandbox = {
            let mut registry = self.lock();
            let Some(sandbox) = registry.sandboxes.remove(&sandbox_id) else {
                return false;
            };
            registry.by_plugin.remove(sandbox.plugin_id());
            sandbox
        };

        sandbox.deactivate();
        let plugin_id = sandbox.plugin_id().clone();
        self.monitor.clear_limits(&plugin_id);
        info!(plugin_id = %plugin_id, sandbox_id = %sandbox_id, "Sandbox destroyed");
        self.events.publish(KernelEvent::SandboxDestroyed {
            sandbox_id,
            plugin_id,
        });
        true
    }

    // ================================================================
    // Modules / execution
    // ================================================================

    /// Attaches plugin code to a sandbox, replacing any previous module.
    pub fn load_module(&self, sandbox_id: SandboxId, module: Arc<dyn PluginModule>) -> Result<()> {
        let sandbox = self.active(sandbox_id)?;
        sandbox.attach_module(module);
        debug!(plugin_id = %sandbox.plugin_id(), sandbox_id = %sandbox_id, "Module attached");
        Ok(())
    }

    /// Runs `entry` on the sandbox's module under the configured deadline.
    ///
    /// Plugin errors, panics and timeouts are reported through the
    /// [`ExecutionResult`]; `Err` means the sandbox itself was unusable.
    pub async fn execute(
        &self,
        sandbox_id: SandboxId,
        entry: &str,
        extra: Value,
    ) -> Result<ExecutionResult> {
        let sandbox = self.active(sandbox_id)?;
        let module = sandbox
            .module()
            .ok_or(SandboxError::ModuleNotLoaded(sandbox_id))?;
        let scope = self.scope_for(Arc::clone(&sandbox));
        let plugin_id = sandbox.plugin_id().clone();
        let timeout = self.config.execution_timeout();

        let requests_before = sandbox.total_requests();
        let started = Instant::now();
        let entry_name = entry.to_string();
        let mut task =
            tokio::spawn(async move { module.invoke(&entry_name, scope, extra).await });

        let outcome = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join_error)) => {
                let message = panic_message(join_error);
                self.events.publish(KernelEvent::SandboxError {
                    sandbox_id,
                    plugin_id: plugin_id.clone(),
                    message: message.clone(),
                });
                Err(message)
            }
            Err(_) => {
                task.abort();
                warn!(plugin_id = %plugin_id, entry, ?timeout, "Execution timed out");
                self.events.publish(KernelEvent::SandboxError {
                    sandbox_id,
                    plugin_id: plugin_id.clone(),
                    message: EXECUTION_TIMEOUT.to_string(),
                });
                Err(EXECUTION_TIMEOUT.to_string())
            }
        };

        let execution_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let usage = ResourceUsage {
            execution_ms,
            storage_bytes: sandbox.storage_bytes(),
            network_requests: sandbox.total_requests().saturating_sub(requests_before),
        };
        #[allow(clippy::cast_precision_loss)]
        let elapsed_ms = execution_ms as f64;
        self.monitor.record(UsageSample::new(
            plugin_id.clone(),
            ResourceKind::ExecutionTime,
            elapsed_ms,
        ));
        debug!(
            plugin_id = %plugin_id,
            entry,
            execution_ms,
            success = outcome.is_ok(),
            "Execution finished"
        );

        Ok(ExecutionResult::from_outcome(outcome, usage))
    }

    // ================================================================
    // Live permission updates
    // ================================================================

    /// Merges `patch` into the live capability set. Policy still applies
    /// to the result. Returns false for unknown or inactive sandboxes.
    pub fn update_permissions(&self, sandbox_id: SandboxId, patch: &CapabilityPatch) -> bool {
        let Ok(sandbox) = self.active(sandbox_id) else {
            return false;
        };
        let (before, after) = sandbox.update_capabilities(|caps| {
            caps.apply(patch);
            self.policy.enforce(caps);
        });

        let plugin_id = sandbox.plugin_id().clone();
        self.set_monitor_limits(&plugin_id, &after);
        info!(plugin_id = %plugin_id, sandbox_id = %sandbox_id, "Sandbox permissions updated");
        self.events.publish(KernelEvent::PermissionChanged {
            sandbox_id,
            plugin_id,
            before: Box::new(before),
            after: Box::new(after),
        });
        true
    }

    // ================================================================
    // Queries
    // ================================================================

    /// Facade handle for a live sandbox, for host-side calls outside an
    /// execution.
    pub fn scope(&self, sandbox_id: SandboxId) -> Result<SandboxScope> {
        Ok(self.scope_for(self.active(sandbox_id)?))
    }

    #[must_use]
    pub fn capabilities(&self, sandbox_id: SandboxId) -> Option<CapabilitySet> {
        self.get(sandbox_id).map(|s| s.capabilities())
    }

    #[must_use]
    pub fn sandbox_for(&self, plugin_id: &PluginId) -> Option<SandboxId> {
        self.lock().by_plugin.get(plugin_id).copied()
    }

    #[must_use]
    pub fn plugin_of(&self, sandbox_id: SandboxId) -> Option<PluginId> {
        self.get(sandbox_id).map(|s| s.plugin_id().clone())
    }

    #[must_use]
    pub fn is_active(&self, sandbox_id: SandboxId) -> bool {
        self.get(sandbox_id).is_some_and(|s| s.is_active())
    }

    /// Storage bytes currently counted for a sandbox.
    #[must_use]
    pub fn storage_usage(&self, sandbox_id: SandboxId) -> Option<u64> {
        self.get(sandbox_id).map(|s| s.storage_bytes())
    }

    /// Creation time of a sandbox.
    #[must_use]
    pub fn created_at(&self, sandbox_id: SandboxId) -> Option<tether_types::Timestamp> {
        self.get(sandbox_id).map(|s| s.created_at())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sandboxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn get(&self, sandbox_id: SandboxId) -> Option<Arc<Sandbox>> {
        self.lock().sandboxes.get(&sandbox_id).cloned()
    }

    fn active(&self, sandbox_id: SandboxId) -> Result<Arc<Sandbox>> {
        let sandbox = self
            .get(sandbox_id)
            .ok_or(SandboxError::NotFound(sandbox_id))?;
        sandbox.ensure_active()?;
        Ok(sandbox)
    }

    fn scope_for(&self, sandbox: Arc<Sandbox>) -> SandboxScope {
        SandboxScope::new(
            sandbox,
            Arc::clone(&self.store),
            Arc::clone(&self.monitor),
            Arc::clone(&self.transport),
        )
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_monitor_limits(&self, plugin_id: &PluginId, caps: &CapabilitySet) {
        self.monitor.set_limit(
            plugin_id,
            ResourceKind::Storage,
            caps.storage_quota_bytes as f64,
        );
        self.monitor.set_limit(
            plugin_id,
            ResourceKind::NetworkRequests,
            f64::from(caps.network_rate_per_minute),
        );
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bytes already persisted under a plugin's storage namespace.
pub fn persisted_storage_bytes(store: &dyn KeyValueStore, plugin_id: &PluginId) -> Result<u64> {
    let prefix = keys::storage_prefix(plugin_id);
    let mut total = 0u64;
    for full_key in store.keys_with_prefix(&prefix)? {
        let key = full_key.strip_prefix(prefix.as_str()).unwrap_or(&full_key);
        if let Some(value) = store.get(&full_key)? {
            total = total.saturating_add(entry_size(key, &value)?);
        }
    }
    Ok(total)
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "execution cancelled".to_string();
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("plugin panicked: {detail}")
}
