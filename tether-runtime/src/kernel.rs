//! Kernel composition root.
//!
//! Wires the event bus, usage monitor, sandbox manager, message bus,
//! dependency resolver and permission manager together, and drives the
//! plugin lifecycle across them: register, unload, uninstall and package
//! install.

use crate::config::KernelConfig;
use crate::context::PluginContext;
use crate::loader::ModuleLoader;
use crate::{KernelError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_bus::{BusTeardownHook, MessageBus};
use tether_deps::{
    CheckOptions, DependencyReport, DependencyResolver, FetchedPackage, PluginMarket, UpdateInfo,
};
use tether_monitor::{spawn_reporter, ReporterHandle, ResourceMonitor};
use tether_package::{PluginPackage, VerifyingKey};
use tether_permissions::{PermissionManager, PermissionTeardownHook};
use tether_sandbox::{
    NetworkTransport, PluginModule, PolicyEngine, ReqwestTransport, SandboxError, SandboxManager,
};
use tether_types::store::keys;
use tether_types::{
    CapabilityPatch, EventBus, KernelEvent, KeyValueStore, MemoryStore, PluginId, PluginManifest,
    SandboxId,
};
use tracing::{debug, info, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone)]
struct LoadedPlugin {
    manifest: Arc<PluginManifest>,
    sandbox_id: SandboxId,
}

/// Builder for [`Kernel`]. Every collaborator is optional.
#[derive(Default)]
pub struct KernelBuilder {
    config: KernelConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    events: Option<Arc<EventBus>>,
    market: Option<Arc<dyn PluginMarket>>,
    loader: Option<Arc<dyn ModuleLoader>>,
    transport: Option<Arc<dyn NetworkTransport>>,
    policy: Option<PolicyEngine>,
}

impl KernelBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Host persistence. Defaults to an in-memory store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn market(mut self, market: Arc<dyn PluginMarket>) -> Self {
        self.market = Some(market);
        self
    }

    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn NetworkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the policy built from the `[policy]` config section,
    /// e.g. with one loaded from a policy file.
    #[must_use]
    pub fn policy(mut self, policy: PolicyEngine) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<Kernel> {
        let config = self.config;
        let trusted_keys = config.packages.verifying_keys()?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let events = self.events.unwrap_or_else(|| Arc::new(EventBus::new()));
        let policy = self
            .policy
            .unwrap_or_else(|| PolicyEngine::with_config(config.policy.clone()));

        let monitor = Arc::new(ResourceMonitor::new(
            Arc::clone(&events),
            config.monitor.clone(),
        ));
        let mut sandboxes = SandboxManager::new(
            config.sandbox.clone(),
            policy,
            Arc::clone(&store),
            Arc::clone(&monitor),
            Arc::clone(&events),
        );
        let transport = match self.transport {
            Some(transport) => Some(transport),
            None if config.sandbox.http_transport => Some(Arc::new(ReqwestTransport::new(
                config.sandbox.execution_timeout(),
            )?) as Arc<dyn NetworkTransport>),
            None => None,
        };
        if let Some(transport) = transport {
            sandboxes = sandboxes.with_transport(transport);
        }
        let bus = MessageBus::new(config.bus.clone());
        let resolver = match self.market {
            Some(market) => DependencyResolver::with_market(market),
            None => DependencyResolver::new(),
        };
        let permissions = Arc::new(PermissionManager::new(
            Arc::clone(&store),
            Arc::clone(&events),
        ));

        events.register(Arc::new(BusTeardownHook::new(&bus)));
        events.register(Arc::new(PermissionTeardownHook::new(&permissions)));

        info!(
            trusted_keys = trusted_keys.len(),
            allow_unsigned = config.packages.allow_unsigned,
            "Kernel initialized"
        );

        Ok(Kernel {
            config,
            store,
            events,
            monitor,
            sandboxes: Arc::new(sandboxes),
            bus,
            resolver,
            permissions,
            loader: self.loader,
            trusted_keys,
            plugins: Mutex::new(BTreeMap::new()),
            reporter: Mutex::new(None),
        })
    }
}

/// The plugin runtime kernel.
pub struct Kernel {
    config: KernelConfig,
    store: Arc<dyn KeyValueStore>,
    events: Arc<EventBus>,
    monitor: Arc<ResourceMonitor>,
    sandboxes: Arc<SandboxManager>,
    bus: MessageBus,
    resolver: DependencyResolver,
    permissions: Arc<PermissionManager>,
    loader: Option<Arc<dyn ModuleLoader>>,
    trusted_keys: Vec<VerifyingKey>,
    plugins: Mutex<BTreeMap<PluginId, LoadedPlugin>>,
    reporter: Mutex<Option<ReporterHandle>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("plugins", &self.lock_plugins().len())
            .field("sandboxes", &self.sandboxes)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    #[must_use]
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    /// Registers a plugin without code, e.g. one whose module the host runs
    /// itself. `requested` narrows the declared capabilities.
    pub async fn register_plugin(
        &self,
        manifest: PluginManifest,
        requested: &CapabilityPatch,
    ) -> Result<PluginContext> {
        self.register_with(manifest, requested, None, None).await
    }

    /// Registers a plugin and attaches its module.
    pub async fn register_plugin_with_module(
        &self,
        manifest: PluginManifest,
        requested: &CapabilityPatch,
        module: Arc<dyn PluginModule>,
    ) -> Result<PluginContext> {
        self.register_with(manifest, requested, None, Some(module))
            .await
    }

    async fn register_with(
        &self,
        manifest: PluginManifest,
        requested: &CapabilityPatch,
        signing_key: Option<&str>,
        module: Option<Arc<dyn PluginModule>>,
    ) -> Result<PluginContext> {
        manifest
            .validate()
            .map_err(|e| SandboxError::InvalidManifest(e.to_string()))?;
        let plugin_id = manifest.id.clone();
        if self.is_registered(&plugin_id) {
            return Err(KernelError::AlreadyRegistered(plugin_id));
        }

        self.resolver.register_plugin(&manifest)?;
        let sandbox_id = match self
            .activate(&manifest, requested, signing_key, module)
            .await
        {
            Ok(sandbox_id) => sandbox_id,
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "Plugin registration failed");
                self.resolver.unregister_plugin(&plugin_id);
                self.monitor.remove_plugin(&plugin_id);
                return Err(e);
            }
        };

        let manifest = Arc::new(manifest);
        self.lock_plugins().insert(
            plugin_id.clone(),
            LoadedPlugin {
                manifest: Arc::clone(&manifest),
                sandbox_id,
            },
        );
        if let Err(e) = self.remember_installed(&manifest) {
            warn!(plugin_id = %plugin_id, error = %e, "Failed to persist installed plugin");
        }

        info!(plugin_id = %plugin_id, version = %manifest.version, %sandbox_id, "Plugin registered");
        self.events.publish(KernelEvent::PluginRegistered {
            plugin_id,
            version: manifest.version.clone(),
        });
        Ok(self.context_for(manifest, sandbox_id))
    }

    /// Dependency check, sandbox, module, endpoint and permission table.
    /// Undoes its own steps on failure; the resolver entry is the caller's.
    async fn activate(
        &self,
        manifest: &PluginManifest,
        requested: &CapabilityPatch,
        signing_key: Option<&str>,
        module: Option<Arc<dyn PluginModule>>,
    ) -> Result<SandboxId> {
        let plugin_id = &manifest.id;
        let mut report = self
            .resolver
            .check_dependencies(plugin_id, &self.config.dependencies)
            .await?;
        let fetched = std::mem::take(&mut report.fetched);
        if !fetched.is_empty() {
            self.install_fetched(fetched).await?;
        }
        report.into_result()?;

        let sandbox_id = self
            .sandboxes
            .create_signed(manifest, requested, signing_key)?;
        let attached = match module {
            Some(module) => self.sandboxes.load_module(sandbox_id, module),
            None => Ok(()),
        };
        let wired = attached
            .map_err(KernelError::from)
            .and_then(|()| Ok(self.bus.register_endpoint(plugin_id)?))
            .and_then(|()| Ok(self.permissions.load_plugin(plugin_id).map(|_| ())?));
        if let Err(e) = wired {
            self.sandboxes.destroy(sandbox_id);
            return Err(e);
        }
        Ok(sandbox_id)
    }

    /// Installs packages fetched by an auto-install dependency check.
    /// Boxed because installing a package checks its own dependencies.
    fn install_fetched(&self, fetched: Vec<FetchedPackage>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            for package in fetched {
                let plugin_id = package.manifest.id.clone();
                if self.is_registered(&plugin_id) {
                    continue;
                }
                if self.loader.is_some() {
                    self.install_package(&package.bytes, &CapabilityPatch::default())
                        .await?;
                } else {
                    debug!(plugin_id = %plugin_id, "No module loader, registering fetched manifest only");
                    self.register_with(package.manifest, &CapabilityPatch::default(), None, None)
                        .await?;
                }
                info!(plugin_id = %plugin_id, "Dependency auto-installed");
            }
            Ok(())
        })
    }

    /// Installs a signed plugin package.
    ///
    /// Unless `allow_unsigned` is set, the package must carry a signature
    /// from one of the trusted keys. The module is handed to the configured
    /// [`ModuleLoader`].
    pub async fn install_package(
        &self,
        bytes: &[u8],
        requested: &CapabilityPatch,
    ) -> Result<PluginContext> {
        let package = PluginPackage::from_bytes(bytes)?;
        let plugin_id = package.manifest.plugin.id.clone();

        let signer = if self.config.packages.allow_unsigned && !package.is_signed() {
            None
        } else if self.config.packages.allow_unsigned {
            package
                .verify_trusted(&self.trusted_keys)
                .ok()
                .map(VerifyingKey::to_hex)
        } else {
            Some(package.verify_trusted(&self.trusted_keys)?.to_hex())
        };

        let loader = self
            .loader
            .clone()
            .ok_or_else(|| KernelError::Loader("no module loader configured".into()))?;

        info!(
            plugin_id = %plugin_id,
            content_hash = %package.content_hash(),
            format = %package.manifest.module.format,
            entry = %package.manifest.module.entry,
            signer = signer.as_deref().unwrap_or("unsigned"),
            "Loading plugin module"
        );
        let module = loader
            .load(&package.manifest.plugin, &package.manifest.module, &package.module)
            .await
            .map_err(|e| KernelError::Loader(e.to_string()))?;

        self.register_with(
            package.manifest.plugin,
            requested,
            signer.as_deref(),
            Some(module),
        )
        .await
    }

    /// Tears a plugin down: sandbox, bus endpoint, pending permissions,
    /// resolver entry and usage limits. Persisted data is kept.
    /// Returns false if the plugin was not registered.
    pub fn unload_plugin(&self, plugin_id: &PluginId) -> Result<bool> {
        let Some(loaded) = self.lock_plugins().remove(plugin_id) else {
            return Ok(false);
        };

        let dependents = self.resolver.get_dependents(plugin_id);
        if !dependents.is_empty() {
            warn!(
                plugin_id = %plugin_id,
                dependents = ?dependents,
                "Unloading a plugin other plugins require"
            );
        }

        // Teardown hooks remove the endpoint and cancel pending permissions.
        self.sandboxes.destroy(loaded.sandbox_id);
        self.resolver.unregister_plugin(plugin_id);
        self.monitor.remove_plugin(plugin_id);

        info!(plugin_id = %plugin_id, "Plugin unloaded");
        self.events.publish(KernelEvent::PluginUnregistered {
            plugin_id: plugin_id.clone(),
        });
        Ok(true)
    }

    /// Unloads a plugin and purges everything persisted for it: config,
    /// grant table, storage entries and the installed-list entry.
    pub fn uninstall_plugin(&self, plugin_id: &PluginId) -> Result<bool> {
        let was_loaded = self.unload_plugin(plugin_id)?;
        self.bus.forget_endpoint(plugin_id);

        self.permissions.forget_plugin(plugin_id)?;
        let mut removed = 0usize;
        for key in self.store.keys_with_prefix(&keys::plugin_prefix(plugin_id))? {
            if self.store.remove(&key)? {
                removed += 1;
            }
        }
        let was_installed = self.forget_installed(plugin_id)?;

        info!(plugin_id = %plugin_id, removed_keys = removed, "Plugin uninstalled");
        Ok(was_loaded || was_installed || removed > 0)
    }

    // ================================================================
    // Installed-plugin list
    // ================================================================

    /// Manifests recorded as installed, in id order.
    pub fn installed_manifests(&self) -> Result<Vec<PluginManifest>> {
        match self.store.get(keys::INSTALLED)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    fn remember_installed(&self, manifest: &PluginManifest) -> Result<()> {
        let mut installed = self.installed_manifests()?;
        installed.retain(|m| m.id != manifest.id);
        installed.push(manifest.clone());
        installed.sort_by(|a, b| a.id.cmp(&b.id));
        self.store
            .set(keys::INSTALLED, serde_json::to_value(installed)?)?;
        Ok(())
    }

    fn forget_installed(&self, plugin_id: &PluginId) -> Result<bool> {
        let mut installed = self.installed_manifests()?;
        let before = installed.len();
        installed.retain(|m| m.id != *plugin_id);
        if installed.len() == before {
            return Ok(false);
        }
        self.store
            .set(keys::INSTALLED, serde_json::to_value(installed)?)?;
        Ok(true)
    }

    // ================================================================
    // Dependencies
    // ================================================================

    /// Re-runs the dependency check for a registered plugin.
    pub async fn check_dependencies(
        &self,
        plugin_id: &PluginId,
        options: &CheckOptions,
    ) -> Result<DependencyReport> {
        Ok(self.resolver.check_dependencies(plugin_id, options).await?)
    }

    /// Orders plugins so dependencies come first.
    #[must_use]
    pub fn installation_order(&self, ids: &[PluginId]) -> Vec<PluginId> {
        self.resolver.get_installation_order(ids)
    }

    pub async fn check_for_update(&self, plugin_id: &PluginId) -> Result<Option<UpdateInfo>> {
        Ok(self.resolver.check_for_update(plugin_id).await?)
    }

    // ================================================================
    // Queries
    // ================================================================

    /// A fresh context for a registered plugin.
    pub fn context(&self, plugin_id: &PluginId) -> Result<PluginContext> {
        let loaded = self
            .lock_plugins()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| KernelError::NotRegistered(plugin_id.clone()))?;
        Ok(self.context_for(loaded.manifest, loaded.sandbox_id))
    }

    #[must_use]
    pub fn is_registered(&self, plugin_id: &PluginId) -> bool {
        self.lock_plugins().contains_key(plugin_id)
    }

    /// Registered plugin ids, sorted.
    #[must_use]
    pub fn plugins(&self) -> Vec<PluginId> {
        self.lock_plugins().keys().cloned().collect()
    }

    #[must_use]
    pub fn manifest(&self, plugin_id: &PluginId) -> Option<Arc<PluginManifest>> {
        self.lock_plugins()
            .get(plugin_id)
            .map(|p| Arc::clone(&p.manifest))
    }

    /// Stored configuration of any plugin, registered or not.
    pub fn plugin_config(&self, plugin_id: &PluginId) -> Result<Option<Value>> {
        Ok(self.store.get(&keys::config(plugin_id))?)
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    #[must_use]
    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    #[must_use]
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    #[must_use]
    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.permissions
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    // ================================================================
    // Background work
    // ================================================================

    /// Starts the periodic usage reporter. No-op if it already runs.
    pub fn start_reporter(&self) {
        let mut reporter = self
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reporter.is_none() {
            *reporter = Some(spawn_reporter(Arc::clone(&self.monitor)));
        }
    }

    /// Stops the reporter and unloads every plugin.
    pub async fn shutdown(&self) {
        let reporter = self
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reporter) = reporter {
            reporter.shutdown().await;
        }

        for plugin_id in self.plugins().into_iter().rev() {
            if let Err(e) = self.unload_plugin(&plugin_id) {
                warn!(plugin_id = %plugin_id, error = %e, "Failed to unload plugin on shutdown");
            }
        }
        info!("Kernel shut down");
    }

    fn context_for(&self, manifest: Arc<PluginManifest>, sandbox_id: SandboxId) -> PluginContext {
        PluginContext::new(
            manifest,
            sandbox_id,
            self.bus.clone(),
            Arc::clone(&self.sandboxes),
            Arc::clone(&self.permissions),
            Arc::clone(&self.store),
        )
    }

    fn lock_plugins(&self) -> MutexGuard<'_, BTreeMap<PluginId, LoadedPlugin>> {
        self.plugins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
