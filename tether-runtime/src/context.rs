//! The per-plugin handle a plugin instance talks to the kernel through.

use crate::Result;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_bus::{
    Envelope, HandlerError, MessageBus, OutgoingMessage, Responder, SendOutcome, ServiceDefinition,
    ServiceProvider,
};
use tether_permissions::{PendingPermission, PermissionManager};
use tether_sandbox::{ExecutionResult, SandboxError, SandboxManager, SandboxScope};
use tether_types::store::keys;
use tether_types::{
    CapabilitySet, KeyValueStore, PermissionDefinition, PermissionGrant, PermissionKind,
    PermissionScope, PermissionStatus, PluginId, PluginManifest, SandboxId,
};
use tracing::debug;

/// Everything one plugin may do, bound to its identity.
///
/// Messaging goes out with this plugin as sender and requires the
/// `messaging` capability. Storage, network and logging go through
/// [`PluginContext::scope`]. Once the sandbox is destroyed every call
/// fails closed.
#[derive(Clone)]
pub struct PluginContext {
    manifest: Arc<PluginManifest>,
    sandbox_id: SandboxId,
    bus: MessageBus,
    sandboxes: Arc<SandboxManager>,
    permissions: Arc<PermissionManager>,
    store: Arc<dyn KeyValueStore>,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.manifest.id)
            .field("sandbox_id", &self.sandbox_id)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    pub(crate) fn new(
        manifest: Arc<PluginManifest>,
        sandbox_id: SandboxId,
        bus: MessageBus,
        sandboxes: Arc<SandboxManager>,
        permissions: Arc<PermissionManager>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            manifest,
            sandbox_id,
            bus,
            sandboxes,
            permissions,
            store,
        }
    }

    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.manifest.id
    }

    #[must_use]
    pub fn sandbox_id(&self) -> SandboxId {
        self.sandbox_id
    }

    #[must_use]
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.sandboxes.is_active(self.sandbox_id)
    }

    pub fn capabilities(&self) -> Result<CapabilitySet> {
        self.sandboxes
            .capabilities(self.sandbox_id)
            .ok_or_else(|| SandboxError::Inactive(self.sandbox_id).into())
    }

    fn require_messaging(&self) -> Result<()> {
        if self.capabilities()?.messaging {
            Ok(())
        } else {
            Err(SandboxError::CapabilityDenied {
                plugin_id: self.plugin_id().clone(),
                capability: "messaging".into(),
            }
            .into())
        }
    }

    // ================================================================
    // Messaging
    // ================================================================

    /// Sends a message as this plugin. The sender field is overwritten.
    pub async fn send(&self, mut message: OutgoingMessage) -> Result<SendOutcome> {
        self.require_messaging()?;
        message.sender_id = self.plugin_id().clone();
        Ok(self.bus.send(message).await?)
    }

    /// Broadcasts an EVENT to every other plugin. Returns the plugins whose
    /// handler took it.
    pub async fn broadcast(&self, channel: &str, action: &str, payload: Value) -> Result<Vec<PluginId>> {
        let message = OutgoingMessage::event(self.plugin_id().clone(), channel, action)
            .with_payload(payload);
        match self.send(message).await? {
            SendOutcome::Broadcast { recipients } => Ok(recipients),
            _ => Ok(Vec::new()),
        }
    }

    /// Fire-and-forget EVENT to one plugin.
    pub async fn notify(
        &self,
        receiver: &PluginId,
        channel: &str,
        action: &str,
        payload: Value,
    ) -> Result<()> {
        let message = OutgoingMessage::event(self.plugin_id().clone(), channel, action)
            .to(receiver.clone())
            .with_payload(payload);
        self.send(message).await.map(|_| ())
    }

    /// REQUEST to one plugin; returns the response payload.
    pub async fn request(
        &self,
        receiver: &PluginId,
        channel: &str,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let mut message =
            OutgoingMessage::request(self.plugin_id().clone(), receiver.clone(), channel, action)
                .with_payload(payload);
        if let Some(timeout) = timeout {
            message = message.with_timeout(timeout);
        }
        let response = self.send(message).await?.into_response();
        Ok(response.and_then(Envelope::into_payload).unwrap_or(Value::Null))
    }

    /// Installs a handler on one of this plugin's channels.
    pub fn on_channel<F>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(Envelope, Responder) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.require_messaging()?;
        self.bus.on_channel(self.plugin_id(), channel, handler)?;
        debug!(plugin_id = %self.plugin_id(), channel, "Channel handler installed");
        Ok(())
    }

    pub fn off_channel(&self, channel: &str) -> bool {
        self.bus.off_channel(self.plugin_id(), channel)
    }

    // ================================================================
    // Services
    // ================================================================

    /// Provides a service. The definition's provider is this plugin.
    pub fn provide_service(
        &self,
        mut definition: ServiceDefinition,
        provider: Arc<dyn ServiceProvider>,
    ) -> Result<()> {
        self.require_messaging()?;
        definition.provider_id = self.plugin_id().clone();
        Ok(self.bus.register_service(definition, provider)?)
    }

    pub fn withdraw_service(&self, service_id: &str) -> bool {
        self.bus.unregister_service(self.plugin_id(), service_id)
    }

    pub async fn call_service(&self, service_id: &str, method: &str, params: Value) -> Result<Value> {
        self.require_messaging()?;
        Ok(self
            .bus
            .call_service(self.plugin_id(), service_id, method, params)
            .await?)
    }

    /// Services this plugin may call.
    #[must_use]
    pub fn services(&self) -> Vec<ServiceDefinition> {
        self.bus.services_visible_to(self.plugin_id())
    }

    // ================================================================
    // Permissions
    // ================================================================

    /// Asks for a permission and waits for the host's decision.
    pub async fn request_permission(
        &self,
        definition: PermissionDefinition,
        reason: Option<String>,
    ) -> Result<PermissionGrant> {
        Ok(self.begin_permission_request(definition, reason)?.wait().await?)
    }

    pub fn begin_permission_request(
        &self,
        definition: PermissionDefinition,
        reason: Option<String>,
    ) -> Result<PendingPermission> {
        if !self.is_active() {
            return Err(SandboxError::Inactive(self.sandbox_id).into());
        }
        Ok(self
            .permissions
            .begin_request(self.plugin_id(), definition, reason)?)
    }

    pub fn check_permission(
        &self,
        kind: &PermissionKind,
        scope: PermissionScope,
        target: Option<&str>,
    ) -> Result<PermissionStatus> {
        Ok(self.permissions.check(self.plugin_id(), kind, scope, target)?)
    }

    // ================================================================
    // Sandbox
    // ================================================================

    /// Capability-gated storage, network and logging facades.
    pub fn scope(&self) -> Result<SandboxScope> {
        Ok(self.sandboxes.scope(self.sandbox_id)?)
    }

    /// Runs an entry point of the plugin's module.
    pub async fn execute(&self, entry: &str, extra: Value) -> Result<ExecutionResult> {
        Ok(self.sandboxes.execute(self.sandbox_id, entry, extra).await?)
    }

    // ================================================================
    // Configuration
    // ================================================================

    /// Stored configuration values, if any were saved.
    pub fn config(&self) -> Result<Option<Value>> {
        Ok(self.store.get(&keys::config(self.plugin_id()))?)
    }

    /// Saves configuration values. The manifest's schema is for the host UI;
    /// the kernel stores the values as given.
    pub fn set_config(&self, values: Value) -> Result<()> {
        if !self.is_active() {
            return Err(SandboxError::Inactive(self.sandbox_id).into());
        }
        self.store.set(&keys::config(self.plugin_id()), values)?;
        debug!(plugin_id = %self.plugin_id(), "Plugin config saved");
        Ok(())
    }

    #[must_use]
    pub fn config_schema(&self) -> Option<&Value> {
        self.manifest.config_schema.as_ref()
    }
}
