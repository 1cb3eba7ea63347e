//! Service registry on top of request/response messaging.
//!
//! A service is a named set of methods a plugin offers to others. Calls
//! travel as REQUESTs on the provider's `service:<id>` channel with the
//! method name as the action and the params as the payload.

use crate::bus::{ChannelHandler, MessageBus, Responder};
use crate::envelope::{Envelope, OutgoingMessage};
use crate::{BusError, HandlerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tether_types::PluginId;
use tracing::{debug, info};

/// Channel prefix for service endpoints.
pub const SERVICE_CHANNEL_PREFIX: &str = "service:";

#[must_use]
pub fn service_channel(service_id: &str) -> String {
    format!("{SERVICE_CHANNEL_PREFIX}{service_id}")
}

/// Who may call a service. The provider may always call its own service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "plugins", rename_all = "snake_case")]
pub enum Visibility {
    Public,
    AllowListed(BTreeSet<PluginId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub id: String,
    pub provider_id: PluginId,
    /// Method catalog.
    pub methods: BTreeSet<String>,
    pub visibility: Visibility,
}

impl ServiceDefinition {
    #[must_use]
    pub fn public(id: impl Into<String>, provider: PluginId, methods: &[&str]) -> Self {
        Self {
            id: id.into(),
            provider_id: provider,
            methods: methods.iter().map(|m| (*m).to_string()).collect(),
            visibility: Visibility::Public,
        }
    }

    #[must_use]
    pub fn allow_listed(mut self, callers: impl IntoIterator<Item = PluginId>) -> Self {
        self.visibility = Visibility::AllowListed(callers.into_iter().collect());
        self
    }

    #[must_use]
    pub fn is_visible_to(&self, caller: &PluginId) -> bool {
        *caller == self.provider_id
            || match &self.visibility {
                Visibility::Public => true,
                Visibility::AllowListed(callers) => callers.contains(caller),
            }
    }

    #[must_use]
    pub fn offers(&self, method: &str) -> bool {
        self.methods.contains(method)
    }
}

/// Implementation behind a registered service.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    async fn handle_service_request(
        &self,
        service_id: &str,
        method: &str,
        params: Value,
        caller: &PluginId,
    ) -> std::result::Result<Value, HandlerError>;
}

pub(crate) struct ServiceEntry {
    pub(crate) definition: ServiceDefinition,
}

impl MessageBus {
    /// Registers `definition` and installs its channel handler on the
    /// provider's endpoint.
    pub fn register_service(
        &self,
        definition: ServiceDefinition,
        provider: Arc<dyn ServiceProvider>,
    ) -> Result<()> {
        let provider_id = definition.provider_id.clone();
        let service_id = definition.id.clone();
        {
            let state = self.shared.lock();
            if state.services.contains_key(&service_id) {
                return Err(BusError::ServiceExists(service_id));
            }
        }

        let handler = service_handler(definition.clone(), provider);
        self.install_handler(&provider_id, &service_channel(&service_id), handler)?;

        let mut state = self.shared.lock();
        if state.services.contains_key(&service_id) {
            return Err(BusError::ServiceExists(service_id));
        }
        state
            .services
            .insert(service_id.clone(), ServiceEntry { definition });
        info!(plugin_id = %provider_id, service_id, "Service registered");
        Ok(())
    }

    /// Removes a service. Only its provider may do so.
    pub fn unregister_service(&self, provider: &PluginId, service_id: &str) -> bool {
        {
            let mut state = self.shared.lock();
            match state.services.get(service_id) {
                Some(entry) if entry.definition.provider_id == *provider => {
                    state.services.remove(service_id);
                }
                _ => return false,
            }
        }
        self.off_channel(provider, &service_channel(service_id));
        debug!(plugin_id = %provider, service_id, "Service unregistered");
        true
    }

    #[must_use]
    pub fn service(&self, service_id: &str) -> Option<ServiceDefinition> {
        self.shared
            .lock()
            .services
            .get(service_id)
            .map(|e| e.definition.clone())
    }

    /// Services `caller` may call, in id order.
    #[must_use]
    pub fn services_visible_to(&self, caller: &PluginId) -> Vec<ServiceDefinition> {
        self.shared
            .lock()
            .services
            .values()
            .filter(|e| e.definition.is_visible_to(caller))
            .map(|e| e.definition.clone())
            .collect()
    }

    /// Calls `method` on a service and waits for its result.
    pub async fn call_service(
        &self,
        caller: &PluginId,
        service_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let provider = self
            .service(service_id)
            .ok_or_else(|| BusError::ServiceNotFound(service_id.to_string()))?
            .provider_id;

        let message = OutgoingMessage::request(
            caller.clone(),
            provider,
            service_channel(service_id),
            method,
        )
        .with_payload(params);

        let response = self
            .send(message)
            .await?
            .into_response()
            .ok_or_else(|| BusError::Delivery("service call produced no response".into()))?;
        Ok(response.into_payload().unwrap_or(Value::Null))
    }
}

fn service_handler(
    definition: ServiceDefinition,
    provider: Arc<dyn ServiceProvider>,
) -> ChannelHandler {
    let definition = Arc::new(definition);
    let handler = move |envelope: Envelope,
                        responder: Responder|
          -> std::result::Result<(), HandlerError> {
        let method = envelope.action().to_string();
        let caller = envelope.sender_id().clone();

        if !definition.offers(&method) {
            return Err(BusError::MethodNotFound {
                service: definition.id.clone(),
                method,
            }
            .into());
        }
        if !definition.is_visible_to(&caller) {
            return Err(BusError::PermissionDenied(format!(
                "service '{}' is not visible to '{caller}'",
                definition.id
            ))
            .into());
        }

        let params = envelope.into_payload().unwrap_or(Value::Null);
        let definition = Arc::clone(&definition);
        let provider = Arc::clone(&provider);
        tokio::spawn(async move {
            match provider
                .handle_service_request(&definition.id, &method, params, &caller)
                .await
            {
                Ok(value) => responder.respond(value),
                Err(e) => responder.reject(e.0),
            };
        });
        Ok(())
    };
    Arc::new(handler)
}
