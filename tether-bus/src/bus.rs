//! Endpoint table, delivery and the pending-request table.

use crate::envelope::{Envelope, OutgoingMessage};
use crate::service::ServiceEntry;
use crate::{BusConfig, BusError, HandlerError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tether_types::{MessageId, PluginId};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Synchronous channel handler. Runs inline inside `send`; work that has
/// to await moves the [`Responder`] into a task.
pub type ChannelHandler =
    Arc<dyn Fn(Envelope, Responder) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// What a successful `send` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Broadcast; lists the plugins whose handler accepted the copy.
    Broadcast { recipients: Vec<PluginId> },
    /// Fire-and-forget delivery.
    Delivered { id: MessageId },
    /// The RESPONSE to a request.
    Responded(Envelope),
}

/// Runs a handler, turning a panic into a [`HandlerError`].
fn invoke(
    handler: &ChannelHandler,
    envelope: Envelope,
    responder: Responder,
) -> std::result::Result<(), HandlerError> {
    catch_unwind(AssertUnwindSafe(|| handler(envelope, responder))).unwrap_or_else(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(HandlerError(format!("handler panicked: {detail}")))
    })
}

impl SendOutcome {
    #[must_use]
    pub fn into_response(self) -> Option<Envelope> {
        match self {
            Self::Responded(envelope) => Some(envelope),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Endpoint {
    handlers: HashMap<String, ChannelHandler>,
}

struct Pending {
    tx: oneshot::Sender<Result<Envelope>>,
    timer: JoinHandle<()>,
    receiver: PluginId,
}

#[derive(Default)]
pub(crate) struct BusState {
    endpoints: BTreeMap<PluginId, Endpoint>,
    /// Plugins that were registered once and have since gone away.
    retired: HashSet<PluginId>,
    pending: HashMap<MessageId, Pending>,
    pub(crate) services: BTreeMap<String, ServiceEntry>,
}

pub(crate) struct Shared {
    state: Mutex<BusState>,
    config: BusConfig,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self, plugin: &PluginId, channel: &str) -> Result<ChannelHandler> {
        let state = self.lock();
        match state.endpoints.get(plugin) {
            Some(endpoint) => endpoint.handlers.get(channel).cloned().ok_or_else(|| {
                BusError::Delivery(format!("plugin '{plugin}' has no handler for '{channel}'"))
            }),
            None if state.retired.contains(plugin) => {
                Err(BusError::PluginUnregistered(plugin.clone()))
            }
            None => Err(BusError::NotRegistered(plugin.clone())),
        }
    }

    /// Resolves a pending request. False if it already settled.
    fn resolve(&self, request: &Envelope, payload: Value) -> bool {
        let Some(pending) = self.lock().pending.remove(request.id()) else {
            debug!(request_id = %request.id(), "Late response dropped");
            return false;
        };
        pending.timer.abort();
        let _ = pending.tx.send(Ok(Envelope::response_to(request, payload)));
        true
    }

    /// Rejects a pending request with a handler failure and delivers an
    /// ERROR envelope to the sender's handler for the same channel.
    fn fail(&self, request: &Envelope, message: &str) -> bool {
        let Some(pending) = self.lock().pending.remove(request.id()) else {
            debug!(request_id = %request.id(), "Late error dropped");
            return false;
        };
        pending.timer.abort();

        let error = Envelope::error_to(request, message);
        if let Ok(handler) = self.handler(request.sender_id(), request.channel()) {
            if let Err(e) = invoke(&handler, error, Responder::detached()) {
                warn!(
                    plugin_id = %request.sender_id(),
                    channel = request.channel(),
                    error = %e,
                    "Sender failed to handle ERROR envelope"
                );
            }
        }
        let _ = pending
            .tx
            .send(Err(BusError::HandlerFailed(message.to_string())));
        true
    }

    fn expire(&self, id: &MessageId, timeout_ms: u64) {
        if let Some(pending) = self.lock().pending.remove(id) {
            warn!(request_id = %id, timeout_ms, "Request timed out");
            let _ = pending.tx.send(Err(BusError::Timeout {
                id: id.clone(),
                timeout_ms,
            }));
        }
    }
}

/// Reply handle passed to a channel handler with each message.
///
/// For requests, the first `respond`/`reject` settles the sender's wait;
/// anything after that (or after the timeout) is a no-op. For other
/// messages both calls return false.
pub struct Responder {
    shared: Option<Arc<Shared>>,
    request: Option<Envelope>,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("request", &self.request.as_ref().map(Envelope::id))
            .finish_non_exhaustive()
    }
}

impl Responder {
    pub(crate) fn detached() -> Self {
        Self {
            shared: None,
            request: None,
        }
    }

    fn for_request(shared: Arc<Shared>, request: Envelope) -> Self {
        Self {
            shared: Some(shared),
            request: Some(request),
        }
    }

    /// Returns true if the sender is waiting for an answer.
    #[must_use]
    pub fn expects_response(&self) -> bool {
        self.request.is_some()
    }

    /// Answers the request. Returns false if nothing was waiting.
    pub fn respond(self, payload: Value) -> bool {
        match (&self.shared, &self.request) {
            (Some(shared), Some(request)) => shared.resolve(request, payload),
            _ => false,
        }
    }

    /// Fails the request with `message`. Returns false if nothing was
    /// waiting.
    pub fn reject(self, message: impl Into<String>) -> bool {
        match (&self.shared, &self.request) {
            (Some(shared), Some(request)) => shared.fail(request, &message.into()),
            _ => false,
        }
    }
}

/// Routes envelopes between registered plugins.
#[derive(Clone)]
pub struct MessageBus {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("MessageBus")
            .field("endpoints", &state.endpoints.len())
            .field("pending", &state.pending.len())
            .field("services", &state.services.len())
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                config,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    // ================================================================
    // Endpoints
    // ================================================================

    pub fn register_endpoint(&self, plugin: &PluginId) -> Result<()> {
        let mut state = self.shared.lock();
        if state.endpoints.contains_key(plugin) {
            return Err(BusError::AlreadyRegistered(plugin.clone()));
        }
        state.retired.remove(plugin);
        state.endpoints.insert(plugin.clone(), Endpoint::default());
        debug!(plugin_id = %plugin, "Bus endpoint registered");
        Ok(())
    }

    /// Removes a plugin's endpoint and services, and rejects every pending
    /// request it sent or was asked to answer. Returns false if the plugin
    /// had no endpoint.
    pub fn unregister_endpoint(&self, plugin: &PluginId) -> bool {
        let cancelled: Vec<(MessageId, Pending)> = {
            let mut state = self.shared.lock();
            if state.endpoints.remove(plugin).is_none() {
                return false;
            }
            state.retired.insert(plugin.clone());
            state.services.retain(|_, entry| entry.definition.provider_id != *plugin);

            let ids: Vec<MessageId> = state
                .pending
                .iter()
                .filter(|(id, p)| id.is_namespaced_under(plugin) || p.receiver == *plugin)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        for (id, pending) in &cancelled {
            trace!(request_id = %id, "Cancelling pending request");
            pending.timer.abort();
        }
        let count = cancelled.len();
        for (_, pending) in cancelled {
            let _ = pending
                .tx
                .send(Err(BusError::PluginUnregistered(plugin.clone())));
        }
        info!(plugin_id = %plugin, cancelled = count, "Bus endpoint unregistered");
        true
    }

    /// Drops the record that `plugin` was once registered, so later sends
    /// to it fail with `NotRegistered` instead of `PluginUnregistered`.
    /// Returns false if the plugin is live or was never retired.
    pub fn forget_endpoint(&self, plugin: &PluginId) -> bool {
        let mut state = self.shared.lock();
        if state.endpoints.contains_key(plugin) {
            return false;
        }
        state.retired.remove(plugin)
    }

    #[must_use]
    pub fn is_registered(&self, plugin: &PluginId) -> bool {
        self.shared.lock().endpoints.contains_key(plugin)
    }

    /// Registered plugins in id order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<PluginId> {
        self.shared.lock().endpoints.keys().cloned().collect()
    }

    /// Installs `handler` for `(plugin, channel)`, replacing any previous one.
    pub fn on_channel<F>(&self, plugin: &PluginId, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(Envelope, Responder) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.install_handler(plugin, channel, Arc::new(handler))
    }

    pub(crate) fn install_handler(
        &self,
        plugin: &PluginId,
        channel: &str,
        handler: ChannelHandler,
    ) -> Result<()> {
        let mut state = self.shared.lock();
        let endpoint = state
            .endpoints
            .get_mut(plugin)
            .ok_or_else(|| BusError::NotRegistered(plugin.clone()))?;
        if endpoint.handlers.insert(channel.to_string(), handler).is_some() {
            debug!(plugin_id = %plugin, channel, "Channel handler replaced");
        }
        Ok(())
    }

    /// Removes the handler for `(plugin, channel)`. Returns true if one existed.
    pub fn off_channel(&self, plugin: &PluginId, channel: &str) -> bool {
        self.shared
            .lock()
            .endpoints
            .get_mut(plugin)
            .is_some_and(|e| e.handlers.remove(channel).is_some())
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    // ================================================================
    // Sending
    // ================================================================

    /// Sends a message.
    ///
    /// - no receiver: broadcast to every other registered plugin;
    /// - receiver, no response expected: fire-and-forget;
    /// - receiver, response expected: waits for the RESPONSE, a handler
    ///   failure, or the timeout.
    pub async fn send(&self, message: OutgoingMessage) -> Result<SendOutcome> {
        let envelope = Envelope::from_outgoing(message)?;
        {
            let state = self.shared.lock();
            let sender = envelope.sender_id();
            if !state.endpoints.contains_key(sender) {
                return Err(if state.retired.contains(sender) {
                    BusError::PluginUnregistered(sender.clone())
                } else {
                    BusError::NotRegistered(sender.clone())
                });
            }
        }

        match envelope.receiver_id().cloned() {
            None => Ok(self.broadcast(&envelope)),
            Some(receiver) if !envelope.requires_response() => {
                self.deliver(envelope, &receiver)
            }
            Some(receiver) => self.request(envelope, &receiver).await,
        }
    }

    fn broadcast(&self, envelope: &Envelope) -> SendOutcome {
        let targets: Vec<(PluginId, Option<ChannelHandler>)> = {
            let state = self.shared.lock();
            state
                .endpoints
                .iter()
                .filter(|(id, _)| *id != envelope.sender_id())
                .map(|(id, e)| (id.clone(), e.handlers.get(envelope.channel()).cloned()))
                .collect()
        };

        let mut recipients = Vec::new();
        for (receiver, handler) in targets {
            let Some(handler) = handler else {
                trace!(plugin_id = %receiver, channel = envelope.channel(), "No handler, skipping");
                continue;
            };
            match invoke(&handler, envelope.addressed_to(&receiver), Responder::detached()) {
                Ok(()) => recipients.push(receiver),
                Err(e) => warn!(
                    plugin_id = %receiver,
                    channel = envelope.channel(),
                    error = %e,
                    "Broadcast receiver failed"
                ),
            }
        }
        debug!(
            sender = %envelope.sender_id(),
            channel = envelope.channel(),
            recipients = recipients.len(),
            "Broadcast delivered"
        );
        SendOutcome::Broadcast { recipients }
    }

    fn deliver(&self, envelope: Envelope, receiver: &PluginId) -> Result<SendOutcome> {
        let handler = self.shared.handler(receiver, envelope.channel())?;
        let id = envelope.id().clone();
        trace!(request_id = %id, receiver = %receiver, "Delivering");
        invoke(&handler, envelope, Responder::detached())
            .map_err(|e| BusError::HandlerFailed(e.0))?;
        Ok(SendOutcome::Delivered { id })
    }

    async fn request(&self, envelope: Envelope, receiver: &PluginId) -> Result<SendOutcome> {
        let handler = self.shared.handler(receiver, envelope.channel())?;
        let id = envelope.id().clone();
        let timeout_ms = envelope
            .response_timeout_ms()
            .unwrap_or(self.shared.config.response_timeout_ms);

        let (tx, rx) = oneshot::channel();
        let timer = {
            let weak = Arc::downgrade(&self.shared);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if let Some(shared) = weak.upgrade() {
                    shared.expire(&id, timeout_ms);
                }
            })
        };
        self.shared.lock().pending.insert(
            id.clone(),
            Pending {
                tx,
                timer,
                receiver: receiver.clone(),
            },
        );
        trace!(request_id = %id, receiver = %receiver, timeout_ms, "Request pending");

        let responder = Responder::for_request(Arc::clone(&self.shared), envelope.clone());
        if let Err(e) = invoke(&handler, envelope.clone(), responder) {
            warn!(request_id = %id, receiver = %receiver, error = %e, "Request handler failed");
            self.shared.fail(&envelope, &e.0);
        }

        match rx.await {
            Ok(Ok(response)) => Ok(SendOutcome::Responded(response)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BusError::Cancelled(id)),
        }
    }
}
