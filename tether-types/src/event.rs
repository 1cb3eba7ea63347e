//! Kernel event channel.
//!
//! Subsystems never mutate each other's state. A sandbox teardown, a
//! permission decision or a quota breach is published here, and the other
//! subsystems react through subscribers the runtime wires up.
//!
//! Two delivery modes exist:
//! - async observers hold an [`EventReceiver`] backed by a Tokio broadcast
//!   channel (the consent UI, dashboards);
//! - synchronous [`EventSubscriber`]s run inline inside `publish`, which is
//!   what teardown hooks need so that a cascade has completed by the time
//!   `destroy` returns.

use crate::{
    CapabilitySet, PermissionGrant, PluginId, ResourceKind, SandboxId, Timestamp,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Everything the kernel announces.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    PluginRegistered {
        plugin_id: PluginId,
        version: String,
    },
    PluginUnregistered {
        plugin_id: PluginId,
    },
    SandboxCreated {
        sandbox_id: SandboxId,
        plugin_id: PluginId,
        capabilities: CapabilitySet,
    },
    SandboxDestroyed {
        sandbox_id: SandboxId,
        plugin_id: PluginId,
    },
    SandboxError {
        sandbox_id: SandboxId,
        plugin_id: PluginId,
        message: String,
    },
    ResourceLimitExceeded {
        plugin_id: PluginId,
        resource: ResourceKind,
        value: f64,
        limit: f64,
    },
    PermissionChanged {
        sandbox_id: SandboxId,
        plugin_id: PluginId,
        before: Box<CapabilitySet>,
        after: Box<CapabilitySet>,
    },
    PermissionRequested {
        grant: PermissionGrant,
    },
    PermissionGranted {
        grant: PermissionGrant,
    },
    PermissionDenied {
        grant: PermissionGrant,
    },
    PermissionRevoked {
        grant: PermissionGrant,
    },
    PermissionExpired {
        grant: PermissionGrant,
    },
    UsageReport {
        generated_at: Timestamp,
        averages: BTreeMap<PluginId, BTreeMap<ResourceKind, f64>>,
    },
}

impl KernelEvent {
    /// Stable event name, used for logging and topic filtering.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PluginRegistered { .. } => "plugin:registered",
            Self::PluginUnregistered { .. } => "plugin:unregistered",
            Self::SandboxCreated { .. } => "sandbox:created",
            Self::SandboxDestroyed { .. } => "sandbox:destroyed",
            Self::SandboxError { .. } => "sandbox:error",
            Self::ResourceLimitExceeded { .. } => "resource_limit_exceeded",
            Self::PermissionChanged { .. } => "permission_changed",
            Self::PermissionRequested { .. } => "permission:requested",
            Self::PermissionGranted { .. } => "permission:granted",
            Self::PermissionDenied { .. } => "permission:denied",
            Self::PermissionRevoked { .. } => "permission:revoked",
            Self::PermissionExpired { .. } => "permission:expired",
            Self::UsageReport { .. } => "monitor:report",
        }
    }

    /// The plugin the event concerns, if any.
    #[must_use]
    pub fn plugin_id(&self) -> Option<&PluginId> {
        match self {
            Self::PluginRegistered { plugin_id, .. }
            | Self::PluginUnregistered { plugin_id }
            | Self::SandboxCreated { plugin_id, .. }
            | Self::SandboxDestroyed { plugin_id, .. }
            | Self::SandboxError { plugin_id, .. }
            | Self::ResourceLimitExceeded { plugin_id, .. }
            | Self::PermissionChanged { plugin_id, .. } => Some(plugin_id),
            Self::PermissionRequested { grant }
            | Self::PermissionGranted { grant }
            | Self::PermissionDenied { grant }
            | Self::PermissionRevoked { grant }
            | Self::PermissionExpired { grant } => Some(&grant.plugin_id),
            Self::UsageReport { .. } => None,
        }
    }
}

/// Trait for synchronous event subscribers.
///
/// `on_event` runs inside `publish`; keep it short and never block on
/// async work from here.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &KernelEvent);

    /// Return `false` to skip an event. Accepts everything by default.
    fn accepts(&self, event: &KernelEvent) -> bool {
        let _ = event;
        true
    }

    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Registration handle for a synchronous subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

/// Broadcasts kernel events to async receivers and synchronous subscribers.
pub struct EventBus {
    sender: broadcast::Sender<Arc<KernelEvent>>,
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn EventSubscriber>>>,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("receivers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Publishes an event. Synchronous subscribers have all run by the time
    /// this returns. Returns the number of async receivers reached.
    pub fn publish(&self, event: KernelEvent) -> usize {
        let event = Arc::new(event);
        trace!(event_type = event.event_type(), "Publishing event");

        let count = self.sender.send(Arc::clone(&event)).unwrap_or(0);

        // Snapshot so subscribers may publish or (un)register re-entrantly.
        let subscribers: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for subscriber in subscribers {
            if subscriber.accepts(&event) {
                trace!(
                    subscriber = subscriber.name(),
                    event_type = event.event_type(),
                    "Notifying subscriber"
                );
                // One failing subscriber must not starve the rest.
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    subscriber.on_event(&event);
                }));
                if let Err(e) = result {
                    warn!(
                        subscriber = subscriber.name(),
                        event_type = event.event_type(),
                        error = ?e,
                        "Subscriber panicked"
                    );
                }
            }
        }

        count
    }

    /// Subscribes an async receiver to all future events.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Registers a synchronous subscriber.
    pub fn register(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberId {
        let id = SubscriberId(Uuid::new_v4());
        debug!(subscriber = subscriber.name(), "Subscriber registered");
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, subscriber);
        id
    }

    /// Removes a synchronous subscriber. Returns true if it was present.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Number of async receivers plus synchronous subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let sync = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        self.sender.receiver_count().saturating_add(sync)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Async receiving end of the event bus.
#[derive(Debug)]
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<KernelEvent>>,
}

impl EventReceiver {
    /// Waits for the next event. Returns `None` once the bus is dropped.
    /// Lagged receivers skip the events they missed.
    pub async fn recv(&mut self) -> Option<Arc<KernelEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next already-published event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<KernelEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drains every already-published event.
    pub fn drain(&mut self) -> Vec<Arc<KernelEvent>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
