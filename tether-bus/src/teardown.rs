use crate::bus::{MessageBus, Shared};
use std::sync::Weak;
use tether_types::{EventSubscriber, KernelEvent};

/// Removes a plugin's bus endpoint when its sandbox is destroyed.
pub struct BusTeardownHook {
    bus: Weak<Shared>,
}

impl BusTeardownHook {
    #[must_use]
    pub fn new(bus: &MessageBus) -> Self {
        Self {
            bus: bus.downgrade(),
        }
    }
}

impl EventSubscriber for BusTeardownHook {
    fn on_event(&self, event: &KernelEvent) {
        if let KernelEvent::SandboxDestroyed { plugin_id, .. } = event {
            if let Some(shared) = self.bus.upgrade() {
                MessageBus::from_shared(shared).unregister_endpoint(plugin_id);
            }
        }
    }

    fn accepts(&self, event: &KernelEvent) -> bool {
        matches!(event, KernelEvent::SandboxDestroyed { .. })
    }

    fn name(&self) -> &str {
        "bus-teardown"
    }
}
