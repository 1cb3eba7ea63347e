use crate::PermissionManager;
use std::sync::{Arc, Weak};
use tether_types::{EventSubscriber, KernelEvent};
use tracing::warn;

/// Rejects a plugin's pending permission requests when its sandbox is
/// destroyed.
pub struct PermissionTeardownHook {
    manager: Weak<PermissionManager>,
}

impl PermissionTeardownHook {
    #[must_use]
    pub fn new(manager: &Arc<PermissionManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }
}

impl EventSubscriber for PermissionTeardownHook {
    fn on_event(&self, event: &KernelEvent) {
        let KernelEvent::SandboxDestroyed { plugin_id, .. } = event else {
            return;
        };
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if let Err(e) = manager.cancel_pending(plugin_id) {
            warn!(plugin_id = %plugin_id, error = %e, "Failed to cancel pending permissions");
        }
    }

    fn accepts(&self, event: &KernelEvent) -> bool {
        matches!(event, KernelEvent::SandboxDestroyed { .. })
    }

    fn name(&self) -> &str {
        "permission-teardown"
    }
}
