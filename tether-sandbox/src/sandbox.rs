//! Per-plugin sandbox state.
//!
//! A `Sandbox` owns:
//! - the live capability set (re-read on every facade call)
//! - usage counters (storage bytes, rolling network window)
//! - the attached plugin module
//! - the `active` flag that makes facades fail closed after teardown

use crate::{PluginModule, Result, SandboxError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tether_types::{CapabilitySet, PluginId, SandboxId, Timestamp};
use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct UsageCounters {
    pub(crate) storage_bytes: u64,
    pub(crate) window_requests: u32,
    pub(crate) window_started: Instant,
    pub(crate) total_requests: u64,
}

impl UsageCounters {
    fn new(storage_bytes: u64) -> Self {
        Self {
            storage_bytes,
            window_requests: 0,
            window_started: Instant::now(),
            total_requests: 0,
        }
    }
}

pub(crate) struct Sandbox {
    id: SandboxId,
    plugin_id: PluginId,
    created_at: Timestamp,
    active: AtomicBool,
    capabilities: RwLock<CapabilitySet>,
    counters: Mutex<UsageCounters>,
    module: Mutex<Option<Arc<dyn PluginModule>>>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    pub(crate) fn new(plugin_id: PluginId, capabilities: CapabilitySet, storage_bytes: u64) -> Self {
        Self {
            id: SandboxId::new(),
            plugin_id,
            created_at: Timestamp::now(),
            active: AtomicBool::new(true),
            capabilities: RwLock::new(capabilities),
            counters: Mutex::new(UsageCounters::new(storage_bytes)),
            module: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> SandboxId {
        self.id
    }

    pub(crate) fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    pub(crate) fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SandboxError::Inactive(self.id))
        }
    }

    /// Snapshot of the current capability set.
    pub(crate) fn capabilities(&self) -> CapabilitySet {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `f` to the live capability set, returning the before and
    /// after snapshots.
    pub(crate) fn update_capabilities(
        &self,
        f: impl FnOnce(&mut CapabilitySet),
    ) -> (CapabilitySet, CapabilitySet) {
        let mut caps = self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = caps.clone();
        f(&mut caps);
        (before, caps.clone())
    }

    pub(crate) fn counters(&self) -> MutexGuard<'_, UsageCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn storage_bytes(&self) -> u64 {
        self.counters().storage_bytes
    }

    pub(crate) fn total_requests(&self) -> u64 {
        self.counters().total_requests
    }

    /// Takes one request from the rolling window. The window restarts once
    /// `window` has elapsed since its last reset. On refusal returns the
    /// count the request would have reached.
    pub(crate) fn take_network_slot(
        &self,
        rate_per_window: u32,
        window: Duration,
    ) -> std::result::Result<u32, u32> {
        let mut counters = self.counters();
        let now = Instant::now();
        if now.duration_since(counters.window_started) >= window {
            counters.window_started = now;
            counters.window_requests = 0;
        }
        if counters.window_requests >= rate_per_window {
            return Err(counters.window_requests.saturating_add(1));
        }
        counters.window_requests += 1;
        counters.total_requests += 1;
        Ok(counters.window_requests)
    }

    pub(crate) fn attach_module(&self, module: Arc<dyn PluginModule>) {
        *self.module.lock().unwrap_or_else(PoisonError::into_inner) = Some(module);
    }

    pub(crate) fn module(&self) -> Option<Arc<dyn PluginModule>> {
        self.module
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Marks the sandbox inactive, detaches its module and zeroes counters.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.module
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self.counters() = UsageCounters::new(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new(PluginId::new("p"), CapabilitySet::none(), 12)
    }

    #[test]
    fn deactivate_fails_closed_and_clears_counters() {
        let sb = sandbox();
        assert!(sb.ensure_active().is_ok());
        assert_eq!(sb.storage_bytes(), 12);

        sb.deactivate();
        assert!(matches!(sb.ensure_active(), Err(SandboxError::Inactive(_))));
        assert_eq!(sb.storage_bytes(), 0);
        assert!(sb.module().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn network_window_rolls_from_last_reset() {
        let sb = sandbox();
        let window = Duration::from_secs(60);
        assert_eq!(sb.take_network_slot(2, window), Ok(1));
        assert_eq!(sb.take_network_slot(2, window), Ok(2));
        assert_eq!(sb.take_network_slot(2, window), Err(3));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(sb.take_network_slot(2, window), Err(3));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(sb.take_network_slot(2, window), Ok(1));
        assert_eq!(sb.total_requests(), 3);
    }

    #[test]
    fn update_capabilities_returns_snapshots() {
        let sb = sandbox();
        let (before, after) = sb.update_capabilities(|caps| caps.network = true);
        assert!(!before.network);
        assert!(after.network);
        assert!(sb.capabilities().network);
    }
}
