//! Resource usage monitor for the Tether plugin kernel.
//!
//! Sandboxes and hosts report [`UsageSample`](tether_types::UsageSample)s
//! here. Each sample lands in a bounded ring buffer per
//! `(plugin, resource)` and in a global history, is compared against the
//! limit in force, and breaches are announced on the kernel event bus.
//! A background reporter publishes per-plugin averages at a fixed interval.

mod history;
mod monitor;
mod reporter;

pub use history::RingBuffer;
pub use monitor::{ResourceMonitor, UsageReport};
pub use reporter::{run_reporter, spawn_reporter, ReporterHandle};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Samples kept per `(plugin, resource)` series.
pub const DEFAULT_SERIES_CAPACITY: usize = 100;

/// Samples kept in the global history.
pub const DEFAULT_GLOBAL_CAPACITY: usize = 1000;

/// Default interval between usage reports.
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 60_000;

/// Monitor settings, read from the `[monitor]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub per_series_capacity: usize,
    pub global_capacity: usize,
    pub report_interval_ms: u64,
}

impl MonitorConfig {
    #[must_use]
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            per_series_capacity: DEFAULT_SERIES_CAPACITY,
            global_capacity: DEFAULT_GLOBAL_CAPACITY,
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
        }
    }
}
