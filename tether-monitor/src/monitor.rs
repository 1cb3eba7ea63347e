use crate::{MonitorConfig, RingBuffer};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tether_types::{EventBus, KernelEvent, PluginId, ResourceKind, Timestamp, UsageSample};
use tracing::{debug, warn};

type SeriesKey = (PluginId, ResourceKind);

/// Mean usage per resource per plugin at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub generated_at: Timestamp,
    pub averages: BTreeMap<PluginId, BTreeMap<ResourceKind, f64>>,
}

impl UsageReport {
    /// Mean for one plugin and resource, if any samples were recorded.
    #[must_use]
    pub fn average(&self, plugin: &PluginId, resource: &ResourceKind) -> Option<f64> {
        self.averages.get(plugin)?.get(resource).copied()
    }

    fn into_event(self) -> KernelEvent {
        KernelEvent::UsageReport {
            generated_at: self.generated_at,
            averages: self.averages,
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    series: HashMap<SeriesKey, RingBuffer<UsageSample>>,
    global: RingBuffer<UsageSample>,
    limits: HashMap<SeriesKey, f64>,
}

/// Records usage samples and raises breach events.
#[derive(Debug)]
pub struct ResourceMonitor {
    state: Mutex<MonitorState>,
    events: Arc<EventBus>,
    config: MonitorConfig,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new(events: Arc<EventBus>, config: MonitorConfig) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                series: HashMap::new(),
                global: RingBuffer::new(config.global_capacity),
                limits: HashMap::new(),
            }),
            events,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Sets the configured limit for one plugin's resource.
    pub fn set_limit(&self, plugin: &PluginId, resource: ResourceKind, limit: f64) {
        debug!(plugin_id = %plugin, %resource, limit, "Resource limit set");
        self.lock()
            .limits
            .insert((plugin.clone(), resource), limit);
    }

    /// Configured limit for one plugin's resource.
    #[must_use]
    pub fn limit(&self, plugin: &PluginId, resource: &ResourceKind) -> Option<f64> {
        self.lock()
            .limits
            .get(&(plugin.clone(), resource.clone()))
            .copied()
    }

    /// Drops every configured limit of a plugin. History is kept.
    pub fn clear_limits(&self, plugin: &PluginId) {
        self.lock().limits.retain(|(p, _), _| p != plugin);
    }

    /// Records a sample. Returns true if it breached the limit in force,
    /// in which case a `ResourceLimitExceeded` event has been published.
    ///
    /// The sample's own limit takes precedence over the configured one.
    pub fn record(&self, sample: UsageSample) -> bool {
        let breach = {
            let mut state = self.lock();
            let key = (sample.plugin_id.clone(), sample.resource.clone());
            let limit = sample.limit.or_else(|| state.limits.get(&key).copied());

            let capacity = self.config.per_series_capacity;
            state
                .series
                .entry(key)
                .or_insert_with(|| RingBuffer::new(capacity))
                .push(sample.clone());
            state.global.push(sample.clone());

            limit.filter(|limit| sample.value > *limit)
        };

        // Published after the lock is released; subscribers may call back.
        if let Some(limit) = breach {
            warn!(
                plugin_id = %sample.plugin_id,
                resource = %sample.resource,
                value = sample.value,
                limit,
                "Resource limit exceeded"
            );
            self.events.publish(KernelEvent::ResourceLimitExceeded {
                plugin_id: sample.plugin_id,
                resource: sample.resource,
                value: sample.value,
                limit,
            });
            return true;
        }
        false
    }

    /// Samples for one series, oldest first.
    #[must_use]
    pub fn history(&self, plugin: &PluginId, resource: &ResourceKind) -> Vec<UsageSample> {
        self.lock()
            .series
            .get(&(plugin.clone(), resource.clone()))
            .map(RingBuffer::to_vec)
            .unwrap_or_default()
    }

    /// Most recent samples across all plugins, oldest first.
    #[must_use]
    pub fn global_history(&self) -> Vec<UsageSample> {
        self.lock().global.to_vec()
    }

    /// Latest value recorded for a series.
    #[must_use]
    pub fn latest(&self, plugin: &PluginId, resource: &ResourceKind) -> Option<f64> {
        self.lock()
            .series
            .get(&(plugin.clone(), resource.clone()))
            .and_then(|buf| buf.iter().next_back())
            .map(|s| s.value)
    }

    /// Averages every series currently held.
    #[must_use]
    pub fn report(&self) -> UsageReport {
        let state = self.lock();
        let mut averages: BTreeMap<PluginId, BTreeMap<ResourceKind, f64>> = BTreeMap::new();
        for ((plugin, resource), buf) in &state.series {
            if buf.is_empty() {
                continue;
            }
            let sum: f64 = buf.iter().map(|s| s.value).sum();
            #[allow(clippy::cast_precision_loss)]
            let mean = sum / buf.len() as f64;
            averages
                .entry(plugin.clone())
                .or_default()
                .insert(resource.clone(), mean);
        }
        UsageReport {
            generated_at: Timestamp::now(),
            averages,
        }
    }

    /// Builds a report and publishes it on the event bus.
    pub fn publish_report(&self) -> UsageReport {
        let report = self.report();
        debug!(plugins = report.averages.len(), "Publishing usage report");
        self.events.publish(report.clone().into_event());
        report
    }

    /// Forgets everything about a plugin: limits, series and its entries in
    /// the global history.
    pub fn remove_plugin(&self, plugin: &PluginId) {
        let mut state = self.lock();
        state.limits.retain(|(p, _), _| p != plugin);
        state.series.retain(|(p, _), _| p != plugin);
        state.global.retain(|s| s.plugin_id != *plugin);
        debug!(plugin_id = %plugin, "Usage history dropped");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
