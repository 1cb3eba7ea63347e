use std::sync::Arc;
use std::time::Duration;
use tether_monitor::{spawn_reporter, MonitorConfig, ResourceMonitor};
use tether_types::{EventBus, KernelEvent, PluginId, ResourceKind, UsageSample};

fn monitor(report_interval_ms: u64) -> (Arc<EventBus>, Arc<ResourceMonitor>) {
    let events = Arc::new(EventBus::new());
    let config = MonitorConfig {
        report_interval_ms,
        ..MonitorConfig::default()
    };
    let monitor = Arc::new(ResourceMonitor::new(Arc::clone(&events), config));
    (events, monitor)
}

#[tokio::test(start_paused = true)]
async fn reporter_publishes_on_interval() {
    let (events, monitor) = monitor(1_000);
    let mut rx = events.subscribe();
    monitor.record(UsageSample::new(
        PluginId::new("acme.notes"),
        ResourceKind::ExecutionTime,
        40.0,
    ));

    let handle = spawn_reporter(Arc::clone(&monitor));

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let reports: Vec<_> = rx
        .drain()
        .into_iter()
        .filter(|e| matches!(**e, KernelEvent::UsageReport { .. }))
        .collect();
    assert_eq!(reports.len(), 2);

    match &*reports[0] {
        KernelEvent::UsageReport { averages, .. } => {
            let mean = averages[&PluginId::new("acme.notes")][&ResourceKind::ExecutionTime];
            assert!((mean - 40.0).abs() < f64::EPSILON);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reporter_stops_on_shutdown() {
    let (events, monitor) = monitor(1_000);
    let mut rx = events.subscribe();
    let handle = spawn_reporter(monitor);

    handle.shutdown().await;
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert!(rx.drain().is_empty());
}

#[tokio::test]
async fn breach_events_reach_async_observers() {
    let (events, monitor) = monitor(60_000);
    let mut rx = events.subscribe();
    let plugin = PluginId::new("acme.sync");
    monitor.set_limit(&plugin, ResourceKind::NetworkRequests, 5.0);

    monitor.record(UsageSample::new(plugin.clone(), ResourceKind::NetworkRequests, 6.0));

    let event = rx.recv().await.unwrap();
    assert_eq!(
        *event,
        KernelEvent::ResourceLimitExceeded {
            plugin_id: plugin,
            resource: ResourceKind::NetworkRequests,
            value: 6.0,
            limit: 5.0,
        }
    );
}
