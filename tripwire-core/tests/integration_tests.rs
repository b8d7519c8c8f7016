// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end tests for the trigger evaluation pipeline.
//!
//! These drive a real `MonitorController` with in-memory collaborators, from
//! configuration loading through ingestion, evaluation and dispatch.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tripwire_core::memory::{CountingCache, MemoryStore, RecordingScaler, StaticPlatform};
use tripwire_core::metric::{POLLER_MEMORY, POLLER_MEMORY_QUOTA};
use tripwire_core::types::now_millis;
use tripwire_core::{
    AppId, AppInfo, AppInstanceMetrics, AppState, Collaborators, Config, ConfigLoader,
    DataSource, DispatchError, EngineConfig, InstanceIndex, Metric, MetricFamily,
    MonitorController, ScalingEvents, ThresholdType, ThresholdUnit, Trigger, TriggerEvent,
    TripwireError,
};

struct Harness {
    controller: Arc<MonitorController>,
    scaler: Arc<RecordingScaler>,
    platform: Arc<StaticPlatform>,
    cache: Arc<CountingCache>,
}

fn harness(engine: EngineConfig, scaler: RecordingScaler) -> Harness {
    let scaler = Arc::new(scaler);
    let platform = Arc::new(StaticPlatform::new());
    let cache = Arc::new(CountingCache::new());
    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::new()),
        platform: platform.clone(),
        scaling: scaler.clone(),
        caches: vec![cache.clone()],
    };
    let config = Config {
        engine,
        ..Config::default()
    };

    Harness {
        controller: MonitorController::new(config, collaborators).expect("controller"),
        scaler,
        platform,
        cache,
    }
}

fn app(name: &str) -> AppId {
    AppId::new(name).unwrap()
}

fn memory_snapshot(app_id: &AppId, instances: &[(u32, f64)]) -> AppInstanceMetrics {
    let ts = now_millis();
    instances
        .iter()
        .fold(AppInstanceMetrics::new(app_id.clone(), ts, 1000.0), |snap, &(index, used)| {
            snap.with_instance(
                index,
                vec![
                    Metric::new(POLLER_MEMORY, used, ts),
                    Metric::new(POLLER_MEMORY_QUOTA, 1000.0, ts),
                ],
            )
        })
}

fn upper_memory_trigger(app_id: &AppId, breach_secs: u32) -> Trigger {
    Trigger::new(
        app_id.clone(),
        "mem-upper",
        MetricFamily::Memory,
        ThresholdType::GreaterThan,
        80.0,
    )
    .with_unit(ThresholdUnit::Percent)
    .with_breach_duration(breach_secs)
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_breach_flows_through_to_scaling() {
    let h = harness(EngineConfig::default().with_workers(2, 2), RecordingScaler::new());
    let app_id = app("shop");
    h.controller
        .add_trigger(upper_memory_trigger(&app_id, 0))
        .await
        .unwrap();

    // The first pass only starts the breach timer.
    h.controller
        .process_app_instance_metrics(memory_snapshot(&app_id, &[(0, 950.0)]), &DataSource::Poller)
        .await
        .unwrap();
    let monitor = h.controller.get_state_monitor(&app_id).unwrap();
    assert!(wait_until(Duration::from_secs(2), || monitor.prev_trigger_eval_time() > 0).await);

    h.controller
        .process_app_instance_metrics(memory_snapshot(&app_id, &[(0, 950.0)]), &DataSource::Poller)
        .await
        .unwrap();

    assert!(h.scaler.wait_for_processed(1, Duration::from_secs(2)).await);
    let event = &h.scaler.processed()[0];
    assert_eq!(event.app_id, app_id);
    assert_eq!(event.trigger_id, "mem-upper");
    assert_eq!(event.metric_type, MetricFamily::Memory);
    assert_eq!(event.metric_value, 950.0);

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_equivalent_events_are_not_dispatched_twice() {
    let h = harness(
        EngineConfig::default().with_workers(1, 1),
        RecordingScaler::with_delay(Duration::from_millis(300)),
    );
    let app_id = app("shop");
    h.controller
        .add_trigger_directly(upper_memory_trigger(&app_id, 0))
        .unwrap();

    for _ in 0..4 {
        h.controller
            .process_app_instance_metrics(memory_snapshot(&app_id, &[(0, 950.0)]), &DataSource::Poller)
            .await
            .unwrap();
    }

    let monitor = h.controller.get_state_monitor(&app_id).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            monitor.sample_count(InstanceIndex::new(0), MetricFamily::Memory) == 4
        })
        .await
    );
    assert!(h.scaler.wait_for_processed(1, Duration::from_secs(2)).await);

    assert_eq!(h.scaler.processed_count(), 1);
    assert!(h.scaler.refused() >= 1);

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_blocks_without_losing_snapshots() {
    let mut engine = ConfigLoader::load_string("engine:\n  ingestion_queue_capacity: 1\n")
        .unwrap()
        .engine;
    engine = engine.with_workers(1, 1);
    let h = harness(engine, RecordingScaler::new());
    let app_id = app("shop");
    // Never breaches: 10 of 1000 is below 99%.
    h.controller
        .add_trigger_directly(
            Trigger::new(
                app_id.clone(),
                "mem-upper",
                MetricFamily::Memory,
                ThresholdType::GreaterThan,
                99.0,
            )
            .with_breach_duration(0),
        )
        .unwrap();

    const SNAPSHOTS: usize = 50;
    for _ in 0..SNAPSHOTS {
        h.controller
            .process_app_instance_metrics(memory_snapshot(&app_id, &[(0, 10.0)]), &DataSource::Poller)
            .await
            .unwrap();
    }

    let monitor = h.controller.get_state_monitor(&app_id).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.sample_count(InstanceIndex::new(0), MetricFamily::Memory) == SNAPSHOTS
        })
        .await
    );
    assert_eq!(h.scaler.processed_count(), 0);

    h.controller.shutdown().await;
}

/// Scaler whose `accept` holds the calling evaluation worker until the gate
/// opens.
struct GatedScaler {
    gate: watch::Receiver<bool>,
    accepted: AtomicUsize,
}

#[async_trait]
impl ScalingEvents for GatedScaler {
    async fn accept(&self, _event: &TriggerEvent) -> bool {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.clone();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        true
    }

    async fn process(&self, _event: TriggerEvent) -> Result<(), DispatchError> {
        Ok(())
    }

    fn release(&self, _event: &TriggerEvent) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_producer_waits_while_evaluation_is_stalled() {
    let mut engine = ConfigLoader::load_string("engine:\n  ingestion_queue_capacity: 1\n")
        .unwrap()
        .engine;
    engine = engine.with_workers(1, 1);

    let (open, gate) = watch::channel(false);
    let scaler = Arc::new(GatedScaler {
        gate,
        accepted: AtomicUsize::new(0),
    });
    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::new()),
        platform: Arc::new(StaticPlatform::new()),
        scaling: scaler.clone(),
        caches: Vec::new(),
    };
    let config = Config {
        engine,
        ..Config::default()
    };
    let controller = MonitorController::new(config, collaborators).unwrap();
    let app_id = app("shop");
    controller
        .add_trigger_directly(upper_memory_trigger(&app_id, 0))
        .unwrap();

    let send = |controller: Arc<MonitorController>, app_id: AppId| async move {
        controller
            .process_app_instance_metrics(memory_snapshot(&app_id, &[(0, 900.0)]), &DataSource::Poller)
            .await
    };

    // The first breaching sample arms the trigger, the second fires it and
    // parks the only evaluation worker inside `accept`.
    send(Arc::clone(&controller), app_id.clone()).await.unwrap();
    send(Arc::clone(&controller), app_id.clone()).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || scaler.accepted.load(Ordering::SeqCst) == 1).await
    );

    // One snapshot waits in the dispatcher for a worker, one fills the queue.
    for _ in 0..2 {
        tokio::time::timeout(
            Duration::from_secs(1),
            send(Arc::clone(&controller), app_id.clone()),
        )
        .await
        .unwrap()
        .unwrap();
    }

    let blocked = tokio::spawn(send(Arc::clone(&controller), app_id.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!blocked.is_finished());

    open.send_replace(true);
    tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let monitor = controller.get_state_monitor(&app_id).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.sample_count(InstanceIndex::new(0), MetricFamily::Memory) == 5
        })
        .await
    );

    controller.shutdown().await;
}

#[tokio::test]
async fn test_remove_trigger_for_unknown_app() {
    let h = harness(EngineConfig::default().with_workers(1, 1), RecordingScaler::new());

    let err = h.controller.remove_trigger(&app("ghost")).await.unwrap_err();
    assert!(matches!(err, TripwireError::TriggerNotFound { ref app_id } if app_id.as_str() == "ghost"));
    assert_eq!(err.to_string(), "Trigger not found for application ghost");

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_controller_from_config_file() {
    let yaml = r#"
engine:
  max_sample_retention_secs: 300
  report_interval_secs: 20
  evaluation_workers: 2
  dispatch_workers: 2

metric_sources:
  "*":
    poller:
      metrics: [memory]
  java:
    poller:
      metrics: [cpu, memory]

triggers:
  - app_id: shop
    trigger_id: mem-upper
    metric: memory
    threshold_type: greater_than
    metric_threshold: 80
    stat_window_secs: 60
    breach_duration_secs: 30
  - app_id: shop
    trigger_id: cpu-lower
    metric: CPU
    threshold_type: lower
    metric_threshold: 10
    unit: absolute
    stat_type: max
"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let config = ConfigLoader::load_file(file.path()).unwrap();
    assert_eq!(config.engine.max_sample_retention, Duration::from_secs(300));
    assert_eq!(config.engine.stale_timeout(), Duration::from_secs(30));
    assert_eq!(config.triggers.len(), 2);

    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::new()),
        platform: Arc::new(StaticPlatform::new()),
        scaling: Arc::new(RecordingScaler::new()),
        caches: Vec::new(),
    };
    let controller = MonitorController::new(config, collaborators).unwrap();

    let shop = app("shop");
    let triggers = controller.get_triggers(&shop);
    assert_eq!(triggers.len(), 2);
    // Ordered by metric family, CPU first.
    assert_eq!(triggers[0].trigger_id, "cpu-lower");
    assert_eq!(triggers[1].stat_window_secs, 60);

    let monitor = controller.get_state_monitor(&shop).unwrap();
    assert!(monitor.is_cpu_required());
    assert!(monitor.is_poller_mem_required());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_triggers_in_config_rejected() {
    let yaml = r#"
triggers:
  - { app_id: shop, trigger_id: a, metric: memory, threshold_type: upper, metric_threshold: 80 }
  - { app_id: shop, trigger_id: b, metric: memory, threshold_type: ">", metric_threshold: 90 }
"#;
    let err = ConfigLoader::load_string(yaml).unwrap_err();
    assert!(matches!(err, TripwireError::HardValidation(_)));
}

#[tokio::test]
async fn test_missing_config_file() {
    let err = ConfigLoader::load_file("/nonexistent/tripwire.yaml").unwrap_err();
    assert!(matches!(err, TripwireError::ConfigNotFound { .. }));
}

fn started(instance_count: u32) -> AppInfo {
    AppInfo {
        name: "app".to_string(),
        app_type: "java".to_string(),
        mem_quota: 1000.0,
        state: AppState::Started,
        instance_count,
    }
}

#[tokio::test]
async fn test_stale_purge_consults_platform() {
    let h = harness(EngineConfig::default().with_workers(1, 1), RecordingScaler::new());
    let stopped = app("stopped");
    let shrunk = app("shrunk");
    let unknown = app("unknown");
    let steady = app("steady");

    h.platform.set_app(
        stopped.clone(),
        AppInfo {
            state: AppState::Stopped,
            ..started(0)
        },
    );
    h.platform.set_app(shrunk.clone(), started(1));
    h.platform.set_app(steady.clone(), started(5));

    for app_id in [&stopped, &shrunk, &unknown, &steady] {
        h.controller
            .add_app_instance_metrics(
                &memory_snapshot(app_id, &[(0, 100.0), (1, 100.0)]),
                &DataSource::Poller,
            )
            .await;
    }

    // Nothing is stale yet, so the platform is never asked.
    let report = h.controller.purge_stale_apps().await;
    assert!(report.is_empty());
    assert_eq!(h.platform.requests(), 0);

    let later = now_millis() + 10 * 60 * 1000;
    let report = h.controller.purge_stale_apps_at(later).await;

    assert_eq!(report.apps_removed, vec![stopped.clone()]);
    assert_eq!(report.instances_removed, vec![(shrunk.clone(), InstanceIndex::new(1))]);
    // One platform lookup per application per pass.
    assert_eq!(h.platform.requests(), 4);

    assert!(!h.controller.is_active_app(&stopped));
    assert_eq!(h.controller.app_metrics(&shrunk).unwrap().instance_count(), 1);
    assert_eq!(h.controller.app_metrics(&unknown).unwrap().instance_count(), 2);
    assert_eq!(h.controller.app_metrics(&steady).unwrap().instance_count(), 2);

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_stale_started_app_without_instances_is_dropped() {
    let h = harness(EngineConfig::default().with_workers(1, 1), RecordingScaler::new());
    let app_id = app("idle");
    let pending = app("pending");
    h.platform.set_app(app_id.clone(), started(2));
    h.platform.set_app(
        pending.clone(),
        AppInfo {
            state: AppState::Other("PENDING".to_string()),
            ..started(0)
        },
    );

    for app_id in [&app_id, &pending] {
        h.controller
            .add_app_instance_metrics(
                &AppInstanceMetrics::new(app_id.clone(), now_millis(), 1000.0),
                &DataSource::Poller,
            )
            .await;
    }

    let report = h
        .controller
        .purge_stale_apps_at(now_millis() + 10 * 60 * 1000)
        .await;
    assert_eq!(report.apps_removed, vec![app_id.clone()]);
    assert!(h.controller.is_active_app(&pending));

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_cache_invalidation_reaches_every_cache() {
    let h = harness(EngineConfig::default().with_workers(1, 1), RecordingScaler::new());
    h.controller.invalidate_local_caches().await;
    h.controller.invalidate_local_caches().await;
    assert_eq!(h.cache.invalidations(), 2);
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_periodic_cache_invalidation() {
    let engine = ConfigLoader::load_string(
        "engine:\n  cache_invalidation_interval_secs: 1\n  evaluation_workers: 1\n  dispatch_workers: 1\n",
    )
    .unwrap()
    .engine;
    let h = harness(engine, RecordingScaler::new());

    let cache = h.cache.clone();
    assert!(wait_until(Duration::from_secs(3), || cache.invalidations() >= 1).await);

    h.controller.shutdown().await;
    let after_shutdown = h.cache.invalidations();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(h.cache.invalidations(), after_shutdown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_lets_running_dispatch_finish() {
    let h = harness(
        EngineConfig::default().with_workers(1, 1),
        RecordingScaler::with_delay(Duration::from_millis(200)),
    );
    let app_id = app("shop");
    h.controller
        .add_trigger_directly(upper_memory_trigger(&app_id, 0))
        .unwrap();

    for _ in 0..2 {
        h.controller
            .process_app_instance_metrics(memory_snapshot(&app_id, &[(0, 950.0)]), &DataSource::Poller)
            .await
            .unwrap();
    }
    let monitor = h.controller.get_state_monitor(&app_id).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            monitor.sample_count(InstanceIndex::new(0), MetricFamily::Memory) == 2
        })
        .await
    );
    // Let the second pass fire and the dispatch job start before stopping.
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.controller.shutdown().await;
    h.controller.shutdown().await;

    assert_eq!(h.scaler.processed_count(), 1);
    assert!(matches!(
        h.controller
            .process_app_instance_metrics(memory_snapshot(&app_id, &[(0, 950.0)]), &DataSource::Poller)
            .await,
        Err(TripwireError::ShutDown)
    ));
}
