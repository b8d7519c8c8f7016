// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Central monitor controller.
//!
//! Owns one `StateMonitor` per application with triggers, the latest merged
//! metrics of every reporting application and the service binding cache. It
//! runs the ingestion pipeline:
//!
//! ```text
//! process_app_instance_metrics ─► bounded queue ─► dispatcher ─► evaluation pool
//!                                                                    │ fired events
//!                                                                    ▼
//!                                            ScalingEvents::accept ─► dispatch pool
//! ```
//!
//! plus two periodic purge tasks (see [`crate::purge`]). One controller is
//! meant to exist per process; `shutdown` stops every component in pipeline
//! order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::app_cache::{ApplicationMetrics, BoundApp};
use crate::collaborators::{DataStore, LocalCache, Platform, ScalingEvents};
use crate::config::{Config, EngineConfig, MetricSourceConfig};
use crate::error::{TripwireError, TripwireResult};
use crate::metric::{AppInstanceMetrics, DataSource, MetricFamily, MetricName};
use crate::monitor::StateMonitor;
use crate::pool::WorkerPool;
use crate::registry::MonitorRegistry;
use crate::trigger::{Trigger, TriggerEvent};
use crate::types::{now_millis, AppId};

/// Log target for fired trigger events.
pub const TRIGGER_EVENT_TARGET: &str = "tripwire::trigger_event";

/// External services the controller depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DataStore>,
    pub platform: Arc<dyn Platform>,
    pub scaling: Arc<dyn ScalingEvents>,
    /// Read-through caches flushed by the cache invalidation task.
    pub caches: Vec<Arc<dyn LocalCache>>,
}

/// Counts reported by [`MonitorController::bound_app_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundAppStats {
    pub app_count: usize,
    pub instance_count: usize,
}

/// The trigger evaluation engine.
pub struct MonitorController {
    pub(crate) config: EngineConfig,
    metric_sources: MetricSourceConfig,
    monitors: MonitorRegistry,
    pub(crate) app_metrics: DashMap<AppId, ApplicationMetrics>,
    bound_apps: DashMap<AppId, BoundApp>,
    service_apps: DashMap<String, BTreeSet<AppId>>,
    test_metrics: DashMap<AppId, HashMap<MetricName, f64>>,
    store: Arc<dyn DataStore>,
    pub(crate) platform: Arc<dyn Platform>,
    scaling: Arc<dyn ScalingEvents>,
    pub(crate) caches: Vec<Arc<dyn LocalCache>>,
    ingest_tx: mpsc::Sender<AppInstanceMetrics>,
    evaluation_pool: WorkerPool,
    dispatch_pool: WorkerPool,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    purge_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MonitorController {
    /// Build the controller and start its background tasks.
    ///
    /// Must be called from within a tokio runtime. Triggers listed in the
    /// configuration are registered in memory without being persisted again.
    pub fn new(config: Config, collaborators: Collaborators) -> TripwireResult<Arc<Self>> {
        let Config {
            engine,
            metric_sources,
            triggers,
        } = config;

        let (ingest_tx, ingest_rx) = mpsc::channel(engine.ingestion_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let controller = Arc::new(Self {
            monitors: MonitorRegistry::new(engine.max_sample_retention),
            evaluation_pool: WorkerPool::bounded("evaluation", engine.evaluation_workers()),
            dispatch_pool: WorkerPool::new("dispatch", engine.dispatch_workers()),
            config: engine,
            metric_sources,
            app_metrics: DashMap::new(),
            bound_apps: DashMap::new(),
            service_apps: DashMap::new(),
            test_metrics: DashMap::new(),
            store: collaborators.store,
            platform: collaborators.platform,
            scaling: collaborators.scaling,
            caches: collaborators.caches,
            ingest_tx,
            stopped: AtomicBool::new(false),
            shutdown_tx,
            dispatcher: Mutex::new(None),
            purge_tasks: Mutex::new(Vec::new()),
        });

        for trigger in triggers {
            controller.add_trigger_directly(trigger)?;
        }

        let dispatcher = tokio::spawn(Self::run_dispatcher(
            Arc::downgrade(&controller),
            ingest_rx,
            controller.config.dispatcher_poll_timeout,
            shutdown_rx.clone(),
        ));
        *lock(&controller.dispatcher) = Some(dispatcher);

        let purge_tasks = vec![
            crate::purge::spawn_stale_app_purge(
                Arc::downgrade(&controller),
                controller.config.stale_purge_interval,
                shutdown_rx.clone(),
            ),
            crate::purge::spawn_cache_invalidation(
                Arc::downgrade(&controller),
                controller.config.cache_invalidation_interval,
                shutdown_rx,
            ),
        ];
        *lock(&controller.purge_tasks) = purge_tasks;

        tracing::info!(
            evaluation_workers = controller.evaluation_pool.size(),
            dispatch_workers = controller.dispatch_pool.size(),
            queue_capacity = controller.config.ingestion_queue_capacity,
            "Monitor controller started"
        );

        Ok(controller)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Persist a trigger and register it on the application's monitor.
    ///
    /// The in-memory registration happens even if persistence fails; the store
    /// error is still returned to the caller.
    pub async fn add_trigger(&self, trigger: Trigger) -> TripwireResult<()> {
        trigger.validate()?;
        tracing::info!(
            app_id = %trigger.app_id,
            trigger_id = %trigger.trigger_id,
            metric = %trigger.metric,
            "Adding trigger"
        );

        let persisted = self.store.add_trigger(&trigger).await;
        if let Err(e) = &persisted {
            tracing::warn!(app_id = %trigger.app_id, error = %e, "Failed to persist trigger");
        }

        self.register_trigger(trigger);
        persisted.map_err(TripwireError::from)
    }

    /// Register a trigger in memory only, e.g. when reloading from the store.
    pub fn add_trigger_directly(&self, trigger: Trigger) -> TripwireResult<()> {
        trigger.validate()?;
        tracing::info!(app_id = %trigger.app_id, trigger_id = %trigger.trigger_id, "Adding trigger directly");
        self.register_trigger(trigger);
        Ok(())
    }

    fn register_trigger(&self, trigger: Trigger) {
        let monitor = self.monitors.get_or_create(&trigger.app_id);
        monitor.add_trigger(trigger);
    }

    /// Remove every trigger of an application along with its monitor.
    pub async fn remove_trigger(&self, app_id: &AppId) -> TripwireResult<()> {
        tracing::info!(app_id = %app_id, "Removing triggers");

        if let Err(e) = self.store.remove_trigger(app_id).await {
            tracing::error!(app_id = %app_id, error = %e, "Failed to remove persisted triggers");
        }

        match self.monitors.remove(app_id) {
            Some(_) => Ok(()),
            None => Err(TripwireError::TriggerNotFound {
                app_id: app_id.clone(),
            }),
        }
    }

    /// Triggers of an application; empty if it has no monitor.
    pub fn get_triggers(&self, app_id: &AppId) -> Vec<Trigger> {
        self.monitors
            .get(app_id)
            .map(|monitor| monitor.triggers())
            .unwrap_or_default()
    }

    pub fn get_state_monitor(&self, app_id: &AppId) -> Option<Arc<StateMonitor>> {
        self.monitors.get(app_id)
    }

    /// Applications with at least one registered monitor.
    pub fn monitored_apps(&self) -> Vec<AppId> {
        let mut apps = self.monitors.app_ids();
        apps.sort();
        apps
    }

    /// Metric families wanted from `source` for an application.
    ///
    /// Starts from the configured families for the app type and source, then
    /// adds CPU when a trigger needs it and memory on the poller when the
    /// monitor asks for it. `None` means nothing is wanted from that source.
    pub fn enabled_metrics(
        &self,
        app_type: &str,
        source: &DataSource,
        app_id: &AppId,
    ) -> Option<HashSet<MetricFamily>> {
        let mut enabled = self
            .metric_sources
            .enabled_metrics(app_type, source)
            .cloned()
            .unwrap_or_default();

        if let Some(monitor) = self.monitors.get(app_id) {
            if monitor.is_cpu_required() {
                enabled.insert(MetricFamily::Cpu);
            }
            if source.is_poller() && monitor.is_poller_mem_required() {
                enabled.insert(MetricFamily::Memory);
            }
        }

        if enabled.is_empty() {
            None
        } else {
            Some(enabled)
        }
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Main ingestion entry point.
    ///
    /// Applies test overrides, merges the snapshot into the metrics cache,
    /// keeps only the metrics some trigger is interested in and queues that
    /// copy for evaluation. Waits for a free slot when the queue is full.
    pub async fn process_app_instance_metrics(
        &self,
        mut snapshot: AppInstanceMetrics,
        source: &DataSource,
    ) -> TripwireResult<()> {
        if self.is_shut_down() {
            return Err(TripwireError::ShutDown);
        }

        self.apply_test_metrics(&mut snapshot);
        self.add_app_instance_metrics(&snapshot, source).await;

        if snapshot.instance_metrics.is_empty() {
            return Ok(());
        }

        let Some(filtered) = self.filter_for_evaluation(&snapshot, source) else {
            tracing::trace!(app_id = %snapshot.app_id, source = %source, "No metric of interest");
            return Ok(());
        };

        self.ingest_tx
            .send(filtered)
            .await
            .map_err(|_| TripwireError::ShutDown)
    }

    /// Merge a snapshot into the metrics cache and persist poller data.
    pub async fn add_app_instance_metrics(&self, snapshot: &AppInstanceMetrics, source: &DataSource) {
        let app_id = snapshot.app_id.clone();
        let now = now_millis();

        {
            let mut cached = self.app_metrics.entry(app_id.clone()).or_insert_with(|| {
                tracing::debug!(app_id = %app_id, "Application not cached yet, adding it");
                ApplicationMetrics::from_snapshot(snapshot)
            });
            cached.merge(snapshot, source, now);
        }

        if source.is_poller()
            && !snapshot.instance_metrics.is_empty()
            && self.config.persist_poller_metrics
        {
            self.store_app_instance_metrics(&app_id).await;
        }
    }

    /// Persist the merged metrics view of an application. Failures are logged.
    pub async fn store_app_instance_metrics(&self, app_id: &AppId) {
        let Some(merged) = self
            .app_metrics
            .get(app_id)
            .map(|cached| cached.merge_to_snapshot())
        else {
            return;
        };

        if let Err(e) = self.store.add_app_stats(&merged).await {
            tracing::error!(app_id = %app_id, error = %e, "Failed to store application metrics");
        }
    }

    fn filter_for_evaluation(
        &self,
        snapshot: &AppInstanceMetrics,
        source: &DataSource,
    ) -> Option<AppInstanceMetrics> {
        let app_id = &snapshot.app_id;
        let app_type = match self.app_type(app_id) {
            bound if !bound.is_empty() => bound,
            _ => snapshot.app_type.clone(),
        };

        let enabled = self.enabled_metrics(&app_type, source, app_id)?;
        let wanted: HashSet<MetricName> = self
            .get_triggers(app_id)
            .iter()
            .filter(|trigger| enabled.contains(&trigger.metric))
            .flat_map(|trigger| trigger.metric.compound_names().iter().cloned())
            .collect();

        if wanted.is_empty() {
            return None;
        }
        snapshot.retain_only(&wanted)
    }

    // =========================================================================
    // Test overrides
    // =========================================================================

    /// Force metric values for an application, keyed by compound name.
    pub fn add_test_metrics(&self, app_id: AppId, metrics: HashMap<MetricName, f64>) {
        tracing::info!(app_id = %app_id, count = metrics.len(), "Installing test metrics");
        self.test_metrics.insert(app_id, metrics);
    }

    pub fn remove_test_metrics(&self, app_id: &AppId) {
        self.test_metrics.remove(app_id);
    }

    fn apply_test_metrics(&self, snapshot: &mut AppInstanceMetrics) {
        let Some(overrides) = self.test_metrics.get(&snapshot.app_id) else {
            return;
        };

        for instance in &mut snapshot.instance_metrics {
            for metric in &mut instance.metrics {
                if let Some(value) = overrides.get(&metric.name) {
                    metric.value = *value;
                }
            }
        }
    }

    // =========================================================================
    // Metrics cache
    // =========================================================================

    pub fn app_metrics(&self, app_id: &AppId) -> Option<ApplicationMetrics> {
        self.app_metrics.get(app_id).map(|entry| entry.value().clone())
    }

    /// Whether the application reported metrics recently enough to be cached.
    pub fn is_active_app(&self, app_id: &AppId) -> bool {
        self.app_metrics.contains_key(app_id)
    }

    pub fn purge_app_from_map(&self, app_id: &AppId) {
        self.app_metrics.remove(app_id);
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    /// Bind an application, resolving its name and type on the platform.
    ///
    /// A platform failure is logged and the binding proceeds with empty name
    /// and type.
    pub async fn bind_service(&self, service_id: &str, app_id: &AppId) -> TripwireResult<()> {
        let (app_name, app_type) = match self.platform.app_info(app_id).await {
            Ok(info) => (info.name, info.app_type),
            Err(e) => {
                tracing::error!(app_id = %app_id, error = %e, "Failed to get the app type");
                (String::new(), String::new())
            }
        };

        let binding = self.add_or_update_bound_app(service_id, app_id, &app_type, &app_name);
        self.store.add_binding(&binding).await?;
        Ok(())
    }

    /// Remove a binding and evict the application from the metrics cache.
    pub async fn unbind_service(&self, service_id: &str, app_id: &AppId) -> TripwireResult<()> {
        self.store.remove_binding(service_id, app_id).await?;
        if self.config.remove_history_on_unbind {
            self.store.remove_app_stats_with_history(app_id).await?;
        }

        self.remove_from_service(service_id, app_id);
        self.bound_apps.remove(app_id);
        self.app_metrics.remove(app_id);
        Ok(())
    }

    /// Record a binding in the cache only.
    pub fn add_or_update_bound_app(
        &self,
        service_id: &str,
        app_id: &AppId,
        app_type: &str,
        app_name: &str,
    ) -> BoundApp {
        let binding = BoundApp::new(app_id.clone(), service_id, app_type, app_name);

        if let Some(previous) = self.bound_apps.insert(app_id.clone(), binding.clone()) {
            if previous.service_id != service_id {
                self.remove_from_service(&previous.service_id, app_id);
            }
        }
        self.service_apps
            .entry(service_id.to_string())
            .or_default()
            .insert(app_id.clone());

        binding
    }

    fn remove_from_service(&self, service_id: &str, app_id: &AppId) {
        if let Some(mut apps) = self.service_apps.get_mut(service_id) {
            apps.remove(app_id);
        }
        self.service_apps.remove_if(service_id, |_, apps| apps.is_empty());
    }

    /// Bindings of every application bound to the service.
    pub fn service_bound_apps(&self, service_id: &str) -> Vec<BoundApp> {
        let app_ids: Vec<AppId> = self
            .service_apps
            .get(service_id)
            .map(|apps| apps.iter().cloned().collect())
            .unwrap_or_default();

        app_ids
            .iter()
            .filter_map(|app_id| self.bound_app(app_id))
            .filter(|binding| binding.service_id == service_id)
            .collect()
    }

    pub fn bound_app(&self, app_id: &AppId) -> Option<BoundApp> {
        self.bound_apps.get(app_id).map(|entry| entry.value().clone())
    }

    /// Binding of the application if it is bound to that service.
    pub fn bound_app_for_service(&self, service_id: &str, app_id: &AppId) -> Option<BoundApp> {
        self.bound_app(app_id)
            .filter(|binding| binding.service_id == service_id)
    }

    /// Application name from the binding cache, empty if unknown.
    pub fn app_name_by_id(&self, app_id: &AppId) -> String {
        self.bound_apps
            .get(app_id)
            .map(|binding| binding.app_name.clone())
            .unwrap_or_default()
    }

    /// Application type from the binding cache, empty if unknown.
    pub fn app_type(&self, app_id: &AppId) -> String {
        self.bound_apps
            .get(app_id)
            .map(|binding| binding.app_type.clone())
            .unwrap_or_default()
    }

    /// Rename or retype a bound application and persist the change.
    /// Unbound applications are ignored.
    pub async fn update_app_name_and_type(
        &self,
        app_id: &AppId,
        app_name: &str,
        app_type: &str,
    ) -> TripwireResult<()> {
        let updated = self.bound_apps.get_mut(app_id).map(|mut binding| {
            binding.app_name = app_name.to_string();
            binding.app_type = app_type.to_string();
            binding.clone()
        });

        let Some(binding) = updated else {
            return Ok(());
        };

        if let Some(mut cached) = self.app_metrics.get_mut(app_id) {
            cached.app_name = binding.app_name.clone();
            cached.app_type = binding.app_type.clone();
        }

        self.store.update_binding(&binding).await?;
        Ok(())
    }

    /// Pick up renames made on the platform for every application bound to
    /// the service. Changed bindings are updated in the caches and written
    /// back to the store; the IDs of the renamed applications are returned.
    ///
    /// Stops at the first platform or store failure.
    pub async fn refresh_bound_app_names(&self, service_id: &str) -> TripwireResult<Vec<AppId>> {
        let mut renamed = Vec::new();

        for binding in self.service_bound_apps(service_id) {
            let info = self.platform.app_info(&binding.app_id).await?;
            if info.name.is_empty() || info.name == binding.app_name {
                continue;
            }

            tracing::info!(
                app_id = %binding.app_id,
                old_name = %binding.app_name,
                new_name = %info.name,
                "Bound application renamed"
            );

            let updated = self.bound_apps.get_mut(&binding.app_id).map(|mut cached| {
                cached.app_name = info.name.clone();
                cached.clone()
            });
            let Some(updated) = updated else {
                continue;
            };
            if let Some(mut cached) = self.app_metrics.get_mut(&binding.app_id) {
                cached.app_name = info.name.clone();
            }

            self.store.add_binding(&updated).await?;
            renamed.push(binding.app_id);
        }

        Ok(renamed)
    }

    /// Number of bound applications and of their cached instances.
    pub fn bound_app_stats(&self) -> BoundAppStats {
        let app_ids: Vec<AppId> = self.bound_apps.iter().map(|r| r.key().clone()).collect();
        let instance_count = app_ids
            .iter()
            .filter_map(|app_id| self.app_metrics.get(app_id).map(|m| m.instance_count()))
            .sum();

        BoundAppStats {
            app_count: app_ids.len(),
            instance_count,
        }
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    async fn run_dispatcher(
        controller: Weak<Self>,
        mut ingest_rx: mpsc::Receiver<AppInstanceMetrics>,
        poll_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!("Ingestion dispatcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = tokio::time::timeout(poll_timeout, ingest_rx.recv()) => received,
            };

            let snapshot = match received {
                // Idle poll, re-check the stop flag.
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(snapshot)) => snapshot,
            };

            let Some(controller) = controller.upgrade() else {
                break;
            };
            tracing::trace!(app_id = %snapshot.app_id, "Taken snapshot from ingestion queue");
            // Waiting for a free evaluation worker leaves the ingestion queue
            // to fill up and block producers.
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = controller.submit_evaluation(snapshot) => {}
            }
        }

        tracing::debug!("Ingestion dispatcher stopped");
    }

    async fn submit_evaluation(self: &Arc<Self>, snapshot: AppInstanceMetrics) {
        let app_id = snapshot.app_id.clone();
        let controller = Arc::clone(self);

        if let Err(e) = self
            .evaluation_pool
            .submit(async move { controller.evaluate(snapshot).await })
            .await
        {
            tracing::debug!(app_id = %app_id, error = %e, "Evaluation pool stopped, dropping snapshot");
        }
    }

    /// Feed one snapshot to its monitor and hand fired events to dispatch.
    async fn evaluate(&self, snapshot: AppInstanceMetrics) {
        let Some(monitor) = self.monitors.get(&snapshot.app_id) else {
            tracing::debug!(app_id = %snapshot.app_id, "No state monitor, skipping evaluation");
            return;
        };

        monitor.add_monitor_sample(&snapshot);
        for event in monitor.evaluate_triggers() {
            self.dispatch(event).await;
        }
    }

    async fn dispatch(&self, event: TriggerEvent) {
        if !self.scaling.accept(&event).await {
            tracing::debug!(
                target: TRIGGER_EVENT_TARGET,
                event = %event,
                "Ignoring event, an equivalent event is already queued"
            );
            return;
        }

        tracing::info!(target: TRIGGER_EVENT_TARGET, event = %event, "Submitting event to scaling processor");

        let app_id = event.app_id.clone();
        let pending = PendingDispatch {
            scaling: Arc::clone(&self.scaling),
            event: Some(event),
        };
        if let Err(e) = self.dispatch_pool.submit(pending.run()).await {
            tracing::warn!(app_id = %app_id, error = %e, "Dispatch pool stopped, dropping event");
        }
    }

    /// Stop the pipeline: dispatcher, evaluation pool, dispatch pool, then the
    /// purge tasks. Running jobs finish; queued ones are discarded. Calling it
    /// again is a no-op.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down monitor controller");

        self.shutdown_tx.send_replace(true);

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Ingestion dispatcher failed");
            }
        }

        self.evaluation_pool.shutdown().await;
        self.dispatch_pool.shutdown().await;

        let purge_tasks = std::mem::take(&mut *lock(&self.purge_tasks));
        for handle in purge_tasks {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Purge task failed");
            }
        }

        tracing::info!("Monitor controller stopped");
    }
}

impl std::fmt::Debug for MonitorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorController")
            .field("monitors", &self.monitors.len())
            .field("cached_apps", &self.app_metrics.len())
            .field("bound_apps", &self.bound_apps.len())
            .field("stopped", &self.is_shut_down())
            .finish()
    }
}

/// Accepted event waiting for a dispatch worker. Dropping it unprocessed
/// hands the slot back to the scaling collaborator.
struct PendingDispatch {
    scaling: Arc<dyn ScalingEvents>,
    event: Option<TriggerEvent>,
}

impl PendingDispatch {
    async fn run(mut self) {
        let Some(event) = self.event.take() else {
            return;
        };
        let app_id = event.app_id.clone();
        if let Err(e) = self.scaling.process(event).await {
            tracing::error!(app_id = %app_id, error = %e, "Scaling task failed");
        }
    }
}

impl Drop for PendingDispatch {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            tracing::debug!(target: TRIGGER_EVENT_TARGET, event = %event, "Releasing event that was never processed");
            self.scaling.release(&event);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
