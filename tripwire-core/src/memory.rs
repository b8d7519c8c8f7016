// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-memory collaborators.
//!
//! Used by the test suites and by the CLI when it runs without external
//! services. Each type records what the controller asked of it so callers can
//! assert on the interaction afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::app_cache::BoundApp;
use crate::collaborators::{AppInfo, DataStore, LocalCache, Platform, ScalingEvents};
use crate::error::{DispatchError, PlatformError, StoreError};
use crate::metric::AppInstanceMetrics;
use crate::trigger::{Trigger, TriggerEvent, TriggerKey};
use crate::types::AppId;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Store
// =============================================================================

/// `DataStore` backed by concurrent maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    triggers: DashMap<AppId, Vec<Trigger>>,
    app_stats: DashMap<AppId, AppInstanceMetrics>,
    bindings: DashMap<AppId, BoundApp>,
    stats_writes: AtomicU64,
    history_removals: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn triggers_for(&self, app_id: &AppId) -> Vec<Trigger> {
        self.triggers
            .get(app_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Last persisted metrics view of the application.
    pub fn app_stats(&self, app_id: &AppId) -> Option<AppInstanceMetrics> {
        self.app_stats.get(app_id).map(|entry| entry.value().clone())
    }

    pub fn binding(&self, app_id: &AppId) -> Option<BoundApp> {
        self.bindings.get(app_id).map(|entry| entry.value().clone())
    }

    pub fn stats_writes(&self) -> u64 {
        self.stats_writes.load(Ordering::SeqCst)
    }

    pub fn history_removals(&self) -> u64 {
        self.history_removals.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "memory store switched off".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn add_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
        self.check_available()?;
        self.triggers
            .entry(trigger.app_id.clone())
            .or_default()
            .push(trigger.clone());
        Ok(())
    }

    async fn remove_trigger(&self, app_id: &AppId) -> Result<(), StoreError> {
        self.check_available()?;
        self.triggers.remove(app_id);
        Ok(())
    }

    async fn add_app_stats(&self, snapshot: &AppInstanceMetrics) -> Result<(), StoreError> {
        self.check_available()?;
        self.app_stats.insert(snapshot.app_id.clone(), snapshot.clone());
        self.stats_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_app_stats_with_history(&self, app_id: &AppId) -> Result<(), StoreError> {
        self.check_available()?;
        self.app_stats.remove(app_id);
        self.history_removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_binding(&self, binding: &BoundApp) -> Result<(), StoreError> {
        self.check_available()?;
        self.bindings.insert(binding.app_id.clone(), binding.clone());
        Ok(())
    }

    async fn update_binding(&self, binding: &BoundApp) -> Result<(), StoreError> {
        self.check_available()?;
        match self.bindings.get_mut(&binding.app_id) {
            Some(mut existing) => {
                *existing = binding.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "binding",
                key: binding.app_id.to_string(),
            }),
        }
    }

    async fn remove_binding(&self, service_id: &str, app_id: &AppId) -> Result<(), StoreError> {
        self.check_available()?;
        self.bindings
            .remove_if(app_id, |_, binding| binding.service_id == service_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                entity: "binding",
                key: format!("{}/{}", service_id, app_id),
            })
    }
}

// =============================================================================
// Platform
// =============================================================================

/// `Platform` answering from a fixed table.
#[derive(Debug, Default)]
pub struct StaticPlatform {
    apps: DashMap<AppId, AppInfo>,
    requests: AtomicU64,
}

impl StaticPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_app(&self, app_id: AppId, info: AppInfo) {
        self.apps.insert(app_id, info);
    }

    pub fn remove_app(&self, app_id: &AppId) {
        self.apps.remove(app_id);
    }

    /// Number of `app_info` calls served so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for StaticPlatform {
    async fn app_info(&self, app_id: &AppId) -> Result<AppInfo, PlatformError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.apps
            .get(app_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PlatformError::AppNotFound {
                app_id: app_id.clone(),
            })
    }
}

// =============================================================================
// Scaling events
// =============================================================================

/// `ScalingEvents` that records processed events.
///
/// Keeps at most one event per (application, trigger key) in flight; an
/// equivalent event is refused until the first one has been processed.
#[derive(Debug, Default)]
pub struct RecordingScaler {
    in_flight: DashSet<(AppId, TriggerKey)>,
    processed: Mutex<Vec<TriggerEvent>>,
    refused: AtomicU64,
    delay: Option<Duration>,
}

impl RecordingScaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every `process` call for `delay` before recording it.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn processed(&self) -> Vec<TriggerEvent> {
        lock(&self.processed).clone()
    }

    pub fn processed_count(&self) -> usize {
        lock(&self.processed).len()
    }

    /// Events refused by `accept` as duplicates of an in-flight one.
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` events were processed or `timeout` passes.
    pub async fn wait_for_processed(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.processed_count() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl ScalingEvents for RecordingScaler {
    async fn accept(&self, event: &TriggerEvent) -> bool {
        let accepted = self
            .in_flight
            .insert((event.app_id.clone(), event.trigger.key()));
        if !accepted {
            self.refused.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(event = %event, "Equivalent event already in flight");
        }
        accepted
    }

    async fn process(&self, event: TriggerEvent) -> Result<(), DispatchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let key = (event.app_id.clone(), event.trigger.key());
        lock(&self.processed).push(event);
        self.in_flight.remove(&key);
        Ok(())
    }

    fn release(&self, event: &TriggerEvent) {
        self.in_flight
            .remove(&(event.app_id.clone(), event.trigger.key()));
    }
}

// =============================================================================
// Local cache
// =============================================================================

/// `LocalCache` that only counts invalidations.
#[derive(Debug, Default)]
pub struct CountingCache {
    invalidations: AtomicU64,
}

impl CountingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalCache for CountingCache {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn invalidate_all(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
