// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Periodic housekeeping for the metrics cache and external read caches.
//!
//! The stale-application purge never removes cached data on a timeout alone:
//! an application is dropped only once the platform reports it stopped or
//! without instances, and an instance only once the platform's running count
//! no longer covers its index. Neither task touches `StateMonitor` state.

use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::collaborators::{AppInfo, AppState};
use crate::controller::MonitorController;
use crate::types::{now_millis, AppId, InstanceIndex, TimestampMillis};

/// What one stale-application purge pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub apps_removed: Vec<AppId>,
    pub instances_removed: Vec<(AppId, InstanceIndex)>,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.apps_removed.is_empty() && self.instances_removed.is_empty()
    }
}

/// View of one cache entry taken without holding the map guard.
struct CachedView {
    timestamp: TimestampMillis,
    instances: Vec<(InstanceIndex, TimestampMillis)>,
}

impl MonitorController {
    /// Run one stale-application purge pass against the wall clock.
    pub async fn purge_stale_apps(&self) -> PurgeReport {
        self.purge_stale_apps_at(now_millis()).await
    }

    /// Run one stale-application purge pass as of `now`.
    pub async fn purge_stale_apps_at(&self, now: TimestampMillis) -> PurgeReport {
        let timeout = self.config.stale_timeout().as_millis() as u64;
        let mut report = PurgeReport::default();

        let views: HashMap<AppId, CachedView> = self
            .app_metrics
            .iter()
            .map(|entry| {
                let view = CachedView {
                    timestamp: entry.timestamp,
                    instances: entry
                        .poller_metrics
                        .iter()
                        .map(|(index, cached)| (*index, cached.last_update))
                        .collect(),
                };
                (entry.key().clone(), view)
            })
            .collect();

        for (app_id, view) in views {
            // Platform answer for this app, fetched at most once per pass.
            let mut app_info: Option<AppInfo> = None;

            if now.saturating_sub(view.timestamp) > timeout {
                let info = match self.platform.app_info(&app_id).await {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::warn!(app_id = %app_id, error = %e, "Failed to check stale application");
                        continue;
                    }
                };

                let stopped = info.state == AppState::Stopped;
                // A running app that reports no instances has gone quiet. Other
                // states (staging, pending) may legitimately have none yet.
                let silent = info.state == AppState::Started && view.instances.is_empty();
                if stopped || silent {
                    // Skip the removal if fresh data arrived while we were asking.
                    let removed = self
                        .app_metrics
                        .remove_if(&app_id, |_, cached| cached.timestamp == view.timestamp)
                        .is_some();
                    if removed {
                        tracing::info!(
                            app_id = %app_id,
                            state = %info.state,
                            "Removed stale application from metrics cache"
                        );
                        report.apps_removed.push(app_id);
                    }
                    continue;
                }

                app_info = Some(info);
            }

            for (index, last_update) in view.instances {
                if now.saturating_sub(last_update) <= timeout {
                    continue;
                }

                let running = match app_info.as_ref().map(|info| info.instance_count) {
                    Some(count) => count,
                    None => match self.platform.app_info(&app_id).await {
                        Ok(info) => {
                            let count = info.instance_count;
                            app_info = Some(info);
                            count
                        }
                        Err(e) => {
                            tracing::warn!(app_id = %app_id, error = %e, "Failed to check stale instance");
                            break;
                        }
                    },
                };

                if running > index.value() {
                    continue;
                }

                let removed = self
                    .app_metrics
                    .get_mut(&app_id)
                    .and_then(|mut cached| {
                        let still_stale = cached
                            .poller_metrics
                            .get(&index)
                            .is_some_and(|instance| instance.last_update == last_update);
                        if still_stale {
                            cached.poller_metrics.remove(&index)
                        } else {
                            None
                        }
                    })
                    .is_some();

                if removed {
                    tracing::info!(
                        app_id = %app_id,
                        instance = %index,
                        running,
                        "Removed stale instance from metrics cache"
                    );
                    report.instances_removed.push((app_id.clone(), index));
                }
            }
        }

        report
    }

    /// Flush every external read cache.
    pub async fn invalidate_local_caches(&self) {
        for cache in &self.caches {
            tracing::info!(cache = cache.name(), "Invalidating local cache");
            cache.invalidate_all().await;
        }
    }
}

/// Spawn the periodic stale-application purge. The first pass runs one
/// `period` after start.
pub(crate) fn spawn_stale_app_purge(
    controller: Weak<MonitorController>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_periodic("stale-app-purge", period, shutdown, move || {
        let controller = controller.clone();
        async move {
            let Some(controller) = controller.upgrade() else {
                return false;
            };
            let report = controller.purge_stale_apps().await;
            if !report.is_empty() {
                tracing::debug!(
                    apps = report.apps_removed.len(),
                    instances = report.instances_removed.len(),
                    "Stale application purge finished"
                );
            }
            true
        }
    }))
}

/// Spawn the periodic local cache invalidation.
pub(crate) fn spawn_cache_invalidation(
    controller: Weak<MonitorController>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_periodic("cache-invalidation", period, shutdown, move || {
        let controller = controller.clone();
        async move {
            let Some(controller) = controller.upgrade() else {
                return false;
            };
            controller.invalidate_local_caches().await;
            true
        }
    }))
}

/// Run `tick` every `period` until shutdown or until it returns `false`.
async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                if !tick().await {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!(task = name, "Periodic task stopped");
}
