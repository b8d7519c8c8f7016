//! Controller-side caches: latest merged metrics and binding metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metric::{AppInstanceMetrics, DataSource, InstanceMetrics};
use crate::types::{AppId, InstanceIndex, TimestampMillis};

/// Binding of an application to a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundApp {
    pub app_id: AppId,
    pub service_id: String,
    #[serde(default)]
    pub app_type: String,
    #[serde(default)]
    pub app_name: String,
}

impl BoundApp {
    pub fn new(
        app_id: AppId,
        service_id: impl Into<String>,
        app_type: impl Into<String>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            app_id,
            service_id: service_id.into(),
            app_type: app_type.into(),
            app_name: app_name.into(),
        }
    }
}

/// Latest readings of one instance and when they arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedInstance {
    pub metrics: InstanceMetrics,
    pub last_update: TimestampMillis,
}

/// Latest merged metrics of one application.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationMetrics {
    pub app_id: AppId,
    pub app_name: String,
    pub app_type: String,
    pub service_id: String,
    pub mem_quota: f64,
    /// Arrival time of the last snapshot from any source.
    pub timestamp: TimestampMillis,
    pub poller_metrics: BTreeMap<InstanceIndex, CachedInstance>,
}

impl ApplicationMetrics {
    /// Start a cache entry from the identity fields of a snapshot.
    pub fn from_snapshot(snapshot: &AppInstanceMetrics) -> Self {
        Self {
            app_id: snapshot.app_id.clone(),
            app_name: snapshot.app_name.clone(),
            app_type: snapshot.app_type.clone(),
            service_id: snapshot.service_id.clone(),
            mem_quota: 0.0,
            timestamp: 0,
            poller_metrics: BTreeMap::new(),
        }
    }

    /// Merge a snapshot that arrived at `now`.
    ///
    /// Only poller data updates the memory quota and the per-instance entries;
    /// every arrival refreshes the application timestamp.
    pub fn merge(&mut self, snapshot: &AppInstanceMetrics, source: &DataSource, now: TimestampMillis) {
        if source.is_poller() {
            self.mem_quota = snapshot.mem_quota;
            for instance in &snapshot.instance_metrics {
                self.poller_metrics.insert(
                    instance.instance_index,
                    CachedInstance {
                        metrics: instance.clone(),
                        last_update: now,
                    },
                );
            }
        }
        self.timestamp = now;
    }

    /// Rebuild a snapshot from the cached per-instance entries.
    pub fn merge_to_snapshot(&self) -> AppInstanceMetrics {
        AppInstanceMetrics {
            app_id: self.app_id.clone(),
            app_name: self.app_name.clone(),
            app_type: self.app_type.clone(),
            service_id: self.service_id.clone(),
            timestamp: self.timestamp,
            mem_quota: self.mem_quota,
            instance_metrics: self
                .poller_metrics
                .values()
                .map(|cached| cached.metrics.clone())
                .collect(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.poller_metrics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Metric, POLLER_MEMORY};

    fn snapshot(instances: &[u32]) -> AppInstanceMetrics {
        let mut snap = AppInstanceMetrics::new(AppId::new("app-1").unwrap(), 1_000, 512.0);
        for &i in instances {
            snap = snap.with_instance(i, vec![Metric::new(POLLER_MEMORY, 100.0, 1_000)]);
        }
        snap
    }

    #[test]
    fn test_poller_merge_updates_instances() {
        let snap = snapshot(&[0, 1]);
        let mut cached = ApplicationMetrics::from_snapshot(&snap);
        cached.merge(&snap, &DataSource::Poller, 5_000);

        assert_eq!(cached.instance_count(), 2);
        assert_eq!(cached.mem_quota, 512.0);
        assert_eq!(cached.timestamp, 5_000);
        assert_eq!(
            cached.poller_metrics[&InstanceIndex::new(1)].last_update,
            5_000
        );
    }

    #[test]
    fn test_other_source_only_refreshes_timestamp() {
        let snap = snapshot(&[0]);
        let mut cached = ApplicationMetrics::from_snapshot(&snap);
        cached.merge(&snap, &DataSource::from("agent"), 7_000);

        assert_eq!(cached.instance_count(), 0);
        assert_eq!(cached.mem_quota, 0.0);
        assert_eq!(cached.timestamp, 7_000);
    }

    #[test]
    fn test_merge_to_snapshot_keeps_latest_per_instance() {
        let mut cached = ApplicationMetrics::from_snapshot(&snapshot(&[]));
        cached.merge(&snapshot(&[0, 1]), &DataSource::Poller, 1_000);
        cached.merge(&snapshot(&[1]), &DataSource::Poller, 2_000);

        let merged = cached.merge_to_snapshot();
        assert_eq!(merged.instance_metrics.len(), 2);
        assert_eq!(merged.timestamp, 2_000);
        assert_eq!(
            cached.poller_metrics[&InstanceIndex::new(0)].last_update,
            1_000
        );
    }
}
