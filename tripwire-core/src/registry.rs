//! Thread-safe state monitor registry using DashMap.
//!
//! Maps application IDs to their shared `StateMonitor`. Creation goes through
//! the entry API, so concurrent first registrations for one application end
//! up with exactly one monitor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::monitor::StateMonitor;
use crate::types::AppId;

/// Registry of per-application state monitors.
#[derive(Debug)]
pub struct MonitorRegistry {
    monitors: DashMap<AppId, Arc<StateMonitor>>,
    max_retention: Duration,
}

impl MonitorRegistry {
    /// Create an empty registry whose monitors keep samples for `max_retention`.
    pub fn new(max_retention: Duration) -> Self {
        Self {
            monitors: DashMap::new(),
            max_retention,
        }
    }

    /// Get the monitor of an application, creating it if absent.
    pub fn get_or_create(&self, app_id: &AppId) -> Arc<StateMonitor> {
        if let Some(existing) = self.monitors.get(app_id) {
            return Arc::clone(existing.value());
        }

        let entry = self.monitors.entry(app_id.clone()).or_insert_with(|| {
            tracing::debug!(app_id = %app_id, "Creating state monitor");
            Arc::new(StateMonitor::new(app_id.clone(), self.max_retention))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, app_id: &AppId) -> Option<Arc<StateMonitor>> {
        self.monitors.get(app_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the monitor of an application.
    pub fn remove(&self, app_id: &AppId) -> Option<Arc<StateMonitor>> {
        self.monitors.remove(app_id).map(|(_, monitor)| monitor)
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// IDs of all monitored applications.
    pub fn app_ids(&self) -> Vec<AppId> {
        self.monitors.iter().map(|r| r.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricFamily;
    use crate::trigger::{ThresholdType, Trigger};

    fn app(name: &str) -> AppId {
        AppId::new(name).unwrap()
    }

    #[test]
    fn test_get_or_create_returns_same_monitor() {
        let registry = MonitorRegistry::new(Duration::from_secs(600));
        let first = registry.get_or_create(&app("app-1"));
        let second = registry.get_or_create(&app("app-1"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&app("app-2")).is_none());
    }

    #[test]
    fn test_remove_drops_monitor_with_triggers() {
        let registry = MonitorRegistry::new(Duration::from_secs(600));
        let monitor = registry.get_or_create(&app("app-1"));
        monitor.add_trigger(Trigger::new(
            app("app-1"),
            "upper",
            MetricFamily::Cpu,
            ThresholdType::GreaterThan,
            80.0,
        ));

        let removed = registry.remove(&app("app-1")).unwrap();
        assert_eq!(removed.num_triggers(), 1);
        assert!(registry.is_empty());
        assert!(registry.get(&app("app-1")).is_none());
        assert!(registry.remove(&app("app-1")).is_none());
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let registry = Arc::new(MonitorRegistry::new(Duration::from_secs(600)));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let reg = Arc::clone(&registry);
                thread::spawn(move || {
                    // Every thread races on a shared app and owns one private app.
                    let shared = reg.get_or_create(&app("shared"));
                    reg.get_or_create(&app(&format!("app-{}", i)));
                    shared
                })
            })
            .collect();

        let monitors: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 11);
        assert!(monitors.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
