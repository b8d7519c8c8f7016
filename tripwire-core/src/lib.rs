//! Tripwire Core Library
//!
//! Trigger evaluation engine for an application autoscaler. Keeps sliding
//! windows of per-instance metric samples for every monitored application,
//! aggregates them into MAX/AVG statistics, runs per-trigger breach timers
//! and hands fired events to a scaling collaborator. Also provides the
//! ingestion pipeline, the metrics cache purge tasks and configuration
//! parsing.

pub mod app_cache;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod memory;
pub mod metric;
pub mod monitor;
pub mod pool;
pub mod purge;
pub mod registry;
pub mod sample;
pub mod state;
pub mod trigger;
pub mod types;

// Re-export commonly used types
pub use app_cache::{ApplicationMetrics, BoundApp};
pub use collaborators::{AppInfo, AppState, DataStore, LocalCache, Platform, ScalingEvents};
pub use config::{Config, ConfigLoader, EngineConfig, MetricSourceConfig};
pub use controller::{BoundAppStats, Collaborators, MonitorController, TRIGGER_EVENT_TARGET};
pub use error::{
    DispatchError, HardValidationError, PlatformError, StoreError, TripwireError, TripwireResult,
};
pub use metric::{AppInstanceMetrics, DataSource, InstanceMetrics, Metric, MetricFamily, MetricName};
pub use monitor::StateMonitor;
pub use purge::PurgeReport;
pub use sample::{Sample, Statistic};
pub use state::BreachState;
pub use trigger::{StatType, ThresholdType, ThresholdUnit, Trigger, TriggerEvent, TriggerKey};
pub use types::{AppId, InstanceIndex, TimestampMillis};
