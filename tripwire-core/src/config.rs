// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Raw structs mirror the file layout and carry serde defaults; `ConfigLoader`
//! turns them into validated types. Any invalid field results in a
//! HardValidationError that prevents startup.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HardValidationError, TripwireError, TripwireResult};
use crate::metric::{DataSource, MetricFamily};
use crate::trigger::Trigger;

/// Key of the metric-source entry that applies to every application type.
pub const WILDCARD_APP_TYPE: &str = "*";

/// Raw engine configuration.
#[derive(Debug, Deserialize)]
struct RawEngineConfig {
    #[serde(default = "default_max_sample_retention_secs")]
    max_sample_retention_secs: u64,
    #[serde(default = "default_report_interval_secs")]
    report_interval_secs: u64,
    #[serde(default = "default_stale_purge_interval_secs")]
    stale_purge_interval_secs: u64,
    #[serde(default = "default_cache_invalidation_interval_secs")]
    cache_invalidation_interval_secs: u64,
    #[serde(default = "default_ingestion_queue_capacity")]
    ingestion_queue_capacity: usize,
    #[serde(default = "default_dispatcher_poll_timeout_ms")]
    dispatcher_poll_timeout_ms: u64,
    #[serde(default)]
    evaluation_workers: usize,
    #[serde(default)]
    dispatch_workers: usize,
    #[serde(default)]
    remove_history_on_unbind: bool,
    #[serde(default = "default_persist_poller_metrics")]
    persist_poller_metrics: bool,
}

fn default_max_sample_retention_secs() -> u64 {
    600
}

fn default_report_interval_secs() -> u64 {
    60
}

fn default_stale_purge_interval_secs() -> u64 {
    60
}

fn default_cache_invalidation_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_ingestion_queue_capacity() -> usize {
    1024
}

fn default_dispatcher_poll_timeout_ms() -> u64 {
    5000
}

fn default_persist_poller_metrics() -> bool {
    true
}

impl Default for RawEngineConfig {
    fn default() -> Self {
        Self {
            max_sample_retention_secs: default_max_sample_retention_secs(),
            report_interval_secs: default_report_interval_secs(),
            stale_purge_interval_secs: default_stale_purge_interval_secs(),
            cache_invalidation_interval_secs: default_cache_invalidation_interval_secs(),
            ingestion_queue_capacity: default_ingestion_queue_capacity(),
            dispatcher_poll_timeout_ms: default_dispatcher_poll_timeout_ms(),
            evaluation_workers: 0,
            dispatch_workers: 0,
            remove_history_on_unbind: false,
            persist_poller_metrics: default_persist_poller_metrics(),
        }
    }
}

/// Raw per-source entry.
#[derive(Debug, Deserialize)]
struct RawSourceConfig {
    #[serde(default = "default_source_enabled")]
    enabled: bool,
    #[serde(default)]
    metrics: Vec<String>,
}

fn default_source_enabled() -> bool {
    true
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    engine: RawEngineConfig,
    /// app type → source name → source entry
    #[serde(default)]
    metric_sources: Option<HashMap<String, HashMap<String, RawSourceConfig>>>,
    #[serde(default)]
    triggers: Vec<Trigger>,
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_sample_retention: Duration,
    pub report_interval: Duration,
    pub stale_purge_interval: Duration,
    pub cache_invalidation_interval: Duration,
    pub ingestion_queue_capacity: usize,
    pub dispatcher_poll_timeout: Duration,
    evaluation_workers: usize,
    dispatch_workers: usize,
    pub remove_history_on_unbind: bool,
    pub persist_poller_metrics: bool,
}

impl EngineConfig {
    /// Number of evaluation workers; `0` in the file means twice the CPU count.
    pub fn evaluation_workers(&self) -> usize {
        resolve_workers(self.evaluation_workers)
    }

    /// Number of dispatch workers; `0` in the file means twice the CPU count.
    pub fn dispatch_workers(&self) -> usize {
        resolve_workers(self.dispatch_workers)
    }

    /// Override both pool sizes.
    pub fn with_workers(mut self, evaluation: usize, dispatch: usize) -> Self {
        self.evaluation_workers = evaluation;
        self.dispatch_workers = dispatch;
        self
    }

    fn from_raw(raw: RawEngineConfig) -> Self {
        Self {
            max_sample_retention: Duration::from_secs(raw.max_sample_retention_secs),
            report_interval: Duration::from_secs(raw.report_interval_secs),
            stale_purge_interval: Duration::from_secs(raw.stale_purge_interval_secs),
            cache_invalidation_interval: Duration::from_secs(raw.cache_invalidation_interval_secs),
            ingestion_queue_capacity: raw.ingestion_queue_capacity,
            dispatcher_poll_timeout: Duration::from_millis(raw.dispatcher_poll_timeout_ms),
            evaluation_workers: raw.evaluation_workers,
            dispatch_workers: raw.dispatch_workers,
            remove_history_on_unbind: raw.remove_history_on_unbind,
            persist_poller_metrics: raw.persist_poller_metrics,
        }
    }

    /// Staleness timeout used by the application purge: 1.5 × report interval.
    pub fn stale_timeout(&self) -> Duration {
        self.report_interval + self.report_interval / 2
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_raw(RawEngineConfig::default())
    }
}

fn resolve_workers(configured: usize) -> usize {
    if configured == 0 {
        (num_cpus::get() * 2).max(1)
    } else {
        configured
    }
}

/// Which metric families each data source provides, per application type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSourceConfig {
    by_app_type: HashMap<String, HashMap<String, HashSet<MetricFamily>>>,
}

impl MetricSourceConfig {
    pub fn new() -> Self {
        Self {
            by_app_type: HashMap::new(),
        }
    }

    /// Builder-style helper to enable families for an app type and source.
    pub fn with_source(
        mut self,
        app_type: &str,
        source: &DataSource,
        families: impl IntoIterator<Item = MetricFamily>,
    ) -> Self {
        let families: HashSet<MetricFamily> = families.into_iter().collect();
        if !families.is_empty() {
            self.by_app_type
                .entry(app_type.to_string())
                .or_default()
                .insert(source.as_str().to_ascii_lowercase(), families);
        }
        self
    }

    /// Families enabled for the source. The exact app type wins over the
    /// wildcard entry; `None` means the source is not configured.
    pub fn enabled_metrics(
        &self,
        app_type: &str,
        source: &DataSource,
    ) -> Option<&HashSet<MetricFamily>> {
        let source_key = source.as_str().to_ascii_lowercase();
        self.by_app_type
            .get(app_type)
            .and_then(|sources| sources.get(&source_key))
            .or_else(|| {
                self.by_app_type
                    .get(WILDCARD_APP_TYPE)
                    .and_then(|sources| sources.get(&source_key))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.by_app_type.is_empty()
    }
}

impl Default for MetricSourceConfig {
    /// Poller memory for every app type.
    fn default() -> Self {
        Self::new().with_source(WILDCARD_APP_TYPE, &DataSource::Poller, [MetricFamily::Memory])
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub engine: EngineConfig,
    pub metric_sources: MetricSourceConfig,
    /// Triggers registered at startup without being persisted again.
    pub triggers: Vec<Trigger>,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> TripwireResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(TripwireError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| TripwireError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> TripwireResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| TripwireError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> TripwireResult<Config> {
        let engine = Self::validate_engine(raw.engine)?;

        let metric_sources = match raw.metric_sources {
            Some(sources) => Self::validate_sources(sources)?,
            None => MetricSourceConfig::default(),
        };

        let mut seen = HashSet::new();
        for trigger in &raw.triggers {
            trigger.validate()?;
            if !seen.insert((trigger.app_id.clone(), trigger.key())) {
                return Err(HardValidationError::SchemaValidation {
                    message: format!(
                        "Duplicate trigger {} for app {}",
                        trigger.key(),
                        trigger.app_id
                    ),
                }
                .into());
            }
        }

        Ok(Config {
            engine,
            metric_sources,
            triggers: raw.triggers,
        })
    }

    fn validate_engine(raw: RawEngineConfig) -> Result<EngineConfig, HardValidationError> {
        const MAX_RETENTION_SECS: u64 = 24 * 60 * 60;
        const MAX_QUEUE_CAPACITY: usize = 1_000_000;
        const MAX_WORKERS: usize = 1024;

        if raw.max_sample_retention_secs == 0 || raw.max_sample_retention_secs > MAX_RETENTION_SECS
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "max_sample_retention_secs",
                value: raw.max_sample_retention_secs.to_string(),
                reason: format!("Must be between 1 and {} seconds", MAX_RETENTION_SECS),
            });
        }

        for (field, value) in [
            ("report_interval_secs", raw.report_interval_secs),
            ("stale_purge_interval_secs", raw.stale_purge_interval_secs),
            (
                "cache_invalidation_interval_secs",
                raw.cache_invalidation_interval_secs,
            ),
            ("dispatcher_poll_timeout_ms", raw.dispatcher_poll_timeout_ms),
        ] {
            if value == 0 {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: "0".to_string(),
                    reason: "Must be greater than zero".to_string(),
                });
            }
        }

        if raw.ingestion_queue_capacity == 0 || raw.ingestion_queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(HardValidationError::InvalidFieldValue {
                field: "ingestion_queue_capacity",
                value: raw.ingestion_queue_capacity.to_string(),
                reason: format!("Must be between 1 and {}", MAX_QUEUE_CAPACITY),
            });
        }

        for (field, value) in [
            ("evaluation_workers", raw.evaluation_workers),
            ("dispatch_workers", raw.dispatch_workers),
        ] {
            if value > MAX_WORKERS {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: value.to_string(),
                    reason: format!("Must not exceed {} (0 = twice the CPU count)", MAX_WORKERS),
                });
            }
        }

        Ok(EngineConfig::from_raw(raw))
    }

    fn validate_sources(
        raw: HashMap<String, HashMap<String, RawSourceConfig>>,
    ) -> Result<MetricSourceConfig, HardValidationError> {
        let mut config = MetricSourceConfig::new();

        for (app_type, sources) in raw {
            if app_type.trim().is_empty() {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "metric_sources",
                    value: app_type,
                    reason: "App type key cannot be empty (use \"*\" for all types)".to_string(),
                });
            }

            for (source, entry) in sources {
                // Disabled sources are dropped entirely.
                if !entry.enabled {
                    continue;
                }

                let families = entry
                    .metrics
                    .iter()
                    .map(|m| m.parse::<MetricFamily>())
                    .collect::<Result<HashSet<_>, _>>()?;

                config = config.with_source(&app_type, &DataSource::from(source), families);
            }
        }

        Ok(config)
    }
}
