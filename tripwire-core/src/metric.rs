// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Metric snapshot types as delivered by metric sources.
//!
//! A snapshot is one reporting cycle's worth of per-instance metrics for one
//! application. Compound metric names are classified into [`MetricName`] when
//! the snapshot is deserialized or constructed, so the evaluation path only
//! ever matches on a closed set of variants.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;
use crate::types::{AppId, InstanceIndex, TimestampMillis};

/// Compound name of the platform CPU metric (fraction of one core).
pub const POLLER_CPU: &str = "cf-stats#CPU";
/// Compound name of the platform used-memory metric (MB).
pub const POLLER_MEMORY: &str = "cf-stats#Memory";
/// Compound name of the platform memory-quota metric (MB).
pub const POLLER_MEMORY_QUOTA: &str = "cf-stats#MemoryQuota";

/// Classified compound metric name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MetricName {
    /// CPU usage as a fraction; stored as a 0-100 percentage.
    Cpu,
    /// Used memory in MB.
    MemoryUsed,
    /// Memory quota in MB.
    MemoryQuota,
    /// Any other memory-related metric; accepted on the wire, never evaluated.
    OtherMemory(String),
    /// Anything else.
    Other(String),
}

impl MetricName {
    /// Classify a compound name, ignoring ASCII case.
    pub fn classify(compound_name: &str) -> Self {
        if compound_name.eq_ignore_ascii_case(POLLER_CPU) {
            Self::Cpu
        } else if compound_name.eq_ignore_ascii_case(POLLER_MEMORY) {
            Self::MemoryUsed
        } else if compound_name.eq_ignore_ascii_case(POLLER_MEMORY_QUOTA) {
            Self::MemoryQuota
        } else if compound_name.to_ascii_lowercase().contains("memory") {
            Self::OtherMemory(compound_name.to_string())
        } else {
            Self::Other(compound_name.to_string())
        }
    }

    /// Canonical compound name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cpu => POLLER_CPU,
            Self::MemoryUsed => POLLER_MEMORY,
            Self::MemoryQuota => POLLER_MEMORY_QUOTA,
            Self::OtherMemory(name) | Self::Other(name) => name,
        }
    }
}

impl From<String> for MetricName {
    fn from(value: String) -> Self {
        Self::classify(&value)
    }
}

impl From<&str> for MetricName {
    fn from(value: &str) -> Self {
        Self::classify(value)
    }
}

impl From<MetricName> for String {
    fn from(name: MetricName) -> Self {
        name.as_str().to_string()
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric family a trigger can be defined on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricFamily {
    Cpu,
    Memory,
}

impl MetricFamily {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Memory => "memory",
        }
    }

    /// Compound names a snapshot must retain for this family to be evaluated.
    pub fn compound_names(&self) -> &'static [MetricName] {
        const CPU: &[MetricName] = &[MetricName::Cpu];
        const MEMORY: &[MetricName] = &[MetricName::MemoryQuota, MetricName::MemoryUsed];
        match self {
            Self::Cpu => CPU,
            Self::Memory => MEMORY,
        }
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricFamily {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("cpu") {
            Ok(Self::Cpu)
        } else if s.eq_ignore_ascii_case("memory") {
            Ok(Self::Memory)
        } else {
            Err(HardValidationError::UnknownVariant {
                kind: "metric family",
                value: s.to_string(),
            })
        }
    }
}

impl TryFrom<String> for MetricFamily {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricFamily> for String {
    fn from(family: MetricFamily) -> Self {
        family.name().to_string()
    }
}

/// Origin of a metric snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataSource {
    /// The platform stats poller. Its data is persisted on arrival.
    Poller,
    Custom(String),
}

impl DataSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Poller => "poller",
            Self::Custom(name) => name,
        }
    }

    pub fn is_poller(&self) -> bool {
        matches!(self, Self::Poller)
    }
}

impl From<String> for DataSource {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("poller") {
            Self::Poller
        } else {
            Self::Custom(value)
        }
    }
}

impl From<&str> for DataSource {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<DataSource> for String {
    fn from(source: DataSource) -> Self {
        source.as_str().to_string()
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single raw metric reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "compound_name")]
    pub name: MetricName,
    pub value: f64,
    pub timestamp: TimestampMillis,
}

impl Metric {
    pub fn new(name: impl Into<MetricName>, value: f64, timestamp: TimestampMillis) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }
}

/// All readings reported by one instance in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub instance_index: InstanceIndex,
    #[serde(default)]
    pub timestamp: TimestampMillis,
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

/// One reporting cycle for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInstanceMetrics {
    pub app_id: AppId,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_type: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub timestamp: TimestampMillis,
    /// Memory quota in MB; the denominator of percentage memory thresholds.
    #[serde(default)]
    pub mem_quota: f64,
    #[serde(default)]
    pub instance_metrics: Vec<InstanceMetrics>,
}

impl AppInstanceMetrics {
    /// Create an empty snapshot for an application.
    pub fn new(app_id: AppId, timestamp: TimestampMillis, mem_quota: f64) -> Self {
        Self {
            app_id,
            app_name: String::new(),
            app_type: String::new(),
            service_id: String::new(),
            timestamp,
            mem_quota,
            instance_metrics: Vec::new(),
        }
    }

    /// Builder-style helper to append one instance's readings.
    pub fn with_instance(mut self, index: u32, metrics: Vec<Metric>) -> Self {
        self.instance_metrics.push(InstanceMetrics {
            instance_index: InstanceIndex::new(index),
            timestamp: self.timestamp,
            metrics,
        });
        self
    }

    /// Copy of this snapshot keeping only the named metrics.
    /// Returns `None` if no metric survives.
    pub fn retain_only(&self, wanted: &HashSet<MetricName>) -> Option<Self> {
        let mut filtered = self.clone();
        let mut kept = 0usize;
        for instance in &mut filtered.instance_metrics {
            instance.metrics.retain(|m| wanted.contains(&m.name));
            kept += instance.metrics.len();
        }
        if kept == 0 {
            return None;
        }
        Some(filtered)
    }

    /// Total number of readings across all instances.
    pub fn metric_count(&self) -> usize {
        self.instance_metrics.iter().map(|i| i.metrics.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(MetricName::classify("CF-STATS#cpu"), MetricName::Cpu);
        assert_eq!(MetricName::classify("cf-stats#memory"), MetricName::MemoryUsed);
        assert_eq!(
            MetricName::classify("cf-stats#memoryquota"),
            MetricName::MemoryQuota
        );
        assert!(matches!(
            MetricName::classify("cf-stats#MemoryRss"),
            MetricName::OtherMemory(_)
        ));
        assert!(matches!(
            MetricName::classify("throughput"),
            MetricName::Other(_)
        ));
    }

    #[test]
    fn test_metric_family_parse() {
        assert_eq!("cpu".parse::<MetricFamily>().unwrap(), MetricFamily::Cpu);
        assert_eq!("Memory".parse::<MetricFamily>().unwrap(), MetricFamily::Memory);
        assert!("disk".parse::<MetricFamily>().is_err());
    }

    #[test]
    fn test_snapshot_deserialize_classifies_names() {
        let json = r#"{
            "app_id": "app-1",
            "mem_quota": 1024,
            "instance_metrics": [
                {"instance_index": 0, "metrics": [
                    {"compound_name": "cf-stats#Memory", "value": 512, "timestamp": 1000}
                ]}
            ]
        }"#;
        let snapshot: AppInstanceMetrics = serde_json::from_str(json).unwrap();
        assert_eq!(
            snapshot.instance_metrics[0].metrics[0].name,
            MetricName::MemoryUsed
        );
        assert_eq!(snapshot.mem_quota, 1024.0);
    }

    #[test]
    fn test_retain_only_drops_uninteresting() {
        let app = AppId::new("app-1").unwrap();
        let snapshot = AppInstanceMetrics::new(app, 1000, 512.0)
            .with_instance(0, vec![Metric::new(POLLER_CPU, 0.5, 1000)])
            .with_instance(1, vec![Metric::new(POLLER_MEMORY, 100.0, 1000)]);

        let wanted: HashSet<MetricName> = MetricFamily::Memory
            .compound_names()
            .iter()
            .cloned()
            .collect();
        let filtered = snapshot.retain_only(&wanted).unwrap();
        assert_eq!(filtered.metric_count(), 1);
        assert!(filtered.instance_metrics[0].metrics.is_empty());

        let nothing: HashSet<MetricName> = HashSet::new();
        assert!(snapshot.retain_only(&nothing).is_none());
    }

    #[test]
    fn test_data_source_roundtrip() {
        assert_eq!(DataSource::from("POLLER"), DataSource::Poller);
        assert_eq!(DataSource::from("agent").as_str(), "agent");
    }
}
