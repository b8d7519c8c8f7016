// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Scaling rule definitions and the events they produce.
//!
//! A [`Trigger`] is immutable once registered. Within one application it is
//! identified by its [`TriggerKey`]; registering a second trigger with the same
//! key is ignored.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;
use crate::metric::MetricFamily;
use crate::types::{AppId, TimestampMillis};

/// Direction of the threshold comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ThresholdType {
    /// Breaching while the aggregated value is `<=` the threshold.
    LessThan,
    /// Breaching while the aggregated value is `>=` the threshold.
    GreaterThan,
}

impl ThresholdType {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LessThan => "less_than",
            Self::GreaterThan => "greater_than",
        }
    }

    /// Whether `value` crosses `threshold` in this direction. Equality counts.
    pub fn is_breached(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value >= threshold,
            Self::LessThan => value <= threshold,
        }
    }
}

impl FromStr for ThresholdType {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "less_than" | "lessthan" | "lower" | "<" => Ok(Self::LessThan),
            "greater_than" | "greaterthan" | "larger_than" | "largerthan" | "upper" | ">" => {
                Ok(Self::GreaterThan)
            }
            _ => Err(HardValidationError::UnknownVariant {
                kind: "threshold type",
                value: s.to_string(),
            }),
        }
    }
}

/// Unit of a trigger threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ThresholdUnit {
    Absolute,
    /// Percentage of the quota carried by the samples.
    Percent,
}

impl ThresholdUnit {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Absolute => "absolute",
            Self::Percent => "percent",
        }
    }

    /// Convert a logical threshold into an absolute one.
    /// A zero quota means "unknown" and leaves the threshold unchanged.
    pub fn absolute_threshold(&self, threshold: f64, quota: f64) -> f64 {
        match self {
            Self::Percent if quota != 0.0 => quota * threshold / 100.0,
            _ => threshold,
        }
    }
}

impl FromStr for ThresholdUnit {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "absolute" => Ok(Self::Absolute),
            "percent" | "percentage" | "%" => Ok(Self::Percent),
            _ => Err(HardValidationError::UnknownVariant {
                kind: "threshold unit",
                value: s.to_string(),
            }),
        }
    }
}

/// Aggregation applied per instance and then across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StatType {
    Max,
    Avg,
}

impl StatType {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Avg => "average",
        }
    }
}

impl FromStr for StatType {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" | "maximum" => Ok(Self::Max),
            "avg" | "average" | "mean" => Ok(Self::Avg),
            _ => Err(HardValidationError::UnknownVariant {
                kind: "statistic type",
                value: s.to_string(),
            }),
        }
    }
}

macro_rules! string_enum_conversions {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = HardValidationError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }

            impl From<$ty> for String {
                fn from(value: $ty) -> Self {
                    value.name().to_string()
                }
            }

            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.name())
                }
            }
        )*
    };
}

string_enum_conversions!(ThresholdType, ThresholdUnit, StatType);

/// Identity of a trigger within its application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerKey {
    pub metric: MetricFamily,
    pub threshold_type: ThresholdType,
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.metric, self.threshold_type)
    }
}

fn default_unit() -> ThresholdUnit {
    ThresholdUnit::Percent
}

fn default_stat_window() -> u32 {
    120
}

fn default_breach_duration() -> u32 {
    60
}

fn default_stat_type() -> StatType {
    StatType::Avg
}

/// A scaling rule on one metric family of one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub app_id: AppId,
    pub trigger_id: String,
    pub metric: MetricFamily,
    pub threshold_type: ThresholdType,
    pub metric_threshold: f64,
    #[serde(default = "default_unit")]
    pub unit: ThresholdUnit,
    #[serde(default = "default_stat_window")]
    pub stat_window_secs: u32,
    #[serde(default = "default_breach_duration")]
    pub breach_duration_secs: u32,
    #[serde(default = "default_stat_type")]
    pub stat_type: StatType,
}

impl Trigger {
    /// Create a trigger with the default window, duration, unit and statistic.
    pub fn new(
        app_id: AppId,
        trigger_id: impl Into<String>,
        metric: MetricFamily,
        threshold_type: ThresholdType,
        metric_threshold: f64,
    ) -> Self {
        Self {
            app_id,
            trigger_id: trigger_id.into(),
            metric,
            threshold_type,
            metric_threshold,
            unit: default_unit(),
            stat_window_secs: default_stat_window(),
            breach_duration_secs: default_breach_duration(),
            stat_type: default_stat_type(),
        }
    }

    pub fn with_unit(mut self, unit: ThresholdUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_stat_window(mut self, secs: u32) -> Self {
        self.stat_window_secs = secs;
        self
    }

    pub fn with_breach_duration(mut self, secs: u32) -> Self {
        self.breach_duration_secs = secs;
        self
    }

    pub fn with_stat_type(mut self, stat_type: StatType) -> Self {
        self.stat_type = stat_type;
        self
    }

    /// The key under which this trigger is registered.
    pub fn key(&self) -> TriggerKey {
        TriggerKey {
            metric: self.metric,
            threshold_type: self.threshold_type,
        }
    }

    /// Threshold in absolute units for the given quota.
    pub fn effective_threshold(&self, quota: f64) -> f64 {
        self.unit.absolute_threshold(self.metric_threshold, quota)
    }

    /// Statistics window in milliseconds.
    pub fn stat_window_ms(&self) -> u64 {
        u64::from(self.stat_window_secs) * 1000
    }

    /// Breach duration in milliseconds.
    pub fn breach_duration_ms(&self) -> u64 {
        u64::from(self.breach_duration_secs) * 1000
    }

    /// Reject definitions the engine cannot evaluate meaningfully.
    pub fn validate(&self) -> Result<(), HardValidationError> {
        if self.trigger_id.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "trigger_id",
                context: format!("trigger for app '{}'", self.app_id),
            });
        }

        if !self.metric_threshold.is_finite() || self.metric_threshold < 0.0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "metric_threshold",
                value: self.metric_threshold.to_string(),
                reason: "Threshold must be a finite, non-negative number".to_string(),
            });
        }

        if self.stat_window_secs == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "stat_window_secs",
                value: "0".to_string(),
                reason: "Statistics window must be at least one second".to_string(),
            });
        }

        Ok(())
    }
}

/// Emitted when a trigger has breached for at least its breach duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub app_id: AppId,
    pub trigger_id: String,
    pub metric_type: MetricFamily,
    pub metric_value: f64,
    pub timestamp: TimestampMillis,
    pub trigger: Trigger,
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TriggerEvent[app={}, trigger={}, metric={}, value={:.2}, ts={}]",
            self.app_id, self.trigger_id, self.metric_type, self.metric_value, self.timestamp
        )
    }
}
