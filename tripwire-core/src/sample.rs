//! Timestamped observations and the online aggregator folded over them.

use std::fmt;

use crate::metric::MetricFamily;
use crate::trigger::StatType;
use crate::types::{InstanceIndex, TimestampMillis};

/// A single metric observation held in a state monitor's sliding window.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: MetricFamily,
    pub instance: InstanceIndex,
    pub value: f64,
    pub timestamp: TimestampMillis,
    /// Denominator for percentage thresholds; 0 when not applicable.
    pub quota: f64,
    evaluate_count: u32,
}

impl Sample {
    pub fn new(
        metric: MetricFamily,
        instance: InstanceIndex,
        value: f64,
        timestamp: TimestampMillis,
    ) -> Self {
        Self {
            metric,
            instance,
            value,
            timestamp,
            quota: 0.0,
            evaluate_count: 0,
        }
    }

    pub fn with_quota(mut self, quota: f64) -> Self {
        self.quota = quota;
        self
    }

    /// Number of evaluation passes that folded this sample in.
    pub fn evaluate_count(&self) -> u32 {
        self.evaluate_count
    }

    pub(crate) fn mark_evaluated(&mut self) {
        self.evaluate_count = self.evaluate_count.saturating_add(1);
    }

    /// Milliseconds between the sample timestamp and `now`, saturating at zero
    /// for samples stamped in the future.
    pub fn age_ms(&self, now: TimestampMillis) -> u64 {
        now.saturating_sub(self.timestamp)
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}={} ts={} quota={} evaluated={}",
            self.metric, self.instance, self.value, self.timestamp, self.quota, self.evaluate_count
        )
    }
}

/// O(1) MAX or AVG accumulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistic {
    kind: StatType,
    value: f64,
    count: u64,
}

impl Statistic {
    pub fn new(kind: StatType) -> Self {
        Self {
            kind,
            value: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, x: f64) {
        self.count += 1;
        match self.kind {
            StatType::Max => {
                if self.count == 1 || x > self.value {
                    self.value = x;
                }
            }
            StatType::Avg => {
                self.value += (x - self.value) / self.count as f64;
            }
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
