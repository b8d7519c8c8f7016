// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-application trigger evaluation.
//!
//! A `StateMonitor` owns the sliding sample windows of every (instance,
//! metric) series of one application, the triggers registered for it and one
//! breach timer per trigger. All of that state sits behind a single mutex, so
//! an evaluation pass is atomic with respect to concurrent sample ingestion
//! and trigger registration for the same application, and independent of
//! every other application.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::metric::{AppInstanceMetrics, MetricFamily, MetricName};
use crate::sample::{Sample, Statistic};
use crate::state::{BreachState, BreachTimer};
use crate::trigger::{Trigger, TriggerEvent, TriggerKey};
use crate::types::{now_millis, AppId, InstanceIndex, TimestampMillis};

/// Evaluation passes a sample should take part in before it ages out of a
/// statistics window. Dropping it earlier is logged as a warning.
const MIN_EVALUATIONS: u32 = 2;

/// Tolerance added to the statistics window, in milliseconds.
const STAT_WINDOW_SLACK_MS: u64 = 1;

/// Sliding-window key: one series per instance and metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    instance: InstanceIndex,
    metric: MetricFamily,
}

#[derive(Debug, Default)]
struct MonitorState {
    samples: HashMap<SeriesKey, VecDeque<Sample>>,
    triggers: BTreeMap<TriggerKey, Trigger>,
    breach: HashMap<TriggerKey, BreachTimer>,
    active_instances: BTreeSet<InstanceIndex>,
    poller_mem_required: Option<bool>,
    prev_trigger_eval_time: TimestampMillis,
}

/// Trigger evaluation state machine for one application.
#[derive(Debug)]
pub struct StateMonitor {
    app_id: AppId,
    max_retention_ms: u64,
    state: Mutex<MonitorState>,
}

impl StateMonitor {
    /// Create a monitor that keeps samples for at most `max_retention`.
    pub fn new(app_id: AppId, max_retention: Duration) -> Self {
        Self {
            app_id,
            max_retention_ms: max_retention.as_millis() as u64,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        // A panicking pass leaves the maps structurally valid; keep serving.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Feed one snapshot into the sample windows.
    pub fn add_monitor_sample(&self, snapshot: &AppInstanceMetrics) {
        self.add_monitor_sample_at(snapshot, now_millis());
    }

    /// Feed one snapshot, expiring samples relative to `now`.
    ///
    /// CPU readings are stored as percentages. Memory readings need a positive
    /// used value and a positive snapshot quota; partial data is dropped.
    pub fn add_monitor_sample_at(&self, snapshot: &AppInstanceMetrics, now: TimestampMillis) {
        let mut state = self.lock();

        for instance in &snapshot.instance_metrics {
            let index = instance.instance_index;
            for metric in &instance.metrics {
                if !metric.value.is_finite() {
                    continue;
                }

                let sample = match metric.name {
                    MetricName::Cpu => Some(Sample::new(
                        MetricFamily::Cpu,
                        index,
                        metric.value * 100.0,
                        metric.timestamp,
                    )),
                    MetricName::MemoryUsed => {
                        if metric.value > 0.0 && snapshot.mem_quota > 0.0 {
                            Some(
                                Sample::new(MetricFamily::Memory, index, metric.value, metric.timestamp)
                                    .with_quota(snapshot.mem_quota),
                            )
                        } else {
                            None
                        }
                    }
                    MetricName::MemoryQuota | MetricName::OtherMemory(_) | MetricName::Other(_) => {
                        None
                    }
                };

                if let Some(sample) = sample {
                    self.push_sample(&mut state, sample, now);
                }
            }
        }
    }

    fn push_sample(&self, state: &mut MonitorState, sample: Sample, now: TimestampMillis) {
        let key = SeriesKey {
            instance: sample.instance,
            metric: sample.metric,
        };

        tracing::debug!(app_id = %self.app_id, sample = %sample, "Adding sample");

        let series = state.samples.entry(key).or_default();
        while series
            .front()
            .is_some_and(|oldest| oldest.age_ms(now) > self.max_retention_ms)
        {
            if let Some(expired) = series.pop_front() {
                tracing::debug!(app_id = %self.app_id, sample = %expired, "Dropping expired sample");
            }
        }
        series.push_back(sample);

        state.active_instances.insert(key.instance);
    }

    // =========================================================================
    // Trigger registry
    // =========================================================================

    /// Register a trigger. Returns `false` if its key is already taken.
    pub fn add_trigger(&self, trigger: Trigger) -> bool {
        let mut state = self.lock();
        let key = trigger.key();

        if state.triggers.contains_key(&key) {
            tracing::warn!(
                app_id = %self.app_id,
                trigger_id = %trigger.trigger_id,
                key = %key,
                "Attempting to add a duplicate trigger"
            );
            return false;
        }

        state.triggers.insert(key, trigger);
        true
    }

    /// Unregister a trigger and its breach timer. Unknown keys are ignored.
    pub fn remove_trigger(&self, trigger: &Trigger) -> bool {
        let mut state = self.lock();
        let key = trigger.key();

        if state.triggers.remove(&key).is_none() {
            tracing::warn!(
                app_id = %self.app_id,
                trigger_id = %trigger.trigger_id,
                key = %key,
                "Attempting to remove a non-existing trigger"
            );
            return false;
        }

        state.breach.remove(&key);
        true
    }

    /// All registered triggers, ordered by key.
    pub fn triggers(&self) -> Vec<Trigger> {
        self.lock().triggers.values().cloned().collect()
    }

    pub fn num_triggers(&self) -> usize {
        self.lock().triggers.len()
    }

    /// Whether any registered trigger is defined on CPU.
    pub fn is_cpu_required(&self) -> bool {
        self.requires(MetricFamily::Cpu)
    }

    /// Whether memory must be requested from the poller. Defaults to whether
    /// any trigger is defined on memory unless explicitly overridden.
    pub fn is_poller_mem_required(&self) -> bool {
        let explicit = self.lock().poller_mem_required;
        explicit.unwrap_or_else(|| self.requires(MetricFamily::Memory))
    }

    pub fn set_poller_mem_required(&self, required: bool) {
        self.lock().poller_mem_required = Some(required);
    }

    fn requires(&self, family: MetricFamily) -> bool {
        self.lock().triggers.keys().any(|key| key.metric == family)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Instances currently considered live.
    pub fn active_instances(&self) -> Vec<InstanceIndex> {
        self.lock().active_instances.iter().copied().collect()
    }

    /// Number of samples held for one series.
    pub fn sample_count(&self, instance: InstanceIndex, metric: MetricFamily) -> usize {
        self.lock()
            .samples
            .get(&SeriesKey { instance, metric })
            .map_or(0, VecDeque::len)
    }

    /// Breach state of a registered trigger.
    pub fn breach_state(&self, key: TriggerKey) -> Option<BreachState> {
        let state = self.lock();
        if !state.triggers.contains_key(&key) {
            return None;
        }
        Some(state.breach.get(&key).map(BreachTimer::state).unwrap_or_default())
    }

    /// Time of the last completed evaluation pass, 0 if none.
    pub fn prev_trigger_eval_time(&self) -> TimestampMillis {
        self.lock().prev_trigger_eval_time
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluate every registered trigger against the current windows.
    pub fn evaluate_triggers(&self) -> Vec<TriggerEvent> {
        self.evaluate_triggers_at(now_millis())
    }

    /// Evaluate every registered trigger as of `now`.
    ///
    /// Runs under the monitor lock for the whole pass. Invalid samples are
    /// removed from their series as they are encountered. An instance that
    /// contributed nothing to any trigger in this pass, while having a series
    /// for at least one, is pruned along with all of its samples.
    pub fn evaluate_triggers_at(&self, now: TimestampMillis) -> Vec<TriggerEvent> {
        let mut guard = self.lock();
        let MonitorState {
            samples,
            triggers,
            breach,
            active_instances,
            prev_trigger_eval_time,
            ..
        } = &mut *guard;

        tracing::debug!(app_id = %self.app_id, triggers = triggers.len(), "Evaluating triggers");

        let mut failed: BTreeSet<InstanceIndex> = BTreeSet::new();
        let mut contributed: BTreeSet<InstanceIndex> = BTreeSet::new();
        let mut events = Vec::new();

        for (key, trigger) in triggers.iter() {
            if active_instances.is_empty() {
                tracing::warn!(
                    app_id = %self.app_id,
                    trigger_id = %trigger.trigger_id,
                    metric = %trigger.metric,
                    "No monitoring data available for trigger"
                );
            }

            let mut app_stat = Statistic::new(trigger.stat_type);
            // Quota of the newest sample folded in for this trigger.
            let mut quota: Option<(TimestampMillis, f64)> = None;

            for &instance in active_instances.iter() {
                let series_key = SeriesKey {
                    instance,
                    metric: trigger.metric,
                };
                let series = match samples.get_mut(&series_key) {
                    Some(series) if !series.is_empty() => series,
                    _ => {
                        tracing::debug!(
                            app_id = %self.app_id,
                            instance = %instance,
                            metric = %trigger.metric,
                            "No samples for series"
                        );
                        continue;
                    }
                };

                let mut instance_stat = Statistic::new(trigger.stat_type);
                series.retain_mut(|sample| {
                    if !self.is_valid_sample(sample, trigger, now) {
                        return false;
                    }
                    sample.mark_evaluated();
                    instance_stat.update(sample.value);
                    if quota.map_or(true, |(ts, _)| sample.timestamp >= ts) {
                        quota = Some((sample.timestamp, sample.quota));
                    }
                    true
                });

                if instance_stat.is_empty() {
                    tracing::debug!(
                        app_id = %self.app_id,
                        instance = %instance,
                        metric = %trigger.metric,
                        "No valid samples, marking instance inactive"
                    );
                    failed.insert(instance);
                } else {
                    app_stat.update(instance_stat.value());
                    contributed.insert(instance);
                    tracing::debug!(
                        app_id = %self.app_id,
                        instance = %instance,
                        metric = %trigger.metric,
                        value = instance_stat.value(),
                        count = instance_stat.count(),
                        "Aggregated instance statistic"
                    );
                }
            }

            // No data, no decision: the breach timer is left untouched.
            if app_stat.is_empty() {
                continue;
            }

            let threshold = trigger.effective_threshold(quota.map_or(0.0, |(_, q)| q));
            let breaching = trigger.threshold_type.is_breached(app_stat.value(), threshold);

            tracing::debug!(
                app_id = %self.app_id,
                trigger_id = %trigger.trigger_id,
                metric = %trigger.metric,
                value = app_stat.value(),
                threshold,
                breaching,
                "Aggregated application statistic"
            );

            let timer = breach.entry(*key).or_default();
            if timer.observe(breaching, now, trigger.breach_duration_ms()) {
                events.push(TriggerEvent {
                    app_id: self.app_id.clone(),
                    trigger_id: trigger.trigger_id.clone(),
                    metric_type: trigger.metric,
                    metric_value: app_stat.value(),
                    timestamp: now,
                    trigger: trigger.clone(),
                });
            }
        }

        for instance in failed.difference(&contributed) {
            tracing::debug!(
                app_id = %self.app_id,
                instance = %instance,
                "Removing inactive instance"
            );
            active_instances.remove(instance);
            samples.retain(|key, _| key.instance != *instance);
        }

        *prev_trigger_eval_time = now;
        events
    }

    fn is_valid_sample(&self, sample: &Sample, trigger: &Trigger, now: TimestampMillis) -> bool {
        if sample.value < 0.0 {
            return false;
        }

        let age = sample.age_ms(now);
        if age > self.max_retention_ms {
            tracing::debug!(app_id = %self.app_id, sample = %sample, now, "Removing expired sample");
            return false;
        }

        if age > trigger.stat_window_ms() + STAT_WINDOW_SLACK_MS {
            if sample.evaluate_count() < MIN_EVALUATIONS {
                tracing::warn!(
                    app_id = %self.app_id,
                    sample = %sample,
                    now,
                    evaluate_count = sample.evaluate_count(),
                    "Deleting un-evaluated sample outside the statistics window"
                );
            } else {
                tracing::debug!(app_id = %self.app_id, sample = %sample, now, "Sample left the statistics window");
            }
            return false;
        }

        true
    }
}
