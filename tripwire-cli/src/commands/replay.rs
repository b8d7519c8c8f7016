// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `tripwire replay` command - Evaluate recorded snapshots offline.
//!
//! Every snapshot is fed to its application's monitor and followed by one
//! evaluation pass, both clocked at the snapshot timestamp. No worker pools,
//! purge tasks or collaborators are involved, so a recording always produces
//! the same events.

use std::fs::File;
use std::io::{BufRead, BufReader};

use tripwire_core::registry::MonitorRegistry;
use tripwire_core::{AppInstanceMetrics, Config, ConfigLoader, TimestampMillis, TriggerEvent};

use crate::input::{parse_line, InputError};

/// Outcome of a replay run.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub snapshots: usize,
    /// Snapshots for applications without triggers.
    pub skipped: usize,
    pub events: Vec<TriggerEvent>,
}

pub async fn execute(config_path: &str, file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(config = %config_path, file = %file, "Replaying recorded snapshots");

    let config = ConfigLoader::load_file(config_path)?;
    let reader = BufReader::new(File::open(file)?);
    let summary = replay(&config, reader)?;

    for event in &summary.events {
        println!("{}", serde_json::to_string(event)?);
    }

    eprintln!();
    eprintln!(
        "✓ Replayed {} snapshots ({} without triggers), {} events fired",
        summary.snapshots,
        summary.skipped,
        summary.events.len()
    );
    Ok(())
}

/// Run every snapshot from `reader` through fresh monitors built from `config`.
pub fn replay<R: BufRead>(config: &Config, reader: R) -> Result<ReplaySummary, InputError> {
    let registry = MonitorRegistry::new(config.engine.max_sample_retention);
    for trigger in &config.triggers {
        registry
            .get_or_create(&trigger.app_id)
            .add_trigger(trigger.clone());
    }

    let mut summary = ReplaySummary::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let Some(snapshot) = parse_line(&line, index + 1)? else {
            continue;
        };
        summary.snapshots += 1;

        let Some(monitor) = registry.get(&snapshot.app_id) else {
            summary.skipped += 1;
            continue;
        };

        let now = snapshot_time(&snapshot);
        monitor.add_monitor_sample_at(&snapshot, now);
        summary.events.extend(monitor.evaluate_triggers_at(now));
    }

    Ok(summary)
}

/// Snapshot timestamp, or the newest reading when the snapshot carries none.
fn snapshot_time(snapshot: &AppInstanceMetrics) -> TimestampMillis {
    if snapshot.timestamp > 0 {
        return snapshot.timestamp;
    }
    snapshot
        .instance_metrics
        .iter()
        .flat_map(|instance| instance.metrics.iter().map(|m| m.timestamp))
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CONFIG: &str = r#"
triggers:
  - app_id: shop
    trigger_id: mem-upper
    metric: memory
    threshold_type: greater_than
    metric_threshold: 80
"#;

    fn memory_line(app: &str, ts: u64, used: f64) -> String {
        format!(
            r#"{{"app_id":"{app}","timestamp":{ts},"mem_quota":1000,"instance_metrics":[{{"instance_index":0,"metrics":[{{"compound_name":"cf-stats#Memory","value":{used},"timestamp":{ts}}}]}}]}}"#
        )
    }

    #[test]
    fn test_sustained_breach_fires_after_duration() {
        let config = ConfigLoader::load_string(CONFIG).unwrap();
        let recording = [1_000, 31_000, 61_000, 91_000]
            .iter()
            .map(|ts| memory_line("shop", *ts, 900.0))
            .collect::<Vec<_>>()
            .join("\n");

        let summary = replay(&config, Cursor::new(recording)).unwrap();

        assert_eq!(summary.snapshots, 4);
        assert_eq!(summary.skipped, 0);
        // Pending from 1s, due at 61s, still breaching at 91s.
        let fired: Vec<u64> = summary.events.iter().map(|e| e.timestamp).collect();
        assert_eq!(fired, vec![61_000, 91_000]);
        assert_eq!(summary.events[0].trigger_id, "mem-upper");
    }

    #[test]
    fn test_dip_below_threshold_restarts_timer() {
        let config = ConfigLoader::load_string(CONFIG).unwrap();
        // A 30s window keeps the dip from being averaged away.
        let config = Config {
            triggers: config
                .triggers
                .into_iter()
                .map(|t| t.with_stat_window(30))
                .collect(),
            ..config
        };
        let recording = [
            memory_line("shop", 1_000, 900.0),
            memory_line("shop", 40_000, 100.0),
            memory_line("shop", 80_000, 900.0),
            memory_line("shop", 120_000, 900.0),
        ]
        .join("\n");

        let summary = replay(&config, Cursor::new(recording)).unwrap();
        assert!(summary.events.is_empty());
    }

    #[test]
    fn test_unknown_apps_are_skipped() {
        let config = ConfigLoader::load_string(CONFIG).unwrap();
        let recording = format!(
            "# header\n{}\n\n{}\n",
            memory_line("cart", 1_000, 900.0),
            memory_line("shop", 1_000, 900.0)
        );

        let summary = replay(&config, Cursor::new(recording)).unwrap();
        assert_eq!(summary.snapshots, 2);
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_bad_line_aborts_with_line_number() {
        let config = ConfigLoader::load_string(CONFIG).unwrap();
        let recording = format!("{}\n{{oops\n", memory_line("shop", 1_000, 900.0));

        let err = replay(&config, Cursor::new(recording)).unwrap_err();
        assert!(matches!(err, InputError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_snapshot_time_falls_back_to_readings() {
        let snapshot: AppInstanceMetrics = serde_json::from_str(
            r#"{"app_id":"shop","instance_metrics":[{"instance_index":0,"metrics":[
                {"compound_name":"cf-stats#CPU","value":0.5,"timestamp":7000},
                {"compound_name":"cf-stats#Memory","value":10,"timestamp":9000}]}]}"#,
        )
        .unwrap();
        assert_eq!(snapshot_time(&snapshot), 9_000);
    }
}
