// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `tripwire up` command - Run the engine in the foreground.
//!
//! Reads snapshots as JSON lines, pushes them through the controller and
//! prints fired events on stdout. Store, platform and caches are the
//! in-memory implementations from the core crate.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;

use tripwire_core::memory::{CountingCache, MemoryStore, StaticPlatform};
use tripwire_core::{Collaborators, ConfigLoader, DataSource, MonitorController, TripwireError};

use crate::input;
use crate::metrics::{self, MONITORED_APPS, SNAPSHOTS_INGESTED};
use crate::scaler::StdoutScaler;

pub async fn execute(
    config_path: &str,
    input_path: &str,
    source: &str,
    metrics_port: Option<u16>,
    exit_on_eof: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(config = %config_path, input = %input_path, source = %source, "Starting engine");

    // Fail fast on invalid config
    let config = ConfigLoader::load_file(config_path)?;
    tracing::info!(
        triggers = config.triggers.len(),
        "Configuration validated successfully"
    );

    metrics::init();
    if let Some(port) = metrics_port {
        metrics::start_metrics_server(port);
    }

    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::new()),
        platform: Arc::new(StaticPlatform::new()),
        scaling: Arc::new(StdoutScaler::new()),
        caches: vec![Arc::new(CountingCache::new())],
    };
    let controller = MonitorController::new(config, collaborators)?;
    MONITORED_APPS.set(controller.monitored_apps().len() as i64);

    let source = DataSource::from(source);
    let mut lines = input::open(input_path).await?.lines();
    let mut number = 0usize;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                number += 1;
                if !ingest(&controller, &line, number, &source).await {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                interrupted = true;
                break;
            }
        }
    }

    if !interrupted && !exit_on_eof {
        tracing::info!(lines = number, "Input exhausted, press Ctrl-C to stop");
        ctrl_c.await?;
    }

    tracing::info!(lines = number, "Shutting down");
    controller.shutdown().await;
    Ok(())
}

/// Hand one input line to the controller. Returns `false` once the
/// controller no longer accepts snapshots.
async fn ingest(
    controller: &MonitorController,
    line: &str,
    number: usize,
    source: &DataSource,
) -> bool {
    let snapshot = match input::parse_line(line, number) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return true,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping input line");
            return true;
        }
    };

    let app_id = snapshot.app_id.clone();
    match controller.process_app_instance_metrics(snapshot, source).await {
        Ok(()) => {
            SNAPSHOTS_INGESTED.inc();
            MONITORED_APPS.set(controller.monitored_apps().len() as i64);
            true
        }
        Err(TripwireError::ShutDown) => false,
        Err(e) => {
            tracing::error!(app_id = %app_id, error = %e, "Failed to ingest snapshot");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tripwire_core::memory::RecordingScaler;
    use tripwire_core::types::now_millis;
    use tripwire_core::{AppId, Config, EngineConfig, InstanceIndex, MetricFamily};

    #[tokio::test]
    async fn test_ingest_skips_bad_lines_and_feeds_monitor() {
        let config = ConfigLoader::load_string(
            r#"
triggers:
  - app_id: shop
    trigger_id: cpu-upper
    metric: cpu
    threshold_type: greater_than
    metric_threshold: 90
"#,
        )
        .unwrap();
        let config = Config {
            engine: EngineConfig::default().with_workers(1, 1),
            ..config
        };
        let collaborators = Collaborators {
            store: Arc::new(MemoryStore::new()),
            platform: Arc::new(StaticPlatform::new()),
            scaling: Arc::new(RecordingScaler::new()),
            caches: Vec::new(),
        };
        let controller = MonitorController::new(config, collaborators).unwrap();
        let source = DataSource::Poller;

        assert!(ingest(&controller, "not json", 1, &source).await);
        assert!(ingest(&controller, "", 2, &source).await);
        // Evaluation runs on the wall clock, so the reading must be fresh.
        let now = now_millis();
        let line = format!(
            r#"{{"app_id":"shop","timestamp":{now},"instance_metrics":[{{"instance_index":0,"metrics":[{{"compound_name":"cf-stats#CPU","value":0.5,"timestamp":{now}}}]}}]}}"#
        );
        assert!(ingest(&controller, &line, 3, &source).await);

        let monitor = controller
            .get_state_monitor(&AppId::new("shop").unwrap())
            .unwrap();
        let mut seen = 0;
        for _ in 0..100 {
            seen = monitor.sample_count(InstanceIndex::new(0), MetricFamily::Cpu);
            if seen == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen, 1);

        controller.shutdown().await;
        assert!(!ingest(&controller, &line, 4, &source).await);
    }

    #[tokio::test]
    async fn test_execute_exits_on_eof() {
        let mut config = tempfile::NamedTempFile::new().unwrap();
        config.write_all(b"engine:\n  evaluation_workers: 1\n  dispatch_workers: 1\n").unwrap();
        let mut input = tempfile::NamedTempFile::new().unwrap();
        writeln!(input, r#"{{"app_id":"shop"}}"#).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            execute(
                config.path().to_str().unwrap(),
                input.path().to_str().unwrap(),
                "poller",
                None,
                true,
            ),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
