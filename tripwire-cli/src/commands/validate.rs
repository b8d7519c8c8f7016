// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `tripwire validate` command - Validate configuration file.

use tripwire_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            let engine = &config.engine;
            println!("✓ Configuration is valid");
            println!();
            println!("Engine Settings:");
            println!(
                "  Sample Retention:     {}s",
                engine.max_sample_retention.as_secs()
            );
            println!(
                "  Report Interval:      {}s (stale after {}s)",
                engine.report_interval.as_secs(),
                engine.stale_timeout().as_secs()
            );
            println!(
                "  Stale Purge Every:    {}s",
                engine.stale_purge_interval.as_secs()
            );
            println!(
                "  Cache Flush Every:    {}s",
                engine.cache_invalidation_interval.as_secs()
            );
            println!("  Queue Capacity:       {}", engine.ingestion_queue_capacity);
            println!(
                "  Workers:              {} evaluation, {} dispatch",
                engine.evaluation_workers(),
                engine.dispatch_workers()
            );
            println!();
            println!("Triggers ({}):", config.triggers.len());
            for trigger in &config.triggers {
                println!(
                    "  - {}/{} ({} {} {} {}, {} over {}s, breach {}s)",
                    trigger.app_id,
                    trigger.trigger_id,
                    trigger.metric,
                    trigger.threshold_type,
                    trigger.metric_threshold,
                    trigger.unit,
                    trigger.stat_type,
                    trigger.stat_window_secs,
                    trigger.breach_duration_secs
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
