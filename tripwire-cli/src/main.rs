// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Tripwire CLI
//!
//! Command-line interface for the tripwire trigger evaluation engine.

use clap::{Parser, Subcommand};

mod commands;
mod input;
mod metrics;
mod scaler;

/// Tripwire - metric-driven autoscaling trigger engine
#[derive(Parser)]
#[command(name = "tripwire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tripwire.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine in the foreground, reading snapshots as JSON lines
    Up {
        /// Snapshot input file, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Data source the snapshots come from
        #[arg(short, long, default_value = "poller")]
        source: String,

        /// Serve Prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,

        /// Stop once the input is exhausted instead of waiting for Ctrl-C
        #[arg(long)]
        exit_on_eof: bool,
    },

    /// Replay recorded snapshots offline and print the events they fire
    Replay {
        /// Path to the recorded snapshots (JSON lines)
        file: String,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Up {
            input,
            source,
            metrics_port,
            exit_on_eof,
        } => commands::up::execute(&cli.config, &input, &source, metrics_port, exit_on_eof).await,
        Commands::Replay { file } => commands::replay::execute(&cli.config, &file).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
