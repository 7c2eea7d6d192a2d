//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hookgate")]
#[command(about = "Hookgate - bounded-latency event hook dispatcher", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to .hookgate/config.yaml and .hookgate/local.yaml)
    #[arg(short, long, global = true, env = "HOOKGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration and the declared handler graph
    Validate,

    /// Show what the configured handlers offer per kind and phase
    Capabilities,

    /// Dispatch events read from a JSON file through the configured handlers
    Dispatch {
        /// File holding one event object or an array of events
        #[arg(short, long)]
        event: PathBuf,

        /// Dispatch the events this many times
        #[arg(short, long, default_value = "1")]
        repeat: u32,

        /// Dispatch arrays with `process_batch` instead of one at a time
        #[arg(short, long)]
        batch: bool,
    },

    /// Dispatch events, then print the resulting health report
    Health {
        /// Optional file of events to dispatch before evaluating health
        #[arg(short, long)]
        event: Option<PathBuf>,
    },
}
