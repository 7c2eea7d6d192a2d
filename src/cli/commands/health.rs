//! `hookgate health`: evaluate engine health, optionally after dispatching events.

use anyhow::Result;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

use super::{dispatch, read_events};
use crate::cli::output::{list_table, output, CommandOutput};
use crate::domain::models::Config;
use crate::services::{Engine, HealthReport};

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct HealthOutput(pub HealthReport);

impl CommandOutput for HealthOutput {
    fn to_human(&self) -> String {
        let report = &self.0;
        let mut out = format!("Status: {}\n", report.status.as_str());
        for reason in &report.reasons {
            let _ = writeln!(out, "  - {reason}");
        }
        let _ = writeln!(
            out,
            "Dispatches: {} (success {:.1}%, error {:.1}%), cache entries: {}, hit rate {:.1}%",
            report.metrics.total,
            report.metrics.success_rate * 100.0,
            report.metrics.error_rate * 100.0,
            report.cache.entries,
            report.cache.hit_rate() * 100.0,
        );

        if !report.breakers.is_empty() {
            let mut table = list_table(&["circuit", "state", "failure ratio", "trips"]);
            for stats in &report.breakers {
                table.add_row(vec![
                    stats.scope.to_string(),
                    stats.state.to_string(),
                    format!("{:.2}", stats.failure_ratio),
                    stats.total_trips.to_string(),
                ]);
            }
            let _ = write!(out, "{table}");
        }
        out
    }
}

pub async fn execute(config: Config, event_file: Option<&Path>, json_mode: bool) -> Result<()> {
    let events = match event_file {
        Some(path) => read_events(path)?,
        None => Vec::new(),
    };
    let engine = Engine::new(config)?;
    dispatch::run(&engine, &events, 1, false).await?;

    output(&HealthOutput(engine.health()), json_mode);
    engine.shutdown();
    Ok(())
}
