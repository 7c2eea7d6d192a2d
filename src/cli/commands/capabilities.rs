//! `hookgate capabilities`: print the capability report.

use anyhow::Result;
use serde::Serialize;
use std::fmt::Write as _;

use crate::cli::output::{list_table, output, CommandOutput};
use crate::domain::models::Config;
use crate::services::{CapabilityReport, Engine};

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct CapabilitiesOutput(pub CapabilityReport);

impl CommandOutput for CapabilitiesOutput {
    fn to_human(&self) -> String {
        let report = &self.0;
        let mut out = format!(
            "hookgate {}\n  handlers: {}\n  pipeline timeout: {}ms\n  fast-path timeout: {}ms\n\
             \x20 cache: {}\n  circuit breaker: {}\n  target success rate: {:.1}%\n",
            report.version,
            report.handler_count,
            report.pipeline_timeout_ms,
            report.fast_path_timeout_ms,
            if report.cache_enabled { "enabled" } else { "disabled" },
            if report.breaker_enabled { "enabled" } else { "disabled" },
            report.target_success_rate * 100.0,
        );
        if report.selectors.is_empty() {
            out.push_str("\nNo handlers registered.");
            return out;
        }

        let mut table = list_table(&["kind", "phase", "handlers", "fast path", "max latency"]);
        for selector in &report.selectors {
            table.add_row(vec![
                selector.kind.to_string(),
                selector.phase.to_string(),
                selector
                    .handlers
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                if selector.fast_path { "yes" } else { "no" }.to_string(),
                format!("{}ms", selector.max_latency_ms),
            ]);
        }
        let _ = write!(out, "\n{table}");
        out
    }
}

pub fn execute(config: Config, json_mode: bool) -> Result<()> {
    let engine = Engine::new(config)?;
    output(&CapabilitiesOutput(engine.capabilities()), json_mode);
    engine.shutdown();
    Ok(())
}
