//! `hookgate dispatch`: run events from a file through the configured handlers.

use anyhow::{ensure, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

use super::read_events;
use crate::cli::output::{list_table, output, truncate, CommandOutput};
use crate::domain::models::{Config, DispatchOutcome, Event};
use crate::services::{Engine, MetricsSnapshot};

#[derive(Debug, Serialize)]
pub struct DispatchRecord {
    pub event_id: String,
    pub kind: String,
    pub phase: String,
    pub priority: String,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Serialize)]
pub struct DispatchOutput {
    pub dispatches: Vec<DispatchRecord>,
    pub metrics: MetricsSnapshot,
}

impl CommandOutput for DispatchOutput {
    fn to_human(&self) -> String {
        if self.dispatches.is_empty() {
            return "No events dispatched.".to_string();
        }

        let mut table = list_table(&[
            "kind", "phase", "priority", "result", "elapsed", "handlers", "errors",
        ]);
        for record in &self.dispatches {
            let outcome = &record.outcome;
            let result = if outcome.degraded {
                "degraded"
            } else if outcome.served_from_cache {
                "cached"
            } else if outcome.success {
                "ok"
            } else {
                "failed"
            };
            let errors = outcome
                .errors
                .iter()
                .map(|f| f.handler_id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            table.add_row(vec![
                record.kind.clone(),
                record.phase.clone(),
                record.priority.clone(),
                if outcome.fast_path {
                    format!("{result} (fast path)")
                } else {
                    result.to_string()
                },
                format!("{:.2}ms", outcome.elapsed.as_secs_f64() * 1000.0),
                outcome.handlers_invoked.len().to_string(),
                truncate(&errors, 40),
            ]);
        }

        let m = &self.metrics;
        let mut out = format!("{table}\n");
        let _ = write!(
            out,
            "\n{} dispatch(es): success {:.1}%, cache hits {}, degraded {}, \
             p50 {:.2}ms, p95 {:.2}ms, p99 {:.2}ms",
            m.total,
            m.success_rate * 100.0,
            m.cache_hits,
            m.degraded,
            m.p50_ms,
            m.p95_ms,
            m.p99_ms,
        );
        out
    }
}

/// Dispatch every event `repeat` times, sequentially or as batches.
pub async fn run(
    engine: &Engine,
    events: &[Event],
    repeat: u32,
    batch: bool,
) -> Result<Vec<DispatchRecord>> {
    let mut records = Vec::with_capacity(events.len() * repeat as usize);
    for _ in 0..repeat {
        let outcomes = if batch {
            engine.process_batch(events).await?
        } else {
            let mut outcomes = Vec::with_capacity(events.len());
            for event in events {
                outcomes.push(engine.process(event).await?);
            }
            outcomes
        };

        records.extend(events.iter().zip(outcomes).map(|(event, outcome)| DispatchRecord {
            event_id: event.id().to_string(),
            kind: event.kind().to_string(),
            phase: event.phase().to_string(),
            priority: event.priority().to_string(),
            outcome,
        }));
    }
    Ok(records)
}

pub async fn execute(
    config: Config,
    event_file: &Path,
    repeat: u32,
    batch: bool,
    json_mode: bool,
) -> Result<()> {
    ensure!(repeat > 0, "--repeat must be at least 1");
    let events = read_events(event_file)?;
    let engine = Engine::new(config)?;

    let dispatches = run(&engine, &events, repeat, batch).await?;
    output(
        &DispatchOutput {
            dispatches,
            metrics: engine.metrics().snapshot(),
        },
        json_mode,
    );
    engine.shutdown();
    Ok(())
}
