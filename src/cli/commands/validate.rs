//! `hookgate validate`: check configuration and the handler dependency graph.

use anyhow::Result;
use serde::Serialize;
use std::fmt::Write as _;

use crate::cli::output::{list_table, output, truncate, CommandOutput};
use crate::domain::models::Config;
use crate::services::Engine;

#[derive(Debug, Serialize)]
pub struct SelectorPlan {
    pub kind: String,
    pub phase: String,
    /// Handler ids per stage, in execution order.
    pub stages: Vec<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ValidateOutput {
    pub valid: bool,
    pub handler_count: usize,
    pub plans: Vec<SelectorPlan>,
}

impl CommandOutput for ValidateOutput {
    fn to_human(&self) -> String {
        let mut out = format!(
            "Configuration is valid: {} handler(s), {} selector(s).\n",
            self.handler_count,
            self.plans.len()
        );
        if self.plans.is_empty() {
            return out;
        }

        let mut table = list_table(&["kind", "phase", "stages"]);
        for plan in &self.plans {
            let stages = plan
                .stages
                .iter()
                .map(|stage| stage.join(", "))
                .collect::<Vec<_>>()
                .join(" -> ");
            table.add_row(vec![
                plan.kind.clone(),
                plan.phase.clone(),
                truncate(&stages, 80),
            ]);
        }
        let _ = write!(out, "{table}");
        out
    }
}

pub fn execute(config: Config, json_mode: bool) -> Result<()> {
    let engine = Engine::new(config)?;
    let registry = engine.registry();
    let report = engine.capabilities();

    let mut plans = Vec::with_capacity(report.selectors.len());
    for selector in &report.selectors {
        let selected = registry.select(&selector.kind, selector.phase, None);
        let plan = registry.order(&selected)?;
        plans.push(SelectorPlan {
            kind: selector.kind.to_string(),
            phase: selector.phase.to_string(),
            stages: plan
                .stages()
                .iter()
                .map(|stage| stage.handlers().iter().map(|h| h.id().to_string()).collect())
                .collect(),
        });
    }

    output(
        &ValidateOutput {
            valid: true,
            handler_count: report.handler_count,
            plans,
        },
        json_mode,
    );
    engine.shutdown();
    Ok(())
}
