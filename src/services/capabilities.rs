//! Capability contract advertised to protocol adapters.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::domain::models::{Config, EventKind, HandlerId, Phase, Priority};
use crate::services::handler_registry::HandlerRegistry;

/// What the engine offers for one `(kind, phase)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorCapability {
    /// Event kind, `*` for handlers that apply to every kind.
    pub kind: EventKind,
    pub phase: Phase,
    /// Enabled handlers a dispatch for this pair would select, sorted by id.
    pub handlers: Vec<HandlerId>,
    /// Whether critical events for this pair have a fast-path handler.
    pub fast_path: bool,
    /// Latency bound: the fast-path budget when a fast path exists, else the pipeline bound.
    pub max_latency_ms: u64,
    /// Latency bound for non-critical events: the smaller of the pipeline ceiling and the
    /// sum of stage budgets.
    pub pipeline_latency_ms: u64,
}

/// Capability report for the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityReport {
    pub version: String,
    pub target_success_rate: f64,
    pub pipeline_timeout_ms: u64,
    pub fast_path_timeout_ms: u64,
    pub cache_enabled: bool,
    pub breaker_enabled: bool,
    pub handler_count: usize,
    pub selectors: Vec<SelectorCapability>,
}

/// Describe what the registered handlers offer under `config`.
pub fn describe(registry: &HandlerRegistry, config: &Config) -> CapabilityReport {
    let descriptors = registry.descriptors();
    let pairs: BTreeSet<(EventKind, Phase)> = descriptors
        .iter()
        .filter(|d| d.enabled)
        .flat_map(|d| {
            d.selector
                .phase
                .phases()
                .into_iter()
                .map(|phase| (d.selector.kind.clone(), phase))
        })
        .collect();

    let pipeline_ceiling = config.dispatcher.pipeline_timeout_ms;
    let selectors = pairs
        .into_iter()
        .map(|(kind, phase)| {
            let selected = registry.select(&kind, phase, None);
            let fast_path = selected
                .iter()
                .any(|h| h.descriptor().priority_class == Priority::Critical);
            let pipeline_latency_ms = registry.order(&selected).map_or(pipeline_ceiling, |plan| {
                let budget = u64::try_from(plan.budget().as_millis()).unwrap_or(u64::MAX);
                budget.min(pipeline_ceiling)
            });

            SelectorCapability {
                handlers: selected.iter().map(|h| h.id().clone()).collect(),
                fast_path,
                max_latency_ms: if fast_path {
                    config.fast_path.timeout_ms
                } else {
                    pipeline_latency_ms
                },
                pipeline_latency_ms,
                kind,
                phase,
            }
        })
        .collect();

    CapabilityReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        target_success_rate: config.health.target_success_rate,
        pipeline_timeout_ms: pipeline_ceiling,
        fast_path_timeout_ms: config.fast_path.timeout_ms,
        cache_enabled: config.cache.enabled,
        breaker_enabled: config.breaker.enabled,
        handler_count: descriptors.len(),
        selectors,
    }
}
