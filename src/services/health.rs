//! Health verdict combining metrics, breaker states and cache statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::models::HealthConfig;
use crate::services::circuit_breaker::{BreakerSet, CircuitScope, CircuitState, CircuitStats};
use crate::services::metrics::{MetricsAccumulator, MetricsSnapshot};
use crate::services::result_cache::{CacheStats, ResultCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Why the status is not healthy.
    pub reasons: Vec<String>,
    pub metrics: MetricsSnapshot,
    pub breakers: Vec<CircuitStats>,
    pub cache: CacheStats,
    pub checked_at: DateTime<Utc>,
}

/// Evaluate engine health.
///
/// Unhealthy when the error rate exceeds `max_error_rate` or the global breaker is
/// open. Degraded when any breaker is not closed or the success rate is below target.
/// With no dispatch recorded yet only breaker states count.
pub fn check(
    metrics: &MetricsAccumulator,
    breakers: &BreakerSet,
    cache: &ResultCache,
    config: &HealthConfig,
) -> HealthReport {
    let snapshot = metrics.snapshot();
    let breaker_stats = breakers.stats();
    let mut status = HealthStatus::Healthy;
    let mut reasons = Vec::new();

    if snapshot.total > 0 {
        if snapshot.error_rate > config.max_error_rate {
            status = status.max(HealthStatus::Unhealthy);
            reasons.push(format!(
                "error rate {:.3} above {:.3}",
                snapshot.error_rate, config.max_error_rate
            ));
        } else if snapshot.success_rate < config.target_success_rate {
            status = status.max(HealthStatus::Degraded);
            reasons.push(format!(
                "success rate {:.3} below target {:.3}",
                snapshot.success_rate, config.target_success_rate
            ));
        }
    }

    for stats in &breaker_stats {
        if stats.state == CircuitState::Closed {
            continue;
        }
        let severity = if stats.scope == CircuitScope::Global && stats.state == CircuitState::Open
        {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        status = status.max(severity);
        reasons.push(format!("circuit {} is {}", stats.scope, stats.state));
    }

    HealthReport {
        status,
        reasons,
        metrics: snapshot,
        breakers: breaker_stats,
        cache: cache.stats(),
        checked_at: Utc::now(),
    }
}
