//! Rolling dispatch statistics.
//!
//! Counters are plain atomics so recording never contends with readers. Only the latency
//! window and the EWMA share a short mutex.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::models::{DispatchOutcome, MetricsConfig, Priority};

/// Point-in-time view of the accumulated metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub successes: u64,
    pub errors: u64,
    /// Zero until the first dispatch is recorded.
    pub success_rate: f64,
    pub error_rate: f64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub degraded: u64,
    pub fast_path: u64,
    pub ewma_ms: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub by_priority: BTreeMap<String, u64>,
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
    ewma: Option<f64>,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            ewma: None,
        }
    }

    fn push(&mut self, micros: u64, alpha: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(micros);

        let sample = micros as f64;
        self.ewma = Some(match self.ewma {
            Some(previous) => alpha.mul_add(sample, (1.0 - alpha) * previous),
            None => sample,
        });
    }

    /// Nearest-rank percentiles for each of `quantiles`, in microseconds.
    fn percentiles<const N: usize>(&self, quantiles: [f64; N]) -> [f64; N] {
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        quantiles.map(|q| percentile(&sorted, q))
    }
}

fn percentile(sorted: &[u64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index] as f64
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn ms(micros: f64) -> f64 {
    micros / 1000.0
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Accumulates per-dispatch latency and outcome counters.
#[derive(Debug)]
pub struct MetricsAccumulator {
    total: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    degraded: AtomicU64,
    fast_path: AtomicU64,
    by_priority: [AtomicU64; 4],
    total_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
    latencies: Mutex<LatencyWindow>,
    ewma_alpha: f64,
    started_at: Instant,
}

impl MetricsAccumulator {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            fast_path: AtomicU64::new(0),
            by_priority: Default::default(),
            total_micros: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
            latencies: Mutex::new(LatencyWindow::new(config.latency_window.max(1))),
            ewma_alpha: config.ewma_alpha.clamp(f64::EPSILON, 1.0),
            started_at: Instant::now(),
        }
    }

    /// Record one dispatch.
    pub fn record(&self, elapsed: Duration, success: bool, cache_hit: bool, priority: Priority) {
        let us = micros(elapsed);

        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.by_priority[priority.index()].fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(us, Ordering::Relaxed);
        self.min_micros.fetch_min(us, Ordering::Relaxed);
        self.max_micros.fetch_max(us, Ordering::Relaxed);

        self.latencies.lock().push(us, self.ewma_alpha);
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fast_path(&self) {
        self.fast_path.fetch_add(1, Ordering::Relaxed);
    }

    /// Record everything an outcome says about its dispatch.
    pub fn record_outcome(&self, outcome: &DispatchOutcome, priority: Priority) {
        self.record(
            outcome.elapsed,
            outcome.success,
            outcome.served_from_cache,
            priority,
        );
        if outcome.degraded {
            self.record_degraded();
        }
        if outcome.fast_path {
            self.record_fast_path();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let total_micros = self.total_micros.load(Ordering::Relaxed);
        let min_micros = self.min_micros.load(Ordering::Relaxed);

        let (ewma, [p50, p95, p99]) = {
            let window = self.latencies.lock();
            (window.ewma.unwrap_or(0.0), window.percentiles([0.50, 0.95, 0.99]))
        };

        let by_priority = Priority::ALL
            .iter()
            .map(|p| {
                (
                    p.as_str().to_string(),
                    self.by_priority[p.index()].load(Ordering::Relaxed),
                )
            })
            .collect();

        MetricsSnapshot {
            total,
            successes,
            errors,
            success_rate: ratio(successes, total),
            error_rate: ratio(errors, total),
            cache_hits,
            cache_hit_rate: ratio(cache_hits, total),
            degraded: self.degraded.load(Ordering::Relaxed),
            fast_path: self.fast_path.load(Ordering::Relaxed),
            ewma_ms: ms(ewma),
            mean_ms: if total == 0 {
                0.0
            } else {
                ms(total_micros as f64 / total as f64)
            },
            min_ms: if min_micros == u64::MAX {
                0.0
            } else {
                ms(min_micros as f64)
            },
            max_ms: ms(self.max_micros.load(Ordering::Relaxed) as f64),
            p50_ms: ms(p50),
            p95_ms: ms(p95),
            p99_ms: ms(p99),
            by_priority,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.total,
            &self.successes,
            &self.errors,
            &self.cache_hits,
            &self.degraded,
            &self.fast_path,
            &self.total_micros,
            &self.max_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.by_priority {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_micros.store(u64::MAX, Ordering::Relaxed);

        let mut window = self.latencies.lock();
        window.samples.clear();
        window.ewma = None;
    }
}

impl Default for MetricsAccumulator {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}
