use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::event::{EventKind, Priority};
use super::handler::{HandlerDescriptor, HandlerId, PhaseSelector, Selector};

/// Main configuration structure for hookgate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Full-pipeline settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Fast-path settings for critical events
    #[serde(default)]
    pub fast_path: FastPathConfig,

    /// Result cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Metrics accumulator configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Health thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Notice bus configuration
    #[serde(default)]
    pub notices: NoticesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Built-in handlers declared in configuration
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

/// Full-pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DispatcherConfig {
    /// Pipeline-wide ceiling for one `process` call, in milliseconds
    #[serde(default = "default_pipeline_timeout_ms")]
    pub pipeline_timeout_ms: u64,

    /// Maximum events dispatched concurrently by `process_batch`
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

const fn default_pipeline_timeout_ms() -> u64 {
    50
}

const fn default_batch_concurrency() -> usize {
    32
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pipeline_timeout_ms: default_pipeline_timeout_ms(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl DispatcherConfig {
    pub const fn pipeline_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_timeout_ms)
    }
}

/// Fast-path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FastPathConfig {
    /// Budget for a critical event, in milliseconds
    #[serde(default = "default_fast_path_timeout_ms")]
    pub timeout_ms: u64,

    /// Run the full pipeline when no fast-path handler matches a critical event
    #[serde(default)]
    pub fallback_to_pipeline: bool,
}

const fn default_fast_path_timeout_ms() -> u64 {
    20
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_fast_path_timeout_ms(),
            fallback_to_pipeline: false,
        }
    }
}

impl FastPathConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// TTL applied when no per-kind override exists, in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Upper bound on stored entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Interval of the background sweep, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Treat medium and low priority events as cacheable
    #[serde(default)]
    pub cache_low_priority: bool,

    /// Read-like operations whose events are cacheable
    #[serde(default = "default_read_operations")]
    pub read_operations: BTreeSet<String>,

    /// Per-kind TTL overrides, in milliseconds
    #[serde(default)]
    pub ttl_overrides_ms: HashMap<String, u64>,
}

const fn default_true() -> bool {
    true
}

const fn default_ttl_ms() -> u64 {
    5000
}

const fn default_max_entries() -> usize {
    10_000
}

const fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_read_operations() -> BTreeSet<String> {
    ["read", "view", "list", "search", "status"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_ms: default_ttl_ms(),
            max_entries: default_max_entries(),
            sweep_interval_ms: default_sweep_interval_ms(),
            cache_low_priority: false,
            read_operations: default_read_operations(),
            ttl_overrides_ms: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// TTL for events of the given kind.
    pub fn ttl_for(&self, kind: &EventKind) -> Duration {
        let ms = self
            .ttl_overrides_ms
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_ttl_ms);
        Duration::from_millis(ms)
    }
}

/// Granularity at which circuit breakers are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    /// One breaker shared by every dispatch
    #[default]
    Global,
    /// One breaker per `(kind, phase)` pair
    Selector,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub scope: BreakerScope,

    /// Number of most recent outcomes kept in the rolling window
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Outcomes required in the window before the breaker may trip
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: usize,

    /// Outcomes older than this are dropped from the window, in milliseconds
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,

    /// Trip when the failure ratio exceeds this value (0.0 - 1.0)
    #[serde(default = "default_failure_ratio_threshold")]
    pub failure_ratio_threshold: f64,

    /// Initial open duration, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Cool-down growth factor applied on consecutive trips
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Cool-down ceiling, in milliseconds
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

const fn default_window_size() -> usize {
    20
}

const fn default_minimum_calls() -> usize {
    10
}

const fn default_window_duration_ms() -> u64 {
    60_000
}

const fn default_failure_ratio_threshold() -> f64 {
    0.5
}

const fn default_cooldown_ms() -> u64 {
    5000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_cooldown_ms() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: BreakerScope::default(),
            window_size: default_window_size(),
            minimum_calls: default_minimum_calls(),
            window_duration_ms: default_window_duration_ms(),
            failure_ratio_threshold: default_failure_ratio_threshold(),
            cooldown_ms: default_cooldown_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    pub const fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    /// Cool-down after the `consecutive_opens`-th trip in a row (1-based).
    pub fn cooldown_for(&self, consecutive_opens: u32) -> Duration {
        let exponent = i32::try_from(consecutive_opens.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.cooldown_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_cooldown_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Metrics accumulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricsConfig {
    /// Number of recent latencies kept for percentiles
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,

    /// Smoothing factor of the exponentially weighted latency average
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
}

const fn default_latency_window() -> usize {
    1024
}

const fn default_ewma_alpha() -> f64 {
    0.2
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_window: default_latency_window(),
            ewma_alpha: default_ewma_alpha(),
        }
    }
}

/// Health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthConfig {
    /// Success rate advertised to protocol adapters and required for a healthy verdict
    #[serde(default = "default_target_success_rate")]
    pub target_success_rate: f64,

    /// Error rate above which the engine reports itself unhealthy
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

const fn default_target_success_rate() -> f64 {
    0.95
}

const fn default_max_error_rate() -> f64 {
    0.25
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            target_success_rate: default_target_success_rate(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

/// Notice bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NoticesConfig {
    /// Buffered notices per subscriber before the slowest one starts lagging
    #[serde(default = "default_notice_capacity")]
    pub capacity: usize,
}

const fn default_notice_capacity() -> usize {
    256
}

impl Default for NoticesConfig {
    fn default() -> Self {
        Self {
            capacity: default_notice_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files (stdout only when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Rotation for file output: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Action performed by a configuration-declared handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerAction {
    /// Log a message
    LogMessage {
        #[serde(default = "default_log_level")]
        level: String,
        message: String,
    },

    /// Run an external command
    RunScript {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },

    /// Always fail with the given reason
    Block { reason: String },

    /// Return static data
    Respond { data: serde_json::Value },
}

/// Handler declared in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HandlerConfig {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Event kind, `*` for every kind
    pub kind: String,

    #[serde(default)]
    pub phase: PhaseSelector,

    #[serde(default = "default_priority_class")]
    pub priority_class: Priority,

    #[serde(default = "default_rank")]
    pub rank: u8,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default = "default_handler_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_true")]
    pub parallelizable: bool,

    #[serde(default = "default_true")]
    pub fallback: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub action: HandlerAction,
}

const fn default_priority_class() -> Priority {
    Priority::Low
}

const fn default_rank() -> u8 {
    5
}

const fn default_handler_timeout_ms() -> u64 {
    10
}

impl HandlerConfig {
    /// Registration descriptor for this declaration.
    pub fn descriptor(&self) -> HandlerDescriptor {
        let mut descriptor =
            HandlerDescriptor::new(self.id.as_str(), Selector::new(self.kind.as_str(), self.phase))
                .priority_class(self.priority_class)
                .rank(self.rank)
                .timeout(Duration::from_millis(self.timeout_ms))
                .parallelizable(self.parallelizable)
                .enabled(self.enabled);
        descriptor.fallback = self.fallback;
        descriptor.depends_on = self
            .depends_on
            .iter()
            .map(|id| HandlerId::new(id.as_str()))
            .collect();
        descriptor.description = self.description.clone();
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_backoff() {
        let config = BreakerConfig {
            cooldown_ms: 100,
            backoff_multiplier: 2.0,
            max_cooldown_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.cooldown_for(1), Duration::from_millis(100));
        assert_eq!(config.cooldown_for(2), Duration::from_millis(200));
        assert_eq!(config.cooldown_for(3), Duration::from_millis(400));
        assert_eq!(config.cooldown_for(4), Duration::from_millis(500));
    }

    #[test]
    fn test_ttl_override() {
        let mut config = CacheConfig::default();
        config.ttl_overrides_ms.insert("status".to_string(), 250);
        assert_eq!(config.ttl_for(&EventKind::from("status")), Duration::from_millis(250));
        assert_eq!(config.ttl_for(&EventKind::from("pre-edit")), Duration::from_millis(5000));
    }

    #[test]
    fn test_handler_config_descriptor() {
        let yaml = r"
id: lint
kind: post-edit
phase: after
depends_on: [format]
fallback: false
timeout_ms: 30
action:
  type: run_script
  command: cargo
  args: [clippy]
";
        let config: HandlerConfig = serde_yaml::from_str(yaml).unwrap();
        let descriptor = config.descriptor();
        assert_eq!(descriptor.id.as_str(), "lint");
        assert_eq!(descriptor.selector.phase, PhaseSelector::After);
        assert!(descriptor.depends_on.contains(&HandlerId::from("format")));
        assert!(!descriptor.fallback);
        assert_eq!(descriptor.timeout, Duration::from_millis(30));
        assert_eq!(descriptor.priority_class, Priority::Low);
        assert!(matches!(config.action, HandlerAction::RunScript { .. }));
    }
}
