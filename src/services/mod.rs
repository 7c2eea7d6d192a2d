//! Service layer: the registry, cache, breaker, dispatcher and their supporting pieces.

pub mod builtin_handlers;
pub mod capabilities;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod engine;
pub mod handler_registry;
pub mod health;
pub mod metrics;
pub mod notices;
pub mod result_cache;

pub use capabilities::{CapabilityReport, SelectorCapability};
pub use circuit_breaker::{
    Admission, BreakerSet, CircuitBreaker, CircuitScope, CircuitState, CircuitStats,
};
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use handler_registry::{ExecutionPlan, HandlerRegistry, RegisteredHandler, Stage};
pub use health::{HealthReport, HealthStatus};
pub use metrics::{MetricsAccumulator, MetricsSnapshot};
pub use notices::{Notice, NoticeBus, NoticeEnvelope};
pub use result_cache::{CachePolicy, CacheStats, ResultCache};
