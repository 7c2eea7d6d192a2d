//! Hookgate - bounded-latency event hook dispatcher
//!
//! Hookgate routes lifecycle events to registered handlers. Critical events take a
//! single-handler fast path with a hard time cap; everything else runs through a
//! pipeline that orders handlers by dependency, runs independent handlers
//! concurrently, serves repeat read-only events from a TTL cache and sheds load
//! through a circuit breaker when handlers keep failing.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): events, handler descriptors, outcomes, configuration
//!   and the [`Handler`] port
//! - **Service Layer** (`services`): registry, cache, breaker, dispatcher, metrics and
//!   the [`Engine`] that wires them together
//! - **Infrastructure Layer** (`infrastructure`): configuration loading and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use hookgate::{Config, Engine, Event, Phase};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::new(Config::default())?;
//!     let outcome = engine.process(&Event::new("pre-edit", Phase::Before, "edit")).await?;
//!     assert!(outcome.success);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::models::{
    Config, DispatchOutcome, Event, EventKind, FailureCause, HandlerConfig, HandlerContext,
    HandlerDescriptor, HandlerError, HandlerFailure, HandlerId, HandlerOutput, Payload, Phase,
    PhaseSelector, Priority, Selector,
};
pub use domain::ports::Handler;
pub use domain::{DispatchError, DispatchResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    CapabilityReport, Dispatcher, Engine, HandlerRegistry, HealthReport, HealthStatus,
    MetricsSnapshot, NoticeEnvelope,
};
