pub mod config;
pub mod event;
pub mod handler;
pub mod outcome;
pub mod serde_ext;

pub use config::{
    BreakerConfig, BreakerScope, CacheConfig, Config, DispatcherConfig, FastPathConfig,
    HandlerAction, HandlerConfig, HealthConfig, LoggingConfig, MetricsConfig, NoticesConfig,
};
pub use event::{Event, EventKind, Fingerprint, Payload, Phase, Priority, WILDCARD};
pub use handler::{
    HandlerContext, HandlerDescriptor, HandlerError, HandlerId, HandlerOutput, PhaseSelector,
    Selector,
};
pub use outcome::{DispatchOutcome, FailureCause, HandlerFailure};
