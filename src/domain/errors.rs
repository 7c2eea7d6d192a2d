//! Domain errors for the hookgate dispatch engine.

use std::time::Duration;

use thiserror::Error;

use crate::domain::models::HandlerId;

/// Format a dependency cycle as a human-readable string: `a -> b -> c -> a`.
fn format_cycle_path(path: &[HandlerId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors raised by the registry, the dispatcher and configuration loading.
///
/// Handler-level variants are converted into a
/// [`FailureCause`](crate::domain::models::FailureCause) and recorded in the
/// [`DispatchOutcome`](crate::domain::models::DispatchOutcome); `CircuitOpen` becomes a
/// degraded outcome. Only `InvalidEvent` and `PipelineFatal` propagate to callers of
/// the dispatch API.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Handler already registered: {0}")]
    DuplicateId(HandlerId),

    #[error("Handler dependency cycle detected: {}", format_cycle_path(.path))]
    CyclicDependency { path: Vec<HandlerId> },

    #[error("Fast-path handler {0} must not declare dependencies")]
    FastPathDependency(HandlerId),

    #[error("Handler not found: {0}")]
    HandlerNotFound(HandlerId),

    #[error("Handler {handler} timed out after {}ms", .budget.as_millis())]
    Timeout { handler: HandlerId, budget: Duration },

    #[error("Handler {handler} cut off by the pipeline deadline")]
    DeadlineExceeded { handler: HandlerId },

    #[error("Handler {handler} failed: {message}")]
    HandlerExecution { handler: HandlerId, message: String },

    #[error("Handler {handler} panicked: {message}")]
    HandlerPanicked { handler: HandlerId, message: String },

    #[error("Circuit open, retry after {}ms", .retry_after.as_millis())]
    CircuitOpen { retry_after: Duration },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Pipeline fatal error: {0}")]
    PipelineFatal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Whether this error is one of the classes that propagate out of `process`.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidEvent(_) | Self::PipelineFatal(_))
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
