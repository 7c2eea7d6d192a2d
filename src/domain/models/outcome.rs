//! Dispatch outcome returned to the host for every processed event.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::handler::HandlerId;
use super::serde_ext::duration_ms;
use crate::domain::errors::DispatchError;

/// Why a single handler invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureCause {
    /// The handler exceeded its own budget.
    Timeout { budget_ms: u64 },
    /// The pipeline-wide deadline expired while the handler was running.
    DeadlineExceeded,
    /// The handler returned an error.
    Execution { message: String },
    /// The handler panicked.
    Panicked { message: String },
}

impl FailureCause {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::DeadlineExceeded)
    }
}

impl From<&DispatchError> for FailureCause {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::Timeout { budget, .. } => Self::Timeout {
                budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
            },
            DispatchError::DeadlineExceeded { .. } => Self::DeadlineExceeded,
            DispatchError::HandlerExecution { message, .. } => Self::Execution {
                message: message.clone(),
            },
            DispatchError::HandlerPanicked { message, .. } => Self::Panicked {
                message: message.clone(),
            },
            other => Self::Execution {
                message: other.to_string(),
            },
        }
    }
}

/// Structured failure of one handler within a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub handler_id: HandlerId,
    pub cause: FailureCause,
    pub retryable: bool,
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub success: bool,
    #[serde(rename = "elapsed_ms", with = "duration_ms")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub errors: Vec<HandlerFailure>,
    pub served_from_cache: bool,
    /// Set when the circuit breaker short-circuited the dispatch.
    pub degraded: bool,
    pub fast_path: bool,
    pub handlers_invoked: Vec<HandlerId>,
    pub handlers_skipped: Vec<HandlerId>,
}

impl DispatchOutcome {
    /// Successful outcome for a dispatch that selected no handler.
    pub const fn empty(elapsed: Duration) -> Self {
        Self {
            success: true,
            elapsed,
            data: None,
            errors: Vec::new(),
            served_from_cache: false,
            degraded: false,
            fast_path: false,
            handlers_invoked: Vec::new(),
            handlers_skipped: Vec::new(),
        }
    }

    /// Fallback outcome returned while the circuit is open.
    pub fn degraded(elapsed: Duration) -> Self {
        let mut outcome = Self::empty(elapsed);
        outcome.degraded = true;
        outcome
    }

    /// Copy of a cached outcome, marked as served from cache.
    #[must_use]
    pub fn from_cache(cached: &Self, elapsed: Duration) -> Self {
        let mut outcome = cached.clone();
        outcome.served_from_cache = true;
        outcome.elapsed = elapsed;
        outcome
    }

    pub fn failure_for(&self, handler_id: &HandlerId) -> Option<&HandlerFailure> {
        self.errors.iter().find(|f| &f.handler_id == handler_id)
    }

    pub fn timed_out(&self) -> bool {
        self.errors.iter().any(|f| f.cause.is_timeout())
    }
}
