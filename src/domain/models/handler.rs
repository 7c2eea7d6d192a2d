//! Handler domain models.
//!
//! A handler is described by a [`HandlerDescriptor`]: which events it applies to, its
//! fast-path eligibility, its dependencies and its time budget. The executable side lives
//! behind the [`Handler`](crate::domain::ports::Handler) port.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::event::{EventKind, Phase, Priority};
use super::serde_ext::duration_ms;

const DEFAULT_RANK: u8 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10);

/// Unique, stable handler identifier. Ordering is used as the deterministic tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HandlerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for HandlerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phase side of a selector. `Any` matches both phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseSelector {
    Before,
    After,
    #[default]
    Any,
}

impl PhaseSelector {
    pub const fn matches(self, phase: Phase) -> bool {
        matches!(
            (self, phase),
            (Self::Any, _) | (Self::Before, Phase::Before) | (Self::After, Phase::After)
        )
    }

    /// Whether some phase is matched by both selectors.
    pub const fn overlaps(self, other: Self) -> bool {
        matches!(
            (self, other),
            (Self::Any, _)
                | (_, Self::Any)
                | (Self::Before, Self::Before)
                | (Self::After, Self::After)
        )
    }

    /// Concrete phases this selector covers.
    pub fn phases(self) -> Vec<Phase> {
        match self {
            Self::Before => vec![Phase::Before],
            Self::After => vec![Phase::After],
            Self::Any => vec![Phase::Before, Phase::After],
        }
    }
}

impl From<Phase> for PhaseSelector {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Before => Self::Before,
            Phase::After => Self::After,
        }
    }
}

/// The `(kind, phase)` pair a handler applies to, wildcard-aware.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Selector {
    pub kind: EventKind,
    #[serde(default)]
    pub phase: PhaseSelector,
}

impl Selector {
    pub fn new(kind: impl Into<EventKind>, phase: impl Into<PhaseSelector>) -> Self {
        Self {
            kind: kind.into(),
            phase: phase.into(),
        }
    }

    /// Selector matching every event.
    pub fn any() -> Self {
        Self::new(super::event::WILDCARD, PhaseSelector::Any)
    }

    pub fn matches(&self, kind: &EventKind, phase: Phase) -> bool {
        self.kind.matches(kind) && self.phase.matches(phase)
    }

    /// Whether at least one concrete event would be matched by both selectors.
    pub fn overlaps(&self, other: &Self) -> bool {
        let kinds_overlap =
            self.kind.is_wildcard() || other.kind.is_wildcard() || self.kind == other.kind;
        kinds_overlap && self.phase.overlaps(other.phase)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            PhaseSelector::Before => "before",
            PhaseSelector::After => "after",
            PhaseSelector::Any => "*",
        };
        write!(f, "{}/{}", self.kind, phase)
    }
}

/// Registration record describing a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub id: HandlerId,
    pub selector: Selector,
    /// Minimum event priority this handler serves on the fast path.
    pub priority_class: Priority,
    /// Fast-path preference, higher first.
    pub rank: u8,
    pub depends_on: BTreeSet<HandlerId>,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub parallelizable: bool,
    /// When false, a failure skips every handler that depends on this one.
    pub fallback: bool,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HandlerDescriptor {
    pub fn new(id: impl Into<HandlerId>, selector: Selector) -> Self {
        Self {
            id: id.into(),
            selector,
            priority_class: Priority::Low,
            rank: DEFAULT_RANK,
            depends_on: BTreeSet::new(),
            timeout: DEFAULT_TIMEOUT,
            parallelizable: true,
            fallback: true,
            enabled: true,
            description: None,
        }
    }

    #[must_use]
    pub const fn priority_class(mut self, priority: Priority) -> Self {
        self.priority_class = priority;
        self
    }

    #[must_use]
    pub const fn rank(mut self, rank: u8) -> Self {
        self.rank = rank;
        self
    }

    #[must_use]
    pub fn depends_on(mut self, id: impl Into<HandlerId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn parallelizable(mut self, parallelizable: bool) -> Self {
        self.parallelizable = parallelizable;
        self
    }

    /// Mark the handler non-fallback: its failure skips its dependents.
    #[must_use]
    pub const fn non_fallback(mut self) -> Self {
        self.fallback = false;
        self
    }

    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_fast_path(&self) -> bool {
        self.priority_class == Priority::Critical
    }
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Id of the dispatch this invocation belongs to.
    pub dispatch_id: Uuid,
    /// The instant after which the dispatcher stops waiting for this handler.
    pub deadline: tokio::time::Instant,
    /// Deadline of the whole dispatch; never earlier than `deadline`.
    pub pipeline_deadline: tokio::time::Instant,
    pub fast_path: bool,
}

impl HandlerContext {
    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .saturating_duration_since(tokio::time::Instant::now())
    }
}

/// Successful handler return value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl HandlerOutput {
    pub const fn empty() -> Self {
        Self { data: None }
    }

    pub fn with_data(data: impl Into<Value>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_matching() {
        let exact = Selector::new("pre-edit", Phase::Before);
        assert!(exact.matches(&EventKind::from("pre-edit"), Phase::Before));
        assert!(!exact.matches(&EventKind::from("pre-edit"), Phase::After));
        assert!(!exact.matches(&EventKind::from("post-edit"), Phase::Before));

        let any = Selector::any();
        assert!(any.matches(&EventKind::from("whatever"), Phase::After));
    }

    #[test]
    fn test_selector_overlap() {
        let a = Selector::new("pre-edit", Phase::Before);
        let b = Selector::new("pre-edit", PhaseSelector::Any);
        let c = Selector::new("post-edit", Phase::Before);
        let d = Selector::new("*", Phase::After);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&d));
        assert!(b.overlaps(&d));
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor = HandlerDescriptor::new("h1", Selector::any());
        assert_eq!(descriptor.rank, DEFAULT_RANK);
        assert!(descriptor.parallelizable);
        assert!(descriptor.fallback);
        assert!(descriptor.enabled);
        assert!(!descriptor.is_fast_path());
        assert!(descriptor.depends_on.is_empty());
    }

    #[test]
    fn test_descriptor_serializes_timeout_in_ms() {
        let descriptor = HandlerDescriptor::new("h1", Selector::any())
            .timeout(Duration::from_millis(25));
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["timeout_ms"], 25);
        assert_eq!(value["selector"]["kind"], "*");
    }
}
