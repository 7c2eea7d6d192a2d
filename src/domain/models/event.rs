//! Event domain model.
//!
//! An [`Event`] describes one lifecycle occurrence in the host application. Events are
//! immutable once built: the dispatcher only reads them and derives new data (the
//! fingerprint, the outcome) from them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::errors::{DispatchError, DispatchResult};

/// Opaque contextual data carried by an event. Never interpreted by the engine.
pub type Payload = serde_json::Map<String, Value>;

/// Wildcard accepted in handler selectors.
pub const WILDCARD: &str = "*";

/// Open-ended event category tag (`pre-edit`, `post-command`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKind(String);

impl EventKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    /// Wildcard-aware match against a concrete event kind.
    pub fn matches(&self, kind: &Self) -> bool {
        self.is_wildcard() || self == kind
    }
}

impl From<&str> for EventKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of the event relative to the host operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Before,
    After,
}

impl Phase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event priority. Ordered `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Stable slot used by per-priority counters.
    pub const fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic digest of an event's identifying fields, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One occurrence to be dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    kind: EventKind,
    phase: Phase,
    #[serde(default)]
    priority: Priority,
    operation: String,
    #[serde(default)]
    payload: Payload,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default)]
    cacheable: bool,
}

impl Event {
    /// Create an event with medium priority and an empty payload.
    pub fn new(kind: impl Into<EventKind>, phase: Phase, operation: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            phase,
            priority: Priority::default(),
            operation: operation.into(),
            payload: Payload::new(),
            created_at: Utc::now(),
            cacheable: false,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Add a single payload entry.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Mark the event as safe to serve from the result cache.
    #[must_use]
    pub const fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    pub const fn priority(&self) -> Priority {
        self.priority
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub const fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Structural well-formedness check. Domain semantics are the host's concern.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.kind.as_str().trim().is_empty() {
            return Err(DispatchError::InvalidEvent(
                "event kind cannot be empty".to_string(),
            ));
        }
        if self.kind.is_wildcard() {
            return Err(DispatchError::InvalidEvent(
                "event kind cannot be the wildcard".to_string(),
            ));
        }
        if self.operation.trim().is_empty() {
            return Err(DispatchError::InvalidEvent(format!(
                "event {} has an empty operation",
                self.kind
            )));
        }
        Ok(())
    }

    /// Digest of `(kind, phase, operation, payload)`.
    ///
    /// Object keys are hashed in sorted order so the digest does not depend on
    /// insertion order. Id, priority, timestamp and the cacheable flag are excluded.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, self.kind.as_str().as_bytes());
        hash_field(&mut hasher, self.phase.as_str().as_bytes());
        hash_field(&mut hasher, self.operation.as_bytes());
        hash_map(&mut hasher, &self.payload);

        let digest = hasher.finalize();
        Fingerprint(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

// Length-prefix every field so ("ab", "c") and ("a", "bc") digest differently.
fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_map(hasher: &mut Sha256, map: &Payload) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    hasher.update(b"{");
    hasher.update((keys.len() as u64).to_le_bytes());
    for key in keys {
        hash_field(hasher, key.as_bytes());
        if let Some(value) = map.get(key) {
            hash_value(hasher, value);
        }
    }
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hash_field(hasher, n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hash_field(hasher, s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(map) => hash_map(hasher, map),
    }
}
