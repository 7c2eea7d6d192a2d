//! Notice bus for engine state changes.
//!
//! Breakers, the cache sweeper and the registry publish [`Notice`]s on a bounded
//! broadcast channel. Publishing never blocks: with no subscriber the notice is dropped,
//! and a slow subscriber lags instead of holding up the publisher.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::models::HandlerId;
use crate::services::circuit_breaker::CircuitScope;

/// A state change worth telling observers about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    CircuitOpened {
        scope: CircuitScope,
        failure_ratio: f64,
        cooldown_ms: u64,
    },
    CircuitHalfOpened {
        scope: CircuitScope,
    },
    CircuitClosed {
        scope: CircuitScope,
    },
    CacheSwept {
        removed: usize,
        remaining: usize,
    },
    HandlerRegistered {
        id: HandlerId,
    },
    HandlerDeregistered {
        id: HandlerId,
    },
}

/// A notice stamped with its publication order and time.
#[derive(Debug, Clone, Serialize)]
pub struct NoticeEnvelope {
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub notice: Notice,
}

/// Bounded broadcast bus for [`Notice`]s.
#[derive(Debug)]
pub struct NoticeBus {
    sender: broadcast::Sender<NoticeEnvelope>,
    sequence: AtomicU64,
}

impl NoticeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish a notice to current subscribers.
    pub fn publish(&self, notice: Notice) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let envelope = NoticeEnvelope {
            sequence,
            published_at: Utc::now(),
            notice,
        };
        // No subscribers is not an error.
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoticeEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Number of notices published so far.
    pub fn published(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(256)
    }
}
