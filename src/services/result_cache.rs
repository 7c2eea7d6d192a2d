//! Fingerprint-keyed cache of dispatch outcomes.
//!
//! Entries expire after their TTL. Lookups drop expired entries they run into; a
//! background sweeper removes the rest so expired outcomes do not accumulate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::domain::models::{CacheConfig, DispatchOutcome, Event, Fingerprint, Priority};
use crate::services::notices::{Notice, NoticeBus};

#[derive(Debug, Clone)]
struct CacheEntry {
    outcome: DispatchOutcome,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries removed because their TTL passed.
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// TTL cache of dispatch outcomes.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<Fingerprint, CacheEntry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Fresh outcome stored under `fingerprint`, if any.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<DispatchOutcome> {
        let now = Instant::now();
        let expired = match self.entries.get(fingerprint) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(fingerprint = %fingerprint, "Cache hit");
                return Some(entry.outcome.clone());
            }
            Some(_) => true,
            None => false,
        };

        // A concurrent `put` may have refreshed the entry since the read above.
        if expired
            && self
                .entries
                .remove_if(fingerprint, |_, entry| entry.is_expired(now))
                .is_some()
        {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store an outcome. The last writer for a fingerprint wins.
    pub fn put(&self, fingerprint: Fingerprint, outcome: DispatchOutcome, ttl: Duration) {
        if !self.entries.contains_key(&fingerprint) && self.entries.len() >= self.max_entries {
            self.make_room();
        }
        self.entries.insert(
            fingerprint,
            CacheEntry {
                outcome,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.remove(fingerprint).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        self.expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` on a background task.
    ///
    /// The task stops on its own once the cache is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        notices: Option<Arc<NoticeBus>>,
    ) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    let remaining = cache.len();
                    debug!(removed, remaining, "Swept expired cache entries");
                    if let Some(notices) = &notices {
                        notices.publish(Notice::CacheSwept { removed, remaining });
                    }
                }
            }
        })
    }

    fn make_room(&self) {
        if self.sweep() > 0 && self.entries.len() < self.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Decides which events and outcomes go through the cache.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    config: CacheConfig,
}

impl CachePolicy {
    pub const fn new(config: CacheConfig) -> Self {
        Self { config }
    }

    /// Whether a lookup should be attempted for this event.
    pub fn is_cacheable(&self, event: &Event) -> bool {
        if !self.config.enabled || event.priority() == Priority::Critical {
            return false;
        }
        event.is_cacheable()
            || self.config.read_operations.contains(event.operation())
            || (self.config.cache_low_priority
                && matches!(event.priority(), Priority::Medium | Priority::Low))
    }

    /// Whether a freshly computed outcome may be stored.
    pub fn should_store(&self, event: &Event, outcome: &DispatchOutcome) -> bool {
        self.is_cacheable(event)
            && outcome.success
            && !outcome.degraded
            && !outcome.served_from_cache
            && !outcome.fast_path
    }

    pub fn ttl_for(&self, event: &Event) -> Duration {
        self.config.ttl_for(event.kind())
    }
}
