//! Circuit breaker pattern for failure detection and recovery.
//!
//! A breaker watches the outcomes of recent dispatches and stops admitting new ones when
//! too many fail, giving misbehaving handlers time to recover instead of adding latency
//! to every host operation.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::models::{BreakerConfig, BreakerScope, Event, EventKind, Phase};
use crate::services::notices::{Notice, NoticeBus};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, dispatches flow normally.
    Closed,
    /// Circuit is open, dispatches are short-circuited.
    Open,
    /// Circuit is testing whether handlers have recovered.
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope of a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CircuitScope {
    /// One circuit for every dispatch.
    Global,
    /// Circuit for a specific `(kind, phase)` pair.
    Selector { kind: EventKind, phase: Phase },
}

impl CircuitScope {
    pub fn selector(kind: impl Into<EventKind>, phase: Phase) -> Self {
        Self::Selector {
            kind: kind.into(),
            phase,
        }
    }

    /// Scope an event falls under with the given granularity.
    pub fn for_event(granularity: BreakerScope, event: &Event) -> Self {
        match granularity {
            BreakerScope::Global => Self::Global,
            BreakerScope::Selector => Self::selector(event.kind().clone(), event.phase()),
        }
    }
}

impl fmt::Display for CircuitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Selector { kind, phase } => write!(f, "{kind}/{phase}"),
        }
    }
}

/// Result of asking a breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, proceed.
    Allowed,
    /// Circuit half-open and this caller holds the single trial.
    Trial,
    /// Circuit open.
    Rejected { retry_after: Duration },
}

impl Admission {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed | Self::Trial)
    }

    pub const fn is_trial(&self) -> bool {
        matches!(self, Self::Trial)
    }
}

/// Snapshot of a breaker for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub scope: CircuitScope,
    pub state: CircuitState,
    pub window_calls: usize,
    pub window_failures: usize,
    pub failure_ratio: f64,
    pub total_trips: u64,
    pub consecutive_opens: u32,
    pub rejected: u64,
    pub cooldown_ms: u64,
    pub state_changed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// `(recorded_at, failed)` for the most recent outcomes.
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    consecutive_opens: u32,
    trial_in_flight: bool,
    total_trips: u64,
    rejected: u64,
    state_changed_at: DateTime<Utc>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            cooldown: Duration::ZERO,
            consecutive_opens: 0,
            trial_in_flight: false,
            total_trips: 0,
            rejected: 0,
            state_changed_at: Utc::now(),
        }
    }

    fn prune(&mut self, now: Instant, config: &BreakerConfig) {
        let max_age = config.window_duration();
        while self
            .window
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) > max_age)
        {
            self.window.pop_front();
        }
        while self.window.len() > config.window_size.max(1) {
            self.window.pop_front();
        }
    }

    fn failures(&self) -> usize {
        self.window.iter().filter(|(_, failed)| *failed).count()
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.window.len() as f64
        }
    }

    fn retry_after(&self, now: Instant) -> Duration {
        self.opened_at.map_or(Duration::ZERO, |opened_at| {
            (opened_at + self.cooldown).saturating_duration_since(now)
        })
    }

    fn open(&mut self, now: Instant, config: &BreakerConfig) {
        self.consecutive_opens = self.consecutive_opens.saturating_add(1);
        self.cooldown = config.cooldown_for(self.consecutive_opens);
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.total_trips += 1;
        self.state_changed_at = Utc::now();
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.trial_in_flight = false;
        self.state_changed_at = Utc::now();
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.window.clear();
        self.opened_at = None;
        self.cooldown = Duration::ZERO;
        self.consecutive_opens = 0;
        self.trial_in_flight = false;
        self.state_changed_at = Utc::now();
    }
}

/// Rolling-window circuit breaker with a single half-open trial.
///
/// All state sits behind one mutex; no critical section awaits.
#[derive(Debug)]
pub struct CircuitBreaker {
    scope: CircuitScope,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    notices: Option<Arc<NoticeBus>>,
}

impl CircuitBreaker {
    pub fn new(scope: CircuitScope, config: BreakerConfig) -> Self {
        Self {
            scope,
            config,
            inner: Mutex::new(BreakerInner::new()),
            notices: None,
        }
    }

    #[must_use]
    pub fn with_notices(mut self, notices: Arc<NoticeBus>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub const fn scope(&self) -> &CircuitScope {
        &self.scope
    }

    /// Ask for admission of one dispatch.
    ///
    /// Once the cool-down has elapsed the first caller moves the circuit to half-open and
    /// receives [`Admission::Trial`]; everyone else is rejected until the trial reports
    /// back through `record_success`, `record_failure` or `release_trial`.
    pub fn try_acquire(&self) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }

        let now = Instant::now();
        let mut notice = None;
        let admission = {
            let mut inner = self.inner.lock();
            let admission = match inner.state {
                CircuitState::Closed => Admission::Allowed,
                CircuitState::Open => {
                    let retry_after = inner.retry_after(now);
                    if retry_after.is_zero() {
                        inner.half_open();
                        inner.trial_in_flight = true;
                        notice = Some(Notice::CircuitHalfOpened {
                            scope: self.scope.clone(),
                        });
                        Admission::Trial
                    } else {
                        Admission::Rejected { retry_after }
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        Admission::Rejected {
                            retry_after: Duration::ZERO,
                        }
                    } else {
                        inner.trial_in_flight = true;
                        Admission::Trial
                    }
                }
            };
            if !admission.is_allowed() {
                inner.rejected += 1;
            }
            admission
        };

        if let Some(notice) = notice {
            info!(scope = %self.scope, "Circuit half-open, admitting trial dispatch");
            self.publish(notice);
        }
        admission
    }

    /// Whether a new dispatch would be rejected right now.
    pub fn is_open(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => !inner.retry_after(Instant::now()).is_zero(),
            CircuitState::HalfOpen => inner.trial_in_flight,
        }
    }

    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let now = Instant::now();
        let closed = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.close();
                    true
                }
                CircuitState::Closed => {
                    inner.window.push_back((now, false));
                    inner.prune(now, &self.config);
                    false
                }
                // Late result from a dispatch admitted before the trip.
                CircuitState::Open => false,
            }
        };

        if closed {
            info!(scope = %self.scope, "Circuit closed after successful trial");
            self.publish(Notice::CircuitClosed {
                scope: self.scope.clone(),
            });
        }
    }

    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let now = Instant::now();
        let opened = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.open(now, &self.config);
                    Some((inner.failure_ratio(), inner.cooldown))
                }
                CircuitState::Closed => {
                    inner.window.push_back((now, true));
                    inner.prune(now, &self.config);
                    let ratio = inner.failure_ratio();
                    if inner.window.len() >= self.config.minimum_calls
                        && ratio > self.config.failure_ratio_threshold
                    {
                        inner.open(now, &self.config);
                        Some((ratio, inner.cooldown))
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };

        if let Some((failure_ratio, cooldown)) = opened {
            let cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
            warn!(scope = %self.scope, failure_ratio, cooldown_ms, "Circuit opened");
            self.publish(Notice::CircuitOpened {
                scope: self.scope.clone(),
                failure_ratio,
                cooldown_ms,
            });
        }
    }

    /// Give the trial back without a verdict, e.g. when it was served from cache.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.trial_in_flight = false;
            debug!(scope = %self.scope, "Trial released without verdict");
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            scope: self.scope.clone(),
            state: inner.state,
            window_calls: inner.window.len(),
            window_failures: inner.failures(),
            failure_ratio: inner.failure_ratio(),
            total_trips: inner.total_trips,
            consecutive_opens: inner.consecutive_opens,
            rejected: inner.rejected,
            cooldown_ms: u64::try_from(inner.cooldown.as_millis()).unwrap_or(u64::MAX),
            state_changed_at: inner.state_changed_at,
        }
    }

    /// Manually close the circuit and forget all history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.close();
        inner.total_trips = 0;
        inner.rejected = 0;
    }

    fn publish(&self, notice: Notice) {
        if let Some(notices) = &self.notices {
            notices.publish(notice);
        }
    }
}

/// Breakers keyed by scope, created on first use.
#[derive(Debug)]
pub struct BreakerSet {
    config: BreakerConfig,
    breakers: DashMap<CircuitScope, Arc<CircuitBreaker>>,
    notices: Option<Arc<NoticeBus>>,
}

impl BreakerSet {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            notices: None,
        }
    }

    #[must_use]
    pub fn with_notices(mut self, notices: Arc<NoticeBus>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn scope_for(&self, event: &Event) -> CircuitScope {
        CircuitScope::for_event(self.config.scope, event)
    }

    /// Breaker guarding the given event.
    pub fn breaker_for(&self, event: &Event) -> Arc<CircuitBreaker> {
        self.get_or_create(self.scope_for(event))
    }

    pub fn get_or_create(&self, scope: CircuitScope) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(&scope) {
            return Arc::clone(breaker.value());
        }
        let breaker = self
            .breakers
            .entry(scope.clone())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(scope, self.config.clone());
                let breaker = match &self.notices {
                    Some(notices) => breaker.with_notices(Arc::clone(notices)),
                    None => breaker,
                };
                Arc::new(breaker)
            });
        Arc::clone(breaker.value())
    }

    pub fn get(&self, scope: &CircuitScope) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(scope).map(|b| Arc::clone(b.value()))
    }

    /// Stats for every breaker, sorted by scope.
    pub fn stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> =
            self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by_key(|s| s.scope.to_string());
        stats
    }

    /// Number of breakers currently rejecting dispatches.
    pub fn open_count(&self) -> usize {
        self.breakers.iter().filter(|b| b.value().is_open()).count()
    }

    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            window_size: 10,
            minimum_calls: 4,
            failure_ratio_threshold: 0.5,
            cooldown_ms: 100,
            backoff_multiplier: 2.0,
            max_cooldown_ms: 1000,
            ..BreakerConfig::default()
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitScope::Global, config())
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..4 {
            breaker.record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_only_after_minimum_calls() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_open());
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_must_exceed_threshold() {
        let breaker = breaker();
        for _ in 0..2 {
            breaker.record_success();
            breaker.record_failure();
        }
        // 2 of 4 is exactly the threshold.
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = breaker();
        trip(&breaker);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.try_acquire(), Admission::Trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
        assert_eq!(breaker.stats().window_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_doubles_cooldown() {
        let breaker = breaker();
        trip(&breaker);
        assert_eq!(breaker.stats().cooldown_ms, 100);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(breaker.try_acquire(), Admission::Trial);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().cooldown_ms, 200);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(
            breaker.try_acquire(),
            Admission::Rejected { retry_after } if retry_after == Duration::from_millis(50)
        ));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(breaker.try_acquire(), Admission::Trial);
        breaker.record_success();
        assert_eq!(breaker.stats().consecutive_opens, 0);
        assert_eq!(breaker.stats().total_trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_can_be_retaken() {
        let breaker = breaker();
        trip(&breaker);
        tokio::time::advance(Duration::from_millis(100)).await;

        assert_eq!(breaker.try_acquire(), Admission::Trial);
        breaker.release_trial();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire(), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_outcomes_leave_the_window() {
        let breaker = CircuitBreaker::new(
            CircuitScope::Global,
            BreakerConfig {
                window_duration_ms: 1000,
                ..config()
            },
        );
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1500)).await;
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().window_calls, 1);
    }

    #[test]
    fn test_disabled_breaker_always_admits() {
        let breaker = CircuitBreaker::new(
            CircuitScope::Global,
            BreakerConfig {
                enabled: false,
                ..config()
            },
        );
        trip(&breaker);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_publish_notices() {
        let bus = Arc::new(NoticeBus::new(16));
        let mut rx = bus.subscribe();
        let breaker = breaker().with_notices(bus);

        trip(&breaker);
        tokio::time::advance(Duration::from_millis(100)).await;
        breaker.try_acquire();
        breaker.record_success();

        let notices: Vec<Notice> = (0..3).map(|_| rx.try_recv().unwrap().notice).collect();
        assert!(matches!(notices[0], Notice::CircuitOpened { cooldown_ms: 100, .. }));
        assert!(matches!(notices[1], Notice::CircuitHalfOpened { .. }));
        assert!(matches!(notices[2], Notice::CircuitClosed { .. }));
    }

    #[test]
    fn test_selector_scope_isolates_breakers() {
        let set = BreakerSet::new(BreakerConfig {
            scope: BreakerScope::Selector,
            ..config()
        });
        let edit = Event::new("pre-edit", Phase::Before, "edit");
        let command = Event::new("post-command", Phase::After, "bash");

        trip(&set.breaker_for(&edit));
        assert!(set.breaker_for(&edit).is_open());
        assert!(!set.breaker_for(&command).is_open());
        assert_eq!(set.open_count(), 1);
        assert_eq!(set.stats().len(), 2);
    }

    #[test]
    fn test_global_scope_shares_one_breaker() {
        let set = BreakerSet::new(config());
        let edit = Event::new("pre-edit", Phase::Before, "edit");
        let command = Event::new("post-command", Phase::After, "bash");

        assert!(Arc::ptr_eq(&set.breaker_for(&edit), &set.breaker_for(&command)));
        assert_eq!(set.scope_for(&edit), CircuitScope::Global);
    }
}
