//! Event dispatcher.
//!
//! Routes each event either through the fast path (critical events: one handler, one
//! tight budget, no cache, no breaker) or through the full pipeline (breaker gate, cache
//! lookup, dependency-ordered execution of every matching handler). Handler failures are
//! folded into the returned [`DispatchOutcome`]; only malformed events and fatal pipeline
//! errors surface as `Err`.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::models::{
    Config, DispatchOutcome, DispatcherConfig, Event, FailureCause, FastPathConfig,
    HandlerContext, HandlerFailure, HandlerId, HandlerOutput, Priority,
};
use crate::services::circuit_breaker::{Admission, BreakerSet, CircuitBreaker};
use crate::services::handler_registry::{HandlerRegistry, RegisteredHandler};
use crate::services::metrics::MetricsAccumulator;
use crate::services::result_cache::{CachePolicy, ResultCache};

/// Holds a breaker admission until the dispatch reports a verdict.
///
/// A dispatch in which any handler failed counts as one breaker failure, even when a
/// sibling succeeded. A half-open trial that ends without a verdict (cache hit, no
/// handler ran, error, or the dispatch future being dropped) is handed back on drop.
struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
}

impl BreakerPermit {
    fn settle(mut self, outcome: &DispatchOutcome) {
        if outcome.handlers_invoked.is_empty() {
            return;
        }
        self.trial = false;
        if outcome.errors.is_empty() {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Results of the handlers run so far in one dispatch.
#[derive(Default)]
struct Aggregate {
    data: Map<String, Value>,
    errors: Vec<HandlerFailure>,
    invoked: Vec<HandlerId>,
    skipped: Vec<HandlerId>,
    succeeded: usize,
}

impl Aggregate {
    fn absorb(&mut self, id: &HandlerId, run: Result<HandlerOutput, HandlerFailure>) -> bool {
        match run {
            Ok(output) => {
                self.succeeded += 1;
                if let Some(data) = output.data {
                    self.data.insert(id.to_string(), data);
                }
                true
            }
            Err(failure) => {
                self.errors.push(failure);
                false
            }
        }
    }

    fn into_outcome(self, elapsed: Duration, fast_path: bool) -> DispatchOutcome {
        DispatchOutcome {
            success: self.succeeded > 0,
            elapsed,
            data: (!self.data.is_empty()).then_some(Value::Object(self.data)),
            errors: self.errors,
            served_from_cache: false,
            degraded: false,
            fast_path,
            handlers_invoked: self.invoked,
            handlers_skipped: self.skipped,
        }
    }
}

/// Dispatches events to registered handlers under bounded latency.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    cache: Arc<ResultCache>,
    policy: CachePolicy,
    breakers: Arc<BreakerSet>,
    metrics: Arc<MetricsAccumulator>,
    config: DispatcherConfig,
    fast_path: FastPathConfig,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        registry: Arc<HandlerRegistry>,
        cache: Arc<ResultCache>,
        breakers: Arc<BreakerSet>,
        metrics: Arc<MetricsAccumulator>,
    ) -> Self {
        Self {
            registry,
            cache,
            policy: CachePolicy::new(config.cache.clone()),
            breakers,
            metrics,
            config: config.dispatcher.clone(),
            fast_path: config.fast_path.clone(),
        }
    }

    pub const fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub const fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub const fn breakers(&self) -> &Arc<BreakerSet> {
        &self.breakers
    }

    pub const fn metrics(&self) -> &Arc<MetricsAccumulator> {
        &self.metrics
    }

    /// Dispatch one event.
    ///
    /// Returns within the pipeline ceiling (the fast-path budget for critical events)
    /// plus bookkeeping, whatever the handlers do.
    #[instrument(
        skip_all,
        fields(
            event_id = %event.id(),
            kind = %event.kind(),
            phase = %event.phase(),
            priority = %event.priority()
        )
    )]
    pub async fn process(&self, event: &Event) -> DispatchResult<DispatchOutcome> {
        event.validate()?;
        let started = Instant::now();

        let outcome = if event.priority() == Priority::Critical {
            self.dispatch_fast_path(event, started).await?
        } else {
            self.dispatch_guarded(event, started).await?
        };

        self.metrics.record_outcome(&outcome, event.priority());
        debug!(
            success = outcome.success,
            elapsed_us = u64::try_from(outcome.elapsed.as_micros()).unwrap_or(u64::MAX),
            cached = outcome.served_from_cache,
            degraded = outcome.degraded,
            invoked = outcome.handlers_invoked.len(),
            "Dispatch complete"
        );
        Ok(outcome)
    }

    /// Dispatch several events.
    ///
    /// Every event is validated before any runs. Critical events are dispatched first,
    /// all at once; the rest follow with at most `batch_concurrency` in flight. Outcomes
    /// come back in input order.
    pub async fn process_batch(&self, events: &[Event]) -> DispatchResult<Vec<DispatchOutcome>> {
        for event in events {
            event.validate()?;
        }

        let (critical, rest): (Vec<usize>, Vec<usize>) =
            (0..events.len()).partition(|&i| events[i].priority() == Priority::Critical);
        let mut outcomes: Vec<Option<DispatchOutcome>> = vec![None; events.len()];

        let critical_runs = join_all(
            critical
                .into_iter()
                .map(|i| async move { (i, self.process(&events[i]).await) }),
        )
        .await;
        for (i, result) in critical_runs {
            outcomes[i] = Some(result?);
        }

        let rest_runs: Vec<(usize, DispatchResult<DispatchOutcome>)> = futures::stream::iter(rest)
            .map(|i| async move { (i, self.process(&events[i]).await) })
            .buffer_unordered(self.config.batch_concurrency.max(1))
            .collect()
            .await;
        for (i, result) in rest_runs {
            outcomes[i] = Some(result?);
        }

        outcomes
            .into_iter()
            .map(|o| {
                o.ok_or_else(|| DispatchError::PipelineFatal("batch outcome missing".to_string()))
            })
            .collect()
    }

    async fn dispatch_fast_path(
        &self,
        event: &Event,
        started: Instant,
    ) -> DispatchResult<DispatchOutcome> {
        let chosen = self
            .registry
            .select(event.kind(), event.phase(), Some(Priority::Critical))
            .into_iter()
            .max_by(|a, b| {
                a.descriptor()
                    .rank
                    .cmp(&b.descriptor().rank)
                    .then_with(|| b.id().cmp(a.id()))
            });

        let Some(handler) = chosen else {
            if self.fast_path.fallback_to_pipeline {
                debug!("No fast-path handler, falling back to pipeline");
                return self.run_pipeline(event, started).await;
            }
            let mut outcome = DispatchOutcome::empty(started.elapsed());
            outcome.fast_path = true;
            return Ok(outcome);
        };

        let cap = started + self.fast_path.timeout();
        let mut aggregate = Aggregate::default();
        aggregate.invoked.push(handler.id().clone());
        let run = self.invoke(&handler, event, Uuid::new_v4(), cap, true).await;
        aggregate.absorb(handler.id(), run);

        Ok(aggregate.into_outcome(started.elapsed(), true))
    }

    async fn dispatch_guarded(
        &self,
        event: &Event,
        started: Instant,
    ) -> DispatchResult<DispatchOutcome> {
        let breaker = self.breakers.breaker_for(event);
        let admission = breaker.try_acquire();
        if let Admission::Rejected { retry_after } = admission {
            let err = DispatchError::CircuitOpen { retry_after };
            debug!(scope = %breaker.scope(), error = %err, "Returning degraded outcome");
            return Ok(DispatchOutcome::degraded(started.elapsed()));
        }
        let permit = BreakerPermit {
            breaker,
            trial: admission.is_trial(),
        };

        let fingerprint = self
            .policy
            .is_cacheable(event)
            .then(|| event.fingerprint());
        if let Some(fingerprint) = &fingerprint {
            if let Some(cached) = self.cache.get(fingerprint) {
                debug!(fingerprint = %fingerprint, "Serving outcome from cache");
                return Ok(DispatchOutcome::from_cache(&cached, started.elapsed()));
            }
        }

        let outcome = self.run_pipeline(event, started).await?;
        permit.settle(&outcome);

        if let Some(fingerprint) = fingerprint {
            if self.policy.should_store(event, &outcome) {
                self.cache
                    .put(fingerprint, outcome.clone(), self.policy.ttl_for(event));
            }
        }
        Ok(outcome)
    }

    async fn run_pipeline(
        &self,
        event: &Event,
        started: Instant,
    ) -> DispatchResult<DispatchOutcome> {
        let selected = self.registry.select(event.kind(), event.phase(), None);
        if selected.is_empty() {
            return Ok(DispatchOutcome::empty(started.elapsed()));
        }
        let plan = self.registry.order(&selected)?;

        let pipeline_deadline = started + self.config.pipeline_timeout();
        let dispatch_id = Uuid::new_v4();
        let mut aggregate = Aggregate::default();
        // Handlers whose dependents must not run.
        let mut blocked: HashSet<HandlerId> = HashSet::new();

        for group in plan.groups() {
            let mut runnable: Vec<&RegisteredHandler> = Vec::with_capacity(group.len());
            for handler in &group {
                let descriptor = handler.descriptor();
                if let Some(dep) = descriptor.depends_on.iter().find(|d| blocked.contains(*d)) {
                    debug!(
                        handler_id = %descriptor.id,
                        dependency = %dep,
                        "Skipping handler after dependency failure"
                    );
                    blocked.insert(descriptor.id.clone());
                    aggregate.skipped.push(descriptor.id.clone());
                } else if Instant::now() >= pipeline_deadline {
                    debug!(
                        handler_id = %descriptor.id,
                        "Skipping handler, pipeline deadline reached"
                    );
                    aggregate.skipped.push(descriptor.id.clone());
                } else {
                    runnable.push(handler);
                }
            }
            if runnable.is_empty() {
                continue;
            }

            aggregate
                .invoked
                .extend(runnable.iter().map(|h| h.id().clone()));
            let runs = join_all(
                runnable
                    .iter()
                    .map(|h| self.invoke(h, event, dispatch_id, pipeline_deadline, false)),
            )
            .await;

            for (handler, run) in runnable.into_iter().zip(runs) {
                let succeeded = aggregate.absorb(handler.id(), run);
                if !succeeded && !handler.descriptor().fallback {
                    blocked.insert(handler.id().clone());
                }
            }
        }

        Ok(aggregate.into_outcome(started.elapsed(), false))
    }

    /// Run one handler under `min(own budget, cap)`, converting every failure mode.
    async fn invoke(
        &self,
        handler: &RegisteredHandler,
        event: &Event,
        dispatch_id: Uuid,
        cap: Instant,
        fast_path: bool,
    ) -> Result<HandlerOutput, HandlerFailure> {
        let descriptor = handler.descriptor();
        let invoked_at = Instant::now();
        let own_deadline = invoked_at + descriptor.timeout;
        let deadline = own_deadline.min(cap);
        let ctx = HandlerContext {
            dispatch_id,
            deadline,
            pipeline_deadline: cap,
            fast_path,
        };

        let execution = AssertUnwindSafe(handler.handler().execute(event, &ctx)).catch_unwind();
        let handler_id = descriptor.id.clone();
        let (err, retryable) = match tokio::time::timeout_at(deadline, execution).await {
            Ok(Ok(Ok(output))) => return Ok(output),
            Ok(Ok(Err(err))) => (
                DispatchError::HandlerExecution {
                    handler: handler_id,
                    message: err.message,
                },
                err.retryable,
            ),
            Ok(Err(panic)) => (
                DispatchError::HandlerPanicked {
                    handler: handler_id,
                    message: panic_message(panic.as_ref()),
                },
                false,
            ),
            Err(_) if own_deadline <= cap => (
                DispatchError::Timeout {
                    handler: handler_id,
                    budget: descriptor.timeout,
                },
                true,
            ),
            Err(_) if fast_path => (
                DispatchError::Timeout {
                    handler: handler_id,
                    budget: deadline.saturating_duration_since(invoked_at),
                },
                true,
            ),
            Err(_) => (DispatchError::DeadlineExceeded { handler: handler_id }, true),
        };

        warn!(handler_id = %descriptor.id, error = %err, "Handler failed");
        Err(HandlerFailure {
            handler_id: descriptor.id.clone(),
            cause: FailureCause::from(&err),
            retryable,
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{HandlerDescriptor, HandlerError, Phase, Selector};
    use crate::domain::ports::Handler;
    use async_trait::async_trait;
    use serde_json::json;

    struct Scripted {
        descriptor: HandlerDescriptor,
        delay: Duration,
        result: Result<Option<Value>, String>,
    }

    #[async_trait]
    impl Handler for Scripted {
        fn describe(&self) -> HandlerDescriptor {
            self.descriptor.clone()
        }

        async fn execute(
            &self,
            _event: &Event,
            _ctx: &HandlerContext,
        ) -> Result<HandlerOutput, HandlerError> {
            tokio::time::sleep(self.delay).await;
            match &self.result {
                Ok(Some(data)) => Ok(HandlerOutput::with_data(data.clone())),
                Ok(None) => Ok(HandlerOutput::empty()),
                Err(message) => Err(HandlerError::new(message.clone())),
            }
        }
    }

    fn scripted(
        descriptor: HandlerDescriptor,
        delay_ms: u64,
        result: Result<Option<Value>, String>,
    ) -> Arc<dyn Handler> {
        Arc::new(Scripted {
            descriptor,
            delay: Duration::from_millis(delay_ms),
            result,
        })
    }

    fn dispatcher(config: &Config) -> Dispatcher {
        Dispatcher::new(
            config,
            Arc::new(HandlerRegistry::new()),
            Arc::new(ResultCache::new(config.cache.max_entries)),
            Arc::new(BreakerSet::new(config.breaker.clone())),
            Arc::new(MetricsAccumulator::new(&config.metrics)),
        )
    }

    fn edit(id: &str) -> HandlerDescriptor {
        HandlerDescriptor::new(id, Selector::new("pre-edit", Phase::Before))
    }

    fn edit_event() -> Event {
        Event::new("pre-edit", Phase::Before, "edit")
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_handlers_is_empty_success() {
        let dispatcher = dispatcher(&Config::default());
        let outcome = dispatcher.process(&edit_event()).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.handlers_invoked.is_empty());
        assert!(outcome.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_is_keyed_by_handler_id() {
        let dispatcher = dispatcher(&Config::default());
        dispatcher
            .registry()
            .register(scripted(edit("a"), 1, Ok(Some(json!(1)))))
            .unwrap();
        dispatcher
            .registry()
            .register(scripted(edit("b"), 1, Ok(None)))
            .unwrap();
        dispatcher
            .registry()
            .register(scripted(edit("c"), 1, Err("boom".to_string())))
            .unwrap();

        let outcome = dispatcher.process(&edit_event()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(json!({"a": 1})));
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            outcome.failure_for(&HandlerId::from("c")).unwrap().cause,
            FailureCause::Execution {
                message: "boom".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failures_is_unsuccessful() {
        let dispatcher = dispatcher(&Config::default());
        dispatcher
            .registry()
            .register(scripted(edit("a"), 0, Err("no".to_string())))
            .unwrap();
        let outcome = dispatcher.process(&edit_event()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.handlers_invoked, vec![HandlerId::from("a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_event_propagates() {
        let dispatcher = dispatcher(&Config::default());
        let err = dispatcher
            .process(&Event::new("pre-edit", Phase::Before, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidEvent(_)));
        assert_eq!(dispatcher.metrics().snapshot().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_failure_does_not_skip_dependents() {
        let dispatcher = dispatcher(&Config::default());
        dispatcher
            .registry()
            .register(scripted(edit("a"), 0, Err("soft".to_string())))
            .unwrap();
        dispatcher
            .registry()
            .register(scripted(edit("b").depends_on("a"), 0, Ok(None)))
            .unwrap();

        let outcome = dispatcher.process(&edit_event()).await.unwrap();
        assert_eq!(
            outcome.handlers_invoked,
            vec![HandlerId::from("a"), HandlerId::from("b")]
        );
        assert!(outcome.handlers_skipped.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_path_without_handler() {
        let dispatcher = dispatcher(&Config::default());
        dispatcher
            .registry()
            .register(scripted(edit("slow-pipeline"), 0, Ok(Some(json!("x")))))
            .unwrap();

        let event = edit_event().with_priority(Priority::Critical);
        let outcome = dispatcher.process(&event).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.fast_path);
        assert!(outcome.handlers_invoked.is_empty());

        let mut config = Config::default();
        config.fast_path.fallback_to_pipeline = true;
        let fallback = Dispatcher::new(
            &config,
            Arc::clone(dispatcher.registry()),
            Arc::new(ResultCache::new(16)),
            Arc::new(BreakerSet::new(config.breaker.clone())),
            Arc::new(MetricsAccumulator::default()),
        );
        let outcome = fallback.process(&event).await.unwrap();
        assert_eq!(outcome.handlers_invoked, vec![HandlerId::from("slow-pipeline")]);
        assert!(!outcome.fast_path);
    }

    #[test]
    fn test_panic_message_extraction() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "handler panicked");
    }
}
