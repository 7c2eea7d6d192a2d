//! End-to-end dispatch scenarios against a fully wired engine.
//!
//! All tests run on paused tokio time, so elapsed durations are exact.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use common::{setup_test_logging, TestHandler, Trace};
use hookgate::domain::models::{
    BreakerConfig, Config, Event, FailureCause, HandlerContext, HandlerDescriptor, HandlerError,
    HandlerId, HandlerOutput, Phase, Priority, Selector,
};
use hookgate::domain::ports::Handler;
use hookgate::services::Engine;

fn descriptor(id: &str, kind: &str, timeout_ms: u64) -> HandlerDescriptor {
    HandlerDescriptor::new(id, Selector::new(kind, Phase::Before))
        .timeout(Duration::from_millis(timeout_ms))
}

fn ids(list: &[HandlerId]) -> Vec<&str> {
    list.iter().map(HandlerId::as_str).collect()
}

fn engine() -> Engine {
    Engine::new(Config::default()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn scenario_a_single_handler_succeeds() {
    setup_test_logging();
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(TestHandler::new(descriptor("H1", "pre-edit", 10), &trace).delay_ms(5).arc())
        .unwrap();

    let event = Event::new("pre-edit", Phase::Before, "edit").with_priority(Priority::High);
    let outcome = engine.process(&event).await.unwrap();

    assert!(outcome.success);
    assert_eq!(ids(&outcome.handlers_invoked), vec!["H1"]);
    assert_eq!(outcome.elapsed, Duration::from_millis(5));
    assert!(outcome.errors.is_empty());
    assert!(!outcome.fast_path);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_dependency_runs_first() {
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(
            TestHandler::new(descriptor("H1", "pre-edit", 10).depends_on("H2"), &trace).arc(),
        )
        .unwrap();
    engine
        .register(TestHandler::new(descriptor("H2", "pre-edit", 10), &trace).delay_ms(3).arc())
        .unwrap();

    let outcome = engine
        .process(&Event::new("pre-edit", Phase::Before, "edit"))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(ids(&outcome.handlers_invoked), vec!["H2", "H1"]);
    assert_eq!(trace.started_order(), vec!["H2", "H1"]);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_breaker_trips_after_timeouts() {
    let mut config = Config::default();
    config.breaker = BreakerConfig {
        window_size: 5,
        minimum_calls: 5,
        failure_ratio_threshold: 0.5,
        ..BreakerConfig::default()
    };
    let engine = Engine::new(config).unwrap();
    let trace = Trace::new();
    engine
        .register(TestHandler::new(descriptor("slow", "pre-edit", 10), &trace).delay_ms(30).arc())
        .unwrap();

    let event = Event::new("pre-edit", Phase::Before, "edit").with_priority(Priority::High);
    let mut outcomes = Vec::new();
    for _ in 0..10 {
        outcomes.push(engine.process(&event).await.unwrap());
    }

    for outcome in &outcomes[..5] {
        assert!(!outcome.success);
        assert!(outcome.timed_out());
        assert_eq!(
            outcome.errors[0].cause,
            FailureCause::Timeout { budget_ms: 10 }
        );
    }
    for outcome in &outcomes[5..] {
        assert!(outcome.success);
        assert!(outcome.degraded);
        assert!(outcome.handlers_invoked.is_empty());
    }
    assert_eq!(trace.count("slow"), 5);
    assert_eq!(engine.metrics().snapshot().degraded, 5);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_repeat_is_served_from_cache() {
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(
            TestHandler::new(descriptor("lookup", "file", 10), &trace)
                .delay_ms(2)
                .responds(json!({"lines": 42}))
                .arc(),
        )
        .unwrap();

    let event = Event::new("file", Phase::Before, "read").with_entry("path", "src/lib.rs");
    let first = engine.process(&event).await.unwrap();
    tokio::time::advance(Duration::from_millis(1000)).await;
    let second = engine.process(&event).await.unwrap();

    assert!(!first.served_from_cache);
    assert!(second.served_from_cache);
    assert_eq!(first.data, second.data);
    assert_eq!(second.data, Some(json!({"lookup": {"lines": 42}})));
    assert_eq!(trace.count("lookup"), 1);
    assert_eq!(engine.cache().stats().hits, 1);
}

#[tokio::test(start_paused = true)]
async fn cache_entry_expires_after_ttl() {
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(TestHandler::new(descriptor("lookup", "file", 10), &trace).arc())
        .unwrap();

    let event = Event::new("file", Phase::Before, "list");
    engine.process(&event).await.unwrap();
    tokio::time::advance(Duration::from_millis(5001)).await;
    let again = engine.process(&event).await.unwrap();

    assert!(!again.served_from_cache);
    assert_eq!(trace.count("lookup"), 2);
}

#[tokio::test(start_paused = true)]
async fn p1_critical_events_respect_fast_path_budget() {
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(
            TestHandler::new(
                descriptor("guard", "pre-command", 100).priority_class(Priority::Critical),
                &trace,
            )
            .delay_ms(80)
            .arc(),
        )
        .unwrap();

    let event = Event::new("pre-command", Phase::Before, "run").with_priority(Priority::Critical);
    for _ in 0..20 {
        let outcome = engine.process(&event).await.unwrap();
        assert!(outcome.fast_path);
        assert!(outcome.elapsed <= Duration::from_millis(20));
        assert!(!outcome.success);
        assert_eq!(outcome.errors[0].cause, FailureCause::Timeout { budget_ms: 20 });
    }
    assert_eq!(engine.metrics().snapshot().fast_path, 20);
}

#[tokio::test(start_paused = true)]
async fn p2_pipeline_stays_under_ceiling() {
    let engine = engine();
    let trace = Trace::new();
    for (id, delay) in [("a", 8), ("b", 9), ("c", 4)] {
        let handler = TestHandler::new(descriptor(id, "post-edit", 10), &trace).delay_ms(delay);
        engine.register(handler.arc()).unwrap();
    }
    engine
        .register(
            TestHandler::new(descriptor("d", "post-edit", 10).depends_on("a"), &trace)
                .delay_ms(9)
                .arc(),
        )
        .unwrap();

    let outcome = engine
        .process(&Event::new("post-edit", Phase::Before, "write"))
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.handlers_invoked.len(), 4);
    assert!(outcome.elapsed <= Duration::from_millis(50));
    // Stage one runs a, b and c together; d follows.
    assert_eq!(outcome.elapsed, Duration::from_millis(18));
}

#[tokio::test(start_paused = true)]
async fn pipeline_deadline_cuts_off_long_chain() {
    let engine = engine();
    let trace = Trace::new();
    let chain = [("s1", None), ("s2", Some("s1")), ("s3", Some("s2")), ("s4", Some("s3"))];
    for (id, dep) in chain {
        let mut d = descriptor(id, "build", 25);
        if let Some(dep) = dep {
            d = d.depends_on(dep);
        }
        engine
            .register(TestHandler::new(d, &trace).delay_ms(20).arc())
            .unwrap();
    }

    let outcome = engine
        .process(&Event::new("build", Phase::Before, "compile"))
        .await
        .unwrap();

    assert_eq!(outcome.elapsed, Duration::from_millis(50));
    assert_eq!(ids(&outcome.handlers_invoked), vec!["s1", "s2", "s3"]);
    assert_eq!(ids(&outcome.handlers_skipped), vec!["s4"]);
    assert_eq!(
        outcome.failure_for(&HandlerId::from("s3")).unwrap().cause,
        FailureCause::DeadlineExceeded
    );
    assert!(outcome.success, "s1 and s2 succeeded");
}

#[tokio::test(start_paused = true)]
async fn p4_dependency_completes_before_dependent_starts() {
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(TestHandler::new(descriptor("A", "commit", 10), &trace).delay_ms(7).arc())
        .unwrap();
    engine
        .register(TestHandler::new(descriptor("B", "commit", 10).depends_on("A"), &trace).arc())
        .unwrap();
    engine
        .register(TestHandler::new(descriptor("C", "commit", 10), &trace).delay_ms(2).arc())
        .unwrap();

    for _ in 0..5 {
        engine
            .process(&Event::new("commit", Phase::Before, "commit"))
            .await
            .unwrap();
    }

    let entries = trace.entries();
    for (i, entry) in entries.iter().enumerate() {
        if entry.id.as_str() != "B" {
            continue;
        }
        let a = entries[..i]
            .iter()
            .rev()
            .find(|e| e.id.as_str() == "A")
            .unwrap();
        assert!(a.finished.unwrap() <= entry.started);
    }
    assert_eq!(trace.count("B"), 5);
}

#[tokio::test(start_paused = true)]
async fn p6_panic_and_error_stay_with_their_handler() {
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(TestHandler::new(descriptor("boom", "save", 10), &trace).panics("kaboom").arc())
        .unwrap();
    engine
        .register(TestHandler::new(descriptor("broken", "save", 10), &trace).fails("nope").arc())
        .unwrap();
    engine
        .register(
            TestHandler::new(descriptor("fine", "save", 10), &trace)
                .delay_ms(1)
                .responds(json!("ok"))
                .arc(),
        )
        .unwrap();

    let outcome = engine
        .process(&Event::new("save", Phase::Before, "write"))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.errors.len(), 2);
    assert_eq!(
        outcome.failure_for(&HandlerId::from("boom")).unwrap().cause,
        FailureCause::Panicked {
            message: "kaboom".to_string()
        }
    );
    assert_eq!(
        outcome.failure_for(&HandlerId::from("broken")).unwrap().cause,
        FailureCause::Execution {
            message: "nope".to_string()
        }
    );
    assert_eq!(outcome.data, Some(json!({"fine": "ok"})));
    assert_eq!(trace.count("fine"), 1);
}

#[tokio::test(start_paused = true)]
async fn non_fallback_failure_skips_dependents() {
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(
            TestHandler::new(descriptor("gate", "push", 10).non_fallback(), &trace)
                .fails("denied")
                .arc(),
        )
        .unwrap();
    let upload = descriptor("upload", "push", 10).depends_on("gate");
    engine.register(TestHandler::new(upload, &trace).arc()).unwrap();
    engine
        .register(
            TestHandler::new(descriptor("notify", "push", 10).depends_on("upload"), &trace).arc(),
        )
        .unwrap();

    let outcome = engine
        .process(&Event::new("push", Phase::Before, "push"))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(ids(&outcome.handlers_invoked), vec!["gate"]);
    assert_eq!(ids(&outcome.handlers_skipped), vec!["upload", "notify"]);
    assert_eq!(trace.count("upload"), 0);
}

#[tokio::test(start_paused = true)]
async fn fallback_failure_keeps_dependents_running() {
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(TestHandler::new(descriptor("lint", "push", 10), &trace).fails("warn").arc())
        .unwrap();
    let upload = descriptor("upload", "push", 10).depends_on("lint");
    engine.register(TestHandler::new(upload, &trace).arc()).unwrap();

    let outcome = engine
        .process(&Event::new("push", Phase::Before, "push"))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(ids(&outcome.handlers_invoked), vec!["lint", "upload"]);
    assert!(outcome.handlers_skipped.is_empty());
}

#[tokio::test(start_paused = true)]
async fn fast_path_picks_highest_rank_then_smallest_id() {
    let engine = engine();
    let trace = Trace::new();
    for (id, rank) in [("alpha", 5), ("gamma", 9), ("beta", 9)] {
        engine
            .register(
                TestHandler::new(
                    descriptor(id, "pre-command", 10)
                        .priority_class(Priority::Critical)
                        .rank(rank),
                    &trace,
                )
                .arc(),
            )
            .unwrap();
    }
    engine
        .register(TestHandler::new(descriptor("audit", "pre-command", 10), &trace).arc())
        .unwrap();

    let outcome = engine
        .process(&Event::new("pre-command", Phase::Before, "run").with_priority(Priority::Critical))
        .await
        .unwrap();

    assert!(outcome.fast_path);
    assert_eq!(ids(&outcome.handlers_invoked), vec!["beta"]);
    assert_eq!(trace.started_order(), vec!["beta"]);
}

#[tokio::test(start_paused = true)]
async fn critical_event_without_fast_path_handler() {
    let trace = Trace::new();

    let engine = engine();
    engine
        .register(TestHandler::new(descriptor("audit", "pre-command", 10), &trace).arc())
        .unwrap();
    let event = Event::new("pre-command", Phase::Before, "run").with_priority(Priority::Critical);
    let outcome = engine.process(&event).await.unwrap();
    assert!(outcome.success);
    assert!(outcome.fast_path);
    assert!(outcome.handlers_invoked.is_empty());

    let mut config = Config::default();
    config.fast_path.fallback_to_pipeline = true;
    let engine = Engine::new(config).unwrap();
    engine
        .register(TestHandler::new(descriptor("audit", "pre-command", 10), &trace).arc())
        .unwrap();
    let outcome = engine.process(&event).await.unwrap();
    assert_eq!(ids(&outcome.handlers_invoked), vec!["audit"]);
    assert!(!outcome.fast_path);
}

#[tokio::test(start_paused = true)]
async fn batch_returns_outcomes_in_input_order() {
    let engine = engine();
    let trace = Trace::new();
    engine
        .register(
            TestHandler::new(descriptor("slow", "lint", 40), &trace)
                .delay_ms(30)
                .responds(json!(1))
                .arc(),
        )
        .unwrap();
    engine
        .register(
            TestHandler::new(
                descriptor("guard", "pre-command", 10).priority_class(Priority::Critical),
                &trace,
            )
            .delay_ms(1)
            .arc(),
        )
        .unwrap();

    let events = vec![
        Event::new("lint", Phase::Before, "check"),
        Event::new("unknown", Phase::After, "noop"),
        Event::new("pre-command", Phase::Before, "run").with_priority(Priority::Critical),
    ];
    let outcomes = engine.process_batch(&events).await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(ids(&outcomes[0].handlers_invoked), vec!["slow"]);
    assert!(outcomes[1].handlers_invoked.is_empty());
    assert!(outcomes[2].fast_path);
    assert_eq!(trace.started_order()[0], "guard", "Critical events go first");
}

#[tokio::test]
async fn invalid_event_is_rejected() {
    let engine = engine();
    let err = engine
        .process(&Event::new("*", Phase::Before, "edit"))
        .await
        .unwrap_err();
    assert!(matches!(err, hookgate::DispatchError::InvalidEvent(_)));

    let batch = vec![
        Event::new("ok", Phase::Before, "edit"),
        Event::new("ok", Phase::Before, " "),
    ];
    assert!(engine.process_batch(&batch).await.is_err());
    assert_eq!(engine.metrics().snapshot().total, 0, "Nothing ran");
}

/// Sets its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Handler that sleeps far past any budget, recording whether it finished or was dropped.
struct Stuck {
    descriptor: HandlerDescriptor,
    finished: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

impl Stuck {
    fn new(descriptor: HandlerDescriptor) -> (Arc<Self>, Arc<AtomicBool>, Arc<AtomicBool>) {
        let finished = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(Self {
            descriptor,
            finished: Arc::clone(&finished),
            dropped: Arc::clone(&dropped),
        });
        (handler, finished, dropped)
    }
}

#[async_trait]
impl Handler for Stuck {
    fn describe(&self) -> HandlerDescriptor {
        self.descriptor.clone()
    }

    async fn execute(
        &self,
        _event: &Event,
        _ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let _flag = DropFlag(Arc::clone(&self.dropped));
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(HandlerOutput::empty())
    }
}

#[tokio::test(start_paused = true)]
async fn handler_past_its_deadline_is_dropped() {
    let engine = engine();
    let (handler, finished, dropped) = Stuck::new(descriptor("stuck", "lint", 10));
    engine.register(handler).unwrap();

    let outcome = engine
        .process(&Event::new("lint", Phase::Before, "check"))
        .await
        .unwrap();
    assert_eq!(outcome.elapsed, Duration::from_millis(10));
    assert_eq!(outcome.errors[0].cause, FailureCause::Timeout { budget_ms: 10 });
    assert!(dropped.load(Ordering::SeqCst), "Handler future is dropped at its deadline");

    tokio::time::advance(Duration::from_secs(2)).await;
    tokio::task::yield_now().await;
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn cancelling_dispatch_drops_running_handlers() {
    let engine = engine();
    let (handler, finished, dropped) = Stuck::new(descriptor("stuck", "lint", 40));
    engine.register(handler).unwrap();

    let event = Event::new("lint", Phase::Before, "check");
    let cancelled = tokio::time::timeout(Duration::from_millis(5), engine.process(&event)).await;
    assert!(cancelled.is_err());
    assert!(dropped.load(Ordering::SeqCst));

    tokio::time::advance(Duration::from_secs(2)).await;
    tokio::task::yield_now().await;
    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(engine.metrics().snapshot().total, 0, "Cancelled dispatch records nothing");
}
