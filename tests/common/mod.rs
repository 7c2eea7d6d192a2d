//! Common test utilities for integration tests
//!
//! Provides test handlers with scripted latency and results, plus logging setup.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use hookgate::domain::models::{
    Event, HandlerContext, HandlerDescriptor, HandlerError, HandlerOutput, HandlerId,
};
use hookgate::domain::ports::Handler;

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Start and finish times of handler executions, shared between handlers of one test.
#[derive(Debug, Default, Clone)]
pub struct Trace {
    entries: Arc<Mutex<Vec<TraceEntry>>>,
}

#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub id: HandlerId,
    pub started: Instant,
    pub finished: Option<Instant>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&self, id: &HandlerId) -> usize {
        let mut entries = self.entries.lock();
        entries.push(TraceEntry {
            id: id.clone(),
            started: Instant::now(),
            finished: None,
        });
        entries.len() - 1
    }

    fn finish(&self, index: usize) {
        self.entries.lock()[index].finished = Some(Instant::now());
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().clone()
    }

    /// Ids in the order their executions started.
    pub fn started_order(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.id.to_string())
            .collect()
    }

    pub fn count(&self, id: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.id.as_str() == id)
            .count()
    }

    pub fn entry(&self, id: &str) -> Option<TraceEntry> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.id.as_str() == id)
            .cloned()
    }
}

/// What a [`TestHandler`] does once its delay has elapsed.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Option<Value>),
    Fail(String),
    Panic(String),
}

/// Handler that sleeps, then behaves as scripted, recording itself in a [`Trace`].
pub struct TestHandler {
    descriptor: HandlerDescriptor,
    delay: Duration,
    behavior: Behavior,
    trace: Trace,
}

impl TestHandler {
    pub fn new(descriptor: HandlerDescriptor, trace: &Trace) -> Self {
        Self {
            descriptor,
            delay: Duration::ZERO,
            behavior: Behavior::Succeed(None),
            trace: trace.clone(),
        }
    }

    #[must_use]
    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    #[must_use]
    pub fn responds(mut self, data: Value) -> Self {
        self.behavior = Behavior::Succeed(Some(data));
        self
    }

    #[must_use]
    pub fn fails(mut self, message: &str) -> Self {
        self.behavior = Behavior::Fail(message.to_string());
        self
    }

    #[must_use]
    pub fn panics(mut self, message: &str) -> Self {
        self.behavior = Behavior::Panic(message.to_string());
        self
    }

    pub fn arc(self) -> Arc<dyn Handler> {
        Arc::new(self)
    }
}

#[async_trait]
impl Handler for TestHandler {
    fn describe(&self) -> HandlerDescriptor {
        self.descriptor.clone()
    }

    async fn execute(
        &self,
        _event: &Event,
        _ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let index = self.trace.start(&self.descriptor.id);
        tokio::time::sleep(self.delay).await;
        self.trace.finish(index);

        match &self.behavior {
            Behavior::Succeed(Some(data)) => Ok(HandlerOutput::with_data(data.clone())),
            Behavior::Succeed(None) => Ok(HandlerOutput::empty()),
            Behavior::Fail(message) => Err(HandlerError::new(message.clone())),
            Behavior::Panic(message) => panic!("{message}"),
        }
    }
}
