//! Engine wiring.
//!
//! [`Engine`] owns one instance of every shared component. Nothing is global: two
//! engines built from two configs are fully independent.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::errors::DispatchResult;
use crate::domain::models::{Config, DispatchOutcome, Event};
use crate::domain::ports::Handler;
use crate::services::capabilities::{self, CapabilityReport};
use crate::services::circuit_breaker::BreakerSet;
use crate::services::dispatcher::Dispatcher;
use crate::services::handler_registry::HandlerRegistry;
use crate::services::health::{self, HealthReport};
use crate::services::metrics::MetricsAccumulator;
use crate::services::notices::{NoticeBus, NoticeEnvelope};
use crate::services::result_cache::ResultCache;

pub struct Engine {
    config: Config,
    notices: Arc<NoticeBus>,
    registry: Arc<HandlerRegistry>,
    cache: Arc<ResultCache>,
    breakers: Arc<BreakerSet>,
    metrics: Arc<MetricsAccumulator>,
    dispatcher: Arc<Dispatcher>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine and register the handlers declared in `config`.
    ///
    /// The cache sweeper is started when called inside a tokio runtime.
    pub fn new(config: Config) -> DispatchResult<Self> {
        let notices = Arc::new(NoticeBus::new(config.notices.capacity));
        let registry = Arc::new(HandlerRegistry::new().with_notices(Arc::clone(&notices)));
        let cache = Arc::new(ResultCache::new(config.cache.max_entries));
        let breakers = Arc::new(
            BreakerSet::new(config.breaker.clone()).with_notices(Arc::clone(&notices)),
        );
        let metrics = Arc::new(MetricsAccumulator::new(&config.metrics));
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
        ));

        registry.load_from_config(&config.handlers)?;

        let sweeper = if !config.cache.enabled {
            None
        } else if tokio::runtime::Handle::try_current().is_ok() {
            Some(cache.spawn_sweeper(config.cache.sweep_interval(), Some(Arc::clone(&notices))))
        } else {
            warn!("No tokio runtime, cache sweeper not started");
            None
        };

        info!(
            handlers = registry.len(),
            cache_enabled = config.cache.enabled,
            breaker_enabled = config.breaker.enabled,
            "Engine started"
        );

        Ok(Self {
            config,
            notices,
            registry,
            cache,
            breakers,
            metrics,
            dispatcher,
            sweeper: Mutex::new(sweeper),
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
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

    pub fn register(&self, handler: Arc<dyn Handler>) -> DispatchResult<()> {
        self.registry.register(handler)
    }

    pub async fn process(&self, event: &Event) -> DispatchResult<DispatchOutcome> {
        self.dispatcher.process(event).await
    }

    pub async fn process_batch(&self, events: &[Event]) -> DispatchResult<Vec<DispatchOutcome>> {
        self.dispatcher.process_batch(events).await
    }

    pub fn capabilities(&self) -> CapabilityReport {
        capabilities::describe(&self.registry, &self.config)
    }

    pub fn health(&self) -> HealthReport {
        health::check(&self.metrics, &self.breakers, &self.cache, &self.config.health)
    }

    /// Drop the cached outcome for `event`, if any.
    pub fn invalidate(&self, event: &Event) -> bool {
        self.cache.invalidate(&event.fingerprint())
    }

    /// Clear cached outcomes, close every circuit and zero the metrics.
    pub fn reset(&self) {
        self.cache.clear();
        self.breakers.reset_all();
        self.metrics.reset();
        info!("Engine state reset");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoticeEnvelope> {
        self.notices.subscribe()
    }

    /// Stop background work. Dispatching keeps working; expired cache entries are then
    /// only removed on lookup.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Engine shut down");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
