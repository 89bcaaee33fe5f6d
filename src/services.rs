//! Wiring for a full execution core from one [`CoreConfig`].

use std::sync::Arc;

use tracing::info;

use crate::Result;
use crate::cache::TieredCache;
use crate::config::CoreConfig;
use crate::events::EventBus;
use crate::requests::{CachingEngine, Engine, RequestQueue};
use crate::worker::TaskScheduler;

/// The scheduler, request queue and cache sharing one event bus.
///
/// Engine calls made through `requests` are served from `cache` when
/// possible.
pub struct Services {
    pub events: EventBus,
    pub scheduler: Arc<TaskScheduler>,
    pub requests: Arc<RequestQueue>,
    pub cache: Arc<TieredCache>,
}

impl Services {
    /// Validate `config` and start every component. Must be called inside a
    /// tokio runtime.
    pub fn start<E>(config: CoreConfig, engine: E) -> Result<Self>
    where
        E: Engine + 'static,
    {
        config.validate()?;
        let events = EventBus::new();

        let cache = TieredCache::new(config.cache, events.clone())?;
        let engine = Arc::new(CachingEngine::new(engine, Arc::clone(&cache)));
        let requests = RequestQueue::new(config.requests, engine, events.clone());
        let scheduler = TaskScheduler::new(config.scheduler, events.clone());

        info!("Execution core started");
        Ok(Self {
            events,
            scheduler,
            requests,
            cache,
        })
    }

    /// Stop accepting work and wind down every component.
    pub async fn shutdown(&self) {
        self.requests.shutdown().await;
        self.scheduler.shutdown().await;
        self.cache.shutdown().await;
        info!("Execution core stopped");
    }
}
