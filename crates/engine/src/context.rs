//! The engine's explicit context: every handle a job handler needs,
//! built once at startup and passed by reference into each call.

use std::sync::Arc;
use std::time::Duration;

use campaign_cache::{DistributedLock, LocalLock};
use campaign_core::config::AppConfig;
use campaign_core::event_bus::{log_tracker, ErrorTracker};
use campaign_delivery::{MemoryThrottle, ProviderRegistry, ProviderThrottle};
use campaign_journey::{JourneyRunner, JourneyStore, MemoryJourneyStore};
use campaign_queue::{JobQueue, MemoryQueue};
use campaign_rules::{EvaluationCache, MemoryEvaluationCache, MemoryRuleStore, RuleOrchestrator, RuleStore};

use crate::actions::CampaignActions;
use crate::store::{CampaignStore, EventStore, ListStore, MemoryStore, SendStore, UserStore};

/// Persistence collaborators.
#[derive(Clone)]
pub struct Stores {
    pub campaigns: Arc<dyn CampaignStore>,
    pub sends: Arc<dyn SendStore>,
    pub users: Arc<dyn UserStore>,
    pub lists: Arc<dyn ListStore>,
    pub events: Arc<dyn EventStore>,
    pub rules: Arc<dyn RuleStore>,
    pub journeys: Arc<dyn JourneyStore>,
}

impl Stores {
    /// Every engine contract served by one memory store.
    pub fn memory(store: Arc<MemoryStore>, rules: MemoryRuleStore, journeys: MemoryJourneyStore) -> Self {
        Self {
            campaigns: store.clone(),
            sends: store.clone(),
            users: store.clone(),
            lists: store.clone(),
            events: store,
            rules: Arc::new(rules),
            journeys: Arc::new(journeys),
        }
    }
}

/// Infrastructure the deployment chooses: queue transport, lock,
/// evaluation cache, throttle and error tracking.
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn JobQueue>,
    pub lock: Arc<dyn DistributedLock>,
    pub cache: Arc<dyn EvaluationCache>,
    pub throttle: Arc<dyn ProviderThrottle>,
    pub errors: Arc<dyn ErrorTracker>,
}

#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<AppConfig>,
    pub queue: Arc<dyn JobQueue>,
    pub lock: Arc<dyn DistributedLock>,
    pub throttle: Arc<dyn ProviderThrottle>,
    pub providers: Arc<ProviderRegistry>,
    pub errors: Arc<dyn ErrorTracker>,
    pub rules: Arc<RuleOrchestrator>,
    pub journeys: Arc<JourneyRunner>,
    pub campaigns: Arc<dyn CampaignStore>,
    pub sends: Arc<dyn SendStore>,
    pub users: Arc<dyn UserStore>,
    pub lists: Arc<dyn ListStore>,
    pub events: Arc<dyn EventStore>,
}

impl EngineContext {
    pub fn new(config: AppConfig, stores: Stores, backends: Backends, providers: ProviderRegistry) -> Self {
        let rules = Arc::new(RuleOrchestrator::new(stores.rules.clone(), backends.cache.clone()));
        let actions = Arc::new(CampaignActions::new(
            stores.campaigns.clone(),
            stores.sends.clone(),
            backends.queue.clone(),
        ));
        let journeys = Arc::new(JourneyRunner::new(
            stores.journeys.clone(),
            rules.clone(),
            actions,
            backends.queue.clone(),
            config.journey.clone(),
        ));

        Self {
            config: Arc::new(config),
            queue: backends.queue,
            lock: backends.lock,
            throttle: backends.throttle,
            providers: Arc::new(providers),
            errors: backends.errors,
            rules,
            journeys,
            campaigns: stores.campaigns,
            sends: stores.sends,
            users: stores.users,
            lists: stores.lists,
            events: stores.events,
        }
    }
}

/// A fully in-process engine: memory stores, queue, lock, cache and
/// throttle, with typed handles kept for seeding and inspection.
pub struct MemoryBackend {
    pub config: AppConfig,
    pub store: Arc<MemoryStore>,
    pub rules: MemoryRuleStore,
    pub journeys: MemoryJourneyStore,
    pub queue: Arc<MemoryQueue>,
    pub lock: Arc<LocalLock>,
    pub cache: Arc<MemoryEvaluationCache>,
    pub throttle: Arc<dyn ProviderThrottle>,
    pub errors: Arc<dyn ErrorTracker>,
}

impl MemoryBackend {
    pub fn new(config: AppConfig) -> Self {
        let queue = MemoryQueue::new(Duration::from_millis(config.queue.poll_interval_ms));
        let throttle = MemoryThrottle::new(Duration::from_millis(config.dispatch.rate_window_ms));
        Self {
            store: Arc::new(MemoryStore::new()),
            rules: MemoryRuleStore::new(),
            journeys: MemoryJourneyStore::new(),
            queue: Arc::new(queue),
            lock: Arc::new(LocalLock::new()),
            cache: Arc::new(MemoryEvaluationCache::new()),
            throttle: Arc::new(throttle),
            errors: log_tracker(),
            config,
        }
    }

    pub fn with_errors(mut self, errors: Arc<dyn ErrorTracker>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_throttle(mut self, throttle: Arc<dyn ProviderThrottle>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn stores(&self) -> Stores {
        Stores::memory(self.store.clone(), self.rules.clone(), self.journeys.clone())
    }

    pub fn backends(&self) -> Backends {
        Backends {
            queue: self.queue.clone(),
            lock: self.lock.clone(),
            cache: self.cache.clone(),
            throttle: self.throttle.clone(),
            errors: self.errors.clone(),
        }
    }

    pub fn context(&self) -> EngineContext {
        EngineContext::new(
            self.config.clone(),
            self.stores(),
            self.backends(),
            ProviderRegistry::with_defaults(),
        )
    }
}
