use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::info;

use crate::clock::{Clock, MonotonicClock};
use crate::config::HubConfig;
use crate::envelope::{EnvelopeFactory, RoutingKey};
use crate::event::EventBus;
use crate::gather::GatherRegistry;
use crate::stats::{MessageCounter, MessageStats};

/// Shared context for every topic, publisher and gatherer on one bus.
///
/// Owns the bus, the clock, the stats sink and the gather registry. Cloning a
/// `Hub` is cheap and yields a handle to the same context. Components built
/// from different hubs never see each other.
///
/// # Examples
///
/// ```no_run
/// use tandem_core::{Hub, HubConfig, Topic};
///
/// # async fn example() -> tandem_core::Result<()> {
/// let hub = Hub::new(HubConfig::load());
/// let cart: Topic<u32> = Topic::new(&hub, "cart.count", 1);
/// cart.publish(3).await?;
/// assert_eq!(cart.get_value(), Some(3));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    bus: Arc<EventBus>,
    envelopes: EnvelopeFactory,
    counter: Option<Arc<MessageCounter>>,
    registry: RwLock<Option<Arc<GatherRegistry>>>,
    closed: watch::Sender<bool>,
}

impl Hub {
    /// Build a hub with the monotonic wall clock and in-memory counters.
    pub fn new(config: HubConfig) -> Self {
        let counter = Arc::new(MessageCounter::new(config.stats.enabled));
        let stats: Arc<dyn MessageStats> = counter.clone();
        Self::build(config, Arc::new(MonotonicClock::new()), stats, Some(counter))
    }

    /// Build a hub around caller-supplied clock and stats collaborators.
    pub fn with_parts(
        config: HubConfig,
        clock: Arc<dyn Clock>,
        stats: Arc<dyn MessageStats>,
    ) -> Self {
        Self::build(config, clock, stats, None)
    }

    fn build(
        config: HubConfig,
        clock: Arc<dyn Clock>,
        stats: Arc<dyn MessageStats>,
        counter: Option<Arc<MessageCounter>>,
    ) -> Self {
        let registry = config
            .gather
            .registry
            .then(|| Arc::new(GatherRegistry::new()));
        info!(
            target: "hub",
            stats = config.stats.enabled,
            registry = registry.is_some(),
            ack = ?config.publisher.ack,
            "Hub created"
        );
        Self {
            inner: Arc::new(HubInner {
                envelopes: EnvelopeFactory::new(clock, stats),
                bus: Arc::new(EventBus::new()),
                counter,
                registry: RwLock::new(registry),
                closed: watch::channel(false).0,
                config,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn envelopes(&self) -> &EnvelopeFactory {
        &self.inner.envelopes
    }

    pub fn stats(&self) -> &Arc<dyn MessageStats> {
        self.inner.envelopes.stats()
    }

    /// Counters, when the hub was built by [`Hub::new`]
    pub fn message_counts(&self) -> Option<&Arc<MessageCounter>> {
        self.inner.counter.as_ref()
    }

    /// The gather registry, or `None` once shut down or when not configured
    pub fn registry(&self) -> Option<Arc<GatherRegistry>> {
        self.inner.registry.read().clone()
    }

    /// Install a fresh registry if none is present, returning the active one.
    pub fn install_registry(&self) -> Arc<GatherRegistry> {
        let mut slot = self.inner.registry.write();
        Arc::clone(slot.get_or_insert_with(|| {
            info!(target: "hub", "Gather registry installed");
            Arc::new(GatherRegistry::new())
        }))
    }

    /// Acknowledge the write identified by `id` on a routing key.
    pub async fn resolve(&self, key: &RoutingKey, id: i64) -> u64 {
        let env = self.inner.envelopes.resolve(key, id);
        self.inner.bus.publish(env).await
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Completes once [`Hub::shutdown`] has run.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Remove the gather registry, detach every bus listener and end every
    /// topic stream.
    pub fn shutdown(&self) {
        info!(target: "hub", "Shutting down hub...");
        self.inner.closed.send_replace(true);
        if let Some(registry) = self.inner.registry.write().take() {
            registry.clear();
        }
        self.inner.bus.shutdown();
        info!(target: "hub", "Hub shut down successfully");
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
