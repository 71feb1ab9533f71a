use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::hub::Hub;
use crate::topic::Topic;
use crate::{Result, SyncError};

/// A peer's answer, encoded for the wire, as seen by the requester.
pub type PendingResponse = BoxFuture<'static, Result<serde_json::Value>>;

/// Value carried on a gatherer's internal topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatherRequest<Req> {
    pub id: u64,
    pub request: Req,
}

/// Answers requests broadcast by other gatherers on the same routing key.
#[async_trait]
pub trait Responder<Req, Resp>: Send + Sync {
    async fn respond(&self, request: Req) -> Resp;
}

/// Adapts an async closure into a [`Responder`]
pub struct FnResponder<F>(pub F);

#[async_trait]
impl<Req, Resp, F, Fut> Responder<Req, Resp> for FnResponder<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Resp> + Send + 'static,
{
    async fn respond(&self, request: Req) -> Resp {
        (self.0)(request).await
    }
}

/// Correlation slots shared by every gatherer of a hub.
///
/// Maps a request id to the responses peers attached while handling that
/// request. Ids come from a counter owned by the registry, so they are unique
/// across all routing keys of the hub.
#[derive(Default)]
pub struct GatherRegistry {
    next_id: AtomicU64,
    // id -> responses attached by peers
    slots: Mutex<HashMap<u64, Vec<PendingResponse>>>,
}

impl GatherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh request id
    pub fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Create an empty slot for `id`
    pub fn open(&self, id: u64) {
        self.slots.lock().entry(id).or_default();
    }

    /// Attach a response to an open slot. Returns false if the slot is gone.
    pub fn attach(&self, id: u64, response: PendingResponse) -> bool {
        match self.slots.lock().get_mut(&id) {
            Some(slot) => {
                slot.push(response);
                true
            }
            None => false,
        }
    }

    /// Remove the slot and hand back whatever was attached
    pub fn take(&self, id: u64) -> Option<Vec<PendingResponse>> {
        self.slots.lock().remove(&id)
    }

    pub fn remove(&self, id: u64) -> bool {
        self.slots.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.slots.lock().contains_key(&id)
    }

    /// Number of open slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// Scatter/gather over a routing key.
///
/// `gather` broadcasts a request to every other live gatherer sharing
/// `(name, version)` and collects what their responders return. Only peers
/// that receive the request while it is being delivered contribute; there is
/// no deadline and no quorum, and an empty result is a normal outcome.
///
/// A gatherer never answers a request it sent itself.
///
/// Each peer starts its responder on a spawned task while the request is being
/// delivered, so a peer's responder runs to completion even when the
/// requester's `gather` future is dropped; only the answer is lost.
///
/// # Examples
///
/// ```no_run
/// use tandem_core::{Gatherer, Hub};
///
/// # async fn example() -> tandem_core::Result<()> {
/// let hub = Hub::default();
/// let _peer = Gatherer::from_fn(&hub, "rpc", 1, |req: String| async move {
///     format!("A:{req}")
/// });
/// let client: Gatherer<String, String> =
///     Gatherer::from_fn(&hub, "rpc", 1, |req: String| async move { req });
///
/// let answers = client.gather("x".to_string()).await?;
/// assert_eq!(answers, vec!["A:x".to_string()]);
/// # Ok(())
/// # }
/// ```
pub struct Gatherer<Req, Resp> {
    topic: Topic<GatherRequest<Req>>,
    own: Arc<Mutex<HashSet<u64>>>,
    _resp: PhantomData<fn() -> Resp>,
}

impl<Req, Resp> Gatherer<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    Resp: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(
        hub: &Hub,
        name: impl Into<String>,
        version: u32,
        responder: Arc<dyn Responder<Req, Resp>>,
    ) -> Self {
        let topic: Topic<GatherRequest<Req>> = Topic::new(hub, name, version);
        let own: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

        let key = topic.key().clone();
        let own_ids = Arc::clone(&own);
        let hub_handle = hub.clone();
        topic.observe(move |msg: &GatherRequest<Req>| {
            if own_ids.lock().contains(&msg.id) {
                trace!(target: "gatherer", key = %key, id = msg.id, "Skipping own request");
                return;
            }
            let Some(registry) = hub_handle.registry() else {
                warn!(target: "gatherer", key = %key, id = msg.id, "No gather registry; dropping request");
                return;
            };
            if !registry.contains(msg.id) {
                warn!(target: "gatherer", key = %key, id = msg.id, "No response slot for request; dropping");
                return;
            }

            let Ok(runtime) = Handle::try_current() else {
                warn!(target: "gatherer", key = %key, id = msg.id, "No async runtime to answer on; dropping request");
                return;
            };

            let (tx, rx) = oneshot::channel::<Result<serde_json::Value>>();
            let pending: PendingResponse = Box::pin(async move {
                rx.await.unwrap_or_else(|_| {
                    Err(SyncError::Responder(
                        "responder ended without answering".into(),
                    ))
                })
            });
            if !registry.attach(msg.id, pending) {
                warn!(target: "gatherer", key = %key, id = msg.id, "Response slot closed; dropping");
                return;
            }

            // Runs on its own task, so it completes even if the requester stops waiting
            let responder = Arc::clone(&responder);
            let request = msg.request.clone();
            runtime.spawn(async move {
                let response = responder.respond(request).await;
                let _ = tx.send(serde_json::to_value(response).map_err(SyncError::from));
            });
            debug!(target: "gatherer", key = %key, id = msg.id, "Responder started");
        });

        Self {
            topic,
            own,
            _resp: PhantomData,
        }
    }

    /// Build a gatherer whose responder is an async closure
    pub fn from_fn<F, Fut>(hub: &Hub, name: impl Into<String>, version: u32, f: F) -> Self
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Resp> + Send + 'static,
    {
        Self::new(hub, name, version, Arc::new(FnResponder(f)))
    }

    /// Broadcast `request` and collect the peers' responses.
    ///
    /// Fails only when the hub has no gather registry.
    pub async fn gather(&self, request: Req) -> Result<Vec<Resp>> {
        let registry = self
            .topic
            .hub()
            .registry()
            .ok_or(SyncError::RegistryUnavailable)?;

        let id = registry.allocate();
        self.own.lock().insert(id);
        registry.open(id);

        let published = self.topic.publish(GatherRequest { id, request }).await;

        // The slot only lives for one delivery round
        let pending = registry.take(id).unwrap_or_default();
        self.own.lock().remove(&id);
        published?;

        debug!(target: "gatherer", key = %self.topic.key(), id, peers = pending.len(), "Gathering responses");

        let mut responses = Vec::with_capacity(pending.len());
        for outcome in join_all(pending).await {
            match outcome.and_then(|v| serde_json::from_value::<Resp>(v).map_err(SyncError::from)) {
                Ok(resp) => responses.push(resp),
                Err(e) => {
                    warn!(target: "gatherer", key = %self.topic.key(), id, error = %e, "Dropping undecodable response");
                }
            }
        }
        Ok(responses)
    }
}

impl<Req, Resp> Gatherer<Req, Resp> {
    pub fn topic(&self) -> &Topic<GatherRequest<Req>> {
        &self.topic
    }

    /// Ids of requests this gatherer has sent and not yet finalized
    pub fn own_ids(&self) -> Vec<u64> {
        self.own.lock().iter().copied().collect()
    }

    /// Detach from the bus and drop the slots of unfinished requests.
    ///
    /// Peers still answering an abandoned request lose their slot and drop
    /// their response. Idempotent.
    pub fn destroy(&self) {
        self.topic.destroy();
        let owned: Vec<u64> = self.own.lock().drain().collect();
        if owned.is_empty() {
            return;
        }
        if let Some(registry) = self.topic.hub().registry() {
            for id in &owned {
                registry.remove(*id);
            }
        }
        debug!(target: "gatherer", key = %self.topic.key(), abandoned = owned.len(), "Gatherer destroyed");
    }
}

impl<Req, Resp> Drop for Gatherer<Req, Resp> {
    fn drop(&mut self) {
        self.destroy();
    }
}
