use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::clock::Timestamp;
use crate::config::AckPolicy;
use crate::envelope::{Message, RoutingKey};
use crate::event::{Delivery, ListenerId};
use crate::hub::Hub;
use crate::{Result, SyncError};

type Resolvers = Arc<Mutex<HashMap<i64, oneshot::Sender<()>>>>;

/// Write-only handle on a routing key.
///
/// Sends updates without the bootstrap handshake and keeps no local state.
/// Whether `publish` waits for an acknowledgement is decided by the
/// [`AckPolicy`]:
///
/// * `FireAndForget`: resolves once the bus delivered the update.
/// * `AwaitResolve`: additionally waits for a `Resolve` envelope on the same
///   key whose id is the update's timestamp in microseconds (see
///   [`Hub::resolve`]). There is no timeout; wrap the call in
///   `tokio::time::timeout` when a bound is needed. A dropped call stops
///   waiting, and a late acknowledgement for it is ignored.
pub struct TopicPublisher<T> {
    key: RoutingKey,
    hub: Hub,
    policy: AckPolicy,
    resolvers: Resolvers,
    listener: Option<ListenerId>,
    destroyed: AtomicBool,
    _value: PhantomData<fn(T)>,
}

impl<T: Serialize> TopicPublisher<T> {
    /// Publisher using the hub's configured `publisher.ack` policy
    pub fn new(hub: &Hub, name: impl Into<String>, version: u32) -> Self {
        Self::with_policy(hub, name, version, hub.config().publisher.ack)
    }

    pub fn with_policy(
        hub: &Hub,
        name: impl Into<String>,
        version: u32,
        policy: AckPolicy,
    ) -> Self {
        let key = RoutingKey::new(name, version);
        let resolvers: Resolvers = Arc::new(Mutex::new(HashMap::new()));

        let listener = match policy {
            AckPolicy::FireAndForget => None,
            AckPolicy::AwaitResolve => {
                let key = key.clone();
                let resolvers = Arc::clone(&resolvers);
                Some(hub.bus().subscribe(move |env| {
                    if let Message::Resolve { id } = env.message() {
                        if env.is_for(&key) {
                            if let Some(tx) = resolvers.lock().remove(id) {
                                trace!(target: "publisher", key = %key, id, "Write acknowledged");
                                let _ = tx.send(());
                            }
                        }
                    }
                    Delivery::Continue
                }))
            }
        };

        debug!(target: "publisher", key = %key, ?policy, "Publisher created");
        Self {
            key,
            hub: hub.clone(),
            policy,
            resolvers,
            listener,
            destroyed: AtomicBool::new(false),
            _value: PhantomData,
        }
    }

    /// Send `value` as an update. Returns the update's timestamp.
    pub async fn publish(&self, value: T) -> Result<Timestamp> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(SyncError::Destroyed(self.key.clone()));
        }
        let env = self.hub.envelopes().next(&self.key, &value)?;
        let ts = env.timestamp();

        match self.policy {
            AckPolicy::FireAndForget => {
                self.hub.bus().publish(env).await;
            }
            AckPolicy::AwaitResolve => {
                // Registered before sending so an in-line acknowledgement is not missed
                let (tx, rx) = oneshot::channel();
                self.resolvers.lock().insert(ts.as_micros(), tx);
                let _pending = PendingAck {
                    resolvers: &self.resolvers,
                    id: ts.as_micros(),
                };
                self.hub.bus().publish(env).await;
                rx.await
                    .map_err(|_| SyncError::Destroyed(self.key.clone()))?;
            }
        }
        Ok(ts)
    }
}

// Forgets the resolver when `publish` is dropped before its acknowledgement
struct PendingAck<'a> {
    resolvers: &'a Resolvers,
    id: i64,
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        if self.resolvers.lock().remove(&self.id).is_some() {
            trace!(target: "publisher", id = self.id, "Stopped waiting for acknowledgement");
        }
    }
}

impl<T> TopicPublisher<T> {
    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    /// Writes still waiting for an acknowledgement
    pub fn pending_acks(&self) -> usize {
        self.resolvers.lock().len()
    }

    /// Detach from the bus; writes awaiting acknowledgement fail with
    /// `Destroyed`. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.listener {
            self.hub.bus().unsubscribe(id);
        }
        let abandoned = {
            let mut resolvers = self.resolvers.lock();
            let n = resolvers.len();
            resolvers.clear();
            n
        };
        debug!(target: "publisher", key = %self.key, abandoned, "Publisher destroyed");
    }
}

impl<T> Drop for TopicPublisher<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}
