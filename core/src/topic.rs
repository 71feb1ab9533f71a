//! Topic synchronization primitive.
//!
//! A [`Topic`] is one participant's view of a named, versioned value shared
//! over the hub bus. Participants never reference each other; they converge by
//! exchanging envelopes:
//!
//! 1. **Bootstrap**: a new topic registers its bus listener and sends `Get`.
//!    Every initialized peer answers by re-sending the `Next` it holds,
//!    verbatim, and marks the `Get` handled so local listeners skip it.
//! 2. **First accept**: an uninitialized topic accepts the first `Next` it sees
//!    for its key, whatever its timestamp. The answer to `Get` is usually an
//!    old envelope, and several peers may answer with different ones.
//! 3. **Last writer wins**: once initialized, a `Next` is accepted only if its
//!    timestamp is strictly greater than the held one. Ties are rejected.
//!
//! `publish` only sends. The local value changes when the envelope comes back
//! through the listener, the same path remote updates take, so a topic never
//! disagrees with what its own subscribers saw.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, trace, warn};

use crate::clock::Timestamp;
use crate::envelope::{Envelope, Message, RoutingKey};
use crate::event::{Delivery, ListenerId};
use crate::hub::Hub;
use crate::{Result, SyncError};

/// Handle returned by [`Topic::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A synchronized, versioned value.
///
/// Dropping a topic destroys it.
pub struct Topic<T> {
    shared: Arc<TopicShared<T>>,
    listener: ListenerId,
}

struct TopicShared<T> {
    key: RoutingKey,
    hub: Hub,
    state: Mutex<TopicState<T>>,
    initialized: watch::Sender<bool>,
    observers: RwLock<Vec<(ObserverId, Observer<T>)>>,
    next_observer: AtomicU64,
    destroyed: AtomicBool,
}

struct TopicState<T> {
    // Last accepted Next, replayed verbatim on Get
    last: Option<Envelope>,
    value: Option<T>,
    // Taken on destroy, which ends every subscriber stream
    updates: Option<broadcast::Sender<T>>,
}

impl<T> Topic<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Join the topic `(name, version)` on the hub bus.
    ///
    /// Sends the bootstrap `Get` before returning. If a peer already holds a
    /// value the returned topic is usually initialized, since the bus delivers
    /// in-line; callers should still await [`Topic::initialized`].
    pub fn new(hub: &Hub, name: impl Into<String>, version: u32) -> Self {
        let key = RoutingKey::new(name, version);
        let (initialized, _) = watch::channel(false);
        let (updates, _) = broadcast::channel(hub.config().bus.subscriber_buffer.max(1));

        let shared = Arc::new(TopicShared {
            key: key.clone(),
            hub: hub.clone(),
            state: Mutex::new(TopicState {
                last: None,
                value: None,
                updates: Some(updates),
            }),
            initialized,
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        });

        let weak: Weak<TopicShared<T>> = Arc::downgrade(&shared);
        let listener = hub.bus().subscribe_peer(move |env| match weak.upgrade() {
            Some(shared) => shared.on_envelope(env),
            None => Delivery::Continue,
        });

        let stats = hub.stats();
        if stats.is_enabled() {
            stats.increase_instance_count(&key.name);
        }

        debug!(target: "topic", key = %key, listener = %listener, "Topic created; sending get");
        hub.bus().send(hub.envelopes().get(&key));

        Self { shared, listener }
    }

    /// Send `value` to every instance of this topic, this one included.
    ///
    /// Resolves once the bus has delivered the update. Local state is not
    /// touched here; it changes when the update comes back through the bus.
    pub async fn publish(&self, value: T) -> Result<()> {
        if self.is_destroyed() {
            return Err(SyncError::Destroyed(self.shared.key.clone()));
        }
        let env = self.shared.hub.envelopes().next(&self.shared.key, &value)?;
        trace!(target: "topic", key = %self.shared.key, ts = %env.timestamp(), "Publishing");
        self.shared.hub.bus().publish(env).await;
        Ok(())
    }

    /// Payload of the last accepted update, `None` before initialization.
    pub fn get_value(&self) -> Option<T> {
        self.shared.state.lock().value.clone()
    }

    pub fn is_initialized(&self) -> bool {
        *self.shared.initialized.borrow()
    }

    /// Completes once the first update has been accepted.
    ///
    /// Never times out: if no peer ever answers, this never completes.
    pub async fn initialized(&self) {
        let mut rx = self.shared.initialized.subscribe();
        // The sender lives as long as `self`, so this only ends by matching
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Stream of accepted payloads.
    ///
    /// Starts with the held value, if any, then yields every update accepted
    /// afterwards. Never yields before initialization. A reader that falls
    /// more than `bus.subscriber_buffer` values behind skips the missed ones.
    ///
    /// The stream ends when the topic is destroyed or its hub shuts down.
    pub fn subscribe(&self) -> impl Stream<Item = T> + Send + 'static {
        // Hold the state lock so no update slips between snapshot and receiver
        let (current, rx) = {
            let state = self.shared.state.lock();
            let rx = match &state.updates {
                Some(tx) => tx.subscribe(),
                // Destroyed: a receiver whose sender is already gone
                None => broadcast::channel(1).1,
            };
            (state.value.clone(), rx)
        };
        let key = self.shared.key.clone();
        let updates = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(value) => Some(value),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(target: "topic", key = %key, skipped, "Subscriber lagged; skipping values");
                None
            }
        });
        let hub = self.shared.hub.clone();
        let stream = tokio_stream::iter(current).chain(updates);
        futures::StreamExt::take_until(stream, async move { hub.closed().await })
    }

    /// Register a callback run in-line, during bus delivery, for each
    /// accepted payload. Runs immediately with the held value, if any.
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ObserverId(self.shared.next_observer.fetch_add(1, Ordering::Relaxed));
        let observer: Observer<T> = Arc::new(observer);
        let current = {
            let state = self.shared.state.lock();
            self.shared
                .observers
                .write()
                .push((id, Arc::clone(&observer)));
            state.value.clone()
        };
        if let Some(value) = current {
            observer(&value);
        }
        id
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Timestamp of the held update
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.shared
            .state
            .lock()
            .last
            .as_ref()
            .map(Envelope::timestamp)
    }
}

impl<T> Topic<T> {
    pub fn key(&self) -> &RoutingKey {
        &self.shared.key
    }

    pub fn hub(&self) -> &Hub {
        &self.shared.hub
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Detach from the bus. Later envelopes are ignored. Idempotent.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.hub.bus().unsubscribe(self.listener);
        self.shared.observers.write().clear();
        self.shared.state.lock().updates.take();
        debug!(target: "topic", key = %self.shared.key, "Topic destroyed");
    }
}

impl<T> Drop for Topic<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T> TopicShared<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn on_envelope(&self, env: &Envelope) -> Delivery {
        if self.destroyed.load(Ordering::Acquire) || !env.is_for(&self.key) {
            return Delivery::Continue;
        }
        match env.message() {
            Message::Get => self.on_get(),
            Message::Next { value } => {
                self.on_next(env, value);
                Delivery::Continue
            }
            Message::Resolve { .. } => Delivery::Continue,
        }
    }

    fn on_get(&self) -> Delivery {
        let held = self.state.lock().last.clone();
        match held {
            Some(next) => {
                debug!(target: "topic", key = %self.key, ts = %next.timestamp(), "Replaying held value for get");
                self.hub.bus().send(next);
                Delivery::Handled
            }
            None => Delivery::Continue,
        }
    }

    fn on_next(&self, env: &Envelope, raw: &serde_json::Value) {
        let value = {
            let mut state = self.state.lock();
            if let Some(held) = &state.last {
                if env.timestamp() <= held.timestamp() {
                    trace!(
                        target: "topic",
                        key = %self.key,
                        incoming = %env.timestamp(),
                        held = %held.timestamp(),
                        "Rejected stale update"
                    );
                    return;
                }
            }
            let value: T = match serde_json::from_value(raw.clone()) {
                Ok(v) => v,
                Err(e) => {
                    warn!(target: "topic", key = %self.key, error = %e, "Ignoring undecodable update");
                    return;
                }
            };
            state.last = Some(env.clone());
            state.value = Some(value.clone());
            if let Some(updates) = &state.updates {
                // No receivers is fine
                let _ = updates.send(value.clone());
            }
            value
        };

        self.initialized.send_if_modified(|ready| !std::mem::replace(ready, true));
        debug!(target: "topic", key = %self.key, ts = %env.timestamp(), "Accepted update");

        let observers: Vec<Observer<T>> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer(&value);
        }
    }
}
