// Event bus implementation
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use crate::envelope::Envelope;

/// What a listener asks the bus to do after it handled an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Keep delivering to the remaining listeners.
    Continue,
    /// Do not deliver this envelope to listeners registered after this one.
    Stop,
    /// The envelope has been acted on: later local listeners skip it, later
    /// peer listeners still receive it and may act on it independently.
    Handled,
}

/// Which listeners a [`Delivery::Handled`] envelope still reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Ordinary listener; skipped once an earlier listener handled the envelope.
    Local,
    /// Protocol participant (a topic instance); never skipped by `Handled`.
    Peer,
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener_{}", self.0)
    }
}

type Listener = Arc<dyn Fn(&Envelope) -> Delivery + Send + Sync>;

/// Event bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub total_sent: u64,
    pub total_delivered: u64,
    pub stopped_dispatches: u64,
    pub handled_dispatches: u64,
    pub active_listeners: usize,
    pub backlog_size: usize,
}

struct Queued {
    envelope: Envelope,
    // Fires with the number of listeners that saw the envelope
    done: Option<oneshot::Sender<u64>>,
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<Queued>,
    draining: bool,
}

/// Shared in-process broadcast bus.
///
/// Every envelope is delivered to every listener, in registration order,
/// including the listener of the component that sent it. Delivery runs
/// in-line on the sending task. A send that arrives while a dispatch is in
/// progress (a listener replying, or another thread sending) is queued and
/// delivered by the active dispatcher once the current envelope has reached
/// every listener, so each listener observes envelopes in send order.
///
/// Listeners are synchronous and must not block.
#[derive(Default)]
pub struct EventBus {
    // Ordered: delivery follows registration order
    listeners: RwLock<Vec<(ListenerId, ListenerKind, Listener)>>,
    next_listener: AtomicU64,
    dispatch: Mutex<DispatchState>,

    // Statistics
    total_sent: AtomicU64,
    total_delivered: AtomicU64,
    stopped_dispatches: AtomicU64,
    handled_dispatches: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it sees every envelope sent after this call
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Envelope) -> Delivery + Send + Sync + 'static,
    {
        self.register(ListenerKind::Local, Arc::new(listener))
    }

    /// Register a peer listener, which still receives envelopes an earlier
    /// listener reported as [`Delivery::Handled`].
    pub fn subscribe_peer<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Envelope) -> Delivery + Send + Sync + 'static,
    {
        self.register(ListenerKind::Peer, Arc::new(listener))
    }

    fn register(&self, kind: ListenerKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write();
        listeners.push((id, kind, listener));
        debug!(target: "event_bus", listener = %id, ?kind, active = listeners.len(), "Listener registered");
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    ///
    /// A dispatch already in progress may still hand the current envelope to
    /// the removed listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        let removed = listeners.len() != before;
        if removed {
            debug!(target: "event_bus", listener = %id, active = listeners.len(), "Listener removed");
        }
        removed
    }

    /// Send an envelope without waiting for delivery.
    ///
    /// Outside a dispatch this delivers before returning. Inside a listener it
    /// only queues, and the envelope is delivered after the current one.
    pub fn send(&self, envelope: Envelope) {
        self.enqueue(Queued {
            envelope,
            done: None,
        });
    }

    /// Send an envelope and wait until every listener has seen it.
    ///
    /// Returns the number of listeners the envelope reached. Must not be
    /// awaited from inside a listener.
    pub async fn publish(&self, envelope: Envelope) -> u64 {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Queued {
            envelope,
            done: Some(tx),
        });
        rx.await.unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Get stats
    pub fn stats(&self) -> BusStats {
        BusStats {
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            stopped_dispatches: self.stopped_dispatches.load(Ordering::Relaxed),
            handled_dispatches: self.handled_dispatches.load(Ordering::Relaxed),
            active_listeners: self.listener_count(),
            backlog_size: self.dispatch.lock().queue.len(),
        }
    }

    /// Drop every listener. Envelopes still queued are delivered to nobody.
    pub fn shutdown(&self) {
        let mut listeners = self.listeners.write();
        info!(target: "event_bus", dropped = listeners.len(), "Event bus shutting down");
        listeners.clear();
    }

    fn enqueue(&self, item: Queued) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.dispatch.lock();
            state.queue.push_back(item);
            if state.draining {
                trace!(target: "event_bus", backlog = state.queue.len(), "Queued behind active dispatch");
                return;
            }
            state.draining = true;
        }

        let _guard = DrainGuard { bus: self };
        loop {
            let next = {
                let mut state = self.dispatch.lock();
                match state.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            let delivered = self.deliver(&next.envelope);
            if let Some(done) = next.done {
                let _ = done.send(delivered);
            }
        }
    }

    fn deliver(&self, envelope: &Envelope) -> u64 {
        // Snapshot so listeners can subscribe/unsubscribe while handling
        let snapshot: Vec<(ListenerKind, Listener)> = self
            .listeners
            .read()
            .iter()
            .map(|(_, kind, l)| (*kind, Arc::clone(l)))
            .collect();

        let mut delivered = 0;
        let mut handled = false;
        for (kind, listener) in snapshot {
            if handled && kind == ListenerKind::Local {
                continue;
            }
            delivered += 1;
            match listener(envelope) {
                Delivery::Continue => {}
                Delivery::Handled => {
                    if !handled {
                        handled = true;
                        self.handled_dispatches.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Delivery::Stop => {
                    self.stopped_dispatches.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        target: "event_bus",
                        key = %envelope.key(),
                        kind = %envelope.kind(),
                        "Dispatch stopped by listener"
                    );
                    break;
                }
            }
        }
        self.total_delivered.fetch_add(delivered, Ordering::Relaxed);
        delivered
    }
}

// Releases the dispatcher role if a listener panics mid-dispatch
struct DrainGuard<'a> {
    bus: &'a EventBus,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.bus.dispatch.lock().draining = false;
        }
    }
}
