// Debug statistics collaborator
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::envelope::EnvelopeKind;

/// Sink for instance and message counters.
///
/// Called opportunistically on envelope construction. Implementations must not
/// panic and must not block; counting never affects delivery.
#[cfg_attr(test, mockall::automock)]
pub trait MessageStats: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn increase_message_count(&self, name: &str, kind: EnvelopeKind);

    fn increase_instance_count(&self, name: &str);
}

/// Stats sink that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl MessageStats for NoopStats {
    fn is_enabled(&self) -> bool {
        false
    }

    fn increase_message_count(&self, _name: &str, _kind: EnvelopeKind) {}

    fn increase_instance_count(&self, _name: &str) {}
}

/// Snapshot of the counters kept for one topic name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCounts {
    pub instances: u64,
    pub get: u64,
    pub next: u64,
    pub resolve: u64,
}

/// In-memory counters keyed by topic name.
#[derive(Debug, Default)]
pub struct MessageCounter {
    enabled: AtomicBool,
    // name -> counts
    counts: DashMap<String, TopicCounts>,
    total_messages: AtomicU64,
}

impl MessageCounter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ..Default::default()
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Get counts for a topic name
    pub fn get(&self, name: &str) -> Option<TopicCounts> {
        self.counts.get(name).map(|c| c.clone())
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.counts.clear();
        self.total_messages.store(0, Ordering::Relaxed);
    }
}

impl MessageStats for MessageCounter {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn increase_message_count(&self, name: &str, kind: EnvelopeKind) {
        let mut entry = self.counts.entry(name.to_string()).or_default();
        match kind {
            EnvelopeKind::Get => entry.get += 1,
            EnvelopeKind::Next => entry.next += 1,
            EnvelopeKind::Resolve => entry.resolve += 1,
        }
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    fn increase_instance_count(&self, name: &str) {
        self.counts.entry(name.to_string()).or_default().instances += 1;
    }
}
