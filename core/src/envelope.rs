use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::stats::MessageStats;
use crate::Result;

/// Logical topic identity shared by independently created instances.
///
/// Two envelopes belong to the same topic iff both `name` and `version` match.
/// Distinct keys are fully independent topics that only share the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey {
    pub name: String,
    pub version: u32,
}

impl RoutingKey {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Discriminant of a [`Message`], used for stats and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Get,
    Next,
    Resolve,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvelopeKind::Get => "get",
            EnvelopeKind::Next => "next",
            EnvelopeKind::Resolve => "resolve",
        };
        f.write_str(s)
    }
}

/// Wire messages exchanged on the bus.
///
/// Serialized with an inline `kind` tag:
///
/// ```
/// use tandem_core::Message;
///
/// let json = serde_json::to_value(Message::Resolve { id: 7 }).unwrap();
/// assert_eq!(json, serde_json::json!({ "kind": "resolve", "id": 7 }));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// "I am new; does anyone hold a value for this routing key?"
    Get,
    /// The current or updated value, encoded as JSON so peers only need to
    /// agree on the wire shape.
    Next { value: serde_json::Value },
    /// Acknowledges a prior write identified by a caller-chosen id.
    Resolve { id: i64 },
}

impl Message {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Message::Get => EnvelopeKind::Get,
            Message::Next { .. } => EnvelopeKind::Next,
            Message::Resolve { .. } => EnvelopeKind::Resolve,
        }
    }
}

/// A timestamped, topic-scoped message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    key: RoutingKey,
    timestamp: Timestamp,
    #[serde(flatten)]
    message: Message,
}

impl Envelope {
    /// Builds an envelope with an explicit timestamp.
    ///
    /// Most callers go through [`EnvelopeFactory`], which stamps the hub clock
    /// and records stats.
    pub fn new(key: RoutingKey, timestamp: Timestamp, message: Message) -> Self {
        Self {
            key,
            timestamp,
            message,
        }
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.message.kind()
    }

    pub fn is_for(&self, key: &RoutingKey) -> bool {
        &self.key == key
    }
}

/// Stamps envelopes with the hub clock and reports them to the stats sink.
#[derive(Clone)]
pub struct EnvelopeFactory {
    clock: Arc<dyn Clock>,
    stats: Arc<dyn MessageStats>,
}

impl EnvelopeFactory {
    pub fn new(clock: Arc<dyn Clock>, stats: Arc<dyn MessageStats>) -> Self {
        Self { clock, stats }
    }

    pub fn get(&self, key: &RoutingKey) -> Envelope {
        self.build(key, Message::Get)
    }

    /// Serializes `value` into a `Next` envelope
    pub fn next<T: Serialize>(&self, key: &RoutingKey, value: &T) -> Result<Envelope> {
        let value = serde_json::to_value(value)?;
        Ok(self.build(key, Message::Next { value }))
    }

    pub fn resolve(&self, key: &RoutingKey, id: i64) -> Envelope {
        self.build(key, Message::Resolve { id })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn stats(&self) -> &Arc<dyn MessageStats> {
        &self.stats
    }

    fn build(&self, key: &RoutingKey, message: Message) -> Envelope {
        if self.stats.is_enabled() {
            self.stats.increase_message_count(&key.name, message.kind());
        }
        Envelope::new(key.clone(), self.clock.now(), message)
    }
}
