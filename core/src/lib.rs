// Tandem Core Library
// Cross-instance topic synchronization and scatter/gather over a shared bus

pub mod clock;
pub mod config;
pub mod envelope;
pub mod event;
pub mod gather;
pub mod hub;
pub mod publisher;
pub mod stats;
pub mod syncable;
pub mod topic;

// Export core types
pub use clock::{Clock, ManualClock, MonotonicClock, Timestamp};
pub use config::{AckPolicy, HubConfig};
pub use envelope::{Envelope, EnvelopeFactory, EnvelopeKind, Message, RoutingKey};
pub use event::{BusStats, Delivery, EventBus, ListenerId, ListenerKind};
pub use gather::{FnResponder, GatherRegistry, GatherRequest, Gatherer, Responder};
pub use hub::Hub;
pub use publisher::TopicPublisher;
pub use stats::{MessageCounter, MessageStats, NoopStats, TopicCounts};
pub use syncable::SyncableTopic;
pub use topic::{ObserverId, Topic};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Gather registry is not available")]
    RegistryUnavailable,

    #[error("Topic {0} has not been initialized")]
    NotInitialized(RoutingKey),

    #[error("Topic {0} has been destroyed")]
    Destroyed(RoutingKey),

    #[error("Responder error: {0}")]
    Responder(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, SyncError>;
