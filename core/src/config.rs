use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, SyncError};

/// How [`TopicPublisher::publish`](crate::TopicPublisher::publish) confirms a write.
///
/// The protocol carries `Resolve` envelopes but nothing in it requires a
/// consumer to send them, so whether a publish waits for one is left to the
/// integrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Return once the bus has delivered the update.
    #[default]
    FireAndForget,
    /// Wait for a `Resolve` whose id equals the update's timestamp.
    AwaitResolve,
}

/// Hub configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub stats: StatsConfig,
    pub bus: BusConfig,
    pub gather: GatherConfig,
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Count instances and messages per topic name
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Values buffered per `Topic::subscribe` stream before a slow reader skips
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherConfig {
    /// Install the gather registry when the hub is built
    pub registry: bool,
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self { registry: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub ack: AckPolicy,
}

impl HubConfig {
    /// Load configuration from a TOML file (path via TANDEM_CONFIG or ./tandem.toml),
    /// overlaying env-driven values on top.
    pub fn load() -> Self {
        let path = std::env::var("TANDEM_CONFIG").unwrap_or_else(|_| "tandem.toml".into());
        let p = Path::new(&path);
        let base = if !p.exists() {
            tracing::info!(target: "hub", path = %path, "No TOML config found; using defaults/env");
            Self::default()
        } else {
            match Self::from_file(p) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(target: "hub", path = %path, error = %e, "Failed to load TOML; using defaults");
                    Self::default()
                }
            }
        };
        base.overlay_env()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Apply TANDEM_STATS / TANDEM_SUBSCRIBER_BUFFER / TANDEM_PUBLISHER_ACK
    pub fn overlay_env(self) -> Self {
        self.overlay(|k| std::env::var(k).ok())
    }

    fn overlay(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = var("TANDEM_STATS").and_then(|v| parse_bool(&v)) {
            self.stats.enabled = v;
        }
        if let Some(v) = var("TANDEM_SUBSCRIBER_BUFFER")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            self.bus.subscriber_buffer = v;
        }
        match var("TANDEM_PUBLISHER_ACK").as_deref() {
            Some("fire_and_forget") => self.publisher.ack = AckPolicy::FireAndForget,
            Some("await_resolve") => self.publisher.ack = AckPolicy::AwaitResolve,
            _ => {}
        }
        self
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
