use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::RoutingKey;
use crate::hub::Hub;
use crate::topic::Topic;
use crate::{Result, SyncError};

/// A [`Topic`] meant to be read synchronously instead of subscribed to.
///
/// Each instance keeps its own copy of the converged value, and several
/// instances for the same routing key may be alive at once. Callers must only
/// read after [`initialized`](Self::initialized) has completed on every code
/// path that can reach the read; [`read`](Self::read) turns a premature read
/// into [`SyncError::NotInitialized`] instead of a silent `None`.
///
/// # Examples
///
/// ```no_run
/// use tandem_core::{Hub, SyncableTopic};
///
/// # async fn example() -> tandem_core::Result<()> {
/// let hub = Hub::default();
/// let theme: SyncableTopic<String> = SyncableTopic::new(&hub, "theme", 1);
/// let current = theme.wait_value().await?;
/// println!("theme is {current}");
/// # Ok(())
/// # }
/// ```
pub struct SyncableTopic<T> {
    inner: Topic<T>,
}

impl<T> SyncableTopic<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(hub: &Hub, name: impl Into<String>, version: u32) -> Self {
        Self {
            inner: Topic::new(hub, name, version),
        }
    }

    /// Held value, `None` before initialization
    pub fn get_value(&self) -> Option<T> {
        self.inner.get_value()
    }

    /// Held value, or `NotInitialized` if no update has been accepted yet
    pub fn read(&self) -> Result<T> {
        self.inner
            .get_value()
            .ok_or_else(|| SyncError::NotInitialized(self.inner.key().clone()))
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    pub async fn initialized(&self) {
        self.inner.initialized().await
    }

    /// Wait for initialization, then read.
    pub async fn wait_value(&self) -> Result<T> {
        self.inner.initialized().await;
        self.read()
    }

    pub async fn publish(&self, value: T) -> Result<()> {
        self.inner.publish(value).await
    }
}

impl<T> SyncableTopic<T> {
    pub fn key(&self) -> &RoutingKey {
        self.inner.key()
    }

    pub fn topic(&self) -> &Topic<T> {
        &self.inner
    }

    pub fn destroy(&self) {
        self.inner.destroy()
    }
}

impl<T> From<Topic<T>> for SyncableTopic<T> {
    fn from(inner: Topic<T>) -> Self {
        Self { inner }
    }
}
