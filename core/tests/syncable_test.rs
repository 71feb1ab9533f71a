use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_core::{Hub, Result, SyncError, SyncableTopic, Topic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Session {
    user: String,
    roles: Vec<String>,
}

fn session() -> Session {
    Session {
        user: "ada".into(),
        roles: vec!["admin".into()],
    }
}

#[tokio::test]
async fn read_before_initialization_is_an_error() -> Result<()> {
    let hub = Hub::default();
    let topic: SyncableTopic<Session> = SyncableTopic::new(&hub, "session", 1);

    assert!(!topic.is_initialized());
    assert_eq!(topic.get_value(), None);
    match topic.read() {
        Err(SyncError::NotInitialized(key)) => assert_eq!(key.to_string(), "session@v1"),
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn wait_value_returns_converged_state() -> Result<()> {
    let hub = Hub::default();
    let owner: Topic<Session> = Topic::new(&hub, "session", 1);
    owner.publish(session()).await?;

    let embedded: SyncableTopic<Session> = SyncableTopic::new(&hub, "session", 1);
    let value = tokio::time::timeout(Duration::from_secs(1), embedded.wait_value())
        .await
        .expect("initialized")?;
    assert_eq!(value, session());
    assert_eq!(embedded.read()?, session());
    Ok(())
}

#[tokio::test]
async fn each_instance_keeps_its_own_copy() -> Result<()> {
    let hub = Hub::default();
    let a: SyncableTopic<u64> = SyncableTopic::new(&hub, "counter", 1);
    let b: SyncableTopic<u64> = SyncableTopic::new(&hub, "counter", 1);

    a.publish(1).await?;
    assert_eq!((a.read()?, b.read()?), (1, 1));

    b.destroy();
    a.publish(2).await?;
    assert_eq!(a.read()?, 2);
    assert_eq!(b.read()?, 1, "destroyed instance keeps its last copy");
    Ok(())
}

#[tokio::test]
async fn wraps_an_existing_topic() -> Result<()> {
    let hub = Hub::default();
    let topic: Topic<String> = Topic::new(&hub, "wrapped", 3);
    let syncable: SyncableTopic<String> = topic.into();
    syncable.publish("ok".into()).await?;
    syncable.initialized().await;
    assert_eq!(syncable.key().version, 3);
    assert_eq!(syncable.topic().get_value(), Some("ok".to_string()));
    Ok(())
}
