use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tandem_core::{
    Delivery, Envelope, Hub, HubConfig, ManualClock, Message, NoopStats, Result, RoutingKey,
    Timestamp, Topic,
};
use tokio_stream::StreamExt;

fn manual_hub(start: i64) -> (Hub, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start));
    let hub = Hub::with_parts(HubConfig::default(), clock.clone(), Arc::new(NoopStats));
    (hub, clock)
}

fn next(key: &RoutingKey, ts: i64, value: &str) -> Envelope {
    Envelope::new(
        key.clone(),
        Timestamp(ts),
        Message::Next {
            value: serde_json::json!(value),
        },
    )
}

fn counting_observer(topic: &Topic<String>) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    topic.observe(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    calls
}

#[tokio::test]
async fn first_update_is_accepted_whatever_its_timestamp() -> Result<()> {
    let (hub, _clock) = manual_hub(1_000_000);
    let topic: Topic<String> = Topic::new(&hub, "test", 1);
    assert!(!topic.is_initialized());
    assert_eq!(topic.get_value(), None);

    // Far older than the hub clock
    hub.bus().send(next(topic.key(), 3, "old"));

    assert!(topic.is_initialized());
    assert_eq!(topic.get_value(), Some("old".to_string()));
    assert_eq!(topic.last_timestamp(), Some(Timestamp(3)));
    Ok(())
}

#[tokio::test]
async fn later_updates_need_a_strictly_greater_timestamp() -> Result<()> {
    let (hub, _clock) = manual_hub(0);
    let topic: Topic<String> = Topic::new(&hub, "test", 1);
    let key = topic.key().clone();
    hub.bus().send(next(&key, 10, "a"));
    let calls = counting_observer(&topic);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "observer replays held value");

    // Tie
    hub.bus().send(next(&key, 10, "tie"));
    assert_eq!(topic.get_value(), Some("a".to_string()));
    // Older
    hub.bus().send(next(&key, 9, "older"));
    assert_eq!(topic.get_value(), Some("a".to_string()));
    assert_eq!(topic.last_timestamp(), Some(Timestamp(10)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    hub.bus().send(next(&key, 11, "newer"));
    assert_eq!(topic.get_value(), Some("newer".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn routing_keys_are_isolated() -> Result<()> {
    let hub = Hub::default();
    let v1: Topic<String> = Topic::new(&hub, "test", 1);
    let v2: Topic<String> = Topic::new(&hub, "test", 2);
    let other: Topic<String> = Topic::new(&hub, "other", 1);

    v1.publish("value1".into()).await?;

    assert_eq!(v1.get_value(), Some("value1".to_string()));
    assert_eq!(v2.get_value(), None);
    assert_eq!(other.get_value(), None);
    assert!(!v2.is_initialized());
    Ok(())
}

#[tokio::test]
async fn late_joiner_converges_through_bootstrap() -> Result<()> {
    let hub = Hub::default();
    let t1: Topic<String> = Topic::new(&hub, "test", 1);
    t1.publish("value1".into()).await?;

    let t2: Topic<String> = Topic::new(&hub, "test", 1);
    tokio::time::timeout(Duration::from_secs(1), t2.initialized())
        .await
        .expect("late joiner should initialize");
    assert_eq!(t2.get_value(), Some("value1".to_string()));
    // The replay keeps the original timestamp
    assert_eq!(t2.last_timestamp(), t1.last_timestamp());

    let t3: Topic<String> = Topic::new(&hub, "test", 2);
    let waited = tokio::time::timeout(Duration::from_millis(50), t3.initialized()).await;
    assert!(waited.is_err(), "a different version never initializes");
    assert_eq!(t3.get_value(), None);
    Ok(())
}

#[tokio::test]
async fn early_joiner_sees_later_publish() -> Result<()> {
    let hub = Hub::default();
    let t2: Topic<String> = Topic::new(&hub, "test", 1);
    let t1: Topic<String> = Topic::new(&hub, "test", 1);

    t1.publish("value1".into()).await?;

    t2.initialized().await;
    assert_eq!(t2.get_value(), Some("value1".to_string()));
    Ok(())
}

#[tokio::test]
async fn publish_only_changes_state_through_the_bus() -> Result<()> {
    let hub = Hub::default();
    let cell: Arc<OnceLock<Arc<Topic<String>>>> = Arc::new(OnceLock::new());
    let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));

    // Registered ahead of the topic, so it sees each update first
    let (c, s) = (Arc::clone(&cell), Arc::clone(&seen));
    hub.bus().subscribe(move |env| {
        if let (Message::Next { .. }, Some(topic)) = (env.message(), c.get()) {
            s.lock().unwrap().push(topic.get_value());
        }
        Delivery::Continue
    });

    let topic = Arc::new(Topic::<String>::new(&hub, "test", 1));
    let _ = cell.set(Arc::clone(&topic));

    topic.publish("v".into()).await?;

    assert_eq!(*seen.lock().unwrap(), vec![None]);
    assert_eq!(topic.get_value(), Some("v".to_string()));
    Ok(())
}

#[tokio::test]
async fn peers_agree_after_concurrent_publishes() -> Result<()> {
    let hub = Hub::default();
    let a: Topic<u32> = Topic::new(&hub, "counter", 1);
    let b: Topic<u32> = Topic::new(&hub, "counter", 1);

    let (ra, rb) = tokio::join!(a.publish(1), b.publish(2));
    ra?;
    rb?;
    let c: Topic<u32> = Topic::new(&hub, "counter", 1);

    assert_eq!(a.get_value(), b.get_value());
    assert_eq!(b.get_value(), c.get_value());
    assert_eq!(a.last_timestamp(), c.last_timestamp());
    Ok(())
}

#[tokio::test]
async fn subscribe_yields_current_then_updates() -> Result<()> {
    let hub = Hub::default();
    let topic: Topic<String> = Topic::new(&hub, "test", 1);
    topic.publish("one".into()).await?;

    let mut stream = Box::pin(topic.subscribe());
    topic.publish("two".into()).await?;
    topic.publish("three".into()).await?;

    let mut got = Vec::new();
    for _ in 0..3 {
        let v = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        got.push(v);
    }
    assert_eq!(got, vec!["one", "two", "three"]);
    Ok(())
}

#[tokio::test]
async fn subscribe_waits_for_initialization() -> Result<()> {
    let hub = Hub::default();
    let topic: Topic<String> = Topic::new(&hub, "test", 1);
    let mut stream = Box::pin(topic.subscribe());

    let early = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(early.is_err(), "nothing before initialization");

    topic.publish("first".into()).await?;
    let v = tokio::time::timeout(Duration::from_millis(500), stream.next())
        .await
        .expect("timeout");
    assert_eq!(v, Some("first".to_string()));
    Ok(())
}

#[tokio::test]
async fn undecodable_update_is_ignored() -> Result<()> {
    let (hub, _clock) = manual_hub(0);
    let topic: Topic<u32> = Topic::new(&hub, "typed", 1);
    let key = topic.key().clone();

    hub.bus().send(next(&key, 5, "not a number"));
    assert!(!topic.is_initialized());

    hub.bus().send(Envelope::new(
        key,
        Timestamp(6),
        Message::Next {
            value: serde_json::json!(7),
        },
    ));
    assert_eq!(topic.get_value(), Some(7));
    Ok(())
}

#[tokio::test]
async fn destroyed_topic_ignores_updates() -> Result<()> {
    let hub = Hub::default();
    let writer: Topic<String> = Topic::new(&hub, "test", 1);
    let reader: Topic<String> = Topic::new(&hub, "test", 1);
    let listeners = hub.bus().listener_count();

    reader.destroy();
    reader.destroy();
    assert!(reader.is_destroyed());
    assert_eq!(hub.bus().listener_count(), listeners - 1);

    writer.publish("after".into()).await?;
    assert_eq!(reader.get_value(), None);
    assert!(matches!(
        reader.publish("x".into()).await,
        Err(tandem_core::SyncError::Destroyed(_))
    ));
    Ok(())
}

#[tokio::test]
async fn dropping_a_topic_detaches_it() -> Result<()> {
    let hub = Hub::default();
    {
        let _t: Topic<String> = Topic::new(&hub, "test", 1);
        assert_eq!(hub.bus().listener_count(), 1);
    }
    assert_eq!(hub.bus().listener_count(), 0);
    Ok(())
}

#[tokio::test]
async fn every_initialized_peer_answers_get() -> Result<()> {
    let hub = Hub::default();
    let a: Topic<String> = Topic::new(&hub, "test", 1);
    let _b: Topic<String> = Topic::new(&hub, "test", 1);
    a.publish("held".into()).await?;

    let before = hub.bus().stats();
    let c: Topic<String> = Topic::new(&hub, "test", 1);
    let after = hub.bus().stats();

    assert_eq!(c.get_value(), Some("held".to_string()));
    assert_eq!(c.last_timestamp(), a.last_timestamp());
    // One get, one replay per initialized peer
    assert_eq!(after.total_sent - before.total_sent, 3);
    assert_eq!(after.handled_dispatches - before.handled_dispatches, 1);
    assert_eq!(after.stopped_dispatches, before.stopped_dispatches);
    Ok(())
}

#[tokio::test]
async fn newcomer_converges_past_a_peer_it_cannot_decode() -> Result<()> {
    let hub = Hub::default();
    // Registered first, so its replay reaches the newcomer first
    let numbers: Topic<u32> = Topic::new(&hub, "shared", 1);
    numbers.publish(1).await?;
    let words: Topic<String> = Topic::new(&hub, "shared", 1);
    words.publish("fresh".into()).await?;

    let newcomer: Topic<String> = Topic::new(&hub, "shared", 1);
    tokio::time::timeout(Duration::from_secs(1), newcomer.initialized())
        .await
        .expect("newcomer should initialize");
    assert_eq!(newcomer.get_value(), Some("fresh".to_string()));
    assert_eq!(numbers.get_value(), Some(1));
    Ok(())
}

#[tokio::test]
async fn get_is_hidden_from_local_listeners_once_answered() -> Result<()> {
    let hub = Hub::default();
    let a: Topic<String> = Topic::new(&hub, "test", 1);
    a.publish("held".into()).await?;

    let gets = Arc::new(AtomicUsize::new(0));
    let g = Arc::clone(&gets);
    hub.bus().subscribe(move |env| {
        if let Message::Get = env.message() {
            g.fetch_add(1, Ordering::SeqCst);
        }
        Delivery::Continue
    });

    let _late: Topic<String> = Topic::new(&hub, "test", 1);
    assert_eq!(gets.load(Ordering::SeqCst), 0);

    let _other: Topic<String> = Topic::new(&hub, "other", 1);
    assert_eq!(gets.load(Ordering::SeqCst), 1, "unanswered gets still reach it");
    Ok(())
}

#[tokio::test]
async fn destroy_ends_subscriber_streams() -> Result<()> {
    let hub = Hub::default();
    let topic: Topic<String> = Topic::new(&hub, "test", 1);
    let mut stream = Box::pin(topic.subscribe());

    topic.destroy();
    let end = tokio::time::timeout(Duration::from_millis(500), stream.next())
        .await
        .expect("stream should end");
    assert_eq!(end, None);

    let mut late = Box::pin(topic.subscribe());
    let end = tokio::time::timeout(Duration::from_millis(500), late.next())
        .await
        .expect("stream should end");
    assert_eq!(end, None);
    Ok(())
}

#[tokio::test]
async fn hub_shutdown_ends_subscriber_streams() -> Result<()> {
    let hub = Hub::default();
    let topic: Topic<String> = Topic::new(&hub, "test", 1);
    topic.publish("v".into()).await?;
    let mut stream = Box::pin(topic.subscribe());
    assert_eq!(stream.next().await, Some("v".to_string()));

    hub.shutdown();
    assert!(hub.is_shut_down());
    let end = tokio::time::timeout(Duration::from_millis(500), stream.next())
        .await
        .expect("stream should end");
    assert_eq!(end, None);
    Ok(())
}

#[tokio::test]
async fn stats_count_instances_and_messages() -> Result<()> {
    let mut config = HubConfig::default();
    config.stats.enabled = true;
    let hub = Hub::new(config);

    let a: Topic<String> = Topic::new(&hub, "cart", 1);
    let _b: Topic<String> = Topic::new(&hub, "cart", 1);
    a.publish("x".into()).await?;

    let counts = hub.message_counts().expect("counter").get("cart").expect("cart");
    assert_eq!(counts.instances, 2);
    assert_eq!(counts.get, 2);
    assert_eq!(counts.next, 1);
    Ok(())
}
