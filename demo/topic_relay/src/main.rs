use serde::{Deserialize, Serialize};
use tandem_core::{
    AckPolicy, Gatherer, Hub, HubConfig, SyncableTopic, Topic, TopicPublisher,
};
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Presence {
    user: String,
    online: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,tandem_core=info,topic_relay=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(target = "topic_relay", "Starting topic relay demo");

    // Defaults + optional TOML file + env overlay
    let hub = Hub::new(HubConfig::load());

    // 1) Two instances of test@v1 converge; test@v2 stays empty
    let t1: Topic<String> = Topic::new(&hub, "test", 1);
    t1.publish("value1".to_string()).await?;
    let t2: Topic<String> = Topic::new(&hub, "test", 1);
    t2.initialized().await;
    let t3: Topic<String> = Topic::new(&hub, "test", 2);
    info!(
        target = "topic_relay",
        t1 = ?t1.get_value(),
        t2 = ?t2.get_value(),
        t3 = ?t3.get_value(),
        "Topic bootstrap"
    );

    // 2) Observers and streams follow later updates
    t2.observe(|v: &String| info!(target = "topic_relay", value = %v, "t2 observed"));
    let mut updates = Box::pin(t1.subscribe());
    t2.publish("value2".to_string()).await?;
    if let Some(v) = updates.next().await {
        info!(target = "topic_relay", value = %v, "t1 stream head");
    }

    // 3) Typed state shared through a syncable topic and a write-only publisher
    let presence: SyncableTopic<Presence> = SyncableTopic::new(&hub, "presence", 1);
    // Nobody acknowledges here, so never wait for a resolve
    let writer: TopicPublisher<Presence> =
        TopicPublisher::with_policy(&hub, "presence", 1, AckPolicy::FireAndForget);
    writer
        .publish(Presence {
            user: "ada".to_string(),
            online: true,
        })
        .await?;
    match presence.read() {
        Ok(p) => info!(target = "topic_relay", user = %p.user, online = p.online, "Presence"),
        Err(e) => warn!(target = "topic_relay", error = %e, "Presence not available"),
    }

    // 4) Scatter/gather: every other responder answers once
    let _a = Gatherer::from_fn(&hub, "rpc", 1, |req: String| async move { format!("A:{req}") });
    let _b = Gatherer::from_fn(&hub, "rpc", 1, |req: String| async move { format!("B:{req}") });
    let client: Gatherer<String, String> =
        Gatherer::from_fn(&hub, "rpc", 1, |req: String| async move { format!("C:{req}") });
    let answers = client.gather("x".to_string()).await?;
    info!(target = "topic_relay", ?answers, "Gather complete");

    if let Some(counts) = hub.message_counts() {
        for key in ["test", "presence", "rpc"] {
            if let Some(c) = counts.get(key) {
                info!(
                    target = "topic_relay",
                    key,
                    instances = c.instances,
                    get = c.get,
                    next = c.next,
                    resolve = c.resolve,
                    "Message counts"
                );
            }
        }
    }

    info!(target = "topic_relay", stats = ?hub.bus().stats(), "Shutting down");
    hub.shutdown();
    Ok(())
}

