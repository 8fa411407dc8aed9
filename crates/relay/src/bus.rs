// Publish/subscribe bus connecting relay processes.
//
// Redis carries events between processes. The in-process backend gives the
// same topic/pattern semantics inside one process, for single-node runs and
// tests. Both are constructed once at startup and shared by clone.

use futures_util::stream::{self, BoxStream, StreamExt};
use redis::{aio::ConnectionManager, AsyncCommands};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Subscription pattern covering every room topic.
pub const ROOM_TOPIC_PATTERN: &str = "doc:*";

const DEFAULT_MEMORY_BUS_CAPACITY: usize = 4096;

/// A raw message as it travels over the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(#[source] redis::RedisError),
    #[error("bus publish failed: {0}")]
    Publish(#[source] redis::RedisError),
    #[error("bus subscribe failed: {0}")]
    Subscribe(#[source] redis::RedisError),
}

/// Stream of messages matching a subscription pattern. Ends when the
/// underlying bus connection is lost; the bridge resubscribes.
pub type BusSubscription = BoxStream<'static, BusMessage>;

#[derive(Clone)]
pub enum Bus {
    Redis(RedisBus),
    Memory(MemoryBus),
}

impl Bus {
    pub fn in_memory() -> Self {
        Self::Memory(MemoryBus::default())
    }

    pub async fn redis(url: &str) -> Result<Self, BusError> {
        Ok(Self::Redis(RedisBus::connect(url).await?))
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        match self {
            Self::Redis(bus) => bus.publish(topic, payload).await,
            Self::Memory(bus) => {
                bus.publish(topic, payload);
                Ok(())
            }
        }
    }

    pub async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError> {
        match self {
            Self::Redis(bus) => bus.subscribe(pattern).await,
            Self::Memory(bus) => Ok(bus.subscribe(pattern)),
        }
    }
}

/// Redis pub/sub. Publishing shares one managed connection that reconnects
/// after a failed command; each subscription gets its own dedicated pub/sub
/// connection and ends when that connection drops.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(BusError::Connect)?;
        let publisher = ConnectionManager::new(client.clone()).await.map_err(BusError::Connect)?;
        Ok(Self { client, publisher })
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        let mut connection = self.publisher.clone();
        let _receivers: i64 = connection.publish(topic, payload).await.map_err(BusError::Publish)?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(BusError::Subscribe)?;
        pubsub.psubscribe(pattern).await.map_err(BusError::Subscribe)?;

        let messages = pubsub.into_on_message().filter_map(|message| async move {
            let topic = message.get_channel_name().to_owned();
            match message.get_payload::<String>() {
                Ok(payload) => Some(BusMessage { topic, payload }),
                Err(error) => {
                    warn!(topic = %topic, error = %error, "dropping non-text bus payload");
                    None
                }
            }
        });
        Ok(messages.boxed())
    }
}

/// In-process bus on a broadcast channel. Lagging subscribers skip
/// messages, matching the at-most-once contract of the Redis backend.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusMessage>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_BUS_CAPACITY)
    }
}

impl MemoryBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    fn publish(&self, topic: &str, payload: String) {
        // No receivers is not an error: nobody is subscribed yet.
        let _ = self.sender.send(BusMessage { topic: topic.to_owned(), payload });
    }

    fn subscribe(&self, pattern: &str) -> BusSubscription {
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_owned();
        stream::unfold((receiver, pattern), |(mut receiver, pattern)| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) if topic_matches(&pattern, &message.topic) => {
                        return Some((message, (receiver, pattern)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "in-process bus subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Glob match supporting `*` (any run of characters), as used by
/// `PSUBSCRIBE` patterns such as `doc:*`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let Some((prefix, rest)) = pattern.split_once('*') else {
        return pattern == topic;
    };
    let Some(remainder) = topic.strip_prefix(prefix) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    remainder
        .char_indices()
        .map(|(index, _)| index)
        .chain(std::iter::once(remainder.len()))
        .any(|index| topic_matches(rest, &remainder[index..]))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn room_pattern_matches_room_topics_only() {
        assert!(topic_matches(ROOM_TOPIC_PATTERN, "doc:1"));
        assert!(topic_matches(ROOM_TOPIC_PATTERN, "doc:abc-def"));
        assert!(topic_matches(ROOM_TOPIC_PATTERN, "doc:"));
        assert!(!topic_matches(ROOM_TOPIC_PATTERN, "user:1"));
        assert!(!topic_matches(ROOM_TOPIC_PATTERN, "do"));
    }

    #[test]
    fn glob_handles_inner_and_literal_patterns() {
        assert!(topic_matches("doc:*:cursor", "doc:7:cursor"));
        assert!(!topic_matches("doc:*:cursor", "doc:7:caret"));
        assert!(topic_matches("doc:1", "doc:1"));
        assert!(!topic_matches("doc:1", "doc:10"));
        assert!(topic_matches("*", "anything"));
    }

    #[tokio::test]
    async fn memory_bus_delivers_matching_topics_to_every_subscriber() {
        let bus = Bus::in_memory();
        let mut first = bus.subscribe(ROOM_TOPIC_PATTERN).await.unwrap();
        let mut second = bus.subscribe(ROOM_TOPIC_PATTERN).await.unwrap();

        bus.publish("user:1", "ignored".to_owned()).await.unwrap();
        bus.publish("doc:1", "hello".to_owned()).await.unwrap();

        let expected = BusMessage { topic: "doc:1".to_owned(), payload: "hello".to_owned() };
        assert_eq!(first.next().await, Some(expected.clone()));
        assert_eq!(second.next().await, Some(expected));
    }

    #[tokio::test]
    async fn memory_bus_publish_without_subscribers_succeeds() {
        let bus = Bus::in_memory();
        bus.publish("doc:1", "nobody listening".to_owned()).await.unwrap();
        assert_eq!(bus.backend(), "memory");
    }

    #[tokio::test]
    async fn lagging_memory_subscriber_keeps_receiving() {
        let bus = Bus::Memory(MemoryBus::with_capacity(2));
        let mut subscription = bus.subscribe(ROOM_TOPIC_PATTERN).await.unwrap();

        for n in 0..5 {
            bus.publish("doc:1", n.to_string()).await.unwrap();
        }

        let next = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("subscription should yield after lagging")
            .expect("subscription should stay open");
        assert_eq!(next.payload, "3");
    }
}
