use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use futures_util::StreamExt;
use marginalia_common::protocol::ws::PresenceEvent;
use marginalia_common::types::{PeerId, RoomId};
use marginalia_relay::{
    bridge::{BridgeTasks, RelayBridge, ResubscribeBackoff},
    bus::{Bus, ROOM_TOPIC_PATTERN},
    dispatch::Dispatcher,
    metrics::RelayMetrics,
    rooms::{Connection, RoomRegistry},
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

fn annotation(n: u32) -> PresenceEvent {
    PresenceEvent::Annotation { annotation: json!({ "n": n }), peer: PeerId::from("A") }
}

/// Minimal RESP endpoint: `+OK` for every command, `:1` for `PUBLISH`. The
/// first connection is closed right after its first `PUBLISH` reply.
struct FlakyRedis {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    publishes: Arc<AtomicUsize>,
}

impl FlakyRedis {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        let connections = Arc::new(AtomicUsize::new(0));
        let publishes = Arc::new(AtomicUsize::new(0));

        let accepted = Arc::clone(&connections);
        let published = Arc::clone(&publishes);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let first = accepted.fetch_add(1, Ordering::SeqCst) == 0;
                tokio::spawn(serve_resp(stream, first, Arc::clone(&published)));
            }
        });

        Self { addr, connections, publishes }
    }

    fn url(&self) -> String {
        format!("redis://{}/", self.addr)
    }
}

async fn serve_resp(mut stream: TcpStream, drop_after_publish: bool, publishes: Arc<AtomicUsize>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Some((command, consumed)) = parse_resp_command(&buffer) {
            buffer.drain(..consumed);
            let is_publish = command.eq_ignore_ascii_case("PUBLISH");
            let reply: &[u8] = if is_publish { b":1\r\n" } else { b"+OK\r\n" };
            if stream.write_all(reply).await.is_err() {
                return;
            }
            if is_publish {
                publishes.fetch_add(1, Ordering::SeqCst);
                if drop_after_publish {
                    return;
                }
            }
        }

        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => buffer.extend_from_slice(&chunk[..read]),
        }
    }
}

/// Command name and consumed length of the first complete RESP array.
fn parse_resp_command(buffer: &[u8]) -> Option<(String, usize)> {
    let mut cursor = 0;
    let count: usize = resp_line(buffer, &mut cursor)?.strip_prefix('*')?.parse().ok()?;
    let mut name = String::new();
    for index in 0..count {
        let len: usize = resp_line(buffer, &mut cursor)?.strip_prefix('$')?.parse().ok()?;
        let end = cursor + len;
        if buffer.len() < end + 2 {
            return None;
        }
        if index == 0 {
            name = String::from_utf8_lossy(&buffer[cursor..end]).into_owned();
        }
        cursor = end + 2;
    }
    Some((name, cursor))
}

fn resp_line<'a>(buffer: &'a [u8], cursor: &mut usize) -> Option<&'a str> {
    let rest = &buffer[*cursor..];
    let end = rest.windows(2).position(|window| window == b"\r\n")?;
    let line = std::str::from_utf8(&rest[..end]).ok()?;
    *cursor += end + 2;
    Some(line)
}

#[tokio::test]
async fn publisher_reconnects_after_the_bus_drops_its_connection() {
    let redis = FlakyRedis::start().await;
    let metrics = Arc::new(RelayMetrics::default());
    let bus = Bus::redis(&redis.url()).await.expect("bus should connect to the local endpoint");
    let bridge = RelayBridge::new(bus, Arc::clone(&metrics));
    let room = RoomId::for_document("1");

    for n in 0..6 {
        bridge.publish(&room, &annotation(n)).await;
        sleep(Duration::from_millis(20)).await;
    }

    let published = metrics.events_published("presence.annotation");
    assert!(metrics.publish_failures() <= 1, "more than the in-flight event was lost");
    assert_eq!(published + metrics.publish_failures(), 6);
    assert!(redis.connections.load(Ordering::SeqCst) >= 2, "publisher never reconnected");
    assert_eq!(redis.publishes.load(Ordering::SeqCst) as u64, published);
}

// The scenarios below need a real server and run only when
// MARGINALIA_RELAY_TEST_REDIS_URL is set. They kill client connections, so
// they share one test to avoid disturbing each other.

struct Node {
    bridge: RelayBridge,
    registry: Arc<RoomRegistry>,
    metrics: Arc<RelayMetrics>,
    _tasks: BridgeTasks,
}

impl Node {
    async fn start(redis_url: &str) -> Self {
        let metrics = Arc::new(RelayMetrics::default());
        let registry = Arc::new(RoomRegistry::default());
        let bus = Bus::redis(redis_url).await.expect("bus should connect to test redis");
        let bridge = RelayBridge::new(bus, Arc::clone(&metrics)).with_resubscribe_backoff(
            ResubscribeBackoff { initial: Duration::from_millis(50), max: Duration::from_millis(500) },
        );
        let tasks = bridge
            .start(Dispatcher::new(Arc::clone(&registry), Arc::clone(&metrics)), 64)
            .await
            .expect("bridge should subscribe to room topics");
        Self { bridge, registry, metrics, _tasks: tasks }
    }

    async fn join(&self, room: &RoomId, peer: &str) -> mpsc::Receiver<Utf8Bytes> {
        let (connection, rx) = Connection::open(PeerId::from(peer), room.clone(), 16);
        self.registry.join(connection).await;
        rx
    }

    async fn wait_for_resubscribe(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.metrics.bus_resubscribes() == 0 || !self.bridge.is_subscribed() {
            assert!(Instant::now() < deadline, "bridge never resubscribed");
            sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn next_event(rx: &mut mpsc::Receiver<Utf8Bytes>, wait: Duration) -> Option<Value> {
    let frame = timeout(wait, rx.recv()).await.ok()??;
    Some(serde_json::from_str(frame.as_str()).expect("frame should be json"))
}

async fn kill_clients(redis_url: &str, kind: &str) {
    let client = redis::Client::open(redis_url).expect("redis url should parse");
    let mut admin =
        client.get_multiplexed_async_connection().await.expect("admin connection should open");
    let _killed: i64 = redis::cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg(kind)
        .arg("SKIPME")
        .arg("yes")
        .query_async(&mut admin)
        .await
        .expect("CLIENT KILL should succeed");
}

#[tokio::test]
async fn redis_bus_relays_between_nodes_and_survives_dropped_connections() {
    let Some(redis_url) = std::env::var("MARGINALIA_RELAY_TEST_REDIS_URL").ok() else {
        eprintln!("skipping redis bus integration test: set MARGINALIA_RELAY_TEST_REDIS_URL to run it");
        return;
    };
    let room = RoomId::for_document(&format!("it-{}", uuid::Uuid::new_v4()));

    // Pattern subscription reports the concrete room topic.
    let observer = Bus::redis(&redis_url).await.expect("observer should connect");
    let mut raw = observer.subscribe(ROOM_TOPIC_PATTERN).await.expect("psubscribe should succeed");
    observer
        .publish(room.as_str(), r#"{"type":"presence.left","userId":"Z"}"#.to_owned())
        .await
        .expect("publish should succeed");
    let message = timeout(Duration::from_secs(2), raw.next())
        .await
        .expect("pattern subscriber should receive the message")
        .expect("subscription should stay open");
    assert_eq!(message.topic, room.as_str());
    assert_eq!(message.payload, r#"{"type":"presence.left","userId":"Z"}"#);
    drop(raw);

    // Two nodes on one bus, origin excluded after the round trip.
    let first = Node::start(&redis_url).await;
    let second = Node::start(&redis_url).await;
    let mut alice = first.join(&room, "A").await;
    let mut bob = second.join(&room, "B").await;

    first.bridge.publish(&room, &PresenceEvent::Joined { peer: PeerId::from("A") }).await;
    assert_eq!(
        next_event(&mut bob, Duration::from_secs(2)).await,
        Some(json!({ "type": "presence.joined", "userId": "A" }))
    );
    assert_eq!(next_event(&mut alice, Duration::from_millis(200)).await, None);

    // Drop every subscriber and publisher connection.
    kill_clients(&redis_url, "pubsub").await;
    kill_clients(&redis_url, "normal").await;
    first.wait_for_resubscribe().await;
    second.wait_for_resubscribe().await;

    let mut delivered = None;
    for n in 0..20 {
        first.bridge.publish(&room, &annotation(n)).await;
        if let Some(event) = next_event(&mut bob, Duration::from_millis(250)).await {
            delivered = Some(event);
            break;
        }
    }
    let delivered = delivered.expect("events should flow again after reconnecting");
    assert_eq!(delivered["type"], "presence.annotation");
    assert!(first.metrics.publish_failures() <= 1, "more than the in-flight event was lost");

    first.bridge.publish(&room, &annotation(100)).await;
    assert_eq!(
        next_event(&mut bob, Duration::from_secs(2)).await,
        Some(json!({ "type": "presence.annotation", "annotation": { "n": 100 }, "userId": "A" }))
    );
}
