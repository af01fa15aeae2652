//! Integration tests for joining channels over a real WebSocket.
//!
//! Each test starts an in-process pub/sub bus on 127.0.0.1 that speaks the
//! same envelope protocol as a production bus and records upgrade headers:
//! - `subscribe` is answered with an informational frame, then an ack
//!   (immediate, delayed, never, or rejected, per test)
//! - `publish` forwards the `message` text to every subscriber of the topic,
//!   the publisher included

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use webchannel::{ChannelClient, ChannelEvent, ClientConfig};

/// How the bus answers `subscribe`.
#[derive(Clone, Copy, Debug)]
enum AckMode {
    Immediate,
    Delayed(Duration),
    Never,
    Reject,
}

type Subscribers = Arc<Mutex<Vec<(String, mpsc::UnboundedSender<Message>)>>>;
type SeenHeaders = Arc<Mutex<Vec<(String, String)>>>;

struct TestBus {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    headers: SeenHeaders,
    kick: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TestBus {
    async fn start(ack: AckMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let (kick, kick_rx) = watch::channel(false);
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let headers: SeenHeaders = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&connections);
        let seen = Arc::clone(&headers);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    stream,
                    ack,
                    Arc::clone(&subscribers),
                    Arc::clone(&seen),
                    kick_rx.clone(),
                ));
            }
        });

        Self {
            addr,
            connections,
            headers,
            kick,
            task,
        }
    }

    fn uri(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Value of an upgrade request header seen on any connection.
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .lock()
            .unwrap()
            .iter()
            .find(|(seen, _)| seen == name)
            .map(|(_, value)| value.clone())
    }

    /// Close every connection from the bus side.
    fn kick_all(&self) {
        self.kick.send_replace(true);
    }
}

impl Drop for TestBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    ack: AckMode,
    subscribers: Subscribers,
    headers: SeenHeaders,
    mut kick: watch::Receiver<bool>,
) {
    let record = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let mut seen = headers.lock().unwrap();
        for (name, value) in request.headers() {
            seen.push((name.to_string(), value.to_str().unwrap_or_default().to_string()));
        }
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, record).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    loop {
        tokio::select! {
            frame = read.next() => {
                let Some(Ok(Message::Text(text))) = frame else {
                    break;
                };
                let envelope: Value = serde_json::from_str(&text).unwrap();
                let topic = envelope["topic"].as_str().unwrap_or_default().to_string();
                match envelope["action"].as_str() {
                    Some("subscribe") => {
                        let info = json!({"action": "info", "message": "welcome"});
                        let _ = tx.send(Message::text(info.to_string()));
                        subscribers.lock().unwrap().push((topic.clone(), tx.clone()));
                        send_ack(ack, &topic, &tx);
                    }
                    Some("publish") => {
                        let message = envelope["message"].as_str().unwrap_or_default();
                        for (subscribed, subscriber) in subscribers.lock().unwrap().iter() {
                            if *subscribed == topic {
                                let _ = subscriber.send(Message::text(message.to_string()));
                            }
                        }
                    }
                    _ => {}
                }
            }

            Some(outgoing) = rx.recv() => {
                if write.send(outgoing).await.is_err() {
                    break;
                }
            }

            _ = async { let _ = kick.wait_for(|kicked| *kicked).await; } => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

fn send_ack(ack: AckMode, topic: &str, tx: &mpsc::UnboundedSender<Message>) {
    let ack_frame = |message: &str| {
        Message::text(json!({"action": "subscribed", "topic": topic, "message": message}).to_string())
    };
    match ack {
        AckMode::Immediate => {
            let _ = tx.send(ack_frame("success"));
        }
        AckMode::Delayed(delay) => {
            let frame = ack_frame("success");
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(frame);
            });
        }
        AckMode::Never => {}
        AckMode::Reject => {
            let _ = tx.send(ack_frame("denied"));
        }
    }
}

fn test_config() -> ClientConfig {
    ClientConfig {
        join_timeout_ms: 5_000,
        handshake_timeout_ms: 2_000,
        scheme: "ws".to_string(),
        ..ClientConfig::default()
    }
}

/// Poll `condition` until it holds or two seconds pass.
async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event within 2s")
        .unwrap()
}

#[tokio::test]
async fn test_join_reports_channel_and_endpoint() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());

    let result = client.join("room1", &bus.uri()).await.unwrap();

    assert!(result.starts_with("connected to \"room1\""), "{result}");
    assert!(result.contains(&bus.uri()), "{result}");
    assert_eq!(client.report_channel_name(), "room1");
    assert_eq!(client.report_server_uri(), bus.uri());
    assert!(client.is_joined());
}

#[tokio::test]
async fn test_join_without_scheme_uses_configured_scheme() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());
    let bare = bus.addr.to_string();

    let result = client.join("room1", &bare).await.unwrap();

    assert!(result.contains(&format!("ws://{bare}")), "{result}");
    assert_eq!(client.report_server_uri(), bare);
}

#[tokio::test]
async fn test_join_same_uri_twice_is_idempotent() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());

    client.join("room1", &bus.uri()).await.unwrap();
    let again = client.join("room1", &bus.uri()).await.unwrap();

    assert_eq!(again, format!("already connected: {}", bus.uri()));
    assert_eq!(bus.connections(), 1);
}

#[tokio::test]
async fn test_join_same_uri_other_channel_keeps_current_channel() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());

    client.join("room1", &bus.uri()).await.unwrap();
    let again = client.join("room2", &bus.uri()).await.unwrap();

    assert!(again.starts_with("already connected"), "{again}");
    assert_eq!(client.report_channel_name(), "room1");
    assert_eq!(bus.connections(), 1);
}

#[tokio::test]
async fn test_concurrent_join_yields() {
    let slow = TestBus::start(AckMode::Delayed(Duration::from_millis(300))).await;
    let other = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());

    let first = {
        let client = client.clone();
        let uri = slow.uri();
        tokio::spawn(async move { client.join("room1", &uri).await })
    };
    assert!(eventually(|| slow.connections() == 1).await);

    let second = client.join("room2", &other.uri()).await;
    assert_eq!(second, None);
    assert_eq!(other.connections(), 0);

    let first = first.await.unwrap().unwrap();
    assert!(first.starts_with("connected to \"room1\""), "{first}");
    assert_eq!(client.report_channel_name(), "room1");
}

#[tokio::test]
async fn test_handshake_timeout_leaves_nothing_installed() {
    let bus = TestBus::start(AckMode::Never).await;
    let config = ClientConfig {
        handshake_timeout_ms: 200,
        ..test_config()
    };
    let client = ChannelClient::new(config);

    let result = client.join("room1", &bus.uri()).await.unwrap();

    assert_eq!(result, "Connection timeout after 200ms");
    assert!(!client.is_joined());
    assert_eq!(client.report_server_uri(), "");
    assert_eq!(client.leave(), "no channel joined");
}

#[tokio::test]
async fn test_join_timeout_leaves_nothing_installed() {
    let bus = TestBus::start(AckMode::Never).await;
    let config = ClientConfig {
        join_timeout_ms: 200,
        handshake_timeout_ms: 5_000,
        ..test_config()
    };
    let client = ChannelClient::new(config);

    let result = client.join("room1", &bus.uri()).await.unwrap();

    assert_eq!(result, "WebSocket connection timeout after 200ms");
    assert!(!client.is_joined());
    assert_eq!(client.report_server_uri(), "");
}

#[tokio::test]
async fn test_rejected_subscription_is_reported() {
    let bus = TestBus::start(AckMode::Reject).await;
    let client = ChannelClient::new(test_config());

    let result = client.join("room1", &bus.uri()).await.unwrap();

    assert!(result.contains("denied"), "{result}");
    assert!(!client.is_joined());
}

#[tokio::test]
async fn test_set_value_round_trips_through_bus() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());
    client.join("room1", &bus.uri()).await.unwrap();

    assert_eq!(client.set_value("score", "10"), "published score = 10");
    assert!(eventually(|| client.value_of("score") == "10").await);
}

#[tokio::test]
async fn test_value_shared_between_members() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let alice = ChannelClient::new(test_config());
    let bob = ChannelClient::new(test_config());
    alice.join("room1", &bus.uri()).await.unwrap();
    bob.join("room1", &bus.uri()).await.unwrap();

    alice.set_value("color", "blue");

    assert!(eventually(|| bob.value_of("color") == "blue").await);
}

#[tokio::test]
async fn test_send_event_delivered_once_with_hook() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let client = ChannelClient::builder()
        .config(test_config())
        .on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let mut events = client.subscribe_events();
    client.join("room1", &bus.uri()).await.unwrap();

    let result = client.send_event("ping", "hello world");
    assert_eq!(result, "published event: ping data: hello world");

    let event = next_event(&mut events).await;
    assert_eq!(event, ChannelEvent::new("ping", "hello world"));
    assert_eq!(client.last_event_type(), "ping");
    assert_eq!(client.last_event_data(), "hello world");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_leave_after_join() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());
    client.join("room1", &bus.uri()).await.unwrap();

    assert_eq!(client.leave(), "left from room1");
    assert_eq!(client.report_channel_name(), "");
    assert_eq!(client.report_server_uri(), "");
    assert_eq!(client.leave(), "no channel joined");

    // Offline again: values go to the local store.
    assert_eq!(client.set_value("k", "v"), "local k = v");
}

#[tokio::test]
async fn test_bus_closing_connection_tears_down_session() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());
    client.join("room1", &bus.uri()).await.unwrap();

    bus.kick_all();

    assert!(eventually(|| !client.is_joined()).await);
    assert_eq!(client.report_server_uri(), "");
}

#[tokio::test]
async fn test_join_other_uri_replaces_connection() {
    let first = TestBus::start(AckMode::Immediate).await;
    let second = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());

    client.join("room1", &first.uri()).await.unwrap();
    let result = client.join("room2", &second.uri()).await.unwrap();

    assert!(result.starts_with("connected to \"room2\""), "{result}");
    assert_eq!(client.report_channel_name(), "room2");
    assert_eq!(client.report_server_uri(), second.uri());

    // The replaced connection's close must not tear down the new session.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.is_joined());
}

#[tokio::test]
async fn test_values_read_while_joined_outlive_the_session() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::new(test_config());
    assert_eq!(client.set_value("offline", "1"), "local offline = 1");

    client.join("room1", &bus.uri()).await.unwrap();
    client.set_value("score", "10");
    assert!(eventually(|| client.value_of("score") == "10").await);
    assert_eq!(client.value_of("never-set"), "");
    // Joined reads come from the session, which never saw the offline value.
    assert_eq!(client.value_of("offline"), "");

    assert_eq!(client.leave(), "left from room1");

    assert_eq!(client.value_of("score"), "10");
    assert_eq!(client.value_of("offline"), "1");
    assert_eq!(client.value_of("never-set"), "");
}

#[tokio::test]
async fn test_panicking_hook_does_not_block_remote_delivery() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let client = ChannelClient::builder()
        .config(test_config())
        .on_event(|_| panic!("hook failure"))
        .build();
    let mut events = client.subscribe_events();
    client.join("room1", &bus.uri()).await.unwrap();

    client.send_event("first", "1");
    assert_eq!(next_event(&mut events).await, ChannelEvent::new("first", "1"));

    client.send_event("second", "2");
    assert_eq!(next_event(&mut events).await, ChannelEvent::new("second", "2"));
    assert_eq!(client.last_event_type(), "second");
    assert!(client.is_joined());
}

#[tokio::test]
async fn test_configured_headers_sent_with_upgrade() {
    let bus = TestBus::start(AckMode::Immediate).await;
    let mut config = test_config();
    config
        .headers
        .insert("x-webchannel-client".to_string(), "shell".to_string());
    let client = ChannelClient::new(config);

    client.join("room1", &bus.uri()).await.unwrap();

    assert_eq!(bus.header("x-webchannel-client").as_deref(), Some("shell"));
}
