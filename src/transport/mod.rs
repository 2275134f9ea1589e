/// Reconnecting, heartbeat-monitored named-event transport
pub mod frame;

use crate::error::TransportError;
use crate::events::{ClientEvent, EventSink};
use async_trait::async_trait;
use frame::Frame;
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Subscriber callback, invoked with the event's positional arguments
pub type Handler = Arc<dyn Fn(&[Value]) + Send + Sync>;

type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open text-frame link produced by a [`Connector`]
pub struct Socket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens the underlying bidirectional link
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError>;
}

/// Websocket link backed by tokio-tungstenite
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx.with(|text: String| {
            future::ready(Ok::<Message, TransportError>(Message::Text(text)))
        });
        // Ping/pong is answered inside tungstenite; only text frames carry events.
        let stream = ws_rx.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(payload)) => Some(Err(TransportError::Connection(format!(
                    "connection closed by server: {:?}",
                    payload
                )))),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            })
        });

        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Timing knobs for the transport
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    /// Idle time on the outbound side before a heartbeat frame is sent
    pub heartbeat_interval: Duration,
    /// Minimum spacing between connection attempts
    pub reconnect_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

enum Command {
    Emit(String),
    Close,
}

/// Handle to a logical connection.
///
/// The handle keeps its identity across reconnects: subscriptions registered
/// with [`Connection::on`] and frames queued with [`Connection::emit`] survive
/// any number of link failures.
#[derive(Clone)]
pub struct Connection {
    id: Uuid,
    url: String,
    handlers: Arc<RwLock<HashMap<String, Vec<Handler>>>>,
    commands: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
}

impl Connection {
    /// Connect to a websocket endpoint with default timings
    pub fn connect(url: impl Into<String>) -> Self {
        Self::with_connector(url, Arc::new(WebSocketConnector), TransportSettings::default())
    }

    /// Connect through a custom link provider.
    ///
    /// Must be called from within a tokio runtime; the connection runner is
    /// spawned immediately.
    pub fn with_connector(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        settings: TransportSettings,
    ) -> Self {
        let url = url.into();
        let id = Uuid::new_v4();
        let handlers: Arc<RwLock<HashMap<String, Vec<Handler>>>> = Arc::default();
        let open = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let runner = Runner {
            id,
            url: url.clone(),
            connector,
            settings,
            handlers: Arc::clone(&handlers),
            open: Arc::clone(&open),
            commands: command_rx,
            outbound: VecDeque::new(),
            last_attempt: None,
        };
        tokio::spawn(runner.run());

        Self {
            id,
            url,
            handlers,
            commands,
            open,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the underlying link is currently open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Subscribe to a named event. Handlers run in registration order.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Send a named event. Never fails: while the link is down the frame is
    /// queued and delivered in order after the next successful open.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        let text = match Frame::encode_event(event, &args) {
            Ok(text) => text,
            Err(e) => {
                warn!(event, "Failed to encode outbound event: {}", e);
                return;
            }
        };
        if self.commands.send(Command::Emit(text)).is_err() {
            debug!(event, "Transport closed, dropping outbound event");
        }
    }

    /// Stop the connection runner
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl EventSink for Connection {
    fn send_event(&self, event: ClientEvent) {
        self.emit(event.name(), event.args());
    }
}

enum Exit {
    Closed,
    Disconnected(String),
}

/// Owns the live link, the outbound queue and the heartbeat timer
struct Runner {
    id: Uuid,
    url: String,
    connector: Arc<dyn Connector>,
    settings: TransportSettings,
    handlers: Arc<RwLock<HashMap<String, Vec<Handler>>>>,
    open: Arc<AtomicBool>,
    commands: mpsc::UnboundedReceiver<Command>,
    outbound: VecDeque<String>,
    last_attempt: Option<Instant>,
}

impl Runner {
    async fn run(mut self) {
        info!(connection = %self.id, url = %self.url, "Transport runner starting");

        loop {
            let socket = match self.establish().await {
                Some(socket) => socket,
                None => break,
            };

            match self.serve(socket).await {
                Exit::Closed => break,
                Exit::Disconnected(reason) => {
                    self.open.store(false, Ordering::SeqCst);
                    warn!(
                        connection = %self.id,
                        queued = self.outbound.len(),
                        "Transport disconnected: {}",
                        reason
                    );
                }
            }
        }

        self.open.store(false, Ordering::SeqCst);
        info!(connection = %self.id, "Transport runner stopped");
    }

    /// Open a link, pacing attempts. Frames emitted meanwhile are queued.
    /// Returns `None` when the connection is closed before a link opens.
    async fn establish(&mut self) -> Option<Socket> {
        loop {
            let now = Instant::now();
            let start_at = match self.last_attempt {
                Some(previous) => (previous + self.settings.reconnect_interval).max(now),
                None => now,
            };
            self.last_attempt = Some(start_at);

            let connector = Arc::clone(&self.connector);
            let url = self.url.clone();
            let attempt = async move {
                tokio::time::sleep_until(start_at).await;
                connector.connect(&url).await
            };
            tokio::pin!(attempt);

            let result = loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    command = self.commands.recv() => match command {
                        Some(Command::Emit(text)) => self.outbound.push_back(text),
                        Some(Command::Close) | None => return None,
                    },
                }
            };

            match result {
                Ok(socket) => return Some(socket),
                Err(e) => warn!(connection = %self.id, "Connection attempt failed: {}", e),
            }
        }
    }

    async fn serve(&mut self, socket: Socket) -> Exit {
        let Socket {
            mut sink,
            mut stream,
        } = socket;
        self.open.store(true, Ordering::SeqCst);
        info!(connection = %self.id, queued = self.outbound.len(), "Transport connected");

        while let Some(text) = self.outbound.pop_front() {
            if let Err(e) = sink.send(text.clone()).await {
                self.outbound.push_front(text);
                return Exit::Disconnected(e.to_string());
            }
        }

        let interval = self.settings.heartbeat_interval;
        let mut heartbeat_at = Instant::now() + interval;

        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => return Exit::Disconnected(e.to_string()),
                    None => return Exit::Disconnected("link closed".to_string()),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Emit(text)) => {
                        trace!(connection = %self.id, "sending frame: {}", text);
                        if let Err(e) = sink.send(text.clone()).await {
                            self.outbound.push_front(text);
                            return Exit::Disconnected(e.to_string());
                        }
                        heartbeat_at = Instant::now() + interval;
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.close().await;
                        return Exit::Closed;
                    }
                },
                _ = tokio::time::sleep_until(heartbeat_at) => {
                    trace!(connection = %self.id, "sending heartbeat");
                    if let Err(e) = sink.send(frame::HEARTBEAT.to_string()).await {
                        return Exit::Disconnected(e.to_string());
                    }
                    heartbeat_at = Instant::now() + interval;
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match Frame::parse(text) {
            Some(Frame::Heartbeat) => trace!(connection = %self.id, "heartbeat received"),
            Some(Frame::Event { name, args }) => {
                let subscribers = {
                    let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
                    handlers.get(&name).cloned().unwrap_or_default()
                };
                if subscribers.is_empty() {
                    trace!(connection = %self.id, event = %name, "no subscribers for event");
                }
                for handler in subscribers {
                    handler(&args);
                }
            }
            None => trace!(connection = %self.id, "dropping malformed frame"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures::channel::mpsc as chan;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Server end of an in-memory link
    pub struct ServerEnd {
        pub from_client: chan::UnboundedReceiver<String>,
        pub to_client: chan::UnboundedSender<Result<String, TransportError>>,
    }

    impl ServerEnd {
        pub fn push(&self, text: &str) {
            let _ = self.to_client.unbounded_send(Ok(text.to_string()));
        }

        /// Next frame sent by the client, skipping heartbeats
        pub async fn next_event(&mut self) -> Option<String> {
            while let Some(text) = self.from_client.next().await {
                if text != frame::HEARTBEAT {
                    return Some(text);
                }
            }
            None
        }
    }

    /// Connector that hands the server end of every link to the test
    pub struct MemoryConnector {
        accepted: tokio::sync::mpsc::UnboundedSender<ServerEnd>,
        failures: AtomicUsize,
        pub attempts: Mutex<Vec<Instant>>,
    }

    impl MemoryConnector {
        pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<ServerEnd>) {
            let (accepted, rx) = tokio::sync::mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                accepted,
                failures: AtomicUsize::new(0),
                attempts: Mutex::new(Vec::new()),
            });
            (connector, rx)
        }

        /// Make the next `count` attempts fail
        pub fn fail_next(&self, count: usize) {
            self.failures.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, _url: &str) -> Result<Socket, TransportError> {
            self.attempts.lock().unwrap().push(Instant::now());
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::Connection("refused".to_string()));
            }

            let (client_tx, from_client) = chan::unbounded::<String>();
            let (to_client, client_rx) = chan::unbounded::<Result<String, TransportError>>();
            self.accepted
                .send(ServerEnd {
                    from_client,
                    to_client,
                })
                .map_err(|_| TransportError::Disconnected)?;

            Ok(Socket {
                sink: Box::pin(client_tx.sink_map_err(|_| TransportError::Disconnected)),
                stream: Box::pin(client_rx),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryConnector;
    use super::*;
    use serde_json::json;

    fn connection(connector: Arc<MemoryConnector>) -> Connection {
        Connection::with_connector("ws://test/socket/", connector, TransportSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_while_disconnected_are_flushed_in_order() {
        let (connector, mut accepted) = MemoryConnector::new();
        connector.fail_next(2);
        let conn = connection(connector.clone());

        conn.emit("fetch_now_playing", vec![]);
        conn.emit("get_stream", vec![json!("1")]);
        conn.emit("get_stream", vec![json!("2")]);

        let mut server = accepted.recv().await.unwrap();
        assert_eq!(server.next_event().await.unwrap(), r#"1["fetch_now_playing"]"#);
        assert_eq!(server.next_event().await.unwrap(), r#"1["get_stream","1"]"#);
        assert_eq!(server.next_event().await.unwrap(), r#"1["get_stream","2"]"#);
        assert!(conn.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_survives_reconnect_without_duplicates() {
        let (connector, mut accepted) = MemoryConnector::new();
        let conn = connection(connector.clone());

        let mut first = accepted.recv().await.unwrap();
        conn.emit("a", vec![]);
        assert_eq!(first.next_event().await.unwrap(), r#"1["a"]"#);

        drop(first);
        conn.emit("b", vec![]);
        conn.emit("c", vec![]);

        let mut second = accepted.recv().await.unwrap();
        assert_eq!(second.next_event().await.unwrap(), r#"1["b"]"#);
        assert_eq!(second.next_event().await.unwrap(), r#"1["c"]"#);

        // Nothing but heartbeats follows: "a" is not replayed.
        let next = second.from_client.next().await.unwrap();
        assert_eq!(next, frame::HEARTBEAT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_idle_interval() {
        let (connector, mut accepted) = MemoryConnector::new();
        let conn = connection(connector);

        let mut server = accepted.recv().await.unwrap();
        conn.emit("request_volume", vec![]);
        assert_eq!(server.from_client.next().await.unwrap(), r#"1["request_volume"]"#);
        let sent_at = Instant::now();

        assert_eq!(server.from_client.next().await.unwrap(), frame::HEARTBEAT);
        assert!(sent_at.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_attempts_are_rate_limited() {
        let (connector, mut accepted) = MemoryConnector::new();
        connector.fail_next(3);
        let _conn = connection(connector.clone());

        let _server = accepted.recv().await.unwrap();
        let attempts = connector.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_run_in_registration_order() {
        let (connector, mut accepted) = MemoryConnector::new();
        let conn = connection(connector);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let first = tx.clone();
        conn.on("volume", move |args| {
            let _ = first.send(format!("first:{}", args[0]));
        });
        let second = tx.clone();
        conn.on("volume", move |args| {
            let _ = second.send(format!("second:{}", args[0]));
        });
        let done = tx.clone();
        conn.on("done", move |_| {
            let _ = done.send("done".to_string());
        });

        let server = accepted.recv().await.unwrap();
        server.push("0");
        server.push("not a frame");
        server.push(r#"1["volume",40]"#);
        server.push(r#"1["unrelated"]"#);
        server.push(r#"1["done"]"#);

        let mut seen = Vec::new();
        while let Some(item) = rx.recv().await {
            if item == "done" {
                break;
            }
            seen.push(item);
        }
        assert_eq!(seen, vec!["first:40", "second:40"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_survive_reconnect() {
        let (connector, mut accepted) = MemoryConnector::new();
        let conn = connection(connector);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        conn.on("volume", move |args| {
            let _ = tx.send(args[0].clone());
        });

        let first = accepted.recv().await.unwrap();
        first.push(r#"1["volume",10]"#);
        assert_eq!(rx.recv().await.unwrap(), json!(10));
        drop(first);

        let second = accepted.recv().await.unwrap();
        second.push(r#"1["volume",20]"#);
        assert_eq!(rx.recv().await.unwrap(), json!(20));
    }
}
