//! WebSocket streaming sink
//!
//! Streams events to a remote collector as JSON text frames and receives
//! commands back over the same socket.
//!
//! Connection lifecycle:
//! - `Disconnected` -> `Connecting` on `connect()`
//! - `Connecting` -> `Connected` on open: the `_auth` frame goes out first,
//!   then the buffer is flushed oldest first, then live sends resume
//! - any close or error -> `Disconnected`, and while reconnection is enabled
//!   a retry is scheduled after `reconnect_interval`
//! - `Failed` once `max_reconnect_attempts` retries are used up; a manual
//!   `connect()` starts over from zero attempts
//!
//! While not connected, `send` keeps only the `buffer_size` most recent events.

use eyre::{Result, eyre};
use futures_util::future::BoxFuture;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::bus::Sink;
use crate::event::Event;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Remote command callback; receives the command's payload
pub type CommandHandler = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    pub url: String,
    pub reconnect: bool,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub buffer_size: usize,
}

impl WebSocketOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: true,
            reconnect_interval: Duration::from_millis(3000),
            max_reconnect_attempts: 10,
            buffer_size: 100,
        }
    }
}

/// Identity sent in the `_auth` frame right after the socket opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub device_id: String,
    pub auth_token: Option<String>,
    pub user_agent: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    frame_type: String,
    command: Option<String>,
    #[serde(default)]
    payload: Value,
}

struct Connection {
    state: ConnectionState,
    buffer: VecDeque<Event>,
    reconnect_attempts: u32,
    reconnect_enabled: bool,
    outbox: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    /// Bumped on every open and every manual disconnect; a reader only acts
    /// on close if its generation is still current
    generation: u64,
}

struct Shared {
    options: WebSocketOptions,
    auth: AuthPayload,
    conn: Mutex<Connection>,
    handlers: RwLock<HashMap<String, CommandHandler>>,
}

#[derive(Clone)]
pub struct WebSocketSink {
    shared: Arc<Shared>,
}

impl fmt::Debug for WebSocketSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSink")
            .field("url", &self.shared.options.url)
            .field("state", &self.state())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

impl WebSocketSink {
    pub fn new(options: WebSocketOptions, auth: AuthPayload) -> Self {
        let reconnect_enabled = options.reconnect;
        Self {
            shared: Arc::new(Shared {
                options,
                auth,
                conn: Mutex::new(Connection {
                    state: ConnectionState::Disconnected,
                    buffer: VecDeque::new(),
                    reconnect_attempts: 0,
                    reconnect_enabled,
                    outbox: None,
                    reader: None,
                    retry: None,
                    generation: 0,
                }),
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &WebSocketOptions {
        &self.shared.options
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    pub fn buffered_len(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Events waiting for a connection, oldest first
    pub fn buffered_events(&self) -> Vec<Event> {
        self.lock().buffer.iter().cloned().collect()
    }

    /// Open the connection; resolves immediately when already connected
    ///
    /// Fails only if this attempt could not open the socket. A failed
    /// attempt still schedules a retry when reconnection is enabled.
    pub fn connect(&self) -> BoxFuture<'static, Result<()>> {
        let sink = self.clone();
        Box::pin(async move { sink.attempt(false).await })
    }

    /// Stop reconnecting, cancel any pending retry and close the socket
    pub fn disconnect(&self) {
        let mut conn = self.lock();
        conn.reconnect_enabled = false;
        conn.generation += 1;
        if let Some(retry) = conn.retry.take() {
            retry.abort();
        }
        if let Some(reader) = conn.reader.take() {
            reader.abort();
        }
        if let Some(outbox) = conn.outbox.take() {
            // The writer task sends the close frame and exits once the
            // sender is dropped
            let _ = outbox.send(Message::Close(None));
        }
        if conn.state != ConnectionState::Disconnected {
            log::info!("Disconnected from {}", self.shared.options.url);
        }
        conn.state = ConnectionState::Disconnected;
    }

    /// Register the handler for `command`, replacing any previous one
    pub fn on_command<F>(&self, command: &str, handler: F)
    where
        F: Fn(Value) -> Result<()> + Send + Sync + 'static,
    {
        self.on_command_handler(command, Arc::new(handler));
    }

    pub fn on_command_handler(&self, command: &str, handler: CommandHandler) {
        let mut handlers = self.shared.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(command.to_string(), handler).is_some() {
            log::debug!("Replaced handler for command '{}'", command);
        }
    }

    pub fn has_command(&self, command: &str) -> bool {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(command)
    }

    /// Handle one inbound text frame
    ///
    /// Only `command` frames are acted on. Malformed frames and unknown
    /// commands are logged; handler failures and panics are logged and never
    /// reach the connection.
    pub fn handle_frame(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Ignoring malformed frame: {}", e);
                return;
            }
        };

        if frame.frame_type != "command" {
            log::debug!("Ignoring inbound frame of type '{}'", frame.frame_type);
            return;
        }
        let Some(name) = frame.command else {
            log::warn!("Command frame without a command name");
            return;
        };

        let handler = self
            .shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned();
        let Some(handler) = handler else {
            log::warn!("Unknown command '{}'", name);
            return;
        };

        log::info!("Executing remote command '{}'", name);
        match catch_unwind(AssertUnwindSafe(|| handler(frame.payload))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Command '{}' failed: {:#}", name, e),
            Err(_) => log::error!("Command '{}' panicked", name),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.shared.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn attempt(&self, is_retry: bool) -> Result<()> {
        {
            let mut conn = self.lock();
            match conn.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {
                    log::debug!("Connection attempt already in progress");
                    return Ok(());
                }
                ConnectionState::Failed if !is_retry => conn.reconnect_attempts = 0,
                _ => {}
            }
            if is_retry {
                // This is the retry task itself; just forget its handle
                conn.retry.take();
            } else {
                if let Some(retry) = conn.retry.take() {
                    retry.abort();
                }
                conn.reconnect_enabled = self.shared.options.reconnect;
            }
            conn.state = ConnectionState::Connecting;
        }

        let url = self.shared.options.url.clone();
        log::info!("Connecting to {}", url);

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                self.on_open(stream);
                Ok(())
            }
            Err(e) => {
                log::warn!("Connection to {} failed: {}", url, e);
                let mut conn = self.lock();
                if conn.state == ConnectionState::Connecting {
                    conn.state = ConnectionState::Disconnected;
                    self.schedule_retry(&mut conn);
                }
                Err(eyre!("failed to connect to {}: {}", url, e))
            }
        }
    }

    fn on_open(&self, stream: WsStream) {
        let (mut write, read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    log::warn!("WebSocket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let mut conn = self.lock();
        if conn.state != ConnectionState::Connecting {
            // disconnect() won the race while the handshake was in flight
            let _ = tx.send(Message::Close(None));
            return;
        }

        conn.generation += 1;
        conn.state = ConnectionState::Connected;
        conn.reconnect_attempts = 0;

        let auth = serde_json::json!({ "type": "_auth", "payload": self.shared.auth });
        let _ = tx.send(Message::Text(auth.to_string().into()));

        let flushed = conn.buffer.len();
        for event in conn.buffer.drain(..) {
            match event.to_json() {
                Ok(json) => {
                    let _ = tx.send(Message::Text(json.into()));
                }
                Err(e) => log::warn!("Dropping unserializable buffered event: {}", e),
            }
        }
        conn.outbox = Some(tx);

        let generation = conn.generation;
        let sink = self.clone();
        conn.reader = Some(tokio::spawn(async move {
            sink.read_loop(read, generation).await;
        }));

        log::info!("Connected to {} ({} buffered events flushed)", self.shared.options.url, flushed);
    }

    async fn read_loop(&self, mut read: SplitStream<WsStream>, generation: u64) {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_frame(text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("WebSocket read failed: {}", e);
                    break;
                }
            }
        }
        self.on_close(generation);
    }

    fn on_close(&self, generation: u64) {
        let mut conn = self.lock();
        if conn.generation != generation {
            return;
        }
        log::info!("Connection to {} closed", self.shared.options.url);
        conn.outbox = None;
        conn.reader = None;
        conn.state = ConnectionState::Disconnected;
        self.schedule_retry(&mut conn);
    }

    fn schedule_retry(&self, conn: &mut Connection) {
        if !conn.reconnect_enabled {
            return;
        }
        if conn.reconnect_attempts >= self.shared.options.max_reconnect_attempts {
            log::error!(
                "Giving up on {} after {} reconnect attempts",
                self.shared.options.url,
                conn.reconnect_attempts
            );
            conn.state = ConnectionState::Failed;
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No async runtime available to schedule a reconnect");
            return;
        };

        conn.reconnect_attempts += 1;
        let attempt = conn.reconnect_attempts;
        let interval = self.shared.options.reconnect_interval;
        log::info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            self.shared.options.url,
            interval,
            attempt,
            self.shared.options.max_reconnect_attempts
        );

        let sink = self.clone();
        conn.retry = Some(runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Err(e) = sink.retry().await {
                log::debug!("Reconnect attempt {} failed: {:#}", attempt, e);
            }
        }));
    }

    fn retry(&self) -> BoxFuture<'static, Result<()>> {
        let sink = self.clone();
        Box::pin(async move { sink.attempt(true).await })
    }
}

impl Sink for WebSocketSink {
    fn name(&self) -> &str {
        "websocket"
    }

    fn send(&self, event: &Event) -> Result<()> {
        let mut conn = self.lock();

        if conn.state == ConnectionState::Connected {
            if let Some(outbox) = &conn.outbox {
                let json = event.to_json()?;
                if outbox.send(Message::Text(json.into())).is_ok() {
                    return Ok(());
                }
            }
        }

        let capacity = self.shared.options.buffer_size;
        if capacity == 0 {
            return Ok(());
        }
        while conn.buffer.len() >= capacity {
            conn.buffer.pop_front();
        }
        conn.buffer.push_back(event.clone());
        Ok(())
    }
}
