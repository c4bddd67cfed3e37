//! Debug relay server
//!
//! Sits between devices running the agent and the people watching them.
//! Two WebSocket endpoints:
//! - devices connect to `ws_port`, authenticate with `_auth`, then stream
//!   events; each event is tagged with `deviceId`, kept in a per-device ring
//!   and broadcast to subscribers
//! - subscribers connect to `ws_port + 1`, get `devices.list` on connect and
//!   may ask for a device's stored events or push a command to it
//!
//! A read-only HTTP API on `http_port` serves `GET /api/devices` and
//! `GET /api/device/{id}`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use eyre::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub const DEFAULT_WS_PORT: u16 = 9229;

/// Clear of the default device and subscriber ports
pub const DEFAULT_HTTP_PORT: u16 = 9231;

/// Events kept per device
pub const EVENT_HISTORY: usize = 1000;

type Outbox = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub user_agent: String,
    pub url: String,
    pub connected_at: String,
    pub last_seen: String,
}

#[derive(Default)]
struct Registry {
    devices: BTreeMap<String, DeviceRecord>,
    events: HashMap<String, VecDeque<Value>>,
    connections: HashMap<String, Outbox>,
    subscribers: HashMap<u64, Outbox>,
    next_subscriber: u64,
}

impl Registry {
    fn broadcast(&mut self, frame: &Value) {
        let text = frame.to_string();
        self.subscribers
            .retain(|_, outbox| outbox.send(Message::Text(text.clone().into())).is_ok());
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriberRequest {
    #[serde(rename = "type")]
    request_type: String,
    device_id: Option<String>,
    command: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Clone, Default)]
pub struct Relay {
    registry: Arc<Mutex<Registry>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every endpoint on `host` and serve until one of them fails
    pub async fn serve(&self, host: &str, ws_port: u16, http_port: u16) -> Result<()> {
        let subscriber_port = ws_port.saturating_add(1);
        if http_port == ws_port || http_port == subscriber_port {
            bail!(
                "HTTP port {} collides with the WebSocket ports {} and {}",
                http_port,
                ws_port,
                subscriber_port
            );
        }

        let device_addr = format!("{}:{}", host, ws_port);
        let subscriber_addr = format!("{}:{}", host, subscriber_port);
        let http_addr = format!("{}:{}", host, http_port);

        let devices = TcpListener::bind(&device_addr)
            .await
            .context(format!("Failed to bind device endpoint {}", device_addr))?;
        let subscribers = TcpListener::bind(&subscriber_addr)
            .await
            .context(format!("Failed to bind subscriber endpoint {}", subscriber_addr))?;
        let http = TcpListener::bind(&http_addr)
            .await
            .context(format!("Failed to bind HTTP endpoint {}", http_addr))?;

        log::info!("Device endpoint listening on ws://{}", device_addr);
        log::info!("Subscriber endpoint listening on ws://{}", subscriber_addr);
        log::info!("HTTP API listening on http://{}", http_addr);

        tokio::select! {
            result = self.run(devices, subscribers) => result,
            result = self.serve_http(http) => result,
        }
    }

    /// Serve the HTTP API on an already bound listener
    pub async fn serve_http(&self, listener: TcpListener) -> Result<()> {
        axum::serve(listener, self.http_router())
            .into_future()
            .await
            .context("HTTP API failed")
    }

    pub fn http_router(&self) -> Router {
        Router::new()
            .route("/api/devices", get(list_devices))
            .route("/api/device/{device_id}", get(device_detail))
            .fallback(unknown_route)
            .with_state(self.clone())
    }

    /// Serve on already bound listeners
    pub async fn run(&self, devices: TcpListener, subscribers: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                accepted = devices.accept() => {
                    let (stream, addr) = accepted.context("Failed to accept device connection")?;
                    let relay = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = relay.handle_device(stream, addr).await {
                            log::warn!("Device connection {} ended with error: {:#}", addr, e);
                        }
                    });
                }
                accepted = subscribers.accept() => {
                    let (stream, addr) = accepted.context("Failed to accept subscriber connection")?;
                    let relay = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = relay.handle_subscriber(stream, addr).await {
                            log::warn!("Subscriber connection {} ended with error: {:#}", addr, e);
                        }
                    });
                }
            }
        }
    }

    /// Every device that has authenticated since startup
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.lock().devices.values().cloned().collect()
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.lock().devices.get(device_id).cloned()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.lock().connections.contains_key(device_id)
    }

    /// Stored events for a device, oldest first
    pub fn events_for(&self, device_id: &str) -> Vec<Value> {
        self.lock()
            .events
            .get(device_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push a command frame to a connected device
    pub fn send_command(&self, device_id: &str, command: &str, payload: Value) -> bool {
        let frame = json!({ "type": "command", "command": command, "payload": payload });
        match self.lock().connections.get(device_id) {
            Some(outbox) => outbox.send(Message::Text(frame.to_string().into())).is_ok(),
            None => {
                log::warn!("Command '{}' for unknown device {}", command, device_id);
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_device(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .context("WebSocket handshake failed")?;
        log::info!("Device connected from {}", addr);

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        });

        let mut device_id: Option<String> = None;
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => self.on_device_frame(&mut device_id, text.as_str(), &tx),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Device {} read failed: {}", addr, e);
                    break;
                }
            }
        }

        log::info!("Device disconnected: {}", device_id.as_deref().unwrap_or("unknown"));
        if let Some(id) = device_id {
            self.on_device_closed(&id, &tx);
        }
        Ok(())
    }

    fn on_device_frame(&self, device_id: &mut Option<String>, text: &str, outbox: &Outbox) {
        let mut frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Invalid JSON from device: {}", e);
                return;
            }
        };

        if frame["type"] == "_auth" {
            let Some(id) = frame["payload"]["deviceId"].as_str().map(str::to_string) else {
                log::warn!("Auth frame without a deviceId");
                return;
            };
            let now = Utc::now().to_rfc3339();
            let record = DeviceRecord {
                device_id: id.clone(),
                user_agent: frame["payload"]["userAgent"].as_str().unwrap_or_default().to_string(),
                url: frame["payload"]["url"].as_str().unwrap_or_default().to_string(),
                connected_at: now.clone(),
                last_seen: now,
            };

            let mut registry = self.lock();
            registry.devices.insert(id.clone(), record.clone());
            registry.connections.insert(id.clone(), outbox.clone());
            registry.broadcast(&json!({ "type": "device.connected", "payload": record }));
            log::info!("Device authenticated: {}", id);
            *device_id = Some(id);
            return;
        }

        let Some(id) = device_id.as_deref() else {
            log::debug!("Dropping frame from unauthenticated device");
            return;
        };
        if let Some(obj) = frame.as_object_mut() {
            obj.insert("deviceId".to_string(), Value::String(id.to_string()));
        }

        let mut registry = self.lock();
        let ring = registry.events.entry(id.to_string()).or_default();
        ring.push_back(frame.clone());
        while ring.len() > EVENT_HISTORY {
            ring.pop_front();
        }
        if let Some(record) = registry.devices.get_mut(id) {
            record.last_seen = Utc::now().to_rfc3339();
        }
        registry.broadcast(&frame);
    }

    fn on_device_closed(&self, device_id: &str, outbox: &Outbox) {
        let mut registry = self.lock();
        // A reconnect may already have replaced this connection
        let current = registry
            .connections
            .get(device_id)
            .is_some_and(|existing| existing.same_channel(outbox));
        if current {
            registry.connections.remove(device_id);
            registry.broadcast(&json!({ "type": "device.disconnected", "payload": { "deviceId": device_id } }));
        }
    }

    async fn handle_subscriber(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .context("WebSocket handshake failed")?;
        log::info!("Subscriber connected from {}", addr);

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        });

        let id = {
            let mut registry = self.lock();
            let id = registry.next_subscriber;
            registry.next_subscriber += 1;
            let devices: Vec<DeviceRecord> = registry.devices.values().cloned().collect();
            let list = json!({ "type": "devices.list", "payload": devices });
            let _ = tx.send(Message::Text(list.to_string().into()));
            registry.subscribers.insert(id, tx.clone());
            id
        };

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => self.on_subscriber_frame(text.as_str(), &tx),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Subscriber {} read failed: {}", addr, e);
                    break;
                }
            }
        }

        self.lock().subscribers.remove(&id);
        log::info!("Subscriber disconnected: {}", addr);
        Ok(())
    }

    fn on_subscriber_frame(&self, text: &str, reply: &Outbox) {
        let request: SubscriberRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                log::error!("Invalid JSON from subscriber: {}", e);
                return;
            }
        };

        match (request.request_type.as_str(), request.device_id) {
            ("device.request_events", Some(device_id)) => {
                let events = self.events_for(&device_id);
                let frame = json!({
                    "type": "device.events",
                    "payload": { "deviceId": device_id, "events": events },
                });
                let _ = reply.send(Message::Text(frame.to_string().into()));
            }
            ("device.send_command", Some(device_id)) => {
                let Some(command) = request.command else {
                    log::warn!("device.send_command without a command");
                    return;
                };
                let payload = request.payload.unwrap_or_else(|| json!({}));
                self.send_command(&device_id, &command, payload);
            }
            (other, _) => log::warn!("Unhandled subscriber request '{}'", other),
        }
    }
}

async fn list_devices(State(relay): State<Relay>) -> Json<Vec<DeviceRecord>> {
    Json(relay.devices())
}

async fn device_detail(State(relay): State<Relay>, Path(device_id): Path<String>) -> Response {
    let Some(info) = relay.device(&device_id) else {
        return not_found("Device not found");
    };
    Json(json!({ "info": info, "events": relay.events_for(&device_id) })).into_response()
}

async fn unknown_route() -> Response {
    not_found("Not found")
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}
