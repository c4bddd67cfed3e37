//! Telemetry events
//!
//! Every event has a dot-namespaced type tag and a payload whose schema is
//! determined by that tag. On the wire an event is a flat JSON object:
//! `{ "type", "payload", "timestamp", "sessionId" }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Console method that produced a `console` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    pub const ALL: [ConsoleLevel; 5] = [
        ConsoleLevel::Log,
        ConsoleLevel::Info,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
        ConsoleLevel::Debug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolePayload {
    pub level: ConsoleLevel,
    pub args: Vec<String>,
    pub stack: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequestPayload {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponsePayload {
    pub request_id: String,
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Milliseconds between issuing the request and its completion
    pub duration: u64,
    /// Response body size in bytes
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkErrorPayload {
    pub request_id: String,
    pub error: String,
    pub duration: u64,
}

/// Name, message and stack of a captured error value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub filename: Option<String>,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionPayload {
    pub reason: String,
    pub promise: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub used: u64,
    pub total: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub load_time: u64,
    pub dom_ready: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePayload {
    pub memory: Option<MemoryInfo>,
    pub timing: Option<Timing>,
}

/// Width and height in whatever unit the host measures its display in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfoPayload {
    pub user_agent: String,
    pub platform: String,
    pub language: String,
    pub online: bool,
    pub cookie_enabled: bool,
    pub screen: Option<Resolution>,
    pub viewport: Option<Resolution>,
    pub device_memory: Option<u64>,
    pub hardware_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStartedPayload {
    pub config: Value,
    pub user_agent: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptResultPayload {
    pub code: String,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Tagged union of every event schema the agent produces
///
/// Serialized adjacently as `{"type": ..., "payload": ...}`. Types the agent
/// does not know are kept verbatim in [`EventKind::Custom`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    #[serde(rename = "console")]
    Console(ConsolePayload),
    #[serde(rename = "network.request")]
    NetworkRequest(NetworkRequestPayload),
    #[serde(rename = "network.response")]
    NetworkResponse(NetworkResponsePayload),
    #[serde(rename = "network.error")]
    NetworkError(NetworkErrorPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
    #[serde(rename = "error.unhandled_rejection")]
    UnhandledRejection(RejectionPayload),
    #[serde(rename = "performance.metrics")]
    PerformanceMetrics(PerformancePayload),
    #[serde(rename = "device.info")]
    DeviceInfo(DeviceInfoPayload),
    #[serde(rename = "device.online")]
    DeviceOnline(Value),
    #[serde(rename = "device.offline")]
    DeviceOffline(Value),
    #[serde(rename = "agent.started")]
    AgentStarted(AgentStartedPayload),
    #[serde(rename = "agent.shutdown")]
    AgentShutdown(Value),
    #[serde(rename = "script.result")]
    ScriptResult(ScriptResultPayload),
    #[serde(skip)]
    Custom { event_type: String, payload: Value },
}

impl EventKind {
    /// Build a custom event; `payload` should be a JSON object
    pub fn custom(event_type: impl Into<String>, payload: Value) -> Self {
        EventKind::Custom {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Dot-namespaced type tag
    pub fn event_type(&self) -> &str {
        match self {
            EventKind::Console(_) => "console",
            EventKind::NetworkRequest(_) => "network.request",
            EventKind::NetworkResponse(_) => "network.response",
            EventKind::NetworkError(_) => "network.error",
            EventKind::Error(_) => "error",
            EventKind::UnhandledRejection(_) => "error.unhandled_rejection",
            EventKind::PerformanceMetrics(_) => "performance.metrics",
            EventKind::DeviceInfo(_) => "device.info",
            EventKind::DeviceOnline(_) => "device.online",
            EventKind::DeviceOffline(_) => "device.offline",
            EventKind::AgentStarted(_) => "agent.started",
            EventKind::AgentShutdown(_) => "agent.shutdown",
            EventKind::ScriptResult(_) => "script.result",
            EventKind::Custom { event_type, .. } => event_type,
        }
    }

    /// Payload as a JSON value
    pub fn payload(&self) -> Value {
        if let EventKind::Custom { payload, .. } = self {
            return payload.clone();
        }
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("payload").map(Value::take))
            .unwrap_or(Value::Null)
    }

    /// Rebuild from a type tag and a payload, falling back to `Custom` when
    /// the tag is unknown or the payload does not match its schema
    pub fn from_parts(event_type: &str, payload: Value) -> Self {
        let tagged = serde_json::json!({ "type": event_type, "payload": payload });
        match serde_json::from_value::<EventKind>(tagged) {
            Ok(kind) => kind,
            Err(_) => EventKind::custom(event_type, payload),
        }
    }
}

/// An emitted event
///
/// `timestamp` and `session_id` are stamped by the bus; producers only
/// provide the [`EventKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub struct Event {
    pub kind: EventKind,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub session_id: String,
}

impl Event {
    pub fn new(kind: EventKind, timestamp: i64, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp,
            session_id: session_id.into(),
        }
    }

    pub fn event_type(&self) -> &str {
        self.kind.event_type()
    }

    pub fn payload(&self) -> Value {
        self.kind.payload()
    }

    /// Serialize to a single JSON text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
    timestamp: i64,
    session_id: String,
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        Self {
            event_type: event.event_type().to_string(),
            payload: event.payload(),
            timestamp: event.timestamp,
            session_id: event.session_id,
        }
    }
}

impl TryFrom<WireEvent> for Event {
    type Error = String;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        if wire.event_type.is_empty() {
            return Err("event type must not be empty".to_string());
        }
        Ok(Event {
            kind: EventKind::from_parts(&wire.event_type, wire.payload),
            timestamp: wire.timestamp,
            session_id: wire.session_id,
        })
    }
}

/// Stringify one console argument: strings verbatim, everything else as JSON
pub fn stringify_arg(arg: &Value) -> String {
    match arg {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
