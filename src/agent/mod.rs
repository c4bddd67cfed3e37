//! Telemetry agent
//!
//! The single entry point embedders use. The agent owns the configuration,
//! the event bus and both sinks, and drives the instrumentation sources
//! through their lifecycle:
//!
//! - `init()` starts the configured sources (the device source always) and
//!   emits `agent.started`; a second call is a no-op
//! - `set_enabled()` starts or stops the sources without touching transport
//! - `shutdown()` stops the sources and emits `agent.shutdown`; sinks and the
//!   bus survive so a later `init()` resumes on them
//!
//! Remote commands arriving over the WebSocket are wired up in [`commands`].

pub mod commands;

use eyre::{Context, Result};
use serde_json::{Value, json};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;

use crate::bus::EventBus;
use crate::config::Config;
use crate::event::{AgentStartedPayload, Event, EventKind, ScriptResultPayload};
use crate::host::Host;
use crate::identity;
use crate::instrument::{ConsoleSource, DeviceSource, ErrorSource, NetworkSource, PerformanceSource, Source};
use crate::sink::{AuthPayload, LocalPersistentSink, WebSocketOptions, WebSocketSink};
use crate::storage::{FileStore, KeyValueStore, MemoryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    Initialized,
}

pub struct Agent {
    config: Config,
    host: Arc<Host>,
    bus: EventBus,
    device_id: String,
    local: Option<Arc<LocalPersistentSink>>,
    websocket: Option<WebSocketSink>,
    sources: Mutex<Vec<Arc<dyn Source>>>,
    initialized: AtomicBool,
    enabled: AtomicBool,
    runtime: Option<Handle>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .field("enabled", &self.is_enabled())
            .field("sources", &self.active_sources())
            .finish()
    }
}

impl Agent {
    /// Build an agent over explicit storage scopes
    ///
    /// Sinks are created and registered on the bus immediately; nothing is
    /// intercepted until `init()`. The tokio runtime current at construction
    /// (if any) drives sampling, connecting and script execution.
    pub fn new(
        config: Config,
        host: Arc<Host>,
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
    ) -> Arc<Self> {
        let bus = EventBus::new(session);
        let device_id = identity::device_id(durable.as_ref());
        log::info!("Agent for device {} at {}", device_id, host.location());

        let local = config.local.enabled.then(|| {
            let sink = Arc::new(LocalPersistentSink::new(
                durable.clone(),
                config.local.key.clone(),
                config.local.max_events,
            ));
            bus.add_sink(sink.clone());
            sink
        });

        let websocket = config.endpoint.as_ref().map(|endpoint| {
            let options = WebSocketOptions {
                url: endpoint.clone(),
                reconnect: config.reconnect,
                reconnect_interval: config.reconnect_interval(),
                max_reconnect_attempts: config.max_reconnect_attempts,
                buffer_size: config.buffer_size,
            };
            let auth = AuthPayload {
                device_id: device_id.clone(),
                auth_token: config.auth_token.clone(),
                user_agent: host.navigator().user_agent,
                url: host.location(),
            };
            let sink = WebSocketSink::new(options, auth);
            bus.add_sink(Arc::new(sink.clone()));
            sink
        });

        Arc::new_cyclic(|weak| {
            if let Some(ws) = &websocket {
                commands::register(weak, ws);
            }
            Self {
                config,
                host,
                bus,
                device_id,
                local,
                websocket,
                sources: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                enabled: AtomicBool::new(false),
                runtime: Handle::try_current().ok(),
            }
        })
    }

    /// Build an agent with durable storage under `config.storage_dir` and a
    /// fresh session scope
    pub fn open(config: Config, host: Arc<Host>) -> Result<Arc<Self>> {
        let storage_dir = Config::expand_path(&config.storage_dir);
        std::fs::create_dir_all(&storage_dir)
            .context(format!("Failed to create storage directory {}", storage_dir.display()))?;
        let durable: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(storage_dir));
        let session: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        Ok(Self::new(config, host, durable, session))
    }

    /// Start instrumentation and announce the agent; idempotent
    ///
    /// No lock is held while sources start: starting emits events, and
    /// subscribers may call back into the agent.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            log::debug!("Agent already initialized");
            return;
        }

        let sources = self.build_sources();
        *self.lock_sources() = sources.clone();
        self.enabled.store(true, Ordering::SeqCst);
        for source in &sources {
            start_source(source.as_ref());
        }

        self.bus.emit(EventKind::AgentStarted(AgentStartedPayload {
            config: self.config.snapshot(),
            user_agent: self.host.navigator().user_agent,
            url: self.host.location(),
        }));
        log::info!("Agent initialized with sources {:?}", self.active_sources());

        if let Some(ws) = &self.websocket {
            self.spawn_connect(ws);
        }
    }

    /// Start or stop every source; the bus and sinks are untouched
    pub fn set_enabled(&self, enabled: bool) {
        let sources = self.lock_sources().clone();
        if sources.is_empty() {
            log::debug!("set_enabled({}) before init has no sources to toggle", enabled);
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        for source in &sources {
            if enabled {
                start_source(source.as_ref());
            } else {
                source.stop();
            }
        }
        log::info!("Agent {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Stop every source and announce the shutdown
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        let sources = std::mem::take(&mut *self.lock_sources());
        self.enabled.store(false, Ordering::SeqCst);
        for source in &sources {
            source.stop();
        }

        self.bus.emit(EventKind::AgentShutdown(json!({})));
        log::info!("Agent shut down");
    }

    pub fn state(&self) -> AgentState {
        if self.initialized.load(Ordering::SeqCst) {
            AgentState::Initialized
        } else {
            AgentState::Uninitialized
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> String {
        self.bus.session_id()
    }

    pub fn local_sink(&self) -> Option<&Arc<LocalPersistentSink>> {
        self.local.as_ref()
    }

    pub fn websocket_sink(&self) -> Option<&WebSocketSink> {
        self.websocket.as_ref()
    }

    /// Names of the sources currently intercepting
    pub fn active_sources(&self) -> Vec<&'static str> {
        self.lock_sources()
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.name())
            .collect()
    }

    /// Emit an application-defined event
    pub fn track(&self, event_type: &str, payload: Value) -> Event {
        self.bus.emit(EventKind::from_parts(event_type, payload))
    }

    /// Register an extra remote command; false when no WebSocket is configured
    pub fn on_command<F>(&self, command: &str, handler: F) -> bool
    where
        F: Fn(Value) -> Result<()> + Send + Sync + 'static,
    {
        match &self.websocket {
            Some(ws) => {
                ws.on_command(command, handler);
                true
            }
            None => {
                log::warn!("Ignoring handler for '{}': no WebSocket endpoint configured", command);
                false
            }
        }
    }

    /// Run `code` through the host's script runner and emit `script.result`
    pub fn execute_script(&self, code: &str) -> Event {
        let (output, error) = match self.host.execute_script(code) {
            Ok(output) => (Some(output), None),
            Err(e) => {
                log::warn!("Script failed: {:#}", e);
                (None, Some(format!("{:#}", e)))
            }
        };
        self.bus.emit(EventKind::ScriptResult(ScriptResultPayload {
            code: code.to_string(),
            output,
            error,
        }))
    }

    /// Whether remote `script.execute` is accepted
    pub fn script_execution_allowed(&self) -> bool {
        let authenticated = self.config.auth_token.as_deref().is_some_and(|t| !t.is_empty());
        authenticated && self.config.commands.script_execute
    }

    pub(crate) fn runtime(&self) -> Option<&Handle> {
        self.runtime.as_ref()
    }

    fn build_sources(&self) -> Vec<Arc<dyn Source>> {
        let capture = &self.config.capture;
        let mut sources: Vec<Arc<dyn Source>> = Vec::new();

        if capture.console {
            sources.push(Arc::new(ConsoleSource::new(self.host.clone(), self.bus.clone())));
        }
        if capture.network {
            sources.push(Arc::new(NetworkSource::new(self.host.clone(), self.bus.clone())));
        }
        if capture.errors {
            sources.push(Arc::new(ErrorSource::new(self.host.clone(), self.bus.clone())));
        }
        if capture.performance {
            sources.push(Arc::new(PerformanceSource::new(
                self.host.clone(),
                self.bus.clone(),
                self.config.performance_interval(),
                self.runtime.clone(),
            )));
        }
        sources.push(Arc::new(DeviceSource::new(self.host.clone(), self.bus.clone())));
        sources
    }

    fn spawn_connect(&self, ws: &WebSocketSink) {
        let Some(runtime) = &self.runtime else {
            log::warn!("No async runtime; events for {} stay buffered", ws.options().url);
            return;
        };
        let connect = ws.connect();
        runtime.spawn(async move {
            if let Err(e) = connect.await {
                log::warn!("Initial connection failed: {:#}", e);
            }
        });
    }

    fn lock_sources(&self) -> MutexGuard<'_, Vec<Arc<dyn Source>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn start_source(source: &dyn Source) {
    if let Err(e) = source.start() {
        log::warn!("Failed to start {} source: {:#}", source.name(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ConsoleLevel;
    use crate::host::ConsoleOutput;

    struct Capture(Mutex<Vec<String>>);

    impl ConsoleOutput for Capture {
        fn write(&self, _level: ConsoleLevel, args: &[Value]) {
            self.0.lock().unwrap().push(args.iter().map(crate::event::stringify_arg).collect());
        }
    }

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.capture.network = false;
        config.capture.performance = false;
        config
    }

    fn agent_with(config: Config) -> (Arc<Agent>, Arc<Capture>) {
        let host = Arc::new(Host::new("app://test"));
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        host.console.replace(capture.clone());
        let agent = Agent::new(config, host, Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
        (agent, capture)
    }

    fn record(agent: &Agent, event_type: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        agent.event_bus().subscribe(event_type, move |e: &Event| s.lock().unwrap().push(e.clone()));
        seen
    }

    #[test]
    fn test_init_twice_is_a_noop() {
        let (agent, capture) = agent_with(quiet_config());
        let started = record(&agent, "agent.started");
        let console = record(&agent, "console");

        agent.init();
        agent.init();
        agent.host().log(ConsoleLevel::Log, &[json!("x")]);

        assert_eq!(started.lock().unwrap().len(), 1);
        assert_eq!(console.lock().unwrap().len(), 1);
        assert_eq!(*capture.0.lock().unwrap(), vec!["x".to_string()]);
        assert_eq!(agent.state(), AgentState::Initialized);
    }

    #[test]
    fn test_started_payload() {
        let (agent, _) = agent_with(quiet_config());
        let started = record(&agent, "agent.started");
        agent.init();

        let payload = started.lock().unwrap()[0].payload();
        assert_eq!(payload["url"], "app://test");
        assert!(payload["userAgent"].as_str().unwrap().starts_with("insidr/"));
        assert_eq!(payload["config"]["capture"]["network"], false);
    }

    #[test]
    fn test_sources_follow_capture_flags() {
        let mut config = quiet_config();
        config.capture.console = false;
        config.capture.errors = false;
        let (agent, _) = agent_with(config);
        agent.init();
        assert_eq!(agent.active_sources(), vec!["device"]);

        let (agent, _) = agent_with(quiet_config());
        agent.init();
        assert_eq!(agent.active_sources(), vec!["console", "errors", "device"]);
    }

    #[test]
    fn test_disable_keeps_sinks_and_stops_capture() {
        let (agent, capture) = agent_with(quiet_config());
        agent.init();
        let local = agent.local_sink().unwrap().clone();
        let before = local.len();

        agent.set_enabled(false);
        assert!(!agent.is_enabled());
        assert!(agent.active_sources().is_empty());
        agent.host().log(ConsoleLevel::Log, &[json!("quiet")]);
        assert_eq!(local.len(), before);
        assert_eq!(capture.0.lock().unwrap().len(), 1);

        agent.set_enabled(true);
        agent.host().log(ConsoleLevel::Log, &[json!("loud")]);
        let types: Vec<String> = local.get_events().iter().map(|e| e.event_type().to_string()).collect();
        assert!(types.contains(&"console".to_string()));
        assert_eq!(agent.event_bus().sink_count(), 1);
    }

    #[test]
    fn test_device_info_subscriber_can_call_back_into_agent() {
        let (agent, _) = agent_with(quiet_config());
        let observed = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&agent);
        let o = observed.clone();
        agent.event_bus().subscribe("device.info", move |_: &Event| {
            if let Some(agent) = weak.upgrade() {
                o.lock().unwrap().push((agent.state(), agent.active_sources(), agent.is_enabled()));
            }
        });

        agent.init();
        agent.set_enabled(false);
        agent.set_enabled(true);

        let observed = observed.lock().unwrap();
        assert_eq!(observed.len(), 2);
        for (state, sources, enabled) in observed.iter() {
            assert_eq!(*state, AgentState::Initialized);
            assert_eq!(*sources, vec!["console", "errors", "device"]);
            assert!(*enabled);
        }
    }

    #[test]
    fn test_device_info_subscriber_can_toggle_agent() {
        let (agent, _) = agent_with(quiet_config());
        let weak = Arc::downgrade(&agent);
        agent.event_bus().subscribe("device.info", move |_: &Event| {
            if let Some(agent) = weak.upgrade() {
                agent.set_enabled(false);
            }
        });

        agent.init();
        assert!(!agent.is_enabled());
        assert!(agent.active_sources().is_empty());
        assert_eq!(agent.state(), AgentState::Initialized);
    }

    #[test]
    fn test_shutdown_then_reinit() {
        let (agent, _) = agent_with(quiet_config());
        let started = record(&agent, "agent.started");
        let stopped = record(&agent, "agent.shutdown");

        agent.init();
        agent.shutdown();
        agent.shutdown();
        assert_eq!(agent.state(), AgentState::Uninitialized);
        assert_eq!(stopped.lock().unwrap().len(), 1);
        assert!(agent.active_sources().is_empty());

        agent.init();
        assert_eq!(started.lock().unwrap().len(), 2);
        assert_eq!(agent.active_sources(), vec!["console", "errors", "device"]);
    }

    #[test]
    fn test_track_emits_custom_event() {
        let (agent, _) = agent_with(quiet_config());
        let seen = record(&agent, "checkout.completed");
        let event = agent.track("checkout.completed", json!({ "total": 42 }));

        assert_eq!(event.event_type(), "checkout.completed");
        assert_eq!(seen.lock().unwrap()[0].payload()["total"], 42);
        assert_eq!(event.session_id, agent.session_id());
    }

    #[test]
    fn test_device_id_shared_across_agents_on_same_durable_store() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let host = Arc::new(Host::new("app://test"));
        let first = Agent::new(quiet_config(), host.clone(), durable.clone(), Arc::new(MemoryStore::new()));
        let second = Agent::new(quiet_config(), host, durable, Arc::new(MemoryStore::new()));

        assert_eq!(first.device_id(), second.device_id());
        assert_ne!(first.session_id(), second.session_id());
        assert_eq!(first.session_id(), first.session_id());
    }

    #[test]
    fn test_on_command_without_endpoint() {
        let (agent, _) = agent_with(quiet_config());
        assert!(agent.websocket_sink().is_none());
        assert!(!agent.on_command("custom", |_| Ok(())));
    }

    #[test]
    fn test_script_execution_gate() {
        let (agent, _) = agent_with(quiet_config());
        assert!(!agent.script_execution_allowed());

        let mut config = quiet_config();
        config.auth_token = Some("token".to_string());
        let (agent, _) = agent_with(config.clone());
        assert!(agent.script_execution_allowed());

        config.commands.script_execute = false;
        let (agent, _) = agent_with(config);
        assert!(!agent.script_execution_allowed());
    }
}
