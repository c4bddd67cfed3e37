//! The instrumented host
//!
//! A `Host` collects every entry point the agent observes: console output,
//! async and blocking HTTP, uncaught error and rejection handlers,
//! connectivity changes, navigator facts, performance counters, plus the
//! reload and script-execution capabilities remote commands drive.
//!
//! Interceptable entry points sit in a [`Slot`]. An instrumentation source
//! swaps its wrapper into the slot on start and puts the exact previous value
//! back on stop, so several hosts can be instrumented side by side without
//! touching process-global state.

use eyre::{Context, Result};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use crate::event::{ConsoleLevel, DeviceInfoPayload, ErrorDetail, MemoryInfo, PerformancePayload, Resolution, Timing, stringify_arg};

/// A replaceable shared reference
pub struct Slot<T: ?Sized> {
    current: RwLock<Arc<T>>,
}

impl<T: ?Sized> Slot<T> {
    pub fn new(value: Arc<T>) -> Self {
        Self {
            current: RwLock::new(value),
        }
    }

    /// The value installed right now
    pub fn get(&self) -> Arc<T> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Install `value`, returning what was there before
    pub fn replace(&self, value: Arc<T>) -> Arc<T> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, value)
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

pub trait ConsoleOutput: Send + Sync {
    fn write(&self, level: ConsoleLevel, args: &[Value]);
}

/// Writes warn/error to stderr and everything else to stdout
#[derive(Debug, Default)]
pub struct StdConsole;

impl ConsoleOutput for StdConsole {
    fn write(&self, level: ConsoleLevel, args: &[Value]) {
        let line = args.iter().map(stringify_arg).collect::<Vec<_>>().join(" ");
        // Broken pipes are not our problem to report
        match level {
            ConsoleLevel::Warn | ConsoleLevel::Error => {
                let _ = writeln!(std::io::stderr(), "{}", line);
            }
            _ => {
                let _ = writeln!(std::io::stdout(), "{}", line);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Async request entry point (the `fetch` equivalent)
pub trait Fetch: Send + Sync {
    fn fetch(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>>;
}

/// Blocking request entry point (the XHR equivalent)
pub trait XmlHttp: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Default HTTP client backed by ureq
///
/// Non-2xx statuses are returned as responses; only transport failures are
/// errors.
#[derive(Clone)]
pub struct UreqClient {
    agent: ureq::Agent,
}

impl Default for UreqClient {
    fn default() -> Self {
        let config = ureq::Agent::config_builder().http_status_as_error(false).build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl UreqClient {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = ureq::http::Request::builder()
            .method(request.method.as_str())
            .uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let body = request.body.clone().unwrap_or_default().into_bytes();
        let http_request = builder.body(body).context("Invalid HTTP request")?;

        let mut response = self
            .agent
            .run(http_request)
            .context(format!("{} {} failed", request.method, request.url))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response
            .body_mut()
            .read_to_vec()
            .context("Failed to read response body")?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

impl XmlHttp for UreqClient {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.execute(request)
    }
}

impl Fetch for UreqClient {
    fn fetch(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
        let client = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || client.execute(&request))
                .await
                .context("HTTP worker task failed")?
        })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An uncaught error as reported to the host's error handler
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub message: String,
    pub filename: Option<String>,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
    pub error: Option<ErrorDetail>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            filename: None,
            lineno: None,
            colno: None,
            error: None,
        }
    }
}

pub type ErrorHandler = Arc<dyn Fn(&ErrorReport) + Send + Sync>;
pub type RejectionHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type ConnectivityListener = Arc<dyn Fn(bool) + Send + Sync>;
pub type ReloadHandler = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Performance
// ---------------------------------------------------------------------------

pub trait PerformanceProbe: Send + Sync {
    /// Heap usage, or `None` when the platform exposes nothing
    fn memory(&self) -> Option<MemoryInfo>;
}

/// Reads `/proc/self/status` and `/proc/meminfo`; `None` elsewhere
#[derive(Debug, Default)]
pub struct ProcProbe;

impl PerformanceProbe for ProcProbe {
    fn memory(&self) -> Option<MemoryInfo> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        let used = kib_field(&status, "VmRSS:")?;
        let total = kib_field(&status, "VmSize:")?;
        let limit = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| kib_field(&meminfo, "MemTotal:"))
            .unwrap_or(0);

        Some(MemoryInfo { used, total, limit })
    }
}

/// Bytes for a `Name:   1234 kB` line; the kernel reports these in KiB
/// whatever its page size
fn kib_field(text: &str, name: &str) -> Option<u64> {
    text.lines()
        .find(|l| l.starts_with(name))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// A probe for hosts without any memory API
#[derive(Debug, Default)]
pub struct NoMemoryProbe;

impl PerformanceProbe for NoMemoryProbe {
    fn memory(&self) -> Option<MemoryInfo> {
        None
    }
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// Executes a code string in the host's context
pub trait ScriptRunner: Send + Sync {
    fn execute(&self, code: &str) -> Result<String>;
}

/// Runs code through `sh -c`
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ScriptRunner for ShellRunner {
    fn execute(&self, code: &str) -> Result<String> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(code)
            .output()
            .context("Failed to spawn shell")?;

        if !output.status.success() {
            eyre::bail!(
                "script exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Navigator
// ---------------------------------------------------------------------------

/// Static facts about the device the host runs on
#[derive(Debug, Clone, PartialEq)]
pub struct Navigator {
    pub user_agent: String,
    pub platform: String,
    pub language: String,
    pub cookie_enabled: bool,
    pub screen: Option<Resolution>,
    pub viewport: Option<Resolution>,
    pub device_memory: Option<u64>,
    pub hardware_concurrency: usize,
}

impl Navigator {
    pub fn detect() -> Self {
        let terminal = terminal_size::terminal_size().map(|(w, h)| Resolution {
            width: w.0 as u32,
            height: h.0 as u32,
        });
        let device_memory = ProcProbe.memory().map(|m| m.limit / (1024 * 1024 * 1024)).filter(|gb| *gb > 0);

        Self {
            user_agent: format!(
                "insidr/{} ({}; {})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            language: std::env::var("LANG")
                .ok()
                .and_then(|l| l.split('.').next().map(|s| s.replace('_', "-")))
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| "en-US".to_string()),
            cookie_enabled: false,
            screen: terminal,
            viewport: terminal,
            device_memory,
            hardware_concurrency: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

pub struct Host {
    pub console: Slot<dyn ConsoleOutput>,
    pub fetch: Slot<dyn Fetch>,
    pub xhr: Slot<dyn XmlHttp>,
    pub performance_probe: Slot<dyn PerformanceProbe>,
    pub script_runner: Slot<dyn ScriptRunner>,
    navigator: RwLock<Navigator>,
    location: RwLock<String>,
    online: AtomicBool,
    error_handler: RwLock<Option<ErrorHandler>>,
    rejection_handler: RwLock<Option<RejectionHandler>>,
    connectivity: Mutex<Vec<(u64, ConnectivityListener)>>,
    next_listener_id: AtomicU64,
    reload_handler: RwLock<Option<ReloadHandler>>,
    created_at: Instant,
    dom_ready_ms: Mutex<Option<u64>>,
    loaded_ms: Mutex<Option<u64>>,
}

impl Host {
    /// A host with the process's real console, ureq HTTP, `/proc` probe and
    /// shell script runner
    pub fn new(location: impl Into<String>) -> Self {
        let http = Arc::new(UreqClient::default());
        Self {
            console: Slot::new(Arc::new(StdConsole)),
            fetch: Slot::new(http.clone()),
            xhr: Slot::new(http),
            performance_probe: Slot::new(Arc::new(ProcProbe)),
            script_runner: Slot::new(Arc::new(ShellRunner)),
            navigator: RwLock::new(Navigator::detect()),
            location: RwLock::new(location.into()),
            online: AtomicBool::new(true),
            error_handler: RwLock::new(None),
            rejection_handler: RwLock::new(None),
            connectivity: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            reload_handler: RwLock::new(None),
            created_at: Instant::now(),
            dom_ready_ms: Mutex::new(None),
            loaded_ms: Mutex::new(None),
        }
    }

    /// Write through whatever console is installed
    pub fn log(&self, level: ConsoleLevel, args: &[Value]) {
        self.console.get().write(level, args);
    }

    /// Issue a request through whatever fetch is installed
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let fetch = self.fetch.get();
        fetch.fetch(request).await
    }

    /// Issue a blocking request through whatever XHR client is installed
    pub fn xhr_send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.xhr.get().send(request)
    }

    pub fn location(&self) -> String {
        self.location.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_location(&self, location: impl Into<String>) {
        *self.location.write().unwrap_or_else(PoisonError::into_inner) = location.into();
    }

    pub fn navigator(&self) -> Navigator {
        self.navigator.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_navigator(&self, navigator: Navigator) {
        *self.navigator.write().unwrap_or_else(PoisonError::into_inner) = navigator;
    }

    /// Navigator facts plus current connectivity
    pub fn device_info(&self) -> DeviceInfoPayload {
        let nav = self.navigator();
        DeviceInfoPayload {
            user_agent: nav.user_agent,
            platform: nav.platform,
            language: nav.language,
            online: self.is_online(),
            cookie_enabled: nav.cookie_enabled,
            screen: nav.screen,
            viewport: nav.viewport,
            device_memory: nav.device_memory,
            hardware_concurrency: nav.hardware_concurrency,
        }
    }

    // -- errors ------------------------------------------------------------

    /// Install the uncaught-error handler, returning the previous one
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
        let mut slot = self.error_handler.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, handler)
    }

    /// Install the unhandled-rejection handler, returning the previous one
    pub fn set_rejection_handler(&self, handler: Option<RejectionHandler>) -> Option<RejectionHandler> {
        let mut slot = self.rejection_handler.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, handler)
    }

    pub fn has_error_handler(&self) -> bool {
        self.error_handler.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Deliver an uncaught error to the installed handler
    pub fn report_error(&self, report: &ErrorReport) {
        let handler = self.error_handler.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handler) = handler {
            handler(report);
        }
    }

    /// Deliver an unhandled rejection to the installed handler
    pub fn report_rejection(&self, reason: &str, promise: &str) {
        let handler = self.rejection_handler.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handler) = handler {
            handler(reason, promise);
        }
    }

    // -- connectivity ------------------------------------------------------

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Update connectivity; listeners fire only on an actual transition
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let listeners: Vec<ConnectivityListener> = self
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(online);
        }
    }

    pub fn add_connectivity_listener(&self, listener: ConnectivityListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove_connectivity_listener(&self, id: u64) {
        self.connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(lid, _)| *lid != id);
    }

    pub fn connectivity_listener_count(&self) -> usize {
        self.connectivity.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    // -- timing ------------------------------------------------------------

    pub fn mark_dom_ready(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.dom_ready_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(elapsed);
    }

    pub fn mark_loaded(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.loaded_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(elapsed);
    }

    /// Load timing, available once the host has been marked loaded
    pub fn timing(&self) -> Option<Timing> {
        let loaded = (*self.loaded_ms.lock().unwrap_or_else(PoisonError::into_inner))?;
        let dom_ready = *self.dom_ready_ms.lock().unwrap_or_else(PoisonError::into_inner);
        Some(Timing {
            load_time: loaded,
            dom_ready,
        })
    }

    pub fn performance(&self) -> PerformancePayload {
        PerformancePayload {
            memory: self.performance_probe.get().memory(),
            timing: self.timing(),
        }
    }

    // -- reload / scripts ----------------------------------------------------

    pub fn set_reload_handler(&self, handler: Option<ReloadHandler>) {
        *self.reload_handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Ask the embedder to reload; false when nobody handles reloads
    pub fn reload(&self) -> bool {
        let handler = self.reload_handler.read().unwrap_or_else(PoisonError::into_inner).clone();
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    pub fn execute_script(&self, code: &str) -> Result<String> {
        self.script_runner.get().execute(code)
    }
}

thread_local! {
    static IN_PANIC_BRIDGE: Cell<bool> = const { Cell::new(false) };
}

/// Route Rust panics into the host's uncaught-error handler
///
/// The previously installed panic hook still runs first. A panic raised while
/// a panic is being reported is not reported again.
pub fn install_panic_bridge(host: Arc<Host>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);

        if IN_PANIC_BRIDGE.with(|flag| flag.replace(true)) {
            return;
        }

        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        let location = info.location();
        let thread = std::thread::current().name().unwrap_or("unnamed").to_string();

        let report = ErrorReport {
            message: message.clone(),
            filename: location.map(|l| l.file().to_string()),
            lineno: location.map(|l| l.line()),
            colno: location.map(|l| l.column()),
            error: Some(ErrorDetail {
                name: "Panic".to_string(),
                message: format!("thread '{}' panicked: {}", thread, message),
                stack: Some(std::backtrace::Backtrace::force_capture().to_string()),
            }),
        };
        host.report_error(&report);

        IN_PANIC_BRIDGE.with(|flag| flag.set(false));
    }));
}
