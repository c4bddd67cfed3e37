//! Network capture
//!
//! Wraps both request entry points of the host (async fetch and blocking XHR).
//! Each request emits `network.request` before it is issued, then exactly one
//! of `network.response` or `network.error` when it settles. The three events
//! share a `requestId`; completions can arrive in any order relative to other
//! requests.

use eyre::Result;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::{Arm, Source, emit_guarded};
use crate::bus::EventBus;
use crate::event::{EventKind, NetworkErrorPayload, NetworkRequestPayload, NetworkResponsePayload};
use crate::host::{Fetch, Host, HttpRequest, HttpResponse, XmlHttp};

struct Installed {
    original_fetch: Arc<dyn Fetch>,
    original_xhr: Arc<dyn XmlHttp>,
    arm: Arm,
}

pub struct NetworkSource {
    host: Arc<Host>,
    bus: EventBus,
    ids: Arc<RequestIds>,
    installed: Mutex<Option<Installed>>,
}

impl NetworkSource {
    pub fn new(host: Arc<Host>, bus: EventBus) -> Self {
        Self {
            host,
            bus,
            ids: Arc::new(RequestIds::default()),
            installed: Mutex::new(None),
        }
    }
}

impl Source for NetworkSource {
    fn name(&self) -> &'static str {
        "network"
    }

    fn start(&self) -> Result<()> {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if installed.is_some() {
            return Ok(());
        }

        let arm = Arm::armed();
        let original_fetch = self.host.fetch.get();
        let original_xhr = self.host.xhr.get();

        let tracker = Tracker {
            bus: self.bus.clone(),
            arm: arm.clone(),
            ids: self.ids.clone(),
        };
        self.host.fetch.replace(Arc::new(FetchTap {
            original: original_fetch.clone(),
            tracker: tracker.clone(),
        }));
        self.host.xhr.replace(Arc::new(XhrTap {
            original: original_xhr.clone(),
            tracker,
        }));

        *installed = Some(Installed {
            original_fetch,
            original_xhr,
            arm,
        });
        log::debug!("Network capture started");
        Ok(())
    }

    fn stop(&self) {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = installed.take() {
            state.arm.disarm();
            self.host.fetch.replace(state.original_fetch);
            self.host.xhr.replace(state.original_xhr);
            log::debug!("Network capture stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Counter plus random suffix: unique within the session
#[derive(Debug, Default)]
struct RequestIds {
    counter: AtomicU64,
}

impl RequestIds {
    fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("req_{}_{}", n, &suffix[..8])
    }
}

#[derive(Clone)]
struct Tracker {
    bus: EventBus,
    arm: Arm,
    ids: Arc<RequestIds>,
}

impl Tracker {
    fn begin(&self, request: &HttpRequest) -> (String, Instant) {
        let request_id = self.ids.next();
        emit_guarded(&self.bus, &self.arm, "network", || {
            EventKind::NetworkRequest(NetworkRequestPayload {
                request_id: request_id.clone(),
                url: request.url.clone(),
                method: request.method.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
            })
        });
        (request_id, Instant::now())
    }

    fn finish(&self, request_id: String, started: Instant, result: &Result<HttpResponse>) {
        let duration = started.elapsed().as_millis() as u64;
        emit_guarded(&self.bus, &self.arm, "network", || match result {
            Ok(response) => EventKind::NetworkResponse(NetworkResponsePayload {
                request_id,
                status: response.status,
                status_text: response.status_text.clone(),
                headers: response.headers.clone(),
                body: response.text(),
                duration,
                size: response.body.len(),
            }),
            Err(e) => EventKind::NetworkError(NetworkErrorPayload {
                request_id,
                error: format!("{:#}", e),
                duration,
            }),
        });
    }
}

struct FetchTap {
    original: Arc<dyn Fetch>,
    tracker: Tracker,
}

impl Fetch for FetchTap {
    fn fetch(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
        let (request_id, started) = self.tracker.begin(&request);
        let pending = self.original.fetch(request);
        let tracker = self.tracker.clone();
        Box::pin(async move {
            let result = pending.await;
            tracker.finish(request_id, started, &result);
            result
        })
    }
}

struct XhrTap {
    original: Arc<dyn XmlHttp>,
    tracker: Tracker,
}

impl XmlHttp for XhrTap {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let (request_id, started) = self.tracker.begin(request);
        let result = self.original.send(request);
        self.tracker.finish(request_id, started, &result);
        result
    }
}
