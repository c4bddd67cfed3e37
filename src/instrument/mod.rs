//! Instrumentation sources
//!
//! Each source wraps one family of host entry points and turns what it
//! observes into events on the bus. Sources are independently started and
//! stopped; both operations are idempotent and `stop` puts back exactly what
//! `start` replaced.
//!
//! Every `start` arms a fresh [`Arm`] token and `stop` disarms it. Wrappers
//! capture the token of the window they were installed in, so a completion
//! that lands after `stop` (a slow fetch, a queued timer tick) stays silent
//! even if the source has been started again since.

use eyre::Result;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bus::EventBus;
use crate::event::EventKind;

pub mod console;
pub mod device;
pub mod error;
pub mod network;
pub mod performance;

pub use console::ConsoleSource;
pub use device::DeviceSource;
pub use error::ErrorSource;
pub use network::NetworkSource;
pub use performance::PerformanceSource;

/// A start/stoppable event producer
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    /// Install interception; a no-op when already active
    fn start(&self) -> Result<()>;

    /// Restore the original entry points; a no-op when inactive
    fn stop(&self);

    fn is_active(&self) -> bool;
}

/// Liveness token for one start/stop window
#[derive(Debug, Clone)]
pub struct Arm(Arc<AtomicBool>);

impl Arm {
    pub fn armed() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn disarm(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Emit on behalf of a wrapper: only while armed, and never unwinding into
/// the instrumented call
pub(crate) fn emit_guarded(bus: &EventBus, arm: &Arm, source: &str, build: impl FnOnce() -> EventKind) {
    if !arm.is_armed() {
        return;
    }
    if catch_unwind(AssertUnwindSafe(|| {
        bus.emit(build());
    }))
    .is_err()
    {
        log::error!("{} instrumentation failed while capturing an event", source);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use crate::bus::EventBus;
    use crate::event::Event;
    use crate::storage::MemoryStore;

    /// A bus plus a recorder subscribed to the given types
    pub fn recording_bus(types: &[&str]) -> (EventBus, Arc<Mutex<Vec<Event>>>) {
        let bus = EventBus::new(Arc::new(MemoryStore::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for t in types {
            let seen = seen.clone();
            bus.subscribe(t, move |e| seen.lock().unwrap().push(e.clone()));
        }
        (bus, seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disarmed_token_suppresses_emit() {
        let (bus, seen) = testing::recording_bus(&["x"]);
        let arm = Arm::armed();
        emit_guarded(&bus, &arm, "test", || EventKind::custom("x", json!({})));
        arm.disarm();
        emit_guarded(&bus, &arm, "test", || EventKind::custom("x", json!({})));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_panicking_builder_is_contained() {
        let (bus, seen) = testing::recording_bus(&["x"]);
        emit_guarded(&bus, &Arm::armed(), "test", || panic!("capture bug"));
        assert!(seen.lock().unwrap().is_empty());
    }
}
