//! Periodic performance sampling
//!
//! Emits `performance.metrics` on a fixed interval. Memory and timing are
//! `null` when the host cannot provide them.

use eyre::{Result, eyre};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{Arm, Source, emit_guarded};
use crate::bus::EventBus;
use crate::event::EventKind;
use crate::host::Host;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

struct Running {
    task: JoinHandle<()>,
    arm: Arm,
}

pub struct PerformanceSource {
    host: Arc<Host>,
    bus: EventBus,
    interval: Duration,
    runtime: Option<Handle>,
    running: Mutex<Option<Running>>,
}

impl PerformanceSource {
    /// `runtime` drives the sampling timer; when `None` the ambient runtime
    /// at `start()` is used
    pub fn new(host: Arc<Host>, bus: EventBus, interval: Duration, runtime: Option<Handle>) -> Self {
        Self {
            host,
            bus,
            interval,
            runtime,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Emit one sample immediately
    pub fn sample(&self) {
        self.bus.emit(EventKind::PerformanceMetrics(self.host.performance()));
    }
}

impl Source for PerformanceSource {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn start(&self) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(());
        }

        let runtime = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or_else(|| eyre!("performance sampling needs a tokio runtime"))?;

        let arm = Arm::armed();
        let period = self.interval.max(Duration::from_millis(1));
        let host = self.host.clone();
        let bus = self.bus.clone();
        let task_arm = arm.clone();

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !task_arm.is_armed() {
                    break;
                }
                emit_guarded(&bus, &task_arm, "performance", || {
                    EventKind::PerformanceMetrics(host.performance())
                });
            }
        });

        *running = Some(Running { task, arm });
        log::debug!("Performance sampling started every {:?}", period);
        Ok(())
    }

    fn stop(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = running.take() {
            state.arm.disarm();
            state.task.abort();
            log::debug!("Performance sampling stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoMemoryProbe;
    use crate::instrument::testing::recording_bus;

    #[tokio::test]
    async fn test_samples_on_interval_until_stopped() {
        let host = Arc::new(Host::new("app://test"));
        let (bus, seen) = recording_bus(&["performance.metrics"]);
        let source = PerformanceSource::new(host, bus, Duration::from_millis(20), None);

        source.start().unwrap();
        source.start().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        source.stop();

        let count = seen.lock().unwrap().len();
        assert!(count >= 2, "expected several samples, got {}", count);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(seen.lock().unwrap().len(), count);
    }

    #[test]
    fn test_memory_is_null_without_api() {
        let host = Arc::new(Host::new("app://test"));
        host.performance_probe.replace(Arc::new(NoMemoryProbe));
        let (bus, seen) = recording_bus(&["performance.metrics"]);
        let source = PerformanceSource::new(host, bus, DEFAULT_INTERVAL, None);

        source.sample();
        let payload = seen.lock().unwrap()[0].payload();
        assert!(payload["memory"].is_null());
        assert!(payload["timing"].is_null());
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let host = Arc::new(Host::new("app://test"));
        let (bus, _seen) = recording_bus(&[]);
        let source = PerformanceSource::new(host, bus, DEFAULT_INTERVAL, None);
        assert_eq!(source.interval(), DEFAULT_INTERVAL);
        assert!(source.start().is_err());
        assert!(!source.is_active());
    }
}
