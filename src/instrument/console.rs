//! Console capture
//!
//! Wraps the host console. Every call emits a `console` event and is then
//! passed to the original console unchanged.

use eyre::Result;
use serde_json::Value;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::sync::{Arc, Mutex, PoisonError};

use super::{Arm, Source, emit_guarded};
use crate::bus::EventBus;
use crate::event::{ConsoleLevel, ConsolePayload, EventKind, stringify_arg};
use crate::host::{ConsoleOutput, Host};

const STACK_LINES: usize = 40;

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
}

struct Installed {
    original: Arc<dyn ConsoleOutput>,
    arm: Arm,
}

pub struct ConsoleSource {
    host: Arc<Host>,
    bus: EventBus,
    installed: Mutex<Option<Installed>>,
}

impl ConsoleSource {
    pub fn new(host: Arc<Host>, bus: EventBus) -> Self {
        Self {
            host,
            bus,
            installed: Mutex::new(None),
        }
    }
}

impl Source for ConsoleSource {
    fn name(&self) -> &'static str {
        "console"
    }

    fn start(&self) -> Result<()> {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if installed.is_some() {
            return Ok(());
        }

        let arm = Arm::armed();
        let original = self.host.console.get();
        let tap = ConsoleTap {
            original: original.clone(),
            bus: self.bus.clone(),
            arm: arm.clone(),
        };
        self.host.console.replace(Arc::new(tap));
        *installed = Some(Installed { original, arm });
        log::debug!("Console capture started");
        Ok(())
    }

    fn stop(&self) {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(Installed { original, arm }) = installed.take() {
            arm.disarm();
            self.host.console.replace(original);
            log::debug!("Console capture stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

struct ConsoleTap {
    original: Arc<dyn ConsoleOutput>,
    bus: EventBus,
    arm: Arm,
}

impl ConsoleOutput for ConsoleTap {
    fn write(&self, level: ConsoleLevel, args: &[Value]) {
        // A subscriber that logs must not feed back into the bus
        if !CAPTURING.with(|flag| flag.replace(true)) {
            emit_guarded(&self.bus, &self.arm, "console", || {
                EventKind::Console(ConsolePayload {
                    level,
                    args: args.iter().map(stringify_arg).collect(),
                    stack: call_site_stack(),
                })
            });
            CAPTURING.with(|flag| flag.set(false));
        }

        self.original.write(level, args);
    }
}

fn call_site_stack() -> String {
    Backtrace::force_capture()
        .to_string()
        .lines()
        .take(STACK_LINES)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::testing::recording_bus;
    use serde_json::json;

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl ConsoleOutput for Capture {
        fn write(&self, level: ConsoleLevel, args: &[Value]) {
            let line = args.iter().map(stringify_arg).collect::<Vec<_>>().join(" ");
            self.0.lock().unwrap().push(format!("{}:{}", level.as_str(), line));
        }
    }

    fn setup() -> (Arc<Host>, Arc<Capture>, ConsoleSource, Arc<Mutex<Vec<crate::event::Event>>>) {
        let host = Arc::new(Host::new("app://test"));
        let capture = Arc::new(Capture::default());
        host.console.replace(capture.clone());
        let (bus, seen) = recording_bus(&["console"]);
        let source = ConsoleSource::new(host.clone(), bus);
        (host, capture, source, seen)
    }

    #[test]
    fn test_log_is_captured_once_and_passed_through() {
        let (host, capture, source, seen) = setup();

        source.start().unwrap();
        host.log(ConsoleLevel::Log, &[json!("x")]);
        source.stop();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::Console(p) => {
                assert_eq!(p.level, ConsoleLevel::Log);
                assert_eq!(p.args, vec!["x".to_string()]);
                assert!(!p.stack.is_empty());
            }
            other => panic!("unexpected kind: {:?}", other),
        }
        assert_eq!(*capture.0.lock().unwrap(), vec!["log:x".to_string()]);
    }

    #[test]
    fn test_every_level_is_wrapped() {
        let (host, _capture, source, seen) = setup();
        source.start().unwrap();
        for level in ConsoleLevel::ALL {
            host.log(level, &[json!({"k": [1, 2]}), json!(3)]);
        }
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 5);
        let payload = events[0].payload();
        assert_eq!(payload["args"], json!([r#"{"k":[1,2]}"#, "3"]));
    }

    #[test]
    fn test_double_start_wraps_once() {
        let (host, capture, source, seen) = setup();
        source.start().unwrap();
        source.start().unwrap();

        host.log(ConsoleLevel::Info, &[json!("once")]);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(capture.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stop_restores_exact_original() {
        let (host, capture, source, seen) = setup();
        let original: Arc<dyn ConsoleOutput> = capture.clone();

        source.start().unwrap();
        assert!(!Arc::ptr_eq(&host.console.get(), &original));
        source.stop();
        source.stop();
        assert!(Arc::ptr_eq(&host.console.get(), &original));

        host.log(ConsoleLevel::Log, &[json!("quiet")]);
        assert!(seen.lock().unwrap().is_empty());
        assert!(!source.is_active());
    }

    #[test]
    fn test_restart_behaves_like_first_start() {
        let (host, _capture, source, seen) = setup();
        source.start().unwrap();
        source.stop();
        source.start().unwrap();
        host.log(ConsoleLevel::Warn, &[json!("again")]);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stale_wrapper_is_silent_after_stop() {
        let (host, _capture, source, seen) = setup();
        source.start().unwrap();
        let stale = host.console.get();
        source.stop();

        stale.write(ConsoleLevel::Log, &[json!("late")]);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_logging_subscriber_does_not_recurse() {
        let (host, capture, source, _seen) = setup();
        let bus = source.bus.clone();
        let h = host.clone();
        bus.subscribe("console", move |_| h.log(ConsoleLevel::Debug, &[json!("echo")]));

        source.start().unwrap();
        host.log(ConsoleLevel::Log, &[json!("x")]);
        assert_eq!(capture.0.lock().unwrap().len(), 2);
    }
}
