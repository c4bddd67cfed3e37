//! Uncaught error and unhandled rejection capture
//!
//! Installs handlers on the host that emit `error` and
//! `error.unhandled_rejection`, then defer to whatever handler was installed
//! before.

use eyre::Result;
use std::sync::{Arc, Mutex, PoisonError};

use super::{Arm, Source, emit_guarded};
use crate::bus::EventBus;
use crate::event::{ErrorPayload, EventKind, RejectionPayload};
use crate::host::{ErrorHandler, ErrorReport, Host, RejectionHandler};

struct Installed {
    previous_error: Option<ErrorHandler>,
    previous_rejection: Option<RejectionHandler>,
    arm: Arm,
}

pub struct ErrorSource {
    host: Arc<Host>,
    bus: EventBus,
    installed: Mutex<Option<Installed>>,
}

impl ErrorSource {
    pub fn new(host: Arc<Host>, bus: EventBus) -> Self {
        Self {
            host,
            bus,
            installed: Mutex::new(None),
        }
    }

    fn error_handler(&self, arm: Arm, next: Option<ErrorHandler>) -> ErrorHandler {
        let bus = self.bus.clone();
        Arc::new(move |report: &ErrorReport| {
            emit_guarded(&bus, &arm, "errors", || {
                EventKind::Error(ErrorPayload {
                    message: report.message.clone(),
                    filename: report.filename.clone(),
                    lineno: report.lineno,
                    colno: report.colno,
                    error: report.error.clone(),
                })
            });
            if let Some(next) = &next {
                next(report);
            }
        })
    }

    fn rejection_handler(&self, arm: Arm, next: Option<RejectionHandler>) -> RejectionHandler {
        let bus = self.bus.clone();
        Arc::new(move |reason: &str, promise: &str| {
            emit_guarded(&bus, &arm, "errors", || {
                EventKind::UnhandledRejection(RejectionPayload {
                    reason: reason.to_string(),
                    promise: promise.to_string(),
                })
            });
            if let Some(next) = &next {
                next(reason, promise);
            }
        })
    }
}

impl Source for ErrorSource {
    fn name(&self) -> &'static str {
        "errors"
    }

    fn start(&self) -> Result<()> {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if installed.is_some() {
            return Ok(());
        }

        let arm = Arm::armed();
        let previous_error = self.host.set_error_handler(None);
        let previous_rejection = self.host.set_rejection_handler(None);

        self.host
            .set_error_handler(Some(self.error_handler(arm.clone(), previous_error.clone())));
        self.host
            .set_rejection_handler(Some(self.rejection_handler(arm.clone(), previous_rejection.clone())));

        *installed = Some(Installed {
            previous_error,
            previous_rejection,
            arm,
        });
        log::debug!("Error capture started");
        Ok(())
    }

    fn stop(&self) {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = installed.take() {
            state.arm.disarm();
            self.host.set_error_handler(state.previous_error);
            self.host.set_rejection_handler(state.previous_rejection);
            log::debug!("Error capture stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}
