//! Device facts and connectivity
//!
//! Emits one `device.info` snapshot per start, then `device.online` /
//! `device.offline` on every connectivity transition while active.

use eyre::Result;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};

use super::{Arm, Source, emit_guarded};
use crate::bus::EventBus;
use crate::event::EventKind;
use crate::host::Host;

struct Installed {
    listener_id: u64,
    arm: Arm,
}

pub struct DeviceSource {
    host: Arc<Host>,
    bus: EventBus,
    installed: Mutex<Option<Installed>>,
}

impl DeviceSource {
    pub fn new(host: Arc<Host>, bus: EventBus) -> Self {
        Self {
            host,
            bus,
            installed: Mutex::new(None),
        }
    }
}

impl Source for DeviceSource {
    fn name(&self) -> &'static str {
        "device"
    }

    fn start(&self) -> Result<()> {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if installed.is_some() {
            return Ok(());
        }

        let arm = Arm::armed();
        let bus = self.bus.clone();
        let listener_arm = arm.clone();
        let listener_id = self.host.add_connectivity_listener(Arc::new(move |online| {
            emit_guarded(&bus, &listener_arm, "device", || {
                if online {
                    EventKind::DeviceOnline(json!({}))
                } else {
                    EventKind::DeviceOffline(json!({}))
                }
            });
        }));

        *installed = Some(Installed {
            listener_id,
            arm: arm.clone(),
        });
        drop(installed);

        emit_guarded(&self.bus, &arm, "device", || EventKind::DeviceInfo(self.host.device_info()));
        Ok(())
    }

    fn stop(&self) {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = installed.take() {
            state.arm.disarm();
            self.host.remove_connectivity_listener(state.listener_id);
        }
    }

    fn is_active(&self) -> bool {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}
