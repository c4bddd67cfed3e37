//! Device and session identifiers
//!
//! The device id lives in durable storage and outlives restarts. The session
//! id lives in session storage and is regenerated whenever that scope is new.

use eyre::Context;

use crate::storage::KeyValueStore;

pub const DEVICE_ID_KEY: &str = "insidr_device_id";
pub const SESSION_ID_KEY: &str = "insidr_session_id";

/// Get the persisted device id, creating it on first use
pub fn device_id(durable: &dyn KeyValueStore) -> String {
    get_or_create(durable, DEVICE_ID_KEY, "device")
}

/// Get the current session id, creating it on first use in this scope
pub fn session_id(session: &dyn KeyValueStore) -> String {
    get_or_create(session, SESSION_ID_KEY, "session")
}

fn get_or_create(store: &dyn KeyValueStore, key: &str, prefix: &str) -> String {
    match store.get(key) {
        Ok(Some(raw)) => {
            if let Some(existing) = parse_id(&raw) {
                return existing;
            }
            log::warn!("Ignoring unreadable {}", key);
        }
        Ok(None) => {}
        Err(e) => log::warn!("Failed to read {}: {}", key, e),
    }

    let id = format!("{}_{}", prefix, uuid::Uuid::new_v4().simple());
    let persisted = serde_json::to_string(&id)
        .context("Failed to serialize id")
        .and_then(|value| store.set(key, &value));
    if let Err(e) = persisted {
        // Still usable for this process, just not persisted
        log::warn!("Failed to persist {}: {:#}", key, e);
    }
    id
}

/// Ids are stored as JSON strings; a bare id from an older store is accepted
fn parse_id(raw: &str) -> Option<String> {
    let id = serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.trim().to_string());
    (!id.trim().is_empty()).then(|| id.trim().to_string())
}
