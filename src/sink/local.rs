//! Bounded persistent event log

use eyre::{Context, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::bus::Sink;
use crate::event::Event;
use crate::storage::KeyValueStore;

pub const DEFAULT_KEY: &str = "insidr_events";
pub const DEFAULT_MAX_EVENTS: usize = 500;

/// Keeps the most recent `max_events` events, oldest first, and rewrites the
/// whole log to storage after every append
pub struct LocalPersistentSink {
    store: Arc<dyn KeyValueStore>,
    key: String,
    max_events: usize,
    events: Mutex<VecDeque<Event>>,
}

impl LocalPersistentSink {
    /// Open the log stored under `key`, picking up whatever a previous
    /// instance persisted there
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, max_events: usize) -> Self {
        let key = key.into();
        let mut events = match load(store.as_ref(), &key) {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Discarding unreadable event log '{}': {:#}", key, e);
                VecDeque::new()
            }
        };
        trim(&mut events, max_events);
        log::debug!("Opened event log '{}' with {} events", key, events.len());

        Self {
            store,
            key,
            max_events,
            events: Mutex::new(events),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    /// Current log, oldest first
    pub fn get_events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the log in memory and in storage
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
        if let Err(e) = self.store.remove(&self.key) {
            log::warn!("Failed to remove persisted event log '{}': {:#}", self.key, e);
        }
    }

    /// Pretty JSON array of the log, for export
    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.get_events()).context("Failed to serialize event log")
    }

    fn persist(&self, events: &VecDeque<Event>) -> Result<()> {
        let json = serde_json::to_string(events).context("Failed to serialize event log")?;
        self.store.set(&self.key, &json)
    }
}

impl Sink for LocalPersistentSink {
    fn name(&self) -> &str {
        "local"
    }

    fn send(&self, event: &Event) -> Result<()> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.push_back(event.clone());
        trim(&mut events, self.max_events);

        // Storage trouble is logged here so the bus never sees it
        if let Err(e) = self.persist(&events) {
            log::warn!("Failed to persist event log '{}': {:#}", self.key, e);
        }
        Ok(())
    }
}

fn load(store: &dyn KeyValueStore, key: &str) -> Result<VecDeque<Event>> {
    match store.get(key)? {
        Some(json) => serde_json::from_str(&json).context("Failed to parse persisted event log"),
        None => Ok(VecDeque::new()),
    }
}

fn trim(events: &mut VecDeque<Event>, max: usize) {
    while events.len() > max {
        events.pop_front();
    }
}
