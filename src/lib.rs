//! insidr: event-driven telemetry agent
//!
//! Instrumentation sources observe the host (console, HTTP, errors,
//! performance, device facts) and publish structured events to an
//! [`bus::EventBus`]. The bus fans every event out to direct subscribers and
//! to sinks: a [`sink::WebSocketSink`] streaming to a remote collector and a
//! [`sink::LocalPersistentSink`] keeping a bounded durable log. The
//! [`agent::Agent`] wires it together and answers remote commands.

pub mod agent;
pub mod bus;
pub mod config;
pub mod event;
pub mod host;
pub mod identity;
pub mod instrument;
pub mod relay;
pub mod sink;
pub mod storage;

pub use agent::{Agent, AgentState};
pub use bus::{EventBus, Sink, Subscription};
pub use event::{Event, EventKind};
