//! Transport sinks
//!
//! Sinks receive every event the bus emits and externalize it under their own
//! failure policy:
//! - `WebSocketSink` - streams live, buffers the most recent events while
//!   disconnected, reconnects on a fixed interval
//! - `LocalPersistentSink` - appends to a bounded log in durable storage

pub mod local;
pub mod websocket;

pub use local::LocalPersistentSink;
pub use websocket::{AuthPayload, CommandHandler, ConnectionState, WebSocketOptions, WebSocketSink};
