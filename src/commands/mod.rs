pub mod completions;
pub mod config;
pub mod device;
pub mod events;
pub mod pipe;
pub mod relay;
