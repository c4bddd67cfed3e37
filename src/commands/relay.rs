use colored::*;
use eyre::{Context, Result};

use insidr::relay::Relay;

pub fn run(host: &str, ws_port: u16, http_port: u16) -> Result<()> {
    println!("{} Devices:     ws://{}:{}", "→".blue(), host, ws_port);
    println!("{} Subscribers: ws://{}:{}", "→".blue(), host, ws_port.saturating_add(1));
    println!("{} HTTP API:    http://{}:{}/api/devices", "→".blue(), host, http_port);

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(Relay::new().serve(host, ws_port, http_port))
}
