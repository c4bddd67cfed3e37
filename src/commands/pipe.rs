//! Pipe command
//!
//! Runs a full agent over this process. Each stdin line is written through
//! the instrumented console, so it is printed as usual and also captured as a
//! `console` event. Streaming continues until stdin closes.

use colored::*;
use eyre::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use insidr::agent::Agent;
use insidr::config::Config;
use insidr::event::ConsoleLevel;
use insidr::host::{Host, install_panic_bridge};

/// Time given to the writer to drain queued frames before closing
const FLUSH_GRACE: Duration = Duration::from_millis(250);

pub fn run(endpoint: Option<String>, auth_token: Option<String>, url: Option<String>, config: &Config) -> Result<()> {
    let mut config = config.clone();
    if endpoint.is_some() {
        config.endpoint = endpoint;
    }
    if auth_token.is_some() {
        config.auth_token = auth_token;
    }
    if let Some(url) = url {
        config.url = url;
    }

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(pipe(config))
}

async fn pipe(config: Config) -> Result<()> {
    let host = Arc::new(Host::new(config.url.clone()));
    install_panic_bridge(host.clone());

    let agent = Agent::open(config, host.clone())?;
    host.mark_dom_ready();
    host.mark_loaded();
    agent.init();

    eprintln!(
        "{} device {} session {}",
        "→".blue(),
        agent.device_id().cyan(),
        agent.session_id().dimmed()
    );
    if let Some(ws) = agent.websocket_sink() {
        eprintln!("{} streaming to {}", "→".blue(), ws.options().url);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        host.log(level_for(&line), &[Value::String(line)]);
    }

    agent.shutdown();
    if let Some(ws) = agent.websocket_sink() {
        tokio::time::sleep(FLUSH_GRACE).await;
        ws.disconnect();
        tokio::time::sleep(FLUSH_GRACE).await;
    }
    if let Some(local) = agent.local_sink() {
        eprintln!("{} {} events in local log", "✓".green(), local.len());
    }
    Ok(())
}

/// Pick a console level from a conventional log prefix
fn level_for(line: &str) -> ConsoleLevel {
    let head: String = line.trim_start().chars().take(8).collect::<String>().to_lowercase();
    if head.starts_with("error") || head.starts_with("[error") {
        ConsoleLevel::Error
    } else if head.starts_with("warn") || head.starts_with("[warn") {
        ConsoleLevel::Warn
    } else if head.starts_with("info") || head.starts_with("[info") {
        ConsoleLevel::Info
    } else if head.starts_with("debug") || head.starts_with("[debug") {
        ConsoleLevel::Debug
    } else {
        ConsoleLevel::Log
    }
}
