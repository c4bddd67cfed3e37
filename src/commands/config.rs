use colored::*;
use eyre::Result;

use crate::cli::{ConfigAction, OutputFormat};
use insidr::config::Config;

pub fn run(action: ConfigAction, config: &Config) -> Result<()> {
    match action {
        ConfigAction::Show { format } => show(OutputFormat::resolve(format), config),
    }
}

fn show(format: OutputFormat, config: &Config) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(config)?);
        }
        OutputFormat::Text => {
            println!("{}", "insidr Configuration".bold());
            println!();

            println!("{}:", "transport".cyan());
            println!("  endpoint: {}", config.endpoint.as_deref().unwrap_or("(none)"));
            println!("  authToken: {}", if config.auth_token.is_some() { "set" } else { "(none)" });
            println!("  reconnect: {}", config.reconnect);
            println!("  reconnectInterval: {}ms", config.reconnect_interval);
            println!("  maxReconnectAttempts: {}", config.max_reconnect_attempts);
            println!("  bufferSize: {}", config.buffer_size);
            println!();

            println!("{}:", "capture".cyan());
            println!("  console: {}", config.capture.console);
            println!("  network: {}", config.capture.network);
            println!("  errors: {}", config.capture.errors);
            println!("  performance: {} (every {}ms)", config.capture.performance, config.performance_interval);
            println!();

            println!("{}:", "local".cyan());
            println!("  enabled: {}", config.local.enabled);
            println!("  key: {}", config.local.key);
            println!("  maxEvents: {}", config.local.max_events);
            println!("  storageDir: {}", config.storage_dir.display());
            println!();

            println!("{}:", "commands".cyan());
            println!("  scriptExecute: {}", config.commands.script_execute);
        }
    }

    Ok(())
}
