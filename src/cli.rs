use clap::{Parser, Subcommand, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;

use insidr::relay::{DEFAULT_HTTP_PORT, DEFAULT_WS_PORT};

/// Output format for commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

impl OutputFormat {
    /// Resolve the effective output format.
    /// If user specified a format, use it.
    /// Otherwise: TTY → Text, non-TTY (pipe) → Json
    pub fn resolve(user_choice: Option<OutputFormat>) -> OutputFormat {
        match user_choice {
            Some(fmt) => fmt,
            None => {
                if std::io::stdout().is_terminal() {
                    OutputFormat::Text
                } else {
                    OutputFormat::Json
                }
            }
        }
    }
}

#[derive(Parser)]
#[command(
    name = "insidr",
    about = "Event-driven telemetry agent and debug relay",
    version = env!("GIT_DESCRIBE"),
    after_help = "Logs are written to: ~/.local/share/insidr/logs/insidr.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to insidr.yaml config file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an agent over this process: stdin lines go through the instrumented console
    Pipe {
        /// WebSocket endpoint (overrides config)
        #[arg(long)]
        endpoint: Option<String>,

        /// Auth token sent in the handshake (overrides config)
        #[arg(long)]
        auth_token: Option<String>,

        /// Reported location (overrides config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Run the debug relay between devices and subscribers
    Relay {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Device port; subscribers connect on the next port
        #[arg(long, default_value_t = DEFAULT_WS_PORT)]
        ws_port: u16,

        /// Port for the read-only HTTP API
        #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
        http_port: u16,
    },

    /// Inspect the locally persisted event log
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },

    /// Print this machine's device id
    Device,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum EventsAction {
    /// List persisted events, oldest first
    List {
        /// Only events whose type contains this text
        #[arg(long = "type", short = 't')]
        event_type: Option<String>,

        /// Show only the last N events
        #[arg(long, short = 'n')]
        last: Option<usize>,

        /// Output format (default: text for TTY, json for pipes)
        #[arg(long, short = 'o', value_enum)]
        format: Option<OutputFormat>,
    },

    /// Print the whole log as a JSON array
    Export,

    /// Delete the persisted log
    Clear,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Output format (default: text for TTY, json for pipes)
        #[arg(long, short = 'o', value_enum)]
        format: Option<OutputFormat>,
    },
}
