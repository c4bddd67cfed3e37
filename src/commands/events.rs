//! Local event log inspection
//!
//! Reads the same persisted log the agent's local sink writes.

use chrono::{DateTime, Local};
use colored::*;
use eyre::Result;
use std::sync::Arc;

use crate::cli::{EventsAction, OutputFormat};
use insidr::config::Config;
use insidr::event::{Event, EventKind};
use insidr::sink::LocalPersistentSink;
use insidr::storage::FileStore;

pub fn run(action: EventsAction, config: &Config) -> Result<()> {
    let sink = open_log(config);
    match action {
        EventsAction::List { event_type, last, format } => {
            list(&sink, event_type.as_deref(), last, OutputFormat::resolve(format))
        }
        EventsAction::Export => {
            println!("{}", sink.export_json()?);
            Ok(())
        }
        EventsAction::Clear => {
            let count = sink.len();
            sink.clear();
            println!("{} Cleared {} events from '{}'", "✓".green(), count, sink.key());
            Ok(())
        }
    }
}

fn open_log(config: &Config) -> LocalPersistentSink {
    let store = Arc::new(FileStore::new(Config::expand_path(&config.storage_dir)));
    LocalPersistentSink::new(store, config.local.key.clone(), config.local.max_events)
}

fn list(sink: &LocalPersistentSink, filter: Option<&str>, last: Option<usize>, format: OutputFormat) -> Result<()> {
    let events = select(sink.get_events(), filter, last);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(&events)?),
        OutputFormat::Text => {
            if events.is_empty() {
                println!("{}", "No events recorded".dimmed());
                return Ok(());
            }
            let width = terminal_size::terminal_size().map(|(w, _)| w.0 as usize).unwrap_or(120);
            for event in &events {
                println!("{}", format_line(event, width));
            }
        }
    }
    Ok(())
}

/// Filter by type substring (case-insensitive), then keep the last `last`
fn select(events: Vec<Event>, filter: Option<&str>, last: Option<usize>) -> Vec<Event> {
    let mut events: Vec<Event> = match filter {
        Some(f) => {
            let f = f.to_lowercase();
            events
                .into_iter()
                .filter(|e| e.event_type().to_lowercase().contains(&f))
                .collect()
        }
        None => events,
    };
    if let Some(n) = last {
        let start = events.len().saturating_sub(n);
        events.drain(..start);
    }
    events
}

fn format_line(event: &Event, width: usize) -> String {
    let time = DateTime::from_timestamp_millis(event.timestamp)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| event.timestamp.to_string());

    let event_type = event.event_type();
    let label = format!("{:<26}", event_type);
    let label = match event_type.split('.').next().unwrap_or_default() {
        "error" => label.red(),
        "network" => label.cyan(),
        "console" => label.normal(),
        "performance" => label.magenta(),
        "device" => label.yellow(),
        "agent" | "script" => label.green(),
        _ => label.blue(),
    };

    let prefix_len = time.len() + 28;
    let summary = truncate(&summarize(&event.kind), width.saturating_sub(prefix_len).max(20));
    format!("{} {} {}", time.dimmed(), label, summary)
}

fn summarize(kind: &EventKind) -> String {
    match kind {
        EventKind::Console(p) => format!("[{}] {}", p.level.as_str(), p.args.join(" ")),
        EventKind::NetworkRequest(p) => format!("{} {} ({})", p.method, p.url, p.request_id),
        EventKind::NetworkResponse(p) => format!(
            "{} {} {}ms {}B ({})",
            p.status, p.status_text, p.duration, p.size, p.request_id
        ),
        EventKind::NetworkError(p) => format!("{} after {}ms ({})", p.error, p.duration, p.request_id),
        EventKind::Error(p) => match (&p.filename, p.lineno) {
            (Some(file), Some(line)) => format!("{} at {}:{}", p.message, file, line),
            _ => p.message.clone(),
        },
        EventKind::UnhandledRejection(p) => p.reason.clone(),
        EventKind::ScriptResult(p) => match &p.error {
            Some(error) => format!("{} -> error: {}", p.code, error),
            None => format!("{} -> {}", p.code, p.output.as_deref().unwrap_or_default().trim()),
        },
        other => other.payload().to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let kept: String = single_line.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", kept)
}
