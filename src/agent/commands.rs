//! Remote commands answered by the agent
//!
//! Handlers hold a weak reference so the WebSocket sink never keeps the agent
//! alive. A command arriving after the agent is dropped is ignored.

use eyre::{Result, eyre};
use serde_json::Value;
use std::sync::{Arc, Weak};

use super::Agent;
use crate::sink::WebSocketSink;

pub const ENABLE: &str = "agent.enable";
pub const DISABLE: &str = "agent.disable";
pub const RELOAD: &str = "agent.reload";
pub const SCRIPT_EXECUTE: &str = "script.execute";

pub(super) fn register(agent: &Weak<Agent>, ws: &WebSocketSink) {
    ws.on_command(ENABLE, with_agent(agent, |agent, _| {
        agent.set_enabled(true);
        Ok(())
    }));
    ws.on_command(DISABLE, with_agent(agent, |agent, _| {
        agent.set_enabled(false);
        Ok(())
    }));
    ws.on_command(RELOAD, with_agent(agent, |agent, _| {
        if !agent.host().reload() {
            log::warn!("Reload requested but the host has no reload handler");
        }
        Ok(())
    }));
    ws.on_command(SCRIPT_EXECUTE, with_agent(agent, execute_script));
}

fn with_agent<F>(agent: &Weak<Agent>, handler: F) -> impl Fn(Value) -> Result<()> + Send + Sync + 'static
where
    F: Fn(Arc<Agent>, Value) -> Result<()> + Send + Sync + 'static,
{
    let agent = agent.clone();
    move |payload| match agent.upgrade() {
        Some(agent) => handler(agent, payload),
        None => {
            log::debug!("Command arrived after the agent was dropped");
            Ok(())
        }
    }
}

fn execute_script(agent: Arc<Agent>, payload: Value) -> Result<()> {
    let code = payload
        .get("code")
        .and_then(Value::as_str)
        .ok_or_else(|| eyre!("script.execute payload needs a string 'code'"))?
        .to_string();

    if !agent.script_execution_allowed() {
        log::warn!("Refusing script.execute: requires an auth token and commands.scriptExecute");
        return Ok(());
    }

    match agent.runtime().cloned() {
        Some(runtime) => {
            runtime.spawn_blocking(move || {
                agent.execute_script(&code);
            });
        }
        None => {
            agent.execute_script(&code);
        }
    }
    Ok(())
}
