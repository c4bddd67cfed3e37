//! End-to-end tests: agent -> relay -> subscriber, and commands back
//!
//! A real relay is served on loopback listeners; the agent streams to the
//! device endpoint and a tokio-tungstenite client plays the subscriber.

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use insidr::agent::Agent;
use insidr::config::{CaptureConfig, Config};
use insidr::event::ConsoleLevel;
use insidr::host::{ConsoleOutput, Host, ScriptRunner};
use insidr::relay::Relay;
use insidr::storage::MemoryStore;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Silent;

impl ConsoleOutput for Silent {
    fn write(&self, _level: ConsoleLevel, _args: &[Value]) {}
}

struct Echo;

impl ScriptRunner for Echo {
    fn execute(&self, code: &str) -> eyre::Result<String> {
        Ok(format!("ran {}", code))
    }
}

async fn start_relay() -> (Relay, String, String) {
    let devices = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let subscribers = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let device_url = format!("ws://{}", devices.local_addr().unwrap());
    let subscriber_url = format!("ws://{}", subscribers.local_addr().unwrap());

    let relay = Relay::new();
    let server = relay.clone();
    tokio::spawn(async move {
        let _ = server.run(devices, subscribers).await;
    });
    (relay, device_url, subscriber_url)
}

/// Read frames until one of `frame_type` arrives
async fn wait_for(client: &mut Client, frame_type: &str) -> Value {
    let mut frames = collect_until(client, frame_type).await;
    frames.pop().unwrap()
}

/// Every frame read up to and including the first of `frame_type`
async fn collect_until(client: &mut Client, frame_type: &str) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut frames = Vec::new();
    loop {
        let message = tokio::time::timeout_at(deadline, client.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", frame_type))
            .expect("subscriber stream ended")
            .expect("subscriber read failed");
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            let done = frame["type"] == frame_type;
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

fn agent_for(endpoint: &str) -> (Arc<Agent>, Arc<Host>) {
    let mut config = Config::default();
    config.endpoint = Some(endpoint.to_string());
    config.auth_token = Some("token".to_string());
    config.capture = CaptureConfig {
        console: true,
        network: false,
        errors: false,
        performance: false,
    };
    config.local.enabled = false;
    config.reconnect_interval = 50;

    let host = Arc::new(Host::new("app://relay-test"));
    host.console.replace(Arc::new(Silent));
    host.script_runner.replace(Arc::new(Echo));
    let agent = Agent::new(config, host.clone(), Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
    (agent, host)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_and_commands_round_trip() {
    let (relay, device_url, subscriber_url) = start_relay().await;
    let (mut subscriber, _) = connect_async(subscriber_url.as_str()).await.unwrap();

    let list = wait_for(&mut subscriber, "devices.list").await;
    assert_eq!(list["payload"], json!([]));

    let (agent, host) = agent_for(&device_url);
    agent.init();

    let connected = wait_for(&mut subscriber, "device.connected").await;
    assert_eq!(connected["payload"]["deviceId"], agent.device_id());
    assert_eq!(connected["payload"]["url"], "app://relay-test");

    // Buffered before the socket opened, flushed right after auth
    let started = wait_for(&mut subscriber, "agent.started").await;
    assert_eq!(started["deviceId"], agent.device_id());
    assert_eq!(started["sessionId"], agent.session_id());

    host.log(ConsoleLevel::Log, &[json!("over the wire")]);
    let console = wait_for(&mut subscriber, "console").await;
    assert_eq!(console["payload"]["args"][0], "over the wire");

    let command = json!({
        "type": "device.send_command",
        "deviceId": agent.device_id(),
        "command": "script.execute",
        "payload": { "code": "whoami" },
    });
    subscriber.send(Message::Text(command.to_string().into())).await.unwrap();
    let result = wait_for(&mut subscriber, "script.result").await;
    assert_eq!(result["payload"]["output"], "ran whoami");

    let request = json!({ "type": "device.request_events", "deviceId": agent.device_id() });
    subscriber.send(Message::Text(request.to_string().into())).await.unwrap();
    let stored = wait_for(&mut subscriber, "device.events").await;
    let types: Vec<&str> = stored["payload"]["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["type"].as_str())
        .collect();
    assert!(types.contains(&"agent.started"));
    assert!(types.contains(&"console"));
    assert!(types.contains(&"script.result"));

    agent.websocket_sink().unwrap().disconnect();
    let gone = wait_for(&mut subscriber, "device.disconnected").await;
    assert_eq!(gone["payload"]["deviceId"], agent.device_id());
    assert!(!relay.is_connected(agent.device_id()));
    assert_eq!(relay.devices().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disable_command_stops_capture() {
    let (_relay, device_url, subscriber_url) = start_relay().await;
    let (mut subscriber, _) = connect_async(subscriber_url.as_str()).await.unwrap();
    wait_for(&mut subscriber, "devices.list").await;

    let (agent, host) = agent_for(&device_url);
    agent.init();
    wait_for(&mut subscriber, "agent.started").await;

    let disable = json!({
        "type": "device.send_command",
        "deviceId": agent.device_id(),
        "command": "agent.disable",
    });
    subscriber.send(Message::Text(disable.to_string().into())).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while agent.is_enabled() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!agent.is_enabled());

    // Transport stays up while capture is off
    host.log(ConsoleLevel::Log, &[json!("not captured")]);
    agent.track("marker", json!({ "after": "disable" }));
    let frames = collect_until(&mut subscriber, "marker").await;
    assert!(frames.iter().all(|f| f["type"] != "console"));
    assert_eq!(frames.last().unwrap()["payload"]["after"], "disable");

    agent.websocket_sink().unwrap().disconnect();
}
