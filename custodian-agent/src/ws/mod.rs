//! Reverse WebSocket link to the server.

pub mod client;

use custodian_plugin::AgentEvent;
use tokio_tungstenite::tungstenite::Message;

pub use client::AgentWsClient;

/// Agent WebSocket URL for a server base URL (`http(s)://` becomes `ws(s)://`).
pub fn agent_ws_url(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/v1/agent/ws")
}

pub fn encode(event: &AgentEvent) -> Result<Message, serde_json::Error> {
    Ok(Message::Text(serde_json::to_string(event)?))
}
