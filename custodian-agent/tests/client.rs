use custodian_agent::api::AppState;
use custodian_agent::ws::AgentWsClient;
use custodian_plugin::{AgentEvent, Command, Endpoint, Operation, PluginDir, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

type Socket = WebSocketStream<TcpStream>;

const STORE_INFO: &str =
    r#"{"name":"sh-store","author":"tests","version":"0.1","features":{"target":false,"store":true},"fields":[]}"#;

fn script(dir: &Path, name: &str, purge_body: &str) {
    let path = dir.join(name);
    let body = format!(
        "#!/bin/sh\ncase \"$1\" in\n  info) echo '{STORE_INFO}' ;;\n  purge) {purge_body} ;;\n  *) exit 10 ;;\nesac\n"
    );
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

async fn accept(listener: &TcpListener) -> Socket {
    let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("agent never connected")
        .unwrap();
    tokio_tungstenite::accept_async(tcp).await.unwrap()
}

async fn next_event(socket: &mut Socket) -> AgentEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("agent went quiet")
            .expect("agent hung up")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(socket: &mut Socket, event: &ServerEvent) {
    socket
        .send(Message::Text(serde_json::to_string(event).unwrap()))
        .await
        .unwrap();
}

fn purge(task: &str, store: &str) -> ServerEvent {
    ServerEvent::Run(Command::new(Operation::Purge, task).store(store, Endpoint::new()).key("archive-1"))
}

/// Collects events for `task` until its final outcome.
async fn outcome(socket: &mut Socket, task: &str) -> (Vec<String>, AgentEvent) {
    let mut lines = Vec::new();
    loop {
        let event = next_event(socket).await;
        if event.task_uuid() != Some(task) {
            continue;
        }
        match event {
            AgentEvent::Log { line, .. } => lines.push(line),
            AgentEvent::Accepted { .. } => {}
            done => return (lines, done),
        }
    }
}

#[tokio::test]
async fn agent_registers_runs_cancels_and_reconnects() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "quick", "echo 'purging now' >&2; exit 0");
    script(dir.path(), "slow", "sleep 30");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let state = AppState::new("db-host-7", PluginDir::new(dir.path()), 2);
    let shutdown = CancellationToken::new();
    let client = AgentWsClient::new(
        &url,
        state.clone(),
        (Duration::from_millis(20), Duration::from_millis(100)),
        shutdown.clone(),
    );
    let running = tokio::spawn(async move { client.run().await });

    let mut socket = accept(&listener).await;
    match next_event(&mut socket).await {
        AgentEvent::Register { name, plugins, .. } => {
            assert_eq!(name, "db-host-7");
            assert_eq!(plugins, vec!["quick".to_string(), "slow".to_string()]);
        }
        other => panic!("expected registration, got {other:?}"),
    }
    send(&mut socket, &ServerEvent::RegisterOk { name: "db-host-7".into() }).await;

    send(&mut socket, &purge("t-quick", "quick")).await;
    assert_eq!(next_event(&mut socket).await, AgentEvent::Accepted { task_uuid: "t-quick".into() });
    let (lines, done) = outcome(&mut socket, "t-quick").await;
    assert!(matches!(done, AgentEvent::Completed { .. }), "got {done:?}");
    assert!(lines.iter().any(|l| l.contains("purging now")), "lines: {lines:?}");

    send(&mut socket, &purge("t-slow", "slow")).await;
    assert_eq!(next_event(&mut socket).await, AgentEvent::Accepted { task_uuid: "t-slow".into() });
    tokio::time::sleep(Duration::from_millis(200)).await;
    send(&mut socket, &ServerEvent::Cancel { task_uuid: "t-slow".into() }).await;
    match outcome(&mut socket, "t-slow").await.1 {
        AgentEvent::Failed { error, .. } => assert!(error.contains("cancelled"), "error: {error}"),
        other => panic!("expected failure, got {other:?}"),
    }

    // Dropping the connection makes the agent come back and register again.
    drop(socket);
    let mut socket = accept(&listener).await;
    assert!(matches!(next_event(&mut socket).await, AgentEvent::Register { .. }));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
}

#[tokio::test]
async fn rejected_registration_retries() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let state = AppState::new("edge", PluginDir::new(dir.path()), 1);
    let shutdown = CancellationToken::new();
    let client = AgentWsClient::new(
        &url,
        state.clone(),
        (Duration::from_millis(20), Duration::from_millis(100)),
        shutdown.clone(),
    );
    let running = tokio::spawn(async move { client.run().await });

    let mut socket = accept(&listener).await;
    assert!(matches!(next_event(&mut socket).await, AgentEvent::Register { .. }));
    send(&mut socket, &ServerEvent::RegisterError { error: "name taken".into() }).await;

    let mut again = accept(&listener).await;
    assert!(matches!(next_event(&mut again).await, AgentEvent::Register { .. }));
    assert!(!state.connected.load(std::sync::atomic::Ordering::Relaxed));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
}
