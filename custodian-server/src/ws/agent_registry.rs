use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use custodian_plugin::{AgentEvent, Command, CommandOutput, FailureKind, LogSink, ServerEvent};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::services::transport::{is_local, AgentTransport, DispatchError};
use crate::state::AppState;

#[derive(Debug)]
struct AgentConnection {
    version: String,
    plugins: Vec<String>,
    connected_at: DateTime<Utc>,
    session: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
    pub plugins: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

struct PendingTask {
    session: u64,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

/// Connected remote agents, and the tasks each one is running for us.
pub struct AgentRegistry {
    agents: DashMap<String, AgentConnection>,
    pending: DashMap<String, PendingTask>,
    sessions: AtomicU64,
    ack_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            pending: DashMap::new(),
            sessions: AtomicU64::new(1),
            ack_timeout,
        }
    }

    /// Returns the session id the connection must present to unregister.
    pub fn register(
        &self,
        name: &str,
        version: &str,
        plugins: Vec<String>,
        tx: mpsc::UnboundedSender<String>,
    ) -> u64 {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed);
        let old = self.agents.insert(
            name.to_string(),
            AgentConnection {
                version: version.to_string(),
                plugins,
                connected_at: Utc::now(),
                session,
                tx,
            },
        );
        // A reconnect supersedes the old socket and whatever it was running.
        if let Some(old) = old {
            self.drop_session(old.session);
        }
        session
    }

    /// Removes the agent if `session` is still its live connection.
    pub fn unregister(&self, name: &str, session: u64) {
        if self.agents.remove_if(name, |_, c| c.session == session).is_some() {
            self.drop_session(session);
        }
    }

    fn drop_session(&self, session: u64) {
        self.pending.retain(|_, p| p.session != session);
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn connected(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .agents
            .iter()
            .map(|entry| AgentInfo {
                name: entry.key().clone(),
                version: entry.version.clone(),
                plugins: entry.plugins.clone(),
                connected_at: entry.connected_at,
            })
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Hands a task-scoped event to whoever is waiting on that task.
    pub fn route_event(&self, event: AgentEvent) {
        let Some(task_uuid) = event.task_uuid() else {
            return;
        };
        match self.pending.get(task_uuid) {
            Some(p) => {
                let _ = p.tx.send(event);
            }
            None => tracing::debug!(task_id = %task_uuid, "dropping event for task nobody is waiting on"),
        }
    }
}

/// Forgets the pending entry when `execute` returns or is dropped, and
/// tells the agent to stop unless the task already reached an outcome.
struct InFlight<'a> {
    registry: &'a AgentRegistry,
    task_uuid: String,
    conn: mpsc::UnboundedSender<String>,
    armed: bool,
}

impl InFlight<'_> {
    fn settle<T>(&mut self, result: T) -> T {
        self.armed = false;
        result
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.registry.pending.remove(&self.task_uuid);
        if self.armed {
            let cancel = ServerEvent::Cancel {
                task_uuid: self.task_uuid.clone(),
            };
            if let Ok(frame) = serde_json::to_string(&cancel) {
                let _ = self.conn.send(frame);
            }
        }
    }
}

#[async_trait::async_trait]
impl AgentTransport for AgentRegistry {
    async fn execute(&self, agent: &str, cmd: Command, log: LogSink) -> Result<CommandOutput, DispatchError> {
        let unreachable = |reason: String| DispatchError::Unreachable {
            agent: agent.to_string(),
            reason,
        };
        let (conn, session) = match self.agents.get(agent) {
            Some(c) => (c.tx.clone(), c.session),
            None => return Err(unreachable("not connected".into())),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(cmd.task_uuid.clone(), PendingTask { session, tx });
        let mut flight = InFlight {
            registry: self,
            task_uuid: cmd.task_uuid.clone(),
            conn: conn.clone(),
            armed: true,
        };

        let frame = serde_json::to_string(&ServerEvent::Run(cmd)).map_err(|e| unreachable(e.to_string()))?;
        if conn.send(frame).is_err() {
            return flight.settle(Err(unreachable("connection closed".into())));
        }

        let mut next = match tokio::time::timeout(self.ack_timeout, rx.recv()).await {
            Ok(Some(event)) => Some(event),
            Ok(None) => return flight.settle(Err(unreachable("disconnected before acknowledging the task".into()))),
            Err(_) => {
                return Err(unreachable(format!(
                    "no acknowledgement within {}s",
                    self.ack_timeout.as_secs_f32()
                )))
            }
        };

        loop {
            let event = match next.take() {
                Some(event) => event,
                None => match rx.recv().await {
                    Some(event) => event,
                    None => {
                        return flight.settle(Err(DispatchError::Execution {
                            kind: FailureKind::Execution,
                            half: None,
                            message: format!("agent '{agent}' disconnected while running the task"),
                        }))
                    }
                },
            };
            match event {
                AgentEvent::Log { line, .. } => log(&line),
                AgentEvent::Completed { key, size, .. } => {
                    return flight.settle(Ok(CommandOutput { key, size }));
                }
                AgentEvent::Failed { error, kind, half, .. } => {
                    return flight.settle(Err(DispatchError::Execution {
                        kind,
                        half,
                        message: error,
                    }));
                }
                AgentEvent::Accepted { .. } | AgentEvent::Register { .. } => {}
            }
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state.agents.clone()))
}

fn send_frame(tx: &mpsc::UnboundedSender<String>, event: &ServerEvent) {
    if let Ok(frame) = serde_json::to_string(event) {
        let _ = tx.send(frame);
    }
}

async fn handle_agent_socket(socket: WebSocket, agents: Arc<AgentRegistry>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let mut registered: Option<(String, u64)> = None;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let event: AgentEvent = match serde_json::from_str(&text) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!("Ignoring malformed agent frame: {e}");
                continue;
            }
        };

        match event {
            AgentEvent::Register { name, version, plugins } => {
                if name.trim().is_empty() || is_local(&name) {
                    send_frame(
                        &tx,
                        &ServerEvent::RegisterError {
                            error: format!("agent name '{name}' is reserved or empty"),
                        },
                    );
                    continue;
                }
                if let Some((old, session)) = registered.take() {
                    agents.unregister(&old, session);
                }
                let session = agents.register(&name, &version, plugins, tx.clone());
                tracing::info!(agent = %name, version = %version, "Agent registered");
                send_frame(&tx, &ServerEvent::RegisterOk { name: name.clone() });
                registered = Some((name, session));
            }
            other if registered.is_some() => agents.route_event(other),
            _ => tracing::warn!("Ignoring task event from unregistered agent"),
        }
    }

    if let Some((name, session)) = registered {
        tracing::info!(agent = %name, "Agent disconnected");
        agents.unregister(&name, session);
    }

    send_task.abort();
}
