//! Keeps a registered connection to the server alive and serves the
//! commands that arrive over it.
//!
//! On connect the agent sends `agent:register` with its name, version and
//! plugin list. `task:run` commands go to the executor; its events are
//! written back on the same connection. When the connection drops, every
//! task it carried is cancelled: the server has already failed them.

use crate::api::AppState;
use crate::utils::errors::AgentError;
use crate::ws::{agent_ws_url, encode};
use custodian_plugin::{AgentEvent, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct AgentWsClient {
    url: String,
    state: AppState,
    min_backoff: Duration,
    max_backoff: Duration,
    shutdown: CancellationToken,
}

impl AgentWsClient {
    pub fn new(
        server_url: &str,
        state: AppState,
        (min_backoff, max_backoff): (Duration, Duration),
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            url: agent_ws_url(server_url),
            state,
            min_backoff,
            max_backoff,
            shutdown,
        }
    }

    /// Connects, serves, and reconnects with exponential backoff until shutdown.
    pub async fn run(&self) {
        let mut backoff = self.min_backoff;

        loop {
            if self.shutdown.is_cancelled() {
                info!("WS client shutting down");
                return;
            }

            match self.connect_and_serve().await {
                Ok(true) => {
                    info!("Server connection closed");
                    backoff = self.min_backoff;
                }
                Ok(false) => info!("Server connection closed before registration"),
                Err(e) => warn!("Server connection error: {e}"),
            }

            if self.shutdown.is_cancelled() {
                return;
            }

            info!("Reconnecting in {}ms", backoff.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => return,
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// One connection. Returns whether the server accepted our registration.
    async fn connect_and_serve(&self) -> Result<bool, AgentError> {
        info!("Connecting to {}", self.url);
        let (stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();

        let served: Result<(), AgentError> = async {
            write
                .send(encode(&AgentEvent::Register {
                    name: self.state.name.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    plugins: self.state.plugins.list(),
                })?)
                .await?;

            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        write.send(encode(&event)?).await?;
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => self.handle(&text, &tx).await?,
                        Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    },
                    _ = self.shutdown.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
        .await;

        let registered = self.state.connected.swap(false, Ordering::Relaxed);
        let orphaned = self.state.executor.tracker().cancel_all().await;
        if orphaned > 0 {
            warn!("Cancelled {orphaned} task(s) left behind by the closed connection");
        }
        served.map(|()| registered)
    }

    async fn handle(&self, text: &str, tx: &mpsc::UnboundedSender<AgentEvent>) -> Result<(), AgentError> {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring malformed server frame: {e}");
                return Ok(());
            }
        };

        match event {
            ServerEvent::RegisterOk { name } => {
                info!("Registered with server as '{name}'");
                self.state.connected.store(true, Ordering::Relaxed);
            }
            ServerEvent::RegisterError { error } => {
                error!("Registration rejected: {error}");
                return Err(AgentError::Registration(error));
            }
            ServerEvent::Run(cmd) => self.state.executor.dispatch(cmd, tx.clone()).await,
            ServerEvent::Cancel { task_uuid } => {
                info!(task_id = %task_uuid, "Cancel requested by server");
                self.state.executor.cancel(&task_uuid).await;
            }
        }
        Ok(())
    }
}
