//! Runs server commands through the plugin runtime and reports back as
//! agent events.
//!
//! Every command is acknowledged immediately with `task:accepted`, then run
//! on its own task once a concurrency permit is free. Log lines are forwarded
//! as they are produced; the run ends with exactly one `task:completed` or
//! `task:failed`. Cancelling a task drops the pipeline, which kills the
//! plugin processes it started.

pub mod tracker;

use custodian_plugin::{run_command, AgentEvent, Command, FailureKind, LogSink, PluginResolver};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use tracker::TaskTracker;

pub type EventSender = mpsc::UnboundedSender<AgentEvent>;

pub struct Executor {
    plugins: Arc<dyn PluginResolver>,
    permits: Semaphore,
    tracker: TaskTracker,
}

impl Executor {
    pub fn new(plugins: Arc<dyn PluginResolver>, max_concurrent: usize) -> Self {
        Self {
            plugins,
            permits: Semaphore::new(max_concurrent.max(1)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Acknowledges `cmd` and starts it in the background.
    pub async fn dispatch(self: &Arc<Self>, cmd: Command, events: EventSender) {
        let task_uuid = cmd.task_uuid.clone();
        info!(task_id = %task_uuid, operation = %cmd.operation, "Accepted command");
        let _ = events.send(AgentEvent::Accepted {
            task_uuid: task_uuid.clone(),
        });

        let token = CancellationToken::new();
        let generation = self.tracker.register(&task_uuid, token.clone()).await;

        let executor = self.clone();
        tokio::spawn(async move {
            let outcome = executor.execute(&cmd, &events, &token).await;
            executor.tracker.complete(&task_uuid, generation).await;
            let _ = events.send(outcome);
        });
    }

    pub async fn cancel(&self, task_uuid: &str) -> bool {
        let found = self.tracker.cancel(task_uuid).await;
        if !found {
            warn!(task_id = %task_uuid, "Cancel for a task that is not running");
        }
        found
    }

    async fn execute(&self, cmd: &Command, events: &EventSender, token: &CancellationToken) -> AgentEvent {
        let task_uuid = cmd.task_uuid.clone();

        let log_events = events.clone();
        let log_uuid = task_uuid.clone();
        let log: LogSink = Arc::new(move |line: &str| {
            let _ = log_events.send(AgentEvent::Log {
                task_uuid: log_uuid.clone(),
                line: line.to_string(),
            });
        });

        let run = async {
            let _permit = self.permits.acquire().await.ok();
            run_command(cmd, self.plugins.as_ref(), log).await
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(task_id = %task_uuid, "Command cancelled");
                AgentEvent::Failed {
                    task_uuid,
                    error: "cancelled by server".to_string(),
                    kind: FailureKind::Execution,
                    half: None,
                }
            }
            result = run => match result {
                Ok(output) => {
                    info!(task_id = %task_uuid, "Command completed");
                    AgentEvent::Completed {
                        task_uuid,
                        key: output.key,
                        size: output.size,
                    }
                }
                Err(e) => {
                    warn!(task_id = %task_uuid, "Command failed: {e}");
                    AgentEvent::Failed {
                        task_uuid,
                        error: e.to_string(),
                        kind: e.kind(),
                        half: e.half(),
                    }
                }
            },
        }
    }
}
