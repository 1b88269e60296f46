//! Running tasks and the tokens that cancel them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct TaskTracker {
    tasks: Arc<RwLock<HashMap<String, (u64, CancellationToken)>>>,
    generation: Arc<AtomicU64>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a task, cancelling any earlier run of the same task id.
    /// Returns the generation to hand back to [`TaskTracker::complete`].
    pub async fn register(&self, task_uuid: &str, token: CancellationToken) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut tasks = self.tasks.write().await;
        if let Some((_, previous)) = tasks.insert(task_uuid.to_string(), (generation, token)) {
            previous.cancel();
        }
        generation
    }

    pub async fn cancel(&self, task_uuid: &str) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.remove(task_uuid) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let n = tasks.len();
        for (_, (_, token)) in tasks.drain() {
            token.cancel();
        }
        n
    }

    /// Forgets a finished task unless a newer run has replaced it.
    pub async fn complete(&self, task_uuid: &str, generation: u64) {
        let mut tasks = self.tasks.write().await;
        if tasks.get(task_uuid).is_some_and(|(g, _)| *g == generation) {
            tasks.remove(task_uuid);
        }
    }

    pub async fn running_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}
