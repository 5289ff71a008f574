//! Registry of the engine's named background tasks, so shutdown can abort
//! whatever is still running in one sweep.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Track `handle` under `name`. A live task already holding the name is
    /// aborted; entries whose tasks have finished are pruned on the way.
    pub async fn register(&self, name: &str, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, h| !h.is_finished());
        if let Some(previous) = tasks.insert(name.to_string(), handle) {
            if !previous.is_finished() {
                warn!("Task '{}' was still running, replacing and aborting it", name);
                previous.abort();
            }
        }
    }

    /// Number of tracked tasks that have not finished yet.
    pub async fn active_count(&self) -> usize {
        let tasks = self.tasks.lock().await;
        tasks.values().filter(|h| !h.is_finished()).count()
    }

    /// Abort every tracked task and clear the registry. Returns how many
    /// were still running when aborted.
    pub async fn abort_all(&self) -> usize {
        let drained: Vec<(String, JoinHandle<()>)> =
            self.tasks.lock().await.drain().collect();
        let mut aborted = 0;
        for (name, handle) in drained {
            if handle.is_finished() {
                continue;
            }
            handle.abort();
            aborted += 1;
            debug!("Aborted task '{}'", name);
        }
        if aborted > 0 {
            info!("Aborted {} background task(s) on shutdown", aborted);
        }
        aborted
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
