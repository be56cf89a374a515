//! Received-task store — the durable log of tasks peers asked this node to run.
//!
//! Backed by `received-tasks.json` with the same `{version, updatedAt, tasks}`
//! envelope as the sent-task log, most-recent-first, capped at 200. Records
//! are never destroyed individually; they age out of the cap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::ReceivedTask;

use super::{write_atomic, write_atomic_best_effort, SaveScheduler, SAVE_DEBOUNCE, STORE_VERSION};

/// Maximum retained received-task records.
const RECEIVED_TASK_CAP: usize = 200;

/// On-disk shape of `received-tasks.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedFileEnvelope {
    version: u32,
    updated_at: DateTime<Utc>,
    tasks: Vec<ReceivedTask>,
}

/// Durable log of inbound tasks, most recent first.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ReceivedTaskStore {
    path: PathBuf,
    tasks: Arc<RwLock<Vec<ReceivedTask>>>,
    saver: SaveScheduler,
}

impl ReceivedTaskStore {
    /// Open the store under `dir`, loading `received-tasks.json` best-effort.
    pub async fn open(dir: &Path) -> Self {
        let path = dir.join("received-tasks.json");
        let tasks = match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<ReceivedFileEnvelope>(&text) {
                Ok(envelope) => envelope.tasks,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed received-task file, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        debug!(count = tasks.len(), "received-task store loaded");
        Self {
            path,
            tasks: Arc::new(RwLock::new(tasks)),
            saver: SaveScheduler::new(SAVE_DEBOUNCE),
        }
    }

    /// Record a freshly received task at the head of the log.
    pub async fn record(&self, task: ReceivedTask) {
        let mut tasks = self.tasks.write().await;
        tasks.insert(0, task);
        tasks.truncate(RECEIVED_TASK_CAP);
        drop(tasks);
        self.schedule_save();
    }

    /// Replace the record with the same `task_id`.
    ///
    /// Records that already aged out of the cap are ignored.
    pub async fn update(&self, task: &ReceivedTask) {
        let mut tasks = self.tasks.write().await;
        if let Some(slot) = tasks.iter_mut().find(|t| t.task_id == task.task_id) {
            *slot = task.clone();
            drop(tasks);
            self.schedule_save();
        }
    }

    /// Look up a task by id.
    pub async fn get(&self, task_id: &str) -> Option<ReceivedTask> {
        let tasks = self.tasks.read().await;
        tasks.iter().find(|t| t.task_id == task_id).cloned()
    }

    /// List records, most recent first.
    pub async fn list(&self, limit: Option<usize>) -> Vec<ReceivedTask> {
        let tasks = self.tasks.read().await;
        tasks
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Write the log to disk immediately.
    pub async fn flush(&self) {
        let contents = self.serialize().await;
        write_atomic_best_effort(&self.path, contents).await;
    }

    /// Like [`flush`](Self::flush) but surfacing the error; used by tests.
    pub async fn flush_strict(&self) -> std::io::Result<()> {
        let contents = self.serialize().await;
        write_atomic(&self.path, contents).await
    }

    async fn serialize(&self) -> String {
        let tasks = self.tasks.read().await;
        let envelope = ReceivedFileEnvelope {
            version: STORE_VERSION,
            updated_at: Utc::now(),
            tasks: tasks.clone(),
        };
        serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| "{}".to_string())
    }

    fn schedule_save(&self) {
        let store = self.clone();
        self.saver.schedule(async move {
            store.flush().await;
        });
    }
}
