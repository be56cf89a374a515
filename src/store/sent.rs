//! Sent-task store — the durable log of tasks this node dispatched.
//!
//! Backed by `tasks.json`: a single `{version, updatedAt, tasks}` object
//! where `tasks` is most-recent-first and capped at 200 records. Status
//! updates are monotonic along `sent < queued < running < terminal`;
//! regressing updates (a late `queued` ack after the result arrived, frames
//! reordered by the hub) are discarded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::{AckStatus, SentTaskStatus, StoredTask};

use super::{write_atomic, write_atomic_best_effort, SaveScheduler, SAVE_DEBOUNCE, STORE_VERSION};

/// Maximum retained sent-task records.
const SENT_TASK_CAP: usize = 200;

/// On-disk shape of `tasks.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SentFileEnvelope {
    version: u32,
    updated_at: DateTime<Utc>,
    tasks: Vec<StoredTask>,
}

/// Filter for [`SentTaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct SentTaskFilter {
    /// Only tasks sent to this node.
    pub node_id: Option<String>,
    /// Only tasks currently in this state.
    pub status: Option<SentTaskStatus>,
    /// Maximum records to return (most recent first).
    pub limit: Option<usize>,
}

/// Counts per status for the `status` verb and the presenter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    /// All retained records.
    pub total: usize,
    /// Awaiting acknowledgement.
    pub sent: usize,
    /// Queued on the peer.
    pub queued: usize,
    /// Running on the peer.
    pub running: usize,
    /// Terminal: success.
    pub completed: usize,
    /// Terminal: failure.
    pub failed: usize,
    /// Terminal: cancelled.
    pub cancelled: usize,
    /// Terminal: timed out.
    pub timeout: usize,
}

/// Durable log of outbound tasks, most recent first.
///
/// Cheap to clone; clones share state. Thread-safe via `tokio::sync::RwLock`.
#[derive(Debug, Clone)]
pub struct SentTaskStore {
    path: PathBuf,
    tasks: Arc<RwLock<Vec<StoredTask>>>,
    saver: SaveScheduler,
}

impl SentTaskStore {
    /// Open the store under `dir`, loading `tasks.json` best-effort.
    pub async fn open(dir: &Path) -> Self {
        let path = dir.join("tasks.json");
        let tasks = match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<SentFileEnvelope>(&text) {
                Ok(envelope) => envelope.tasks,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed sent-task file, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        debug!(count = tasks.len(), "sent-task store loaded");
        Self {
            path,
            tasks: Arc::new(RwLock::new(tasks)),
            saver: SaveScheduler::new(SAVE_DEBOUNCE),
        }
    }

    /// Record a freshly sent task at the head of the log.
    pub async fn record_sent(&self, task: StoredTask) -> StoredTask {
        let mut tasks = self.tasks.write().await;
        tasks.insert(0, task.clone());
        tasks.truncate(SENT_TASK_CAP);
        drop(tasks);
        self.schedule_save();
        task
    }

    /// Apply a `task_ack` (or `task_status`) frame.
    ///
    /// `queued` stamps `acked_at`, `running` stamps `started_at`. Returns the
    /// updated record, or `None` when the task is unknown or the update would
    /// regress the status.
    pub async fn apply_ack(&self, task_id: &str, ack: AckStatus) -> Option<StoredTask> {
        let status = match ack {
            AckStatus::Queued => SentTaskStatus::Queued,
            AckStatus::Running => SentTaskStatus::Running,
        };
        self.transition(task_id, status, None, None).await
    }

    /// Apply a terminal `result` frame.
    ///
    /// Stamps `completed_at` and derives `duration_ms`.
    pub async fn record_result(
        &self,
        task_id: &str,
        success: bool,
        result: Option<String>,
        error: Option<String>,
    ) -> Option<StoredTask> {
        let status = if success {
            SentTaskStatus::Completed
        } else {
            SentTaskStatus::Failed
        };
        self.transition(task_id, status, result, error).await
    }

    /// Move a non-terminal task to `cancelled`.
    pub async fn mark_cancelled(&self, task_id: &str) -> Option<StoredTask> {
        self.transition(
            task_id,
            SentTaskStatus::Cancelled,
            None,
            Some("cancelled".to_string()),
        )
        .await
    }

    /// Move a non-terminal task to `timeout`.
    pub async fn mark_timeout(&self, task_id: &str, error: impl Into<String>) -> Option<StoredTask> {
        self.transition(task_id, SentTaskStatus::Timeout, None, Some(error.into()))
            .await
    }

    /// Monotonic status transition; the single mutation path for updates.
    async fn transition(
        &self,
        task_id: &str,
        status: SentTaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Option<StoredTask> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.iter_mut().find(|t| t.task_id == task_id)?;

        if status.rank() <= task.status.rank() {
            debug!(
                task_id = %task_id,
                current = %task.status,
                discarded = %status,
                "discarding regressing status update"
            );
            return None;
        }

        let now = Utc::now();
        task.status = status;
        match status {
            SentTaskStatus::Queued => {
                task.acked_at.get_or_insert(now);
            }
            SentTaskStatus::Running => {
                task.started_at.get_or_insert(now);
            }
            _ if status.is_terminal() => {
                task.completed_at = Some(now);
                task.duration_ms = Some((now - task.sent_at).num_milliseconds());
                if result.is_some() {
                    task.result = result;
                }
                if error.is_some() {
                    task.error = error;
                }
            }
            _ => {}
        }

        let snapshot = task.clone();
        drop(tasks);
        self.schedule_save();
        Some(snapshot)
    }

    /// Look up a task by id.
    pub async fn get(&self, task_id: &str) -> Option<StoredTask> {
        let tasks = self.tasks.read().await;
        tasks.iter().find(|t| t.task_id == task_id).cloned()
    }

    /// List tasks, most recent first, honoring the filter.
    pub async fn list(&self, filter: &SentTaskFilter) -> Vec<StoredTask> {
        let tasks = self.tasks.read().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        tasks
            .iter()
            .filter(|t| {
                filter
                    .node_id
                    .as_ref()
                    .map_or(true, |id| &t.target_node_id == id)
            })
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Counts per status.
    pub async fn summary(&self) -> TaskSummary {
        let tasks = self.tasks.read().await;
        let mut summary = TaskSummary {
            total: tasks.len(),
            ..TaskSummary::default()
        };
        for task in tasks.iter() {
            match task.status {
                SentTaskStatus::Sent => summary.sent += 1,
                SentTaskStatus::Queued => summary.queued += 1,
                SentTaskStatus::Running => summary.running += 1,
                SentTaskStatus::Completed => summary.completed += 1,
                SentTaskStatus::Failed => summary.failed += 1,
                SentTaskStatus::Cancelled => summary.cancelled += 1,
                SentTaskStatus::Timeout => summary.timeout += 1,
            }
        }
        summary
    }

    /// Drop terminal records, optionally only those completed before `before`.
    ///
    /// Returns the number of records removed. Non-terminal records are never
    /// touched, so repeating the call removes nothing.
    pub async fn clear_completed(&self, before: Option<DateTime<Utc>>) -> usize {
        let mut tasks = self.tasks.write().await;
        let before_len = tasks.len();
        tasks.retain(|t| {
            if !t.status.is_terminal() {
                return true;
            }
            match (before, t.completed_at) {
                (Some(cutoff), Some(completed)) => completed >= cutoff,
                (Some(_), None) => true,
                (None, _) => false,
            }
        });
        let cleared = before_len - tasks.len();
        drop(tasks);
        if cleared > 0 {
            self.schedule_save();
        }
        cleared
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
        let envelope = SentFileEnvelope {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskSource;

    async fn store() -> (tempfile::TempDir, SentTaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SentTaskStore::open(dir.path()).await;
        (dir, store)
    }

    fn task(id: &str) -> StoredTask {
        StoredTask::new(id, "peer", None, "echo hi", TaskSource::Remote)
    }

    #[tokio::test]
    async fn ack_then_result_walks_the_order() {
        let (_dir, store) = store().await;
        store.record_sent(task("t1")).await;

        let queued = store.apply_ack("t1", AckStatus::Queued).await.unwrap();
        assert_eq!(queued.status, SentTaskStatus::Queued);
        assert!(queued.acked_at.is_some());

        let running = store.apply_ack("t1", AckStatus::Running).await.unwrap();
        assert_eq!(running.status, SentTaskStatus::Running);
        assert!(running.started_at.is_some());

        let done = store
            .record_result("t1", true, Some("output".to_string()), None)
            .await
            .unwrap();
        assert_eq!(done.status, SentTaskStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.duration_ms.is_some());
        assert_eq!(done.result.as_deref(), Some("output"));
    }

    #[tokio::test]
    async fn regressing_updates_are_discarded() {
        let (_dir, store) = store().await;
        store.record_sent(task("t1")).await;
        store
            .record_result("t1", false, None, Some("boom".to_string()))
            .await
            .unwrap();

        // A late ack must not resurrect the task.
        assert!(store.apply_ack("t1", AckStatus::Running).await.is_none());
        assert_eq!(
            store.get("t1").await.unwrap().status,
            SentTaskStatus::Failed
        );

        // A second terminal transition is also discarded.
        assert!(store.mark_cancelled("t1").await.is_none());
    }

    #[tokio::test]
    async fn cap_evicts_the_oldest() {
        let (_dir, store) = store().await;
        for i in 0..=SENT_TASK_CAP {
            store.record_sent(task(&format!("t{i}"))).await;
        }
        let all = store.list(&SentTaskFilter::default()).await;
        assert_eq!(all.len(), SENT_TASK_CAP);
        // Most recent first; t0 fell off the tail.
        assert_eq!(all[0].task_id, format!("t{SENT_TASK_CAP}"));
        assert!(store.get("t0").await.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_node_and_status() {
        let (_dir, store) = store().await;
        store.record_sent(task("t1")).await;
        let mut other = task("t2");
        other.target_node_id = "elsewhere".to_string();
        store.record_sent(other).await;
        store.record_result("t1", true, None, None).await;

        let completed = store
            .list(&SentTaskFilter {
                status: Some(SentTaskStatus::Completed),
                ..Default::default()
            })
            .await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].task_id, "t1");

        let to_peer = store
            .list(&SentTaskFilter {
                node_id: Some("peer".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(to_peer.len(), 1);
    }

    #[tokio::test]
    async fn clear_completed_is_idempotent() {
        let (_dir, store) = store().await;
        store.record_sent(task("t1")).await;
        store.record_sent(task("t2")).await;
        store.record_result("t1", true, None, None).await;

        assert_eq!(store.clear_completed(None).await, 1);
        assert_eq!(store.clear_completed(None).await, 0);
        // The non-terminal task survives.
        assert!(store.get("t2").await.is_some());
    }

    #[tokio::test]
    async fn flush_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SentTaskStore::open(dir.path()).await;
        store.record_sent(task("t1")).await;
        store.record_result("t1", true, Some("ok".to_string()), None).await;
        store.flush_strict().await.unwrap();

        let reloaded = SentTaskStore::open(dir.path()).await;
        let restored = reloaded.get("t1").await.unwrap();
        assert_eq!(restored.status, SentTaskStatus::Completed);
        assert_eq!(restored.result.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn malformed_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("tasks.json"), "{not json")
            .await
            .unwrap();
        let store = SentTaskStore::open(dir.path()).await;
        assert_eq!(store.summary().await.total, 0);
    }

    #[tokio::test]
    async fn summary_counts_by_status() {
        let (_dir, store) = store().await;
        store.record_sent(task("t1")).await;
        store.record_sent(task("t2")).await;
        store.record_sent(task("t3")).await;
        store.apply_ack("t2", AckStatus::Running).await;
        store.record_result("t3", false, None, Some("x".to_string())).await;

        let summary = store.summary().await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.failed, 1);
    }
}
