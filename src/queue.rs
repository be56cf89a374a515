//! Task queue — two-phase execution of inbound tasks.
//!
//! The queue separates *dispatch slots* from *inflight waits*:
//!
//! - **Dispatching** — tasks being submitted to the local agent. Submission is
//!   the expensive part (agent spin-up), so this pool is bounded by
//!   `max_concurrent` (clamped to `[1, 10]`). A task leaves the pool as soon
//!   as the submit round-trip returns — well before the run completes.
//! - **Inflight** — tasks submitted and awaiting completion. Unbounded; a
//!   hundred slow runs cost nothing but memory.
//!
//! Tasks that arrive while all slots are taken wait in a FIFO queue and are
//! acknowledged with their position. Completed tasks land on a ring of the
//! last 50 for the status snapshot.
//!
//! Every task that starts emits exactly one `task_ack{running}` and exactly
//! one `result`, in that order; a task cancelled while still waiting emits a
//! synthesized cancelled `result` and never a running ack.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::{task_session_key, AgentRunner};
use crate::events::{EventBus, FanoutEvent};
use crate::hub::FrameSink;
use crate::store::ReceivedTaskStore;
use crate::types::{
    AckStatus, ReceivedTask, ReceivedTaskStatus, ResultPayload, TaskAckPayload, WsMessage,
};

/// Completed-task ring depth.
const COMPLETED_CAP: usize = 50;
/// Entries shown in `recent_completed`.
const RECENT_COMPLETED: usize = 10;
/// Instruction preview length in status snapshots.
const INSTRUCTION_PREVIEW: usize = 100;

/// Abbreviated waiting task in a [`QueueStatus`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTaskBrief {
    /// Task id.
    pub task_id: String,
    /// First 100 characters of the instruction.
    pub instruction: String,
    /// When the task arrived.
    pub received_at: DateTime<Utc>,
}

/// Abbreviated running task in a [`QueueStatus`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTaskBrief {
    /// Task id.
    pub task_id: String,
    /// First 100 characters of the instruction.
    pub instruction: String,
    /// When the task started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Snapshot of the queue for the `status` verb and the presenter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Dispatch-slot bound.
    pub max_concurrent: usize,
    /// Tasks waiting for a slot.
    pub queued: usize,
    /// Tasks being submitted.
    pub dispatching: usize,
    /// Tasks awaiting completion.
    pub inflight: usize,
    /// `dispatching + inflight`.
    pub running: usize,
    /// Ring entries that completed successfully.
    pub completed: usize,
    /// Ring entries that failed.
    pub failed: usize,
    /// Waiting tasks, queue order.
    pub queued_tasks: Vec<QueuedTaskBrief>,
    /// Dispatching and inflight tasks.
    pub running_tasks: Vec<RunningTaskBrief>,
    /// Most recent 10 terminal tasks.
    pub recent_completed: Vec<ReceivedTask>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<ReceivedTask>,
    dispatching: HashMap<String, ReceivedTask>,
    inflight: HashMap<String, ReceivedTask>,
    completed: VecDeque<ReceivedTask>,
    /// Task ids with a pending cancel; consumed at finalization to map the
    /// surfaced wait error to `cancelled` instead of `failed`.
    cancel_requested: HashSet<String>,
}

impl QueueState {
    fn holds(&self, task_id: &str) -> bool {
        self.waiting.iter().any(|t| t.task_id == task_id)
            || self.dispatching.contains_key(task_id)
            || self.inflight.contains_key(task_id)
    }
}

struct QueueInner {
    max_concurrent: usize,
    task_timeout_ms: u64,
    state: Mutex<QueueState>,
    runner: Arc<dyn AgentRunner>,
    sink: Arc<dyn FrameSink>,
    store: ReceivedTaskStore,
    events: EventBus,
    active_tasks: Arc<AtomicUsize>,
}

/// Two-phase task queue over the local agent.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create a queue.
    ///
    /// `max_concurrent` is clamped to `[1, 10]`. `active_tasks` is shared
    /// with the hub client's heartbeat.
    pub fn new(
        max_concurrent: usize,
        task_timeout_ms: u64,
        runner: Arc<dyn AgentRunner>,
        sink: Arc<dyn FrameSink>,
        store: ReceivedTaskStore,
        events: EventBus,
        active_tasks: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_concurrent: max_concurrent.clamp(1, 10),
                task_timeout_ms,
                state: Mutex::new(QueueState::default()),
                runner,
                sink,
                store,
                events,
                active_tasks,
            }),
        }
    }

    /// Dispatch-slot bound after clamping.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Accept an inbound task: start it if a slot is free, otherwise queue it
    /// and acknowledge the position.
    pub async fn enqueue(&self, task: ReceivedTask) {
        enum Placement {
            Duplicate,
            Started(ReceivedTask),
            Queued(usize),
        }

        let placement = {
            let mut state = self.inner.state.lock().await;
            if state.holds(&task.task_id) {
                Placement::Duplicate
            } else if state.dispatching.len() < self.inner.max_concurrent {
                Placement::Started(claim(&mut state, task.clone()))
            } else {
                state.waiting.push_back(task.clone());
                Placement::Queued(state.waiting.len())
            }
        };

        match placement {
            Placement::Duplicate => {
                warn!(task_id = %task.task_id, "duplicate task frame ignored");
            }
            Placement::Started(claimed) => {
                self.record_and_announce(&task).await;
                tokio::spawn(run_task(Arc::clone(&self.inner), claimed));
            }
            Placement::Queued(position) => {
                self.record_and_announce(&task).await;
                debug!(task_id = %task.task_id, position, "task queued");
                self.inner
                    .sink
                    .send_frame(WsMessage::task_ack(
                        &task.task_id,
                        &task.from_node_id,
                        &TaskAckPayload {
                            status: AckStatus::Queued,
                            position: Some(position),
                        },
                    ))
                    .await;
            }
        }
    }

    async fn record_and_announce(&self, task: &ReceivedTask) {
        self.inner.store.record(task.clone()).await;
        self.inner
            .events
            .publish(FanoutEvent::ReceivedTaskUpdate { task: task.clone() });
    }

    /// Cancel a task.
    ///
    /// - Still waiting: removed from the queue, marked `cancelled`, and a
    ///   synthesized cancelled `result` is sent. No running ack ever fires.
    /// - Dispatching or inflight: the agent session is deleted best-effort;
    ///   the pending wait surfaces an error and finalization maps it to
    ///   `cancelled`.
    ///
    /// Returns whether the task was found.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;

        if let Some(pos) = state.waiting.iter().position(|t| t.task_id == task_id) {
            let Some(mut task) = state.waiting.remove(pos) else {
                return false;
            };
            drop(state);

            task.status = ReceivedTaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            task.error = Some("cancelled".to_string());
            self.inner.store.update(&task).await;
            self.inner
                .events
                .publish(FanoutEvent::ReceivedTaskUpdate { task: task.clone() });
            info!(task_id = %task_id, "cancelled queued task");

            self.inner
                .sink
                .send_frame(WsMessage::result(
                    task_id,
                    &task.from_node_id,
                    &ResultPayload::err("cancelled"),
                ))
                .await;
            return true;
        }

        let session_key = state
            .dispatching
            .get(task_id)
            .or_else(|| state.inflight.get(task_id))
            .and_then(|t| t.session_key.clone());
        if let Some(session_key) = session_key {
            state.cancel_requested.insert(task_id.to_string());
            drop(state);
            info!(task_id = %task_id, "cancelling running task via session delete");
            self.inner.runner.delete_session(&session_key).await;
            return true;
        }

        false
    }

    /// Snapshot of all pools.
    pub async fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock().await;

        let queued_tasks = state
            .waiting
            .iter()
            .map(|t| QueuedTaskBrief {
                task_id: t.task_id.clone(),
                instruction: preview(&t.instruction),
                received_at: t.received_at,
            })
            .collect();

        let running_tasks = state
            .dispatching
            .values()
            .chain(state.inflight.values())
            .map(|t| RunningTaskBrief {
                task_id: t.task_id.clone(),
                instruction: preview(&t.instruction),
                started_at: t.started_at,
            })
            .collect();

        QueueStatus {
            max_concurrent: self.inner.max_concurrent,
            queued: state.waiting.len(),
            dispatching: state.dispatching.len(),
            inflight: state.inflight.len(),
            running: state.dispatching.len() + state.inflight.len(),
            completed: state
                .completed
                .iter()
                .filter(|t| t.status == ReceivedTaskStatus::Completed)
                .count(),
            failed: state
                .completed
                .iter()
                .filter(|t| t.status == ReceivedTaskStatus::Failed)
                .count(),
            queued_tasks,
            running_tasks,
            recent_completed: state
                .completed
                .iter()
                .take(RECENT_COMPLETED)
                .cloned()
                .collect(),
        }
    }
}

/// Truncate an instruction for snapshots.
fn preview(instruction: &str) -> String {
    instruction.chars().take(INSTRUCTION_PREVIEW).collect()
}

/// Move a task into the dispatching pool. Caller holds the state lock and has
/// verified a free slot.
fn claim(state: &mut QueueState, mut task: ReceivedTask) -> ReceivedTask {
    task.status = ReceivedTaskStatus::Running;
    task.started_at = Some(Utc::now());
    task.session_key = Some(task_session_key(&task.task_id));
    state.dispatching.insert(task.task_id.clone(), task.clone());
    task
}

/// Start any waiting tasks that now fit in the dispatching pool.
///
/// Boxed so the Send-auto-trait check on `run_task`'s future (which awaits
/// this function) doesn't cycle back through this function's own opaque
/// return type.
fn drain_waiting(inner: &Arc<QueueInner>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        let claimed: Vec<ReceivedTask> = {
            let mut state = inner.state.lock().await;
            let mut claimed = Vec::new();
            while state.dispatching.len() < inner.max_concurrent {
                match state.waiting.pop_front() {
                    Some(task) => claimed.push(claim(&mut state, task)),
                    None => break,
                }
            }
            claimed
        };
        for task in claimed {
            tokio::spawn(run_task(Arc::clone(inner), task));
        }
    })
}

/// Execute one claimed task to its terminal state.
async fn run_task(inner: Arc<QueueInner>, task: ReceivedTask) {
    inner.active_tasks.fetch_add(1, Ordering::AcqRel);
    inner.store.update(&task).await;
    inner
        .events
        .publish(FanoutEvent::ReceivedTaskUpdate { task: task.clone() });

    inner
        .sink
        .send_frame(WsMessage::task_ack(
            &task.task_id,
            &task.from_node_id,
            &TaskAckPayload {
                status: AckStatus::Running,
                position: None,
            },
        ))
        .await;

    let session_key = task
        .session_key
        .clone()
        .unwrap_or_else(|| task_session_key(&task.task_id));

    let outcome = match inner.runner.dispatch(&task.instruction, &session_key).await {
        Ok(run_id) => {
            // Submit done: release the slot before the long wait.
            {
                let mut state = inner.state.lock().await;
                if let Some(moved) = state.dispatching.remove(&task.task_id) {
                    state.inflight.insert(task.task_id.clone(), moved);
                }
            }
            drain_waiting(&inner).await;

            inner
                .runner
                .wait_and_collect(&run_id, &session_key, Some(inner.task_timeout_ms))
                .await
        }
        Err(e) => {
            warn!(task_id = %task.task_id, error = %e, "agent dispatch failed");
            ResultPayload::err(format!("dispatch failed: {e}"))
        }
    };

    finalize(&inner, task, &session_key, outcome).await;
    inner.active_tasks.fetch_sub(1, Ordering::AcqRel);
    // A slot may have opened while we finalized.
    drain_waiting(&inner).await;
}

/// Record the terminal state, send the result frame, clean up the session.
async fn finalize(
    inner: &Arc<QueueInner>,
    mut task: ReceivedTask,
    session_key: &str,
    mut outcome: ResultPayload,
) {
    let cancelled = {
        let mut state = inner.state.lock().await;
        state.dispatching.remove(&task.task_id);
        state.inflight.remove(&task.task_id);
        let cancelled = state.cancel_requested.remove(&task.task_id);

        task.status = match (outcome.success, cancelled) {
            (true, _) => ReceivedTaskStatus::Completed,
            (false, true) => ReceivedTaskStatus::Cancelled,
            (false, false) => ReceivedTaskStatus::Failed,
        };
        task.completed_at = Some(Utc::now());
        if task.status == ReceivedTaskStatus::Cancelled {
            outcome = ResultPayload::err("cancelled");
        }
        task.result = outcome.result.clone();
        task.error = outcome.error.clone();

        state.completed.push_front(task.clone());
        state.completed.truncate(COMPLETED_CAP);
        cancelled
    };

    if cancelled {
        info!(task_id = %task.task_id, "task finalized as cancelled");
    } else {
        debug!(task_id = %task.task_id, status = %task.status, "task finalized");
    }

    inner.store.update(&task).await;
    inner
        .events
        .publish(FanoutEvent::ReceivedTaskUpdate { task: task.clone() });

    inner
        .sink
        .send_frame(WsMessage::result(
            &task.task_id,
            &task.from_node_id,
            &outcome,
        ))
        .await;

    // Session cleanup after the terminal state; errors ignored.
    inner.runner.delete_session(session_key).await;
}
