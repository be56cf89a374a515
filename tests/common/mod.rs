//! Shared test doubles: a scripted agent runner and a recording frame sink.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use cluster_hub::error::{HubError, HubResult};
use cluster_hub::hub::FrameSink;
use cluster_hub::types::{MessageType, ResultPayload, TranscriptMessage, WsMessage};

/// One dispatch observed by the mock runner.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub run_id: String,
    pub instruction: String,
    pub session_key: String,
}

#[derive(Default)]
struct MockState {
    next_run: usize,
    dispatched: Vec<DispatchRecord>,
    /// run_id -> (session_key, release gate)
    runs: HashMap<String, (String, Arc<Notify>)>,
    cancelled_sessions: Vec<String>,
    deleted_sessions: Vec<String>,
    /// Successive snapshots returned by `history`; the last one repeats.
    history_script: Vec<Vec<TranscriptMessage>>,
    history_calls: usize,
}

/// Scripted [`cluster_hub::agent::AgentRunner`].
///
/// - `dispatch_delay` holds the dispatch slot open, so a second task can
///   observe a full pool.
/// - Waits park until [`release`](Self::release) fires (or complete on their
///   own after `auto_complete`).
/// - `delete_session` releases the session's pending wait with an error,
///   mirroring a killed agent run.
pub struct MockRunner {
    state: Mutex<MockState>,
    pub dispatch_delay: Duration,
    pub auto_complete: Option<Duration>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            dispatch_delay: Duration::ZERO,
            auto_complete: None,
        }
    }

    /// Runner whose waits finish on their own after `delay`.
    pub fn auto_completing(delay: Duration) -> Self {
        Self {
            auto_complete: Some(delay),
            ..Self::new()
        }
    }

    /// Runner that holds the dispatch slot for `delay` before returning.
    pub fn with_dispatch_delay(delay: Duration) -> Self {
        Self {
            dispatch_delay: delay,
            ..Self::new()
        }
    }

    /// Let the wait of the `n`-th dispatched run (0-based) complete.
    ///
    /// Blocks until that run has actually been dispatched, so tests can
    /// release without racing the submit.
    pub async fn release(&self, index: usize) {
        let run_id = format!("run-{index}");
        for _ in 0..200 {
            {
                let state = self.state.lock().await;
                if let Some((_, gate)) = state.runs.get(&run_id) {
                    gate.notify_one();
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} was never dispatched");
    }

    pub async fn dispatched(&self) -> Vec<DispatchRecord> {
        self.state.lock().await.dispatched.clone()
    }

    pub async fn deleted_sessions(&self) -> Vec<String> {
        self.state.lock().await.deleted_sessions.clone()
    }

    /// Script the snapshots `history` hands out, in order.
    pub async fn script_history(&self, snapshots: Vec<Vec<TranscriptMessage>>) {
        let mut state = self.state.lock().await;
        state.history_script = snapshots;
        state.history_calls = 0;
    }
}

#[async_trait]
impl cluster_hub::agent::AgentRunner for MockRunner {
    async fn dispatch(&self, instruction: &str, session_key: &str) -> HubResult<String> {
        if instruction.contains("@fail-dispatch") {
            return Err(HubError::gateway("scripted dispatch failure"));
        }
        if !self.dispatch_delay.is_zero() {
            tokio::time::sleep(self.dispatch_delay).await;
        }

        let mut state = self.state.lock().await;
        let run_id = format!("run-{}", state.next_run);
        state.next_run += 1;
        state.dispatched.push(DispatchRecord {
            run_id: run_id.clone(),
            instruction: instruction.to_string(),
            session_key: session_key.to_string(),
        });
        state
            .runs
            .insert(run_id.clone(), (session_key.to_string(), Arc::new(Notify::new())));
        Ok(run_id)
    }

    async fn wait_and_collect(
        &self,
        run_id: &str,
        session_key: &str,
        _timeout_ms: Option<u64>,
    ) -> ResultPayload {
        let gate = {
            let state = self.state.lock().await;
            state.runs.get(run_id).map(|(_, gate)| Arc::clone(gate))
        };
        let Some(gate) = gate else {
            return ResultPayload::err("unknown run");
        };

        match self.auto_complete {
            Some(delay) => {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => gate.notified().await,
        }

        let state = self.state.lock().await;
        if state
            .cancelled_sessions
            .iter()
            .any(|key| key == session_key)
        {
            ResultPayload::err("session deleted")
        } else {
            ResultPayload::ok("done")
        }
    }

    async fn history(&self, _session_key: &str, _limit: usize) -> HubResult<Vec<TranscriptMessage>> {
        let mut state = self.state.lock().await;
        if state.history_script.is_empty() {
            return Ok(Vec::new());
        }
        let index = state.history_calls.min(state.history_script.len() - 1);
        state.history_calls += 1;
        Ok(state.history_script[index].clone())
    }

    async fn delete_session(&self, session_key: &str) {
        let mut state = self.state.lock().await;
        state.deleted_sessions.push(session_key.to_string());
        state.cancelled_sessions.push(session_key.to_string());
        let gates: Vec<Arc<Notify>> = state
            .runs
            .values()
            .filter(|(key, _)| key == session_key)
            .map(|(_, gate)| Arc::clone(gate))
            .collect();
        drop(state);
        for gate in gates {
            gate.notify_one();
        }
    }
}

/// [`FrameSink`] that records every frame for assertions.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<WsMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn frames(&self) -> Vec<WsMessage> {
        self.frames.lock().await.clone()
    }

    /// Frames of one type concerning one task id, in send order.
    pub async fn frames_for(&self, msg_type: MessageType, id: &str) -> Vec<WsMessage> {
        self.frames
            .lock()
            .await
            .iter()
            .filter(|f| f.msg_type == msg_type && f.id == id)
            .cloned()
            .collect()
    }

    /// Poll until `predicate` holds over the recorded frames, or panic after
    /// two seconds.
    pub async fn wait_until<F>(&self, predicate: F)
    where
        F: Fn(&[WsMessage]) -> bool,
    {
        for _ in 0..200 {
            {
                let frames = self.frames.lock().await;
                if predicate(&frames) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let frames = self.frames.lock().await;
        panic!("condition not reached; recorded frames: {frames:#?}");
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_frame(&self, msg: WsMessage) {
        self.frames.lock().await.push(msg);
    }
}
