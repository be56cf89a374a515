//! Incoming-chat handler — peer chat turns against the local agent.
//!
//! A `chat{role: "user"}` frame starts one agent turn on the session
//! `hub-chat:<peer>`, so conversation context persists per peer. While the
//! turn runs, an optional harvester streams transcript deltas back at the
//! sender's `autoRefreshMs` cadence; the terminal reply carries the whole
//! formatted transcript with `done: true`. Any failure turns into a single
//! error reply so the peer is never left hanging.
//!
//! A second user frame for a peer whose turn is still in flight is rejected
//! immediately — the delta bookkeeping is per-run and must not be shared.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agent::{chat_session_key, content_text, AgentRunner};
use crate::hub::FrameSink;
use crate::types::{now_ms, ChatFrameConfig, ChatPayload, TranscriptMessage, WsMessage};

/// Wait deadline for a chat turn.
const CHAT_WAIT_MS: u64 = 300_000;
/// Messages pulled per harvest.
const CHAT_HISTORY_LIMIT: usize = 30;

struct ChatInner {
    runner: Arc<dyn AgentRunner>,
    sink: Arc<dyn FrameSink>,
    /// Session keys with a turn in flight.
    active: Mutex<HashSet<String>>,
}

/// Handler for inbound peer chat frames.
///
/// Cheap to clone; clones share the active-turn set.
#[derive(Clone)]
pub struct ChatHandler {
    inner: Arc<ChatInner>,
}

impl ChatHandler {
    /// Create a handler over the given runner and frame sink.
    pub fn new(runner: Arc<dyn AgentRunner>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            inner: Arc::new(ChatInner {
                runner,
                sink,
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Run one chat turn to completion.
    ///
    /// The caller (coordinator) spawns this; it blocks for the duration of
    /// the agent run.
    pub async fn handle(&self, msg: WsMessage) {
        let payload: ChatPayload = match msg.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "malformed chat frame, dropped");
                return;
            }
        };
        if payload.role != "user" {
            debug!(role = %payload.role, "non-user chat frame reached handler, dropped");
            return;
        }
        let Some(from) = msg.from.clone() else {
            debug!("chat frame without sender, dropped");
            return;
        };
        let content = payload.content.clone().unwrap_or_default();
        if content.trim().is_empty() {
            debug!(from = %from, "empty chat content, ignored");
            return;
        }

        let chat_id = msg.id.clone();
        let config = payload.config.clone().unwrap_or_default();
        let session_key = chat_session_key(&from);

        // Reject overlapping turns on the same session.
        {
            let mut active = self.inner.active.lock().await;
            if !active.insert(session_key.clone()) {
                warn!(peer = %from, "chat turn already in flight, rejecting");
                drop(active);
                self.send_error_reply(&from, &chat_id, "a chat turn is already running")
                    .await;
                return;
            }
        }

        let outcome = self
            .run_turn(&from, &chat_id, &content, &session_key, &config)
            .await;

        self.inner.active.lock().await.remove(&session_key);

        if let Err(message) = outcome {
            self.send_error_reply(&from, &chat_id, &message).await;
        }
    }

    /// One turn: dispatch, optionally stream deltas, reply with the full
    /// transcript. Returns the error text on failure.
    async fn run_turn(
        &self,
        from: &str,
        chat_id: &str,
        content: &str,
        session_key: &str,
        config: &ChatFrameConfig,
    ) -> Result<(), String> {
        let run_id = self
            .inner
            .runner
            .dispatch(content, session_key)
            .await
            .map_err(|e| e.to_string())?;

        let harvester = match config.auto_refresh_ms {
            Some(interval_ms) if interval_ms > 0 => Some(tokio::spawn(stream_deltas(
                Arc::clone(&self.inner),
                from.to_string(),
                session_key.to_string(),
                config.whole,
                Duration::from_millis(interval_ms),
            ))),
            _ => None,
        };

        let waited = self
            .inner
            .runner
            .wait_and_collect(&run_id, session_key, Some(CHAT_WAIT_MS))
            .await;

        // The harvester never outlives its run.
        if let Some(harvester) = harvester {
            harvester.abort();
        }

        if !waited.success {
            return Err(waited
                .error
                .unwrap_or_else(|| "agent run failed".to_string()));
        }

        let history = self
            .inner
            .runner
            .history(session_key, CHAT_HISTORY_LIMIT)
            .await
            .map_err(|e| e.to_string())?;

        let reply = ChatPayload {
            role: "assistant".to_string(),
            content: None,
            messages: Some(format_messages(&history, config.whole)),
            config: None,
            reply_to: Some(chat_id.to_string()),
            timestamp: now_ms(),
            done: Some(true),
        };
        self.inner.sink.send_frame(WsMessage::chat(from, &reply)).await;
        Ok(())
    }

    async fn send_error_reply(&self, to: &str, chat_id: &str, message: &str) {
        let reply = ChatPayload {
            role: "assistant".to_string(),
            content: Some(format!("❌ 处理失败: {message}")),
            messages: None,
            config: None,
            reply_to: Some(chat_id.to_string()),
            timestamp: now_ms(),
            done: Some(true),
        };
        self.inner.sink.send_frame(WsMessage::chat(to, &reply)).await;
    }
}

/// Periodic delta harvest for one run.
///
/// `sent` is per-run and grows monotonically: every tick fetches the
/// transcript and sends only the slice past the last send — no duplicates,
/// no gaps, until the final reply supersedes the stream.
async fn stream_deltas(
    inner: Arc<ChatInner>,
    peer: String,
    session_key: String,
    whole: bool,
    interval: Duration,
) {
    let mut sent = 0usize;
    loop {
        tokio::time::sleep(interval).await;

        let history = match inner.runner.history(&session_key, CHAT_HISTORY_LIMIT).await {
            Ok(history) => history,
            Err(e) => {
                debug!(error = %e, "delta harvest failed, retrying next tick");
                continue;
            }
        };
        if history.len() <= sent {
            continue;
        }

        let fresh = &history[sent..];
        let delta = ChatPayload {
            role: "delta".to_string(),
            content: None,
            messages: Some(format_messages(fresh, whole)),
            config: None,
            reply_to: None,
            timestamp: now_ms(),
            done: Some(false),
        };
        inner.sink.send_frame(WsMessage::chat(&peer, &delta)).await;
        sent = history.len();
    }
}

/// Shape transcript messages for a chat frame.
///
/// With `whole == false` each message's content is reduced to the
/// concatenation of its text blocks; with `whole == true` the raw block
/// structure passes through unchanged.
pub fn format_messages(messages: &[TranscriptMessage], whole: bool) -> Vec<TranscriptMessage> {
    messages
        .iter()
        .map(|m| TranscriptMessage {
            role: m.role.clone(),
            content: if whole {
                m.content.clone()
            } else {
                serde_json::Value::String(content_text(&m.content))
            },
            timestamp: m.timestamp,
        })
        .collect()
}
