//! Agent bridge — one-shot RPC to the local agent gateway.
//!
//! The local AI runtime is reached over `ws://127.0.0.1:<gateway_port>`. The
//! bridge never keeps the socket open: each call is connect → `connect`
//! handshake (protocol pinned to 3, optional auth token) → one request →
//! matching response → close, so a wedged call never affects the next one.
//!
//! Executing a task composes three calls:
//!
//! 1. `agent` — submit, returns `{runId}` (15 s)
//! 2. `agent.wait` — block until the run is terminal (`timeoutMs` + 5 s)
//! 3. `chat.history` — harvest the assistant's text output (10 s)
//!
//! plus `sessions.delete` (5 s, fire-and-forget) once the task is terminal.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{HubError, HubResult};
use crate::types::{ResultPayload, TranscriptMessage};

/// Submit timeout.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(15);
/// History-harvest timeout.
const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);
/// Session-delete timeout.
const DELETE_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack added to the socket deadline on top of the run's own `timeoutMs`.
const WAIT_SLACK: Duration = Duration::from_secs(5);
/// Messages pulled per history harvest.
const HISTORY_LIMIT: usize = 30;
/// Substituted when the assistant produced no text at all.
const EMPTY_OUTPUT_PLACEHOLDER: &str = "(no output)";

/// Session key for a hub task run: context is per-task, discarded afterwards.
pub fn task_session_key(task_id: &str) -> String {
    format!("agent:main:hub-task:{task_id}")
}

/// Session key for a peer chat: context persists per peer across turns.
pub fn chat_session_key(peer_id: &str) -> String {
    format!("hub-chat:{peer_id}")
}

/// Execution seam between the task queue / chat handler and the local agent.
///
/// [`AgentBridge`] is the production implementation; tests substitute a
/// scripted mock.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Submit an instruction; returns the gateway's run id.
    async fn dispatch(&self, instruction: &str, session_key: &str) -> HubResult<String>;

    /// Block until the run is terminal, then harvest the text output.
    ///
    /// Never errors: timeouts and gateway failures become
    /// `ResultPayload { success: false, .. }`.
    async fn wait_and_collect(
        &self,
        run_id: &str,
        session_key: &str,
        timeout_ms: Option<u64>,
    ) -> ResultPayload;

    /// Fetch the most recent transcript of a session.
    async fn history(&self, session_key: &str, limit: usize) -> HubResult<Vec<TranscriptMessage>>;

    /// Delete a session (also terminates its running turn). Best-effort.
    async fn delete_session(&self, session_key: &str);

    /// Submit and wait in one call — the synchronous composition used for
    /// self-targeted tasks.
    async fn execute(
        &self,
        instruction: &str,
        session_key: &str,
        timeout_ms: Option<u64>,
    ) -> ResultPayload {
        match self.dispatch(instruction, session_key).await {
            Ok(run_id) => self.wait_and_collect(&run_id, session_key, timeout_ms).await,
            Err(e) => ResultPayload::err(e.to_string()),
        }
    }
}

/// Gateway wire envelope (requests and responses share one shape).
#[derive(Debug, Deserialize)]
struct GatewayFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

/// One-shot RPC client for the local agent gateway.
#[derive(Debug, Clone)]
pub struct AgentBridge {
    gateway_port: u16,
    auth_token: Option<String>,
    default_timeout_ms: u64,
    extra_system_prompt: Option<String>,
}

impl AgentBridge {
    /// Create a bridge for the gateway on `127.0.0.1:<gateway_port>`.
    pub fn new(gateway_port: u16, auth_token: Option<String>, default_timeout_ms: u64) -> Self {
        Self {
            gateway_port,
            auth_token,
            default_timeout_ms,
            extra_system_prompt: None,
        }
    }

    /// Attach a system prompt appended to every submitted run.
    pub fn with_extra_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.extra_system_prompt = Some(prompt.into());
        self
    }

    /// Perform one RPC round-trip on a fresh socket.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> HubResult<serde_json::Value> {
        tokio::time::timeout(timeout, self.call_inner(method, params))
            .await
            .map_err(|_| HubError::timeout(format!("gateway call `{method}` timed out")))?
    }

    async fn call_inner(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> HubResult<serde_json::Value> {
        let url = format!("ws://127.0.0.1:{}", self.gateway_port);
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| HubError::transport(format!("gateway connect: {e}")))?;

        // Handshake: pin the protocol and present the auth token.
        let handshake_id = uuid::Uuid::new_v4().to_string();
        let handshake = json!({
            "type": "req",
            "id": handshake_id,
            "method": "connect",
            "params": {
                "minProtocol": 3,
                "maxProtocol": 3,
                "client": {
                    "name": "cluster-hub",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "auth": { "token": self.auth_token },
            },
        });
        send_frame(&mut ws, &handshake).await?;
        await_response(&mut ws, &handshake_id).await?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let request = json!({
            "type": "req",
            "id": request_id,
            "method": method,
            "params": params,
        });
        send_frame(&mut ws, &request).await?;
        let payload = await_response(&mut ws, &request_id).await?;

        let _ = ws.close(None).await;
        Ok(payload)
    }

    /// Fetch a session transcript and reduce it to assistant text.
    async fn history_text(&self, session_key: &str) -> HubResult<String> {
        let messages = self.history(session_key, HISTORY_LIMIT).await?;
        Ok(harvest_text(&messages))
    }
}

#[async_trait]
impl AgentRunner for AgentBridge {
    async fn dispatch(&self, instruction: &str, session_key: &str) -> HubResult<String> {
        let mut params = json!({
            "message": instruction,
            "sessionKey": session_key,
            "idempotencyKey": uuid::Uuid::new_v4().to_string(),
            "deliver": false,
        });
        if let Some(prompt) = self.extra_system_prompt.as_deref() {
            params["extraSystemPrompt"] = json!(prompt);
        }
        let payload = self.call("agent", params, SUBMIT_TIMEOUT).await?;

        payload
            .get("runId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| HubError::gateway("agent submit returned no runId"))
    }

    async fn wait_and_collect(
        &self,
        run_id: &str,
        session_key: &str,
        timeout_ms: Option<u64>,
    ) -> ResultPayload {
        let timeout_ms = timeout_ms.unwrap_or(self.default_timeout_ms);
        let socket_deadline = Duration::from_millis(timeout_ms) + WAIT_SLACK;

        let waited = self
            .call(
                "agent.wait",
                json!({ "runId": run_id, "timeoutMs": timeout_ms }),
                socket_deadline,
            )
            .await;

        match waited {
            Ok(payload) => {
                let status = payload.get("status").and_then(|v| v.as_str());
                let error = payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                if error.is_some() || matches!(status, Some("failed") | Some("error")) {
                    return ResultPayload::err(
                        error.unwrap_or_else(|| "agent run failed".to_string()),
                    );
                }
                match self.history_text(session_key).await {
                    Ok(text) => ResultPayload::ok(text),
                    Err(e) => ResultPayload::err(format!("history harvest failed: {e}")),
                }
            }
            Err(e) if e.is_timeout() => {
                ResultPayload::err(format!("agent run timed out after {timeout_ms}ms"))
            }
            Err(e) => ResultPayload::err(e.to_string()),
        }
    }

    async fn history(&self, session_key: &str, limit: usize) -> HubResult<Vec<TranscriptMessage>> {
        let payload = self
            .call(
                "chat.history",
                json!({ "sessionKey": session_key, "limit": limit }),
                HISTORY_TIMEOUT,
            )
            .await?;

        let messages = payload
            .get("messages")
            .cloned()
            .unwrap_or(serde_json::Value::Array(Vec::new()));
        serde_json::from_value(messages)
            .map_err(|e| HubError::gateway(format!("bad chat.history payload: {e}")))
    }

    async fn delete_session(&self, session_key: &str) {
        let result = self
            .call(
                "sessions.delete",
                json!({ "key": session_key }),
                DELETE_TIMEOUT,
            )
            .await;
        if let Err(e) = result {
            debug!(session_key = %session_key, error = %e, "session delete failed (ignored)");
        }
    }
}

type GatewaySocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn send_frame(ws: &mut GatewaySocket, frame: &serde_json::Value) -> HubResult<()> {
    let text = serde_json::to_string(frame)?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| HubError::transport(format!("gateway send: {e}")))
}

/// Read frames until the response matching `id` arrives.
///
/// Gateway `event` frames interleave freely and are skipped.
async fn await_response(ws: &mut GatewaySocket, id: &str) -> HubResult<serde_json::Value> {
    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| HubError::transport(format!("gateway recv: {e}")))?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => {
                return Err(HubError::transport("gateway closed the connection"))
            }
            _ => continue,
        };

        let parsed: GatewayFrame = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "unparseable gateway frame, skipping");
                continue;
            }
        };

        if parsed.kind != "res" || parsed.id.as_deref() != Some(id) {
            continue;
        }

        let payload = parsed.payload.unwrap_or(serde_json::Value::Null);
        if parsed.ok == Some(false) {
            let message = payload
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("request rejected");
            return Err(HubError::gateway(message.to_string()));
        }
        return Ok(payload);
    }
    Err(HubError::transport("gateway stream ended before response"))
}

/// Reduce arbitrary message content to its text blocks.
///
/// Content is either a plain string or an array of typed blocks; only
/// `{"type": "text"}` blocks contribute.
pub(crate) fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Concatenate the text of all assistant messages, in order.
///
/// Whitespace is trimmed; a run that produced nothing yields a placeholder so
/// the result frame never carries an empty string.
pub(crate) fn harvest_text(messages: &[TranscriptMessage]) -> String {
    let text = messages
        .iter()
        .filter(|m| m.role == "assistant")
        .map(|m| content_text(&m.content))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = text.trim();
    if trimmed.is_empty() {
        EMPTY_OUTPUT_PLACEHOLDER.to_string()
    } else {
        trimmed.to_string()
    }
}
