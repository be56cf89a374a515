//! Wire and entity types for the cluster task-and-chat plane.
//!
//! Two families live here:
//!
//! - **Wire messages** — the JSON frames exchanged with the hub over the
//!   WebSocket uplink ([`WsMessage`] plus typed payload structs). Frames are
//!   `camelCase` on the wire; frame types are snake_case strings.
//! - **Entity records** — the durable shapes persisted by the stores:
//!   [`StoredTask`] (outbound task log), [`ReceivedTask`] (inbound task log),
//!   [`ChatEntry`] (per-peer chat), [`NodeEvent`] (lifecycle ring), and the
//!   [`NodeInfo`] peer cache entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Epoch milliseconds for wire `timestamp` fields.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Wire frames
// ============================================================================

/// Frame type discriminator for [`WsMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A task instruction for the receiving node.
    Task,
    /// Terminal outcome of a task, sent back to its originator.
    Result,
    /// Queue acknowledgement (`queued` or `running`) from the executing node.
    TaskAck,
    /// Intermediate status report from the executing node.
    TaskStatus,
    /// Request to cancel a previously sent task.
    TaskCancel,
    /// Chat message between two nodes.
    Chat,
    /// Hub-to-node control message.
    Direct,
    /// Hub fan-out on a channel (e.g. `system` lifecycle events).
    Broadcast,
    /// Liveness frame carrying load and active-task count.
    Heartbeat,
    /// Channel subscription request.
    Subscribe,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Task => "task",
            MessageType::Result => "result",
            MessageType::TaskAck => "task_ack",
            MessageType::TaskStatus => "task_status",
            MessageType::TaskCancel => "task_cancel",
            MessageType::Chat => "chat",
            MessageType::Direct => "direct",
            MessageType::Broadcast => "broadcast",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Subscribe => "subscribe",
        };
        write!(f, "{}", s)
    }
}

/// A frame on the hub WebSocket.
///
/// `id` is the **task id** for the task family (`task`, `result`, `task_ack`,
/// `task_status`, `task_cancel`) and a fresh UUID for chats. `from` is stamped
/// by the sending side; `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    /// Frame type.
    #[serde(rename = "type")]
    pub msg_type: MessageType,

    /// Task id or fresh UUID, depending on the frame type.
    pub id: String,

    /// Sending node id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Destination node id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Broadcast channel name (`system` for lifecycle events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Frame payload; schema depends on `msg_type`.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Epoch milliseconds when the frame was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl WsMessage {
    /// Create a frame with an explicit id and an empty payload.
    pub fn new(msg_type: MessageType, id: impl Into<String>) -> Self {
        Self {
            msg_type,
            id: id.into(),
            from: None,
            to: None,
            channel: None,
            payload: serde_json::Value::Null,
            timestamp: None,
        }
    }

    /// Build a `task` frame carrying an instruction for `to`.
    pub fn task(task_id: impl Into<String>, to: impl Into<String>, payload: &TaskPayload) -> Self {
        let mut msg = Self::new(MessageType::Task, task_id);
        msg.to = Some(to.into());
        msg.payload = serde_json::to_value(payload).unwrap_or_default();
        msg
    }

    /// Build a `task_ack` frame for the task's originator.
    pub fn task_ack(
        task_id: impl Into<String>,
        to: impl Into<String>,
        payload: &TaskAckPayload,
    ) -> Self {
        let mut msg = Self::new(MessageType::TaskAck, task_id);
        msg.to = Some(to.into());
        msg.payload = serde_json::to_value(payload).unwrap_or_default();
        msg
    }

    /// Build a `result` frame for the task's originator.
    pub fn result(
        task_id: impl Into<String>,
        to: impl Into<String>,
        payload: &ResultPayload,
    ) -> Self {
        let mut msg = Self::new(MessageType::Result, task_id);
        msg.to = Some(to.into());
        msg.payload = serde_json::to_value(payload).unwrap_or_default();
        msg
    }

    /// Build a `task_cancel` frame for the executing node.
    pub fn task_cancel(
        task_id: impl Into<String>,
        to: impl Into<String>,
        reason: Option<&str>,
    ) -> Self {
        let mut msg = Self::new(MessageType::TaskCancel, task_id);
        msg.to = Some(to.into());
        msg.payload = serde_json::json!({ "reason": reason });
        msg
    }

    /// Build a `chat` frame with a fresh UUID id.
    pub fn chat(to: impl Into<String>, payload: &ChatPayload) -> Self {
        let mut msg = Self::new(MessageType::Chat, uuid::Uuid::new_v4().to_string());
        msg.to = Some(to.into());
        msg.payload = serde_json::to_value(payload).unwrap_or_default();
        msg
    }

    /// Build a `heartbeat` frame.
    pub fn heartbeat(load: f64, active_tasks: usize) -> Self {
        let mut msg = Self::new(MessageType::Heartbeat, uuid::Uuid::new_v4().to_string());
        msg.payload = serde_json::to_value(HeartbeatPayload { load, active_tasks }).unwrap_or_default();
        msg
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> crate::error::HubResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            crate::error::HubError::protocol(format!(
                "bad {} payload: {}",
                self.msg_type, e
            ))
        })
    }
}

/// Payload of a `task` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    /// Free-text instruction for the receiving node's agent.
    pub task: String,

    /// Scheduling hint; currently informational (FIFO order).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,

    /// Optional per-task tuning from the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskFrameConfig>,
}

/// Sender-side tuning carried inside a `task` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFrameConfig {
    /// Requested dispatch concurrency on the executing node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

/// Acknowledgement status inside a `task_ack` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Task is waiting for a dispatch slot.
    Queued,
    /// Task has started on the executing node.
    Running,
}

/// Payload of a `task_ack` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAckPayload {
    /// Queue state on the executing node.
    pub status: AckStatus,

    /// 1-based queue position, present when `status == queued`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

/// Payload of a `result` frame, and the outcome type of an agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    /// Whether the run completed successfully.
    pub success: bool,

    /// Harvested agent output, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Failure description, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultPayload {
    /// A successful outcome carrying the agent's text output.
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error: None,
        }
    }

    /// A failed outcome carrying an error description.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Payload of a `chat` frame.
///
/// `role` is `"user"` for the initiating message, `"delta"` for periodic
/// partial history while a run is in flight, and `"assistant"` for the final
/// reply (`done: true`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    /// `user`, `assistant`, or `delta`.
    pub role: String,

    /// Plain-text content (user messages and error replies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Transcript slice (delta and final assistant replies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<TranscriptMessage>>,

    /// Sender options for this conversation turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ChatFrameConfig>,

    /// Frame id of the user message this reply answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Epoch milliseconds.
    pub timestamp: i64,

    /// Whether this is the final frame of the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

/// Sender options inside a user `chat` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFrameConfig {
    /// Pass raw message content through instead of reducing to text blocks.
    #[serde(default)]
    pub whole: bool,

    /// Delta streaming interval; `None` or `0` disables streaming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_refresh_ms: Option<u64>,
}

/// One message of an agent transcript as relayed in `chat` frames.
///
/// `content` is a plain string when the sender asked for reduced text
/// (`whole == false`) and the agent's raw block structure otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMessage {
    /// Message author (`user` / `assistant`).
    pub role: String,

    /// Text or raw block content.
    pub content: serde_json::Value,

    /// Epoch milliseconds, when the agent reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Payload of an outbound `heartbeat` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    /// Load figure; currently a placeholder.
    pub load: f64,

    /// Tasks currently dispatching or in flight.
    pub active_tasks: usize,
}

// ============================================================================
// Sent tasks (outbound log)
// ============================================================================

/// Where a sent task originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    /// Self-targeted task executed through the local agent bridge.
    Local,
    /// Task routed to a peer through the hub.
    Remote,
}

/// Lifecycle state of a sent task.
///
/// States are totally ordered: `sent < queued < running < terminal`.
/// Updates that would move a task backwards are discarded by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentTaskStatus {
    /// Frame sent, no acknowledgement yet.
    Sent,
    /// Peer queued the task behind its dispatch slots.
    Queued,
    /// Peer started the task.
    Running,
    /// Terminal: peer reported success.
    Completed,
    /// Terminal: peer reported failure.
    Failed,
    /// Terminal: cancelled before or during execution.
    Cancelled,
    /// Terminal: the local wait deadline expired.
    Timeout,
}

impl SentTaskStatus {
    /// Position in the monotonic order; all terminal states share rank 3.
    pub fn rank(self) -> u8 {
        match self {
            SentTaskStatus::Sent => 0,
            SentTaskStatus::Queued => 1,
            SentTaskStatus::Running => 2,
            SentTaskStatus::Completed
            | SentTaskStatus::Failed
            | SentTaskStatus::Cancelled
            | SentTaskStatus::Timeout => 3,
        }
    }

    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }
}

impl fmt::Display for SentTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SentTaskStatus::Sent => "sent",
            SentTaskStatus::Queued => "queued",
            SentTaskStatus::Running => "running",
            SentTaskStatus::Completed => "completed",
            SentTaskStatus::Failed => "failed",
            SentTaskStatus::Cancelled => "cancelled",
            SentTaskStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Durable record of a task this node sent (or ran against itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTask {
    /// Unique task id (UUID v4), immutable.
    pub task_id: String,

    /// Node the task was sent to.
    pub target_node_id: String,

    /// Display name of the target at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_name: Option<String>,

    /// Free-text instruction.
    pub instruction: String,

    /// Local loopback or remote dispatch.
    pub source: TaskSource,

    /// Current lifecycle state (monotonically non-regressing).
    pub status: SentTaskStatus,

    /// When the task frame was sent.
    pub sent_at: DateTime<Utc>,

    /// When the `queued` acknowledgement arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<DateTime<Utc>>,

    /// When the `running` acknowledgement arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the terminal result arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Agent output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Failure description on failure / cancellation / timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// `completed_at - sent_at`, derived on the terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl StoredTask {
    /// Create a fresh `sent` record.
    pub fn new(
        task_id: impl Into<String>,
        target_node_id: impl Into<String>,
        target_node_name: Option<String>,
        instruction: impl Into<String>,
        source: TaskSource,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            target_node_id: target_node_id.into(),
            target_node_name,
            instruction: instruction.into(),
            source,
            status: SentTaskStatus::Sent,
            sent_at: Utc::now(),
            acked_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            duration_ms: None,
        }
    }
}

// ============================================================================
// Received tasks (inbound log)
// ============================================================================

/// Scheduling hint on an inbound task. Accepted and stored, not used for
/// ordering — the queue is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Urgent work.
    High,
    /// Default.
    #[default]
    Normal,
    /// Background work.
    Low,
}

/// Lifecycle state of a received task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceivedTaskStatus {
    /// Waiting for a dispatch slot.
    Queued,
    /// Dispatching to or executing on the local agent.
    Running,
    /// Terminal: run succeeded.
    Completed,
    /// Terminal: run failed.
    Failed,
    /// Terminal: cancelled.
    Cancelled,
}

impl ReceivedTaskStatus {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReceivedTaskStatus::Completed
                | ReceivedTaskStatus::Failed
                | ReceivedTaskStatus::Cancelled
        )
    }
}

impl fmt::Display for ReceivedTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceivedTaskStatus::Queued => "queued",
            ReceivedTaskStatus::Running => "running",
            ReceivedTaskStatus::Completed => "completed",
            ReceivedTaskStatus::Failed => "failed",
            ReceivedTaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Durable record of a task received from a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedTask {
    /// Task id issued by the sender.
    pub task_id: String,

    /// Originating node.
    pub from_node_id: String,

    /// Free-text instruction.
    pub instruction: String,

    /// Scheduling hint (informational).
    #[serde(default)]
    pub priority: TaskPriority,

    /// Current lifecycle state.
    pub status: ReceivedTaskStatus,

    /// When the frame arrived.
    pub received_at: DateTime<Utc>,

    /// When the task entered the dispatching pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Agent session handle; set when dispatch begins, used for cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,

    /// Agent output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Failure description on failure / cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReceivedTask {
    /// Create a fresh `queued` record for an inbound task frame.
    pub fn new(
        task_id: impl Into<String>,
        from_node_id: impl Into<String>,
        instruction: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            from_node_id: from_node_id.into(),
            instruction: instruction.into(),
            priority,
            status: ReceivedTaskStatus::Queued,
            received_at: Utc::now(),
            started_at: None,
            completed_at: None,
            session_key: None,
            result: None,
            error: None,
        }
    }
}

// ============================================================================
// Chat log
// ============================================================================

/// Author of a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Sent by this node's operator.
    User,
    /// Reply from the peer.
    Assistant,
}

/// One message in a per-peer chat log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    /// Unique message id (UUID v4).
    pub id: String,

    /// The peer node this conversation is with.
    pub node_id: String,

    /// Message author.
    pub role: ChatRole,

    /// Message text.
    pub content: String,

    /// When the message was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ChatEntry {
    /// Create a chat entry stamped with a fresh id and the current time.
    pub fn new(node_id: impl Into<String>, role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Node lifecycle events
// ============================================================================

/// Kind of a cluster lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeEventKind {
    /// Node connected to the hub.
    Online,
    /// Node disconnected from the hub.
    Offline,
    /// Node joined the cluster tree.
    Registered,
    /// Node left the cluster tree.
    Departed,
}

impl fmt::Display for NodeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeEventKind::Online => "online",
            NodeEventKind::Offline => "offline",
            NodeEventKind::Registered => "registered",
            NodeEventKind::Departed => "departed",
        };
        write!(f, "{}", s)
    }
}

/// One entry in the lifecycle event ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    /// Node the event is about.
    pub node_id: String,

    /// Display name when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// What happened.
    pub event: NodeEventKind,

    /// When it was observed locally.
    pub timestamp: DateTime<Utc>,
}

impl NodeEvent {
    /// Create an event stamped with the current time.
    pub fn new(node_id: impl Into<String>, node_name: Option<String>, event: NodeEventKind) -> Self {
        Self {
            node_id: node_id.into(),
            node_name,
            event,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Cluster directory
// ============================================================================

/// A peer node as reported by the hub directory.
///
/// Everything except `id` is defaulted so a hub running a newer schema does
/// not break deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Node id.
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Cluster-unique alias for @-mentions.
    #[serde(default)]
    pub alias: String,

    /// Parent node; `None` for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Cluster this node belongs to.
    #[serde(default)]
    pub cluster_id: String,

    /// Depth in the cluster tree (root = 0).
    #[serde(default)]
    pub depth: u32,

    /// Whether the hub currently sees the node.
    #[serde(default)]
    pub online: bool,

    /// Last reported load figure.
    #[serde(default)]
    pub load: f64,

    /// Capability strings.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Epoch milliseconds of the current connection, when connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,

    /// Epoch milliseconds of the last heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,

    /// Tasks the node reported as active.
    #[serde(default)]
    pub active_tasks: usize,
}

/// Body of `POST /api/nodes/register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Human-readable node name.
    #[serde(default)]
    pub name: String,

    /// Requested cluster-unique alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Parent to attach under; `None` registers a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Cluster to join; `None` lets the hub assign one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Capability strings.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Invite code, when the parent requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
}

/// Identity issued by the hub on registration (and rotated on reparent).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Assigned node id.
    pub node_id: String,

    /// Assigned cluster id.
    pub cluster_id: String,

    /// Parent node; `None` for a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Depth in the cluster tree.
    #[serde(default)]
    pub depth: u32,

    /// Bearer token for subsequent calls.
    pub token: String,
}
