//! Coordinator — wires the stores, hub client, queue, and chat handler
//! together and exposes the verb surface consumed by the CLI / chatbot /
//! console layers.
//!
//! The coordinator owns every moving part and is the only writer of the
//! fan-out bus. It consumes the hub client's event channel (the client never
//! calls back up): inbound tasks go to the queue, acks and results land in
//! the sent-task store, peer chats go to the chat handler or the chat log,
//! and lifecycle broadcasts become node events.
//!
//! Verbs share one shape: `handle(verb, params)` returns
//! `{ok: true, payload}` or `{ok: false, message}` — logical failures are
//! replies, not panics.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info};

use crate::agent::{task_session_key, AgentBridge, AgentRunner};
use crate::chat::ChatHandler;
use crate::config::{deep_merge, ConfigFile, HubConfig, SelfTaskMode};
use crate::error::{HubError, HubResult};
use crate::events::{EventBus, FanoutEvent};
use crate::hub::{FrameSink, HubClient, HubEvent};
use crate::queue::TaskQueue;
use crate::store::{
    ChatStore, NodeEventStore, ReceivedTaskStore, SentTaskFilter, SentTaskStore,
};
use crate::types::{
    now_ms, ChatFrameConfig, ChatPayload, ChatRole, NodeEvent, NodeEventKind, ReceivedTask,
    RegisterRequest, ResultPayload, SentTaskStatus, StoredTask, TaskAckPayload, TaskPayload,
    TaskSource, WsMessage,
};

/// Reply of a verb call.
#[derive(Debug, Clone, Serialize)]
pub struct VerbReply {
    /// Whether the verb succeeded.
    pub ok: bool,
    /// Result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Failure description on `ok == false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VerbReply {
    fn success(payload: Value) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            message: None,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: None,
            message: Some(message.into()),
        }
    }
}

struct CoordinatorInner {
    config: RwLock<HubConfig>,
    config_file: Option<ConfigFile>,
    client: HubClient,
    queue: TaskQueue,
    runner: Arc<dyn AgentRunner>,
    chat_handler: ChatHandler,
    sent: SentTaskStore,
    received: ReceivedTaskStore,
    chats: ChatStore,
    node_events: NodeEventStore,
    bus: EventBus,
    shared_config: RwLock<Option<Value>>,
    /// Latched: the external tool surface registers at most once, no matter
    /// how many shared-config pushes arrive.
    tools_registered: AtomicBool,
}

/// The assembled plugin core.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Assemble the coordinator with the production agent bridge.
    pub async fn new(config: HubConfig, config_file: Option<ConfigFile>) -> Self {
        let runner: Arc<dyn AgentRunner> = Arc::new(AgentBridge::new(
            config.gateway_port,
            config.gateway_token.clone(),
            config.task_timeout_ms,
        ));
        Self::with_runner(config, config_file, runner).await
    }

    /// Assemble the coordinator around an arbitrary [`AgentRunner`].
    ///
    /// Tests use this with a scripted runner; everything else is identical to
    /// [`new`](Self::new).
    pub async fn with_runner(
        config: HubConfig,
        config_file: Option<ConfigFile>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        let data_dir = config.data_dir();
        let sent = SentTaskStore::open(&data_dir).await;
        let received = ReceivedTaskStore::open(&data_dir).await;
        let chats = ChatStore::open(&data_dir).await;
        let node_events = NodeEventStore::open(&data_dir).await;

        let bus = EventBus::default();
        let active_tasks = Arc::new(AtomicUsize::new(0));
        let (client, events_rx) = HubClient::new(&config, Arc::clone(&active_tasks));
        let sink: Arc<dyn FrameSink> = Arc::new(client.clone());

        let queue = TaskQueue::new(
            config.max_concurrent(),
            config.task_timeout_ms,
            Arc::clone(&runner),
            Arc::clone(&sink),
            received.clone(),
            bus.clone(),
            active_tasks,
        );
        let chat_handler = ChatHandler::new(Arc::clone(&runner), sink);

        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                config: RwLock::new(config),
                config_file,
                client,
                queue,
                runner,
                chat_handler,
                sent,
                received,
                chats,
                node_events,
                bus,
                shared_config: RwLock::new(None),
                tools_registered: AtomicBool::new(false),
            }),
        };

        tokio::spawn(pump(coordinator.clone(), events_rx));
        coordinator
    }

    /// The hub client (also the frame sink).
    pub fn hub(&self) -> &HubClient {
        &self.inner.client
    }

    /// The task queue.
    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    /// Subscribe to the fan-out bus.
    pub fn subscribe(&self) -> broadcast::Receiver<FanoutEvent> {
        self.inner.bus.subscribe()
    }

    /// Whether the external tool surface has been registered.
    pub fn tools_registered(&self) -> bool {
        self.inner.tools_registered.load(Ordering::Acquire)
    }

    /// The most recent shared-config push, when one arrived.
    pub async fn shared_config_cached(&self) -> Option<Value> {
        self.inner.shared_config.read().await.clone()
    }

    /// Flush every store and drop the uplink.
    pub async fn shutdown(&self) {
        self.inner.client.disconnect().await;
        self.inner.sent.flush().await;
        self.inner.received.flush().await;
        self.inner.chats.flush().await;
        self.inner.node_events.flush().await;
        info!("coordinator shut down; stores flushed");
    }

    // ──────────────────────────────────────────────────
    // Verb surface
    // ──────────────────────────────────────────────────

    /// Execute one verb.
    pub async fn handle(&self, verb: &str, params: Value) -> VerbReply {
        match self.dispatch(verb, params).await {
            Ok(payload) => VerbReply::success(payload),
            Err(e) => VerbReply::failure(e.to_string()),
        }
    }

    async fn dispatch(&self, verb: &str, params: Value) -> HubResult<Value> {
        match verb {
            // Identity / transport
            "status" => self.verb_status().await,
            "connect" => {
                self.inner.client.connect().await?;
                Ok(json!({ "connecting": true }))
            }
            "disconnect" => {
                self.inner.client.disconnect().await;
                Ok(json!({ "disconnected": true }))
            }
            "ping" => {
                let running = self.inner.client.check_connection().await?;
                Ok(json!({ "reachable": running }))
            }
            "config.get" => {
                let config = self.inner.config.read().await;
                Ok(serde_json::to_value(&*config)?)
            }
            "config.set" => self.verb_config_set(params).await,

            // Cluster query
            "nodes" => {
                let force = params.get("force").and_then(Value::as_bool).unwrap_or(false);
                let nodes = self.inner.client.fetch_nodes(force).await?;
                Ok(serde_json::to_value(nodes)?)
            }
            "node.get" => {
                let node_id = self.node_id_or_self(&params).await?;
                let node = self.inner.client.fetch_node(&node_id).await?;
                Ok(serde_json::to_value(node)?)
            }
            "node.update" => self.verb_node_update(params).await,
            "tree" => {
                let node_id = self.node_id_or_self(&params).await?;
                self.inner.client.fetch_tree(&node_id).await
            }
            "children" => {
                let node_id = self.node_id_or_self(&params).await?;
                let children = self.inner.client.fetch_children(&node_id).await?;
                Ok(serde_json::to_value(children)?)
            }
            "clusters" => self.inner.client.fetch_clusters().await,

            // Identity lifecycle
            "register" => self.verb_register(params).await,
            "register.child" => {
                let request: RegisterRequest = serde_json::from_value(params)?;
                let registration = self.inner.client.register_child(&request).await?;
                Ok(serde_json::to_value(registration)?)
            }
            "unregister" => self.verb_unregister(params).await,
            "reparent" => self.verb_reparent(params).await,
            "invite-code.get" => {
                let node_id = self.node_id_or_self(&params).await?;
                self.inner.client.invite_code_get(&node_id).await
            }
            "invite-code.set" => {
                let node_id = self.node_id_or_self(&params).await?;
                let code = params.get("code").and_then(Value::as_str);
                self.inner.client.invite_code_set(&node_id, code).await
            }

            // Shared config
            "shared-config.get" => {
                let cluster_id = self.cluster_id().await?;
                self.inner.client.shared_config_get(&cluster_id).await
            }
            "shared-config.set" => {
                let cluster_id = self.cluster_id().await?;
                let config = params
                    .get("config")
                    .cloned()
                    .ok_or_else(|| HubError::invalid_params("missing `config`"))?;
                self.inner
                    .client
                    .shared_config_set(&cluster_id, config)
                    .await
            }

            // Tasks
            "task.send" => {
                let node_id = param_str(&params, "nodeId")?;
                let instruction = param_str(&params, "instruction")?;
                let task = self.send_task(&node_id, &instruction).await?;
                Ok(serde_json::to_value(task)?)
            }
            "task.list" => self.verb_task_list(params).await,
            "task.get" => {
                let task_id = param_str(&params, "taskId")?;
                let task = self
                    .inner
                    .sent
                    .get(&task_id)
                    .await
                    .ok_or_else(|| HubError::TaskNotFound(task_id))?;
                Ok(serde_json::to_value(task)?)
            }
            "task.cancel" => {
                let task_id = param_str(&params, "taskId")?;
                self.cancel_task(&task_id).await
            }
            "task.clear" => {
                let before = parse_before(&params)?;
                let cleared = self.inner.sent.clear_completed(before).await;
                Ok(json!({ "cleared": cleared }))
            }
            "task.batch" => self.verb_task_batch(params).await,

            // Chat
            "chat.send" => self.verb_chat_send(params).await,
            "chat.history" => {
                let node_id = param_str(&params, "nodeId")?;
                let limit = param_usize(&params, "limit");
                let history = self.inner.chats.history(&node_id, limit).await;
                Ok(serde_json::to_value(history)?)
            }
            "chat.list" => Ok(serde_json::to_value(self.inner.chats.active_nodes().await)?),
            "chat.clear" => {
                let node_id = param_str(&params, "nodeId")?;
                self.inner.chats.clear(&node_id).await;
                Ok(json!({ "cleared": true }))
            }

            // Events
            "node.events" => {
                let limit = param_usize(&params, "limit");
                let events = self.inner.node_events.list(limit).await;
                Ok(serde_json::to_value(events)?)
            }

            other => Err(HubError::invalid_params(format!("unknown verb `{other}`"))),
        }
    }

    async fn verb_status(&self) -> HubResult<Value> {
        Ok(json!({
            "hub": self.inner.client.status().await,
            "queue": self.inner.queue.status().await,
            "tasks": self.inner.sent.summary().await,
            "changeSeq": self.inner.client.change_seq(),
        }))
    }

    async fn verb_config_set(&self, params: Value) -> HubResult<Value> {
        if !params.is_object() {
            return Err(HubError::invalid_params("config patch must be an object"));
        }
        let updated = {
            let mut config = self.inner.config.write().await;
            let mut doc = serde_json::to_value(&*config)?;
            deep_merge(&mut doc, &params);
            *config = serde_json::from_value(doc)?;
            config.clone()
        };
        self.persist_config().await;
        Ok(serde_json::to_value(updated)?)
    }

    async fn verb_node_update(&self, params: Value) -> HubResult<Value> {
        let node_id = self.node_id_or_self(&params).await?;
        let name = params.get("name").and_then(Value::as_str);
        let alias = params.get("alias").and_then(Value::as_str);
        let data = self.inner.client.update_node(&node_id, name, alias).await?;

        let is_self = {
            let config = self.inner.config.read().await;
            config.node_id.as_deref() == Some(node_id.as_str())
        };
        if is_self {
            let mut config = self.inner.config.write().await;
            if let Some(name) = name {
                config.node_name = name.to_string();
            }
            if let Some(alias) = alias {
                config.node_alias = alias.to_string();
            }
            drop(config);
            self.persist_config().await;
        }
        Ok(data)
    }

    async fn verb_register(&self, params: Value) -> HubResult<Value> {
        let mut request: RegisterRequest = serde_json::from_value(params)?;
        {
            let config = self.inner.config.read().await;
            if request.name.is_empty() {
                request.name = config.node_name.clone();
            }
            if request.alias.is_none() && !config.node_alias.is_empty() {
                request.alias = Some(config.node_alias.clone());
            }
            if request.capabilities.is_empty() {
                request.capabilities = config.capabilities.clone();
            }
        }

        let registration = self.inner.client.register(&request).await?;

        {
            let mut config = self.inner.config.write().await;
            config.node_id = Some(registration.node_id.clone());
            config.cluster_id = Some(registration.cluster_id.clone());
            config.parent_id = registration.parent_id.clone();
            config.token = Some(registration.token.clone());
        }
        self.persist_config().await;
        Ok(serde_json::to_value(registration)?)
    }

    async fn verb_unregister(&self, params: Value) -> HubResult<Value> {
        let node_id = self.node_id_or_self(&params).await?;
        self.inner.client.unregister(&node_id).await?;

        let was_self = {
            let config = self.inner.config.read().await;
            config.node_id.as_deref() == Some(node_id.as_str())
        };
        if was_self {
            let mut config = self.inner.config.write().await;
            config.node_id = None;
            config.cluster_id = None;
            config.parent_id = None;
            config.token = None;
            drop(config);
            self.persist_config().await;
        }
        Ok(json!({ "unregistered": node_id }))
    }

    async fn verb_reparent(&self, params: Value) -> HubResult<Value> {
        let node_id = self.node_id_or_self(&params).await?;
        let new_parent = params.get("newParentId").and_then(Value::as_str);
        let data = self.inner.client.reparent(&node_id, new_parent).await?;

        let is_self = {
            let config = self.inner.config.read().await;
            config.node_id.as_deref() == Some(node_id.as_str())
        };
        if is_self {
            let mut config = self.inner.config.write().await;
            config.parent_id = new_parent.map(str::to_string);
            if let Some(token) = data.get("token").and_then(Value::as_str) {
                config.token = Some(token.to_string());
            }
            drop(config);
            self.persist_config().await;
        }
        Ok(data)
    }

    async fn verb_task_list(&self, params: Value) -> HubResult<Value> {
        let status = match params.get("status").and_then(Value::as_str) {
            Some(s) => Some(
                serde_json::from_value::<SentTaskStatus>(json!(s))
                    .map_err(|_| HubError::invalid_params(format!("unknown status `{s}`")))?,
            ),
            None => None,
        };
        let filter = SentTaskFilter {
            node_id: params
                .get("nodeId")
                .and_then(Value::as_str)
                .map(str::to_string),
            status,
            limit: param_usize(&params, "limit"),
        };
        let tasks = self.inner.sent.list(&filter).await;
        Ok(serde_json::to_value(tasks)?)
    }

    async fn verb_task_batch(&self, params: Value) -> HubResult<Value> {
        let entries = params
            .get("tasks")
            .and_then(Value::as_array)
            .ok_or_else(|| HubError::invalid_params("missing `tasks` array"))?
            .clone();

        let mut sent = Vec::new();
        for entry in entries {
            let node_id = param_str(&entry, "nodeId")?;
            let instruction = param_str(&entry, "instruction")?;
            let task = self.send_task(&node_id, &instruction).await?;
            sent.push(json!({ "taskId": task.task_id, "nodeId": task.target_node_id }));
        }
        Ok(json!({ "sent": sent }))
    }

    async fn verb_chat_send(&self, params: Value) -> HubResult<Value> {
        let node_id = param_str(&params, "nodeId")?;
        let content = param_str(&params, "content")?;
        let whole = params.get("whole").and_then(Value::as_bool).unwrap_or(false);
        let auto_refresh_ms = params.get("autoRefreshMs").and_then(Value::as_u64);

        let entry = self
            .inner
            .chats
            .append(&node_id, ChatRole::User, &content)
            .await;
        self.inner.bus.publish(FanoutEvent::ChatMessage {
            node_id: node_id.clone(),
            message: entry.clone(),
        });

        let payload = ChatPayload {
            role: "user".to_string(),
            content: Some(content),
            messages: None,
            config: Some(ChatFrameConfig {
                whole,
                auto_refresh_ms,
            }),
            reply_to: None,
            timestamp: now_ms(),
            done: None,
        };
        self.inner
            .client
            .send_frame(WsMessage::chat(&node_id, &payload))
            .await;

        Ok(json!({ "messageId": entry.id }))
    }

    // ──────────────────────────────────────────────────
    // Task routing
    // ──────────────────────────────────────────────────

    /// Create and route an outbound task.
    ///
    /// A self-targeted task in `local` mode short-circuits the hub and runs
    /// through the agent bridge; everything else is sent as a `task` frame.
    pub async fn send_task(&self, node_id: &str, instruction: &str) -> HubResult<StoredTask> {
        let task_id = uuid::Uuid::new_v4().to_string();

        let (self_id, self_task_mode, timeout_ms) = {
            let config = self.inner.config.read().await;
            (
                config.node_id.clone(),
                config.self_task_mode,
                config.task_timeout_ms,
            )
        };
        let loopback =
            self_id.as_deref() == Some(node_id) && self_task_mode == SelfTaskMode::Local;

        let target_name = self.lookup_node_name(node_id).await;
        let source = if loopback {
            TaskSource::Local
        } else {
            TaskSource::Remote
        };
        let task = self
            .inner
            .sent
            .record_sent(StoredTask::new(
                &task_id,
                node_id,
                target_name,
                instruction,
                source,
            ))
            .await;
        self.inner
            .bus
            .publish(FanoutEvent::TaskUpdate { task: task.clone() });

        if loopback {
            let this = self.clone();
            let instruction = instruction.to_string();
            tokio::spawn(async move {
                let outcome = this
                    .inner
                    .runner
                    .execute(
                        &instruction,
                        &task_session_key(&task_id),
                        Some(timeout_ms),
                    )
                    .await;
                let updated = this
                    .inner
                    .sent
                    .record_result(&task_id, outcome.success, outcome.result, outcome.error)
                    .await;
                if let Some(task) = updated {
                    this.inner.bus.publish(FanoutEvent::TaskUpdate { task });
                }
            });
        } else {
            self.inner
                .client
                .send_frame(WsMessage::task(
                    &task_id,
                    node_id,
                    &TaskPayload {
                        task: instruction.to_string(),
                        priority: None,
                        config: None,
                    },
                ))
                .await;
        }

        Ok(task)
    }

    /// Cancel a task from either side of the plane.
    ///
    /// Tries the local queue first (tasks this node executes); in parallel, a
    /// non-terminal sent-task record gets a `task_cancel` frame to its target
    /// and transitions to `cancelled` locally.
    pub async fn cancel_task(&self, task_id: &str) -> HubResult<Value> {
        let cancelled_local = self.inner.queue.cancel(task_id).await;

        let mut cancelled_remote = false;
        if let Some(task) = self.inner.sent.get(task_id).await {
            if !task.status.is_terminal() {
                self.inner
                    .client
                    .send_frame(WsMessage::task_cancel(task_id, &task.target_node_id, None))
                    .await;
                if let Some(updated) = self.inner.sent.mark_cancelled(task_id).await {
                    self.inner
                        .bus
                        .publish(FanoutEvent::TaskUpdate { task: updated });
                }
                cancelled_remote = true;
            }
        }

        if cancelled_local || cancelled_remote {
            Ok(json!({ "cancelled": true, "local": cancelled_local, "remote": cancelled_remote }))
        } else {
            Err(HubError::TaskNotFound(task_id.to_string()))
        }
    }

    // ──────────────────────────────────────────────────
    // Helpers
    // ──────────────────────────────────────────────────

    async fn node_id_or_self(&self, params: &Value) -> HubResult<String> {
        if let Some(node_id) = params.get("nodeId").and_then(Value::as_str) {
            return Ok(node_id.to_string());
        }
        self.inner
            .config
            .read()
            .await
            .node_id
            .clone()
            .ok_or(HubError::NotRegistered)
    }

    async fn cluster_id(&self) -> HubResult<String> {
        self.inner
            .config
            .read()
            .await
            .cluster_id
            .clone()
            .ok_or(HubError::NotRegistered)
    }

    /// Best-effort display name from the node cache.
    async fn lookup_node_name(&self, node_id: &str) -> Option<String> {
        let nodes = self.inner.client.fetch_nodes(false).await.ok()?;
        nodes
            .into_iter()
            .find(|n| n.id == node_id)
            .map(|n| n.name)
            .filter(|name| !name.is_empty())
    }

    async fn persist_config(&self) {
        if let Some(file) = &self.inner.config_file {
            let config = self.inner.config.read().await.clone();
            file.save_best_effort(&config).await;
        }
    }
}

/// Parse the optional `before` param as epoch milliseconds or RFC 3339.
fn parse_before(params: &Value) -> HubResult<Option<DateTime<Utc>>> {
    match params.get("before") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let ms = n
                .as_i64()
                .ok_or_else(|| HubError::invalid_params("`before` out of range"))?;
            DateTime::<Utc>::from_timestamp_millis(ms)
                .map(Some)
                .ok_or_else(|| HubError::invalid_params("`before` out of range"))
        }
        Some(Value::String(s)) => s
            .parse::<DateTime<Utc>>()
            .map(Some)
            .map_err(|_| HubError::invalid_params(format!("bad `before` timestamp `{s}`"))),
        Some(_) => Err(HubError::invalid_params("`before` must be a timestamp")),
    }
}

fn param_str(params: &Value, key: &str) -> HubResult<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HubError::invalid_params(format!("missing `{key}`")))
}

fn param_usize(params: &Value, key: &str) -> Option<usize> {
    params.get(key).and_then(Value::as_u64).map(|n| n as usize)
}

// ──────────────────────────────────────────────────
// Hub event pump
// ──────────────────────────────────────────────────

/// Consume the hub client's event stream for the coordinator's lifetime.
async fn pump(coordinator: Coordinator, mut events: mpsc::UnboundedReceiver<HubEvent>) {
    while let Some(event) = events.recv().await {
        coordinator.on_hub_event(event).await;
    }
    debug!("hub event channel closed; pump exiting");
}

impl Coordinator {
    async fn on_hub_event(&self, event: HubEvent) {
        match event {
            HubEvent::Connected => info!("hub uplink connected"),
            HubEvent::Disconnected => info!("hub uplink disconnected"),

            HubEvent::TaskReceived(msg) => self.on_task_frame(msg).await,

            HubEvent::TaskAck(msg) | HubEvent::TaskStatus(msg) => {
                let Ok(payload) = msg.payload_as::<TaskAckPayload>() else {
                    debug!(task_id = %msg.id, "malformed ack payload, dropped");
                    return;
                };
                if let Some(task) = self.inner.sent.apply_ack(&msg.id, payload.status).await {
                    self.inner.bus.publish(FanoutEvent::TaskUpdate { task });
                }
            }

            HubEvent::ResultReceived(msg) => {
                let Ok(payload) = msg.payload_as::<ResultPayload>() else {
                    debug!(task_id = %msg.id, "malformed result payload, dropped");
                    return;
                };
                if let Some(task) = self
                    .inner
                    .sent
                    .record_result(&msg.id, payload.success, payload.result, payload.error)
                    .await
                {
                    self.inner.bus.publish(FanoutEvent::TaskUpdate { task });
                }
            }

            HubEvent::TaskCancel(msg) => {
                if !self.inner.queue.cancel(&msg.id).await {
                    debug!(task_id = %msg.id, "cancel for unknown task, ignored");
                }
            }

            HubEvent::ChatReceived(msg) => self.on_chat_frame(msg).await,

            HubEvent::NodeOnline(node_id) => {
                self.record_node_event(node_id, NodeEventKind::Online).await;
            }
            HubEvent::NodeOffline(node_id) => {
                self.record_node_event(node_id, NodeEventKind::Offline).await;
            }
            HubEvent::TopologyChanged { action, node_id } => {
                let kind = match action.as_str() {
                    "child_registered" | "child_arrived" => Some(NodeEventKind::Registered),
                    "child_unregistered" | "child_departed" => Some(NodeEventKind::Departed),
                    _ => None,
                };
                if let (Some(kind), Some(node_id)) = (kind, node_id) {
                    self.record_node_event(node_id, kind).await;
                }
            }

            HubEvent::SharedConfig(config) => self.on_shared_config(config).await,
        }
    }

    async fn on_task_frame(&self, msg: WsMessage) {
        let Ok(payload) = msg.payload_as::<TaskPayload>() else {
            debug!(task_id = %msg.id, "malformed task payload, dropped");
            return;
        };
        let Some(from) = msg.from.clone() else {
            debug!(task_id = %msg.id, "task frame without sender, dropped");
            return;
        };
        let task = ReceivedTask::new(
            &msg.id,
            from,
            payload.task,
            payload.priority.unwrap_or_default(),
        );
        self.inner.queue.enqueue(task).await;
    }

    async fn on_chat_frame(&self, msg: WsMessage) {
        let role = msg
            .payload
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match role.as_str() {
            "user" => {
                let handler = self.inner.chat_handler.clone();
                tokio::spawn(async move {
                    handler.handle(msg).await;
                });
            }
            "assistant" => {
                // A peer's reply to a chat this node sent: persist and fan out.
                let Some(from) = msg.from.clone() else {
                    debug!("assistant chat without sender, dropped");
                    return;
                };
                let Ok(payload) = msg.payload_as::<ChatPayload>() else {
                    debug!("malformed assistant chat payload, dropped");
                    return;
                };
                let text = reply_text(&payload);
                if text.is_empty() {
                    return;
                }
                let entry = self
                    .inner
                    .chats
                    .append(&from, ChatRole::Assistant, text)
                    .await;
                self.inner.bus.publish(FanoutEvent::ChatMessage {
                    node_id: from,
                    message: entry,
                });
            }
            // Deltas are transient: the presenter sees them via the peer's
            // final reply; nothing is persisted.
            "delta" => {}
            other => {
                debug!(role = %other, "chat frame with unknown role, dropped");
            }
        }
    }

    async fn record_node_event(&self, node_id: String, kind: NodeEventKind) {
        let node_name = self.lookup_node_name(&node_id).await;
        let event = self
            .inner
            .node_events
            .record(NodeEvent::new(node_id, node_name, kind))
            .await;
        self.inner
            .bus
            .publish(FanoutEvent::NodeLifecycle { event });
    }

    async fn on_shared_config(&self, config: Value) {
        {
            let mut cached = self.inner.shared_config.write().await;
            *cached = Some(config);
        }
        // The tool surface registers exactly once; later pushes only refresh
        // the cached config.
        if !self.inner.tools_registered.swap(true, Ordering::AcqRel) {
            info!("shared config received; external tool surface registered");
        } else {
            debug!("shared config refreshed");
        }
    }
}

/// Text of a peer's assistant reply: direct content, or the concatenated
/// text of its transcript messages.
fn reply_text(payload: &ChatPayload) -> String {
    if let Some(content) = payload.content.as_deref() {
        return content.to_string();
    }
    let Some(messages) = payload.messages.as_ref() else {
        return String::new();
    };
    messages
        .iter()
        .filter(|m| m.role == "assistant")
        .map(|m| crate::agent::content_text(&m.content))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
