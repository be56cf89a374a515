//! Hub client — REST verbs, identity, node cache, and frame dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::types::{
    now_ms, MessageType, NodeInfo, RegisterRequest, Registration, ResultPayload, WsMessage,
};

use super::FrameSink;

/// Inbound hub activity, consumed by the coordinator.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// The uplink opened (initially or after a reconnect).
    Connected,
    /// The uplink closed.
    Disconnected,
    /// A `task` frame arrived for this node.
    TaskReceived(WsMessage),
    /// A `task_ack` frame for a task this node sent.
    TaskAck(WsMessage),
    /// A `task_status` frame for a task this node sent.
    TaskStatus(WsMessage),
    /// A `task_cancel` frame for a task this node is executing.
    TaskCancel(WsMessage),
    /// A terminal `result` frame for a task this node sent.
    ResultReceived(WsMessage),
    /// A `chat` frame from a peer.
    ChatReceived(WsMessage),
    /// A peer came online (`broadcast/system`).
    NodeOnline(String),
    /// A peer went offline (`broadcast/system`).
    NodeOffline(String),
    /// The cluster tree changed shape (`broadcast/system`).
    TopologyChanged {
        /// The broadcast action (`child_registered`, `reparented`, …).
        action: String,
        /// The node the action concerns, when the hub named one.
        node_id: Option<String>,
    },
    /// The hub pushed per-cluster shared configuration.
    SharedConfig(serde_json::Value),
}

/// Snapshot returned by [`HubClient::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStatus {
    /// Whether an identity is held.
    pub registered: bool,
    /// Whether the uplink is currently open.
    pub connected: bool,
    /// Node id, when registered.
    pub node_id: Option<String>,
    /// Cluster id, when registered.
    pub cluster_id: Option<String>,
    /// Parent node id, when attached under one.
    pub parent_id: Option<String>,
    /// Tasks currently dispatching or in flight locally.
    pub pending_tasks: usize,
    /// Peers in the directory cache (0 when stale or invalidated).
    pub cached_nodes: usize,
}

/// Durable identity triple plus token, adopted on register/reparent.
#[derive(Debug, Clone, Default)]
pub(crate) struct Identity {
    pub(crate) node_id: Option<String>,
    pub(crate) cluster_id: Option<String>,
    pub(crate) parent_id: Option<String>,
    pub(crate) token: Option<String>,
}

/// Handle to the socket task.
#[derive(Default)]
pub(crate) struct ConnHandle {
    /// Channel into the socket task; `None` while disconnected.
    pub(crate) outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    /// Whether a connection task (including its reconnect loop) is alive.
    pub(crate) running: bool,
}

pub(crate) struct ClientInner {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) admin_key: Option<String>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) reconnect_interval: Duration,
    pub(crate) cache_ttl: Duration,
    pub(crate) identity: RwLock<Identity>,
    pub(crate) conn: Mutex<ConnHandle>,
    pub(crate) connected: AtomicBool,
    pub(crate) intentionally_closed: AtomicBool,
    pub(crate) change_seq: AtomicU64,
    pub(crate) node_cache: Mutex<Option<(Instant, Vec<NodeInfo>)>>,
    pub(crate) active_tasks: Arc<AtomicUsize>,
    pub(crate) events: mpsc::UnboundedSender<HubEvent>,
}

/// Client for the hub's REST API and WebSocket uplink.
///
/// Cheap to clone; all clones share the connection, identity, and cache.
#[derive(Clone)]
pub struct HubClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("base_url", &self.inner.base_url)
            .field("connected", &self.inner.connected.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl HubClient {
    /// Create a client from the plugin config.
    ///
    /// Returns the client and the event receiver the coordinator consumes.
    /// `active_tasks` is the queue's live dispatching+inflight counter,
    /// reported in heartbeats and `status()`.
    pub fn new(
        config: &HubConfig,
        active_tasks: Arc<AtomicUsize>,
    ) -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = ClientInner {
            http: reqwest::Client::new(),
            base_url: config.hub_url.trim_end_matches('/').to_string(),
            admin_key: config.admin_key.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms.max(1_000)),
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms.max(100)),
            cache_ttl: Duration::from_millis(config.node_cache_ttl_ms),
            identity: RwLock::new(Identity {
                node_id: config.node_id.clone(),
                cluster_id: config.cluster_id.clone(),
                parent_id: config.parent_id.clone(),
                token: config.token.clone(),
            }),
            conn: Mutex::new(ConnHandle::default()),
            connected: AtomicBool::new(false),
            intentionally_closed: AtomicBool::new(false),
            change_seq: AtomicU64::new(0),
            node_cache: Mutex::new(None),
            active_tasks,
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    // ──────────────────────────────────────────────────
    // Identity lifecycle
    // ──────────────────────────────────────────────────

    /// Register this node and adopt the issued identity.
    pub async fn register(&self, request: &RegisterRequest) -> HubResult<Registration> {
        let data = self
            .api(reqwest::Method::POST, "/api/nodes/register", Some(serde_json::to_value(request)?))
            .await?;
        let registration: Registration = serde_json::from_value(data)?;

        let mut identity = self.inner.identity.write().await;
        identity.node_id = Some(registration.node_id.clone());
        identity.cluster_id = Some(registration.cluster_id.clone());
        identity.parent_id = registration.parent_id.clone();
        identity.token = Some(registration.token.clone());
        drop(identity);

        info!(node_id = %registration.node_id, cluster_id = %registration.cluster_id, "registered with hub");
        Ok(registration)
    }

    /// Register a child node; the issued identity is returned, not adopted.
    pub async fn register_child(&self, request: &RegisterRequest) -> HubResult<Registration> {
        let data = self
            .api(reqwest::Method::POST, "/api/nodes/register", Some(serde_json::to_value(request)?))
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Remove a node from the cluster. Removing self clears the identity and
    /// drops the uplink.
    pub async fn unregister(&self, node_id: &str) -> HubResult<()> {
        self.api(reqwest::Method::DELETE, &format!("/api/nodes/{node_id}"), None)
            .await?;

        let is_self = {
            let identity = self.inner.identity.read().await;
            identity.node_id.as_deref() == Some(node_id)
        };
        if is_self {
            let mut identity = self.inner.identity.write().await;
            *identity = Identity::default();
            drop(identity);
            self.disconnect().await;
            info!("unregistered self; identity cleared");
        }
        Ok(())
    }

    /// Move a node under a new parent (or to the root with `None`).
    ///
    /// The hub may rotate the moved node's token; when the node is self, the
    /// rotated token and new parent are adopted.
    pub async fn reparent(
        &self,
        node_id: &str,
        new_parent_id: Option<&str>,
    ) -> HubResult<serde_json::Value> {
        let data = self
            .api(
                reqwest::Method::PATCH,
                &format!("/api/nodes/{node_id}/parent"),
                Some(serde_json::json!({ "newParentId": new_parent_id })),
            )
            .await?;

        let is_self = {
            let identity = self.inner.identity.read().await;
            identity.node_id.as_deref() == Some(node_id)
        };
        if is_self {
            let mut identity = self.inner.identity.write().await;
            identity.parent_id = new_parent_id.map(str::to_string);
            if let Some(token) = data.get("token").and_then(|t| t.as_str()) {
                identity.token = Some(token.to_string());
            }
        }
        self.invalidate_node_cache().await;
        Ok(data)
    }

    // ──────────────────────────────────────────────────
    // Directory queries
    // ──────────────────────────────────────────────────

    /// All nodes visible to this node, through a 15 s TTL cache.
    pub async fn fetch_nodes(&self, force: bool) -> HubResult<Vec<NodeInfo>> {
        if !force {
            let cache = self.inner.node_cache.lock().await;
            if let Some((fetched_at, nodes)) = cache.as_ref() {
                if fetched_at.elapsed() < self.inner.cache_ttl {
                    return Ok(nodes.clone());
                }
            }
        }

        let data = self.api(reqwest::Method::GET, "/api/nodes", None).await?;
        let nodes: Vec<NodeInfo> = serde_json::from_value(data)?;
        let mut cache = self.inner.node_cache.lock().await;
        *cache = Some((Instant::now(), nodes.clone()));
        Ok(nodes)
    }

    /// One node by id.
    pub async fn fetch_node(&self, node_id: &str) -> HubResult<NodeInfo> {
        let data = self
            .api(reqwest::Method::GET, &format!("/api/nodes/{node_id}"), None)
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Direct children of a node.
    pub async fn fetch_children(&self, node_id: &str) -> HubResult<Vec<NodeInfo>> {
        let data = self
            .api(
                reqwest::Method::GET,
                &format!("/api/nodes/{node_id}/children"),
                None,
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Subtree rooted at a node, as reported by the hub.
    pub async fn fetch_tree(&self, node_id: &str) -> HubResult<serde_json::Value> {
        self.api(
            reqwest::Method::GET,
            &format!("/api/nodes/{node_id}/tree"),
            None,
        )
        .await
    }

    /// All clusters visible to the caller.
    pub async fn fetch_clusters(&self) -> HubResult<serde_json::Value> {
        self.api(reqwest::Method::GET, "/api/clusters", None).await
    }

    /// Update a node's display name and/or alias.
    pub async fn update_node(
        &self,
        node_id: &str,
        name: Option<&str>,
        alias: Option<&str>,
    ) -> HubResult<serde_json::Value> {
        let mut body = serde_json::Map::new();
        if let Some(name) = name {
            body.insert("name".to_string(), name.into());
        }
        if let Some(alias) = alias {
            body.insert("alias".to_string(), alias.into());
        }
        self.api(
            reqwest::Method::PATCH,
            &format!("/api/nodes/{node_id}"),
            Some(serde_json::Value::Object(body)),
        )
        .await
    }

    /// Fetch a node's invite code.
    pub async fn invite_code_get(&self, node_id: &str) -> HubResult<serde_json::Value> {
        self.api(
            reqwest::Method::GET,
            &format!("/api/nodes/{node_id}/invite-code"),
            None,
        )
        .await
    }

    /// Set (or rotate, with `None`) a node's invite code.
    pub async fn invite_code_set(
        &self,
        node_id: &str,
        code: Option<&str>,
    ) -> HubResult<serde_json::Value> {
        self.api(
            reqwest::Method::POST,
            &format!("/api/nodes/{node_id}/invite-code"),
            Some(serde_json::json!({ "code": code })),
        )
        .await
    }

    /// Fetch the cluster's shared configuration.
    pub async fn shared_config_get(&self, cluster_id: &str) -> HubResult<serde_json::Value> {
        self.api(
            reqwest::Method::GET,
            &format!("/api/clusters/{cluster_id}/shared-config"),
            None,
        )
        .await
    }

    /// Replace the cluster's shared configuration.
    pub async fn shared_config_set(
        &self,
        cluster_id: &str,
        config: serde_json::Value,
    ) -> HubResult<serde_json::Value> {
        self.api(
            reqwest::Method::PUT,
            &format!("/api/clusters/{cluster_id}/shared-config"),
            Some(config),
        )
        .await
    }

    /// Health probe: GET `/` expecting `{"status": "running"}`.
    pub async fn check_connection(&self) -> HubResult<bool> {
        let value = self.request_raw(reqwest::Method::GET, "/", None).await?;
        Ok(value.get("status").and_then(|s| s.as_str()) == Some("running"))
    }

    // ──────────────────────────────────────────────────
    // Uplink
    // ──────────────────────────────────────────────────

    /// Open the WebSocket uplink and keep it open.
    ///
    /// Spawns the connection task (idempotent while one is alive): connect,
    /// heartbeat at the configured interval, reconnect on unintentional close
    /// after a fixed delay.
    pub async fn connect(&self) -> HubResult<()> {
        {
            let identity = self.inner.identity.read().await;
            if identity.token.is_none() {
                return Err(HubError::NotRegistered);
            }
        }

        self.inner
            .intentionally_closed
            .store(false, Ordering::Release);

        let mut conn = self.inner.conn.lock().await;
        if conn.running {
            return Ok(());
        }
        conn.running = true;
        drop(conn);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(super::socket::run(inner));
        Ok(())
    }

    /// Close the uplink deliberately; no reconnect is armed.
    pub async fn disconnect(&self) {
        self.inner
            .intentionally_closed
            .store(true, Ordering::Release);
        let mut conn = self.inner.conn.lock().await;
        // Dropping the sender ends the socket task's outbound loop.
        conn.outbound = None;
    }

    /// Whether the uplink is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Strictly monotonic counter of observed topology broadcasts.
    pub fn change_seq(&self) -> u64 {
        self.inner.change_seq.load(Ordering::Acquire)
    }

    /// Current status snapshot.
    pub async fn status(&self) -> HubStatus {
        let identity = self.inner.identity.read().await;
        let cached_nodes = {
            let cache = self.inner.node_cache.lock().await;
            cache
                .as_ref()
                .filter(|(at, _)| at.elapsed() < self.inner.cache_ttl)
                .map(|(_, nodes)| nodes.len())
                .unwrap_or(0)
        };
        HubStatus {
            registered: identity.node_id.is_some() && identity.token.is_some(),
            connected: self.is_connected(),
            node_id: identity.node_id.clone(),
            cluster_id: identity.cluster_id.clone(),
            parent_id: identity.parent_id.clone(),
            pending_tasks: self.inner.active_tasks.load(Ordering::Acquire),
            cached_nodes,
        }
    }

    /// This node's id, when registered.
    pub async fn node_id(&self) -> Option<String> {
        self.inner.identity.read().await.node_id.clone()
    }

    /// This node's cluster, when registered.
    pub async fn cluster_id(&self) -> Option<String> {
        self.inner.identity.read().await.cluster_id.clone()
    }

    /// Convenience for sending a terminal `result` frame.
    pub async fn send_result(&self, task_id: &str, to_node_id: &str, outcome: &ResultPayload) {
        self.send_frame(WsMessage::result(task_id, to_node_id, outcome))
            .await;
    }

    /// Feed a frame through the inbound dispatch path.
    ///
    /// Called by the socket task for every parsed frame; public so tests can
    /// drive the dispatch table without a live socket.
    pub fn dispatch_frame(&self, msg: WsMessage) {
        self.inner.dispatch_frame(msg);
    }

    async fn invalidate_node_cache(&self) {
        let mut cache = self.inner.node_cache.lock().await;
        *cache = None;
    }

    // ──────────────────────────────────────────────────
    // HTTP plumbing
    // ──────────────────────────────────────────────────

    /// Request against the hub, returning the raw JSON body.
    async fn request_raw(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> HubResult<serde_json::Value> {
        let url = format!("{}{}", self.inner.base_url, path);
        let mut request = self.inner.http.request(method, &url);

        {
            let identity = self.inner.identity.read().await;
            if let Some(token) = identity.token.as_deref() {
                request = request.bearer_auth(token);
            }
        }
        if let Some(key) = self.inner.admin_key.as_deref() {
            request = request.header("X-Admin-Key", key);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                HubError::timeout(format!("hub request timed out: {e}"))
            } else if e.is_connect() {
                HubError::transport(format!("hub connection failed: {e}"))
            } else {
                HubError::transport(format!("hub request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| HubError::InvalidJson(format!("hub response: {e}")))
    }

    /// Request against the hub API, unwrapping the `{success, data, error}`
    /// envelope.
    async fn api(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> HubResult<serde_json::Value> {
        let envelope = self.request_raw(method, path, body).await?;
        if envelope.get("success").and_then(|s| s.as_bool()) == Some(false) {
            let message = envelope
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("request failed");
            return Err(HubError::Hub(message.to_string()));
        }
        Ok(envelope
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl FrameSink for HubClient {
    async fn send_frame(&self, mut msg: WsMessage) {
        if msg.from.is_none() {
            msg.from = self.inner.identity.read().await.node_id.clone();
        }
        if msg.timestamp.is_none() {
            msg.timestamp = Some(now_ms());
        }

        let conn = self.inner.conn.lock().await;
        match conn.outbound.as_ref() {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    warn!("socket task gone; frame dropped");
                }
            }
            None => {
                warn!(msg_type = %msg.msg_type, "not connected to hub; frame dropped");
            }
        }
    }
}

impl ClientInner {
    /// Bump the topology counter and drop the node cache.
    fn note_topology_change(&self) {
        self.change_seq.fetch_add(1, Ordering::AcqRel);
        // Frame dispatch must not await; a contended cache is simply left to
        // expire via its TTL.
        if let Ok(mut cache) = self.node_cache.try_lock() {
            *cache = None;
        }
    }

    fn emit(&self, event: HubEvent) {
        if self.events.send(event).is_err() {
            debug!("hub event receiver dropped");
        }
    }

    /// The inbound dispatch table.
    pub(crate) fn dispatch_frame(&self, msg: WsMessage) {
        match msg.msg_type {
            MessageType::Task => self.emit(HubEvent::TaskReceived(msg)),
            MessageType::Result => self.emit(HubEvent::ResultReceived(msg)),
            MessageType::TaskAck => self.emit(HubEvent::TaskAck(msg)),
            MessageType::TaskStatus => self.emit(HubEvent::TaskStatus(msg)),
            MessageType::TaskCancel => self.emit(HubEvent::TaskCancel(msg)),
            MessageType::Chat => self.emit(HubEvent::ChatReceived(msg)),
            MessageType::Direct => {
                let action = msg
                    .payload
                    .get("action")
                    .and_then(|a| a.as_str())
                    .unwrap_or_default();
                if action == "connected" {
                    debug!(
                        node_id = msg.payload.get("nodeId").and_then(|n| n.as_str()),
                        "hub acknowledged connection"
                    );
                }
                if let Some(shared) = msg.payload.get("sharedConfig") {
                    self.emit(HubEvent::SharedConfig(shared.clone()));
                }
            }
            MessageType::Broadcast => self.dispatch_broadcast(msg),
            MessageType::Heartbeat => {}
            MessageType::Subscribe => {
                debug!("unexpected subscribe frame from hub, dropped");
            }
        }
    }

    fn dispatch_broadcast(&self, msg: WsMessage) {
        if msg.channel.as_deref() != Some("system") {
            debug!(channel = ?msg.channel, "broadcast on unhandled channel, dropped");
            return;
        }
        let action = msg
            .payload
            .get("action")
            .and_then(|a| a.as_str())
            .unwrap_or_default()
            .to_string();
        let node_id = msg
            .payload
            .get("nodeId")
            .and_then(|n| n.as_str())
            .map(str::to_string);

        match action.as_str() {
            "node_online" => {
                self.note_topology_change();
                if let Some(node_id) = node_id {
                    self.emit(HubEvent::NodeOnline(node_id));
                }
            }
            "node_offline" => {
                self.note_topology_change();
                if let Some(node_id) = node_id {
                    self.emit(HubEvent::NodeOffline(node_id));
                }
            }
            "child_registered" | "child_unregistered" | "child_departed" | "child_arrived"
            | "reparented" => {
                self.note_topology_change();
                self.emit(HubEvent::TopologyChanged { action, node_id });
            }
            other => {
                debug!(action = %other, "unknown system broadcast, dropped");
            }
        }
    }
}
