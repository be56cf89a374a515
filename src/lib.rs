//! # cluster-hub — cluster agent plugin
//!
//! This crate connects a local AI execution runtime to a cloud **hub**,
//! forming a tree of cooperating nodes. A node can:
//!
//! - register into a parent/child hierarchy over the hub
//! - receive free-form task instructions from peers and execute them against
//!   the local agent
//! - dispatch tasks and chat messages to other nodes
//! - persist a complete audit trail so a presentation layer (console, CLI,
//!   chatbot) can render state without any state of its own
//!
//! ## Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`hub`] | REST verbs + resilient WebSocket uplink (heartbeat, reconnect, frame dispatch) |
//! | [`queue`] | Two-phase task queue: bounded dispatch slots, unbounded inflight waits |
//! | [`agent`] | One-shot RPC bridge to the local agent gateway |
//! | [`chat`] | Peer chat turns with optional delta streaming |
//! | [`store`] | JSON-backed logs: sent tasks, received tasks, per-peer chats, node events |
//! | [`events`] | Drop-if-slow fan-out bus to the presentation layer |
//! | [`coordinator`] | Wires everything together; exposes the verb surface |
//! | [`config`] | Plugin config + deep-merge patching of the user config file |
//! | [`types`] | Wire frames and persisted entity records |
//! | [`error`] | Unified error enum |
//!
//! ## Quick start
//!
//! ```no_run
//! use cluster_hub::config::{ConfigFile, HubConfig};
//! use cluster_hub::coordinator::Coordinator;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let file = ConfigFile::new("/home/me/.openclaw/openclaw.json");
//! let config: HubConfig = file.load().await?;
//!
//! let coordinator = Coordinator::new(config, Some(file)).await;
//!
//! // Register into a cluster and open the uplink.
//! let reply = coordinator
//!     .handle("register", serde_json::json!({ "name": "worker-1" }))
//!     .await;
//! assert!(reply.ok);
//! coordinator.handle("connect", serde_json::json!({})).await;
//!
//! // Send a task to a peer.
//! let reply = coordinator
//!     .handle(
//!         "task.send",
//!         serde_json::json!({ "nodeId": "node-abc", "instruction": "summarize the repo" }),
//!     )
//!     .await;
//! println!("{:?}", reply.payload);
//!
//! // Watch state changes.
//! let mut events = coordinator.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Everything runs on the tokio event loop; there is no cross-thread shared
//! mutation outside the synchronization types the modules own. The hub socket
//! lives in one spawned task, each started task in another, and store writes
//! are debounced. The fan-out bus never blocks the source: a slow presenter
//! lags and loses events, by contract.

pub mod agent;
pub mod chat;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod hub;
pub mod queue;
pub mod store;
pub mod types;

/// Re-exports of the types most integrations need.
pub mod prelude {
    pub use crate::agent::{AgentBridge, AgentRunner};
    pub use crate::config::{ConfigFile, HubConfig, SelfTaskMode};
    pub use crate::coordinator::{Coordinator, VerbReply};
    pub use crate::error::{HubError, HubResult};
    pub use crate::events::{EventBus, FanoutEvent};
    pub use crate::hub::{FrameSink, HubClient, HubEvent};
    pub use crate::queue::{QueueStatus, TaskQueue};
    pub use crate::store::{ChatStore, NodeEventStore, ReceivedTaskStore, SentTaskStore};
    pub use crate::types::{
        ChatEntry, ChatPayload, ChatRole, MessageType, NodeEvent, NodeEventKind, NodeInfo,
        ReceivedTask, ReceivedTaskStatus, RegisterRequest, Registration, ResultPayload,
        SentTaskStatus, StoredTask, TaskPriority, TaskSource, WsMessage,
    };
}

pub use error::{HubError, HubResult};
