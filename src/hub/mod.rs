//! Hub transport — REST verbs and the WebSocket uplink.
//!
//! [`HubClient`] owns both halves: authenticated HTTP calls against the hub's
//! directory API, and a resilient WebSocket connection carrying the typed
//! frame protocol (heartbeat out, tasks/chats/broadcasts in). Inbound frames
//! surface as [`HubEvent`]s on a channel the coordinator consumes — the
//! client never calls back up.

mod client;
mod socket;

pub use client::{HubClient, HubEvent, HubStatus};

use async_trait::async_trait;

use crate::types::WsMessage;

/// Outbound frame seam.
///
/// The task queue and chat handler emit acks, results, and chat frames
/// through this trait; [`HubClient`] implements it by stamping `from` and
/// `timestamp` and handing the frame to the socket task (dropping it with a
/// warning when disconnected). Tests substitute a recording sink.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send a frame to the hub, best-effort.
    async fn send_frame(&self, msg: WsMessage);
}
