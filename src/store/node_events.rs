//! Node-event store — ring of recent cluster lifecycle events.
//!
//! Backed by `node-events.json`: `{version, updatedAt, events}` with the most
//! recent event first, pruned to 200 by insertion only.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::NodeEvent;

use super::{write_atomic, write_atomic_best_effort, SaveScheduler, SAVE_DEBOUNCE, STORE_VERSION};

/// Maximum retained lifecycle events.
const NODE_EVENT_CAP: usize = 200;

/// On-disk shape of `node-events.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventFileEnvelope {
    version: u32,
    updated_at: DateTime<Utc>,
    events: Vec<NodeEvent>,
}

/// Ring of the last 200 lifecycle events, most recent first.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct NodeEventStore {
    path: PathBuf,
    events: Arc<RwLock<Vec<NodeEvent>>>,
    saver: SaveScheduler,
}

impl NodeEventStore {
    /// Open the store under `dir`, loading `node-events.json` best-effort.
    pub async fn open(dir: &Path) -> Self {
        let path = dir.join("node-events.json");
        let events = match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<EventFileEnvelope>(&text) {
                Ok(envelope) => envelope.events,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed node-event file, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        debug!(count = events.len(), "node-event store loaded");
        Self {
            path,
            events: Arc::new(RwLock::new(events)),
            saver: SaveScheduler::new(SAVE_DEBOUNCE),
        }
    }

    /// Push an event at the head of the ring.
    pub async fn record(&self, event: NodeEvent) -> NodeEvent {
        let mut events = self.events.write().await;
        events.insert(0, event.clone());
        events.truncate(NODE_EVENT_CAP);
        drop(events);
        self.schedule_save();
        event
    }

    /// The most recent events, newest first.
    pub async fn list(&self, limit: Option<usize>) -> Vec<NodeEvent> {
        let events = self.events.read().await;
        events
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Write the ring to disk immediately.
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
        let events = self.events.read().await;
        let envelope = EventFileEnvelope {
            version: STORE_VERSION,
            updated_at: Utc::now(),
            events: events.clone(),
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
