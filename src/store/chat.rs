//! Chat store — per-peer conversation logs.
//!
//! One `chats/<node_id>.json` file per peer, each holding
//! `{version, nodeId, updatedAt, messages}` with the oldest message first and
//! a per-peer cap of 500 (oldest dropped). A corrupt file poisons only its
//! own peer: the load skips it and every other conversation survives.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::types::{ChatEntry, ChatRole};

use super::{write_atomic, write_atomic_best_effort, SaveScheduler, SAVE_DEBOUNCE, STORE_VERSION};

/// Maximum retained messages per peer.
const CHAT_CAP: usize = 500;

/// On-disk shape of `chats/<node_id>.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatFileEnvelope {
    version: u32,
    node_id: String,
    updated_at: DateTime<Utc>,
    messages: Vec<ChatEntry>,
}

/// Per-peer chat logs under a `chats/` directory.
///
/// Cheap to clone; clones share state. Saves are debounced per store and only
/// rewrite the files of peers whose logs changed.
#[derive(Debug, Clone)]
pub struct ChatStore {
    dir: PathBuf,
    logs: Arc<RwLock<HashMap<String, Vec<ChatEntry>>>>,
    dirty: Arc<Mutex<HashSet<String>>>,
    saver: SaveScheduler,
}

impl ChatStore {
    /// Open the store under `dir`, scanning `dir/chats/*.json` best-effort.
    pub async fn open(dir: &Path) -> Self {
        let chats_dir = dir.join("chats");
        let mut logs = HashMap::new();

        if let Ok(mut entries) = fs::read_dir(&chats_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                match fs::read_to_string(&path).await {
                    Ok(text) => match serde_json::from_str::<ChatFileEnvelope>(&text) {
                        Ok(envelope) => {
                            logs.insert(envelope.node_id, envelope.messages);
                        }
                        Err(e) => {
                            // Corruption is isolated to this peer.
                            warn!(path = %path.display(), error = %e, "skipping malformed chat file");
                        }
                    },
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable chat file");
                    }
                }
            }
        }

        debug!(peers = logs.len(), "chat store loaded");
        Self {
            dir: chats_dir,
            logs: Arc::new(RwLock::new(logs)),
            dirty: Arc::new(Mutex::new(HashSet::new())),
            saver: SaveScheduler::new(SAVE_DEBOUNCE),
        }
    }

    /// Append a message to a peer's log, evicting the oldest past the cap.
    pub async fn append(
        &self,
        node_id: &str,
        role: ChatRole,
        content: impl Into<String>,
    ) -> ChatEntry {
        let entry = ChatEntry::new(node_id, role, content);
        let mut logs = self.logs.write().await;
        let log = logs.entry(node_id.to_string()).or_default();
        log.push(entry.clone());
        if log.len() > CHAT_CAP {
            let excess = log.len() - CHAT_CAP;
            log.drain(..excess);
        }
        drop(logs);

        self.dirty.lock().await.insert(node_id.to_string());
        self.schedule_save();
        entry
    }

    /// The most recent `limit` messages for a peer, oldest first.
    pub async fn history(&self, node_id: &str, limit: Option<usize>) -> Vec<ChatEntry> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(node_id) else {
            return Vec::new();
        };
        let limit = limit.unwrap_or(usize::MAX).min(log.len());
        log[log.len() - limit..].to_vec()
    }

    /// Peers that have at least one message, sorted for stable output.
    pub async fn active_nodes(&self) -> Vec<String> {
        let logs = self.logs.read().await;
        let mut nodes: Vec<String> = logs
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Drop a peer's log and delete its file.
    pub async fn clear(&self, node_id: &str) {
        let mut logs = self.logs.write().await;
        logs.remove(node_id);
        drop(logs);
        self.dirty.lock().await.remove(node_id);

        let path = self.peer_path(node_id);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to delete chat file");
            }
        }
    }

    /// Write all dirty peer logs to disk immediately.
    pub async fn flush(&self) {
        let dirty: Vec<String> = self.dirty.lock().await.drain().collect();
        for node_id in dirty {
            let Some(contents) = self.serialize_peer(&node_id).await else {
                continue;
            };
            write_atomic_best_effort(&self.peer_path(&node_id), contents).await;
        }
    }

    /// Like [`flush`](Self::flush) but surfacing the first error; used by tests.
    pub async fn flush_strict(&self) -> std::io::Result<()> {
        let dirty: Vec<String> = self.dirty.lock().await.drain().collect();
        for node_id in dirty {
            let Some(contents) = self.serialize_peer(&node_id).await else {
                continue;
            };
            write_atomic(&self.peer_path(&node_id), contents).await?;
        }
        Ok(())
    }

    fn peer_path(&self, node_id: &str) -> PathBuf {
        self.dir.join(format!("{node_id}.json"))
    }

    async fn serialize_peer(&self, node_id: &str) -> Option<String> {
        let logs = self.logs.read().await;
        let log = logs.get(node_id)?;
        let envelope = ChatFileEnvelope {
            version: STORE_VERSION,
            node_id: node_id.to_string(),
            updated_at: Utc::now(),
            messages: log.clone(),
        };
        serde_json::to_string_pretty(&envelope).ok()
    }

    fn schedule_save(&self) {
        let store = self.clone();
        self.saver.schedule(async move {
            store.flush().await;
        });
    }
}
