//! Plugin configuration and config-file patching.
//!
//! The durable identity (`node_id`, `token`, `cluster_id`, `parent_id`) and
//! tuning knobs live under the `plugins.entries.cluster-hub.config` branch of
//! the user's `openclaw.json`. Writes deep-merge into the existing document so
//! unrelated settings survive: objects merge recursively, everything else
//! (including arrays) replaces wholly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{HubError, HubResult};

/// How self-targeted tasks are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelfTaskMode {
    /// Short-circuit the hub and execute through the local agent bridge.
    #[default]
    Local,
    /// Always round-trip through the hub, even for self.
    Hub,
}

fn default_hub_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_node_name() -> String {
    "node".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_node_cache_ttl_ms() -> u64 {
    15_000
}

fn default_gateway_port() -> u16 {
    18_789
}

/// Plugin configuration, persisted under
/// `plugins.entries.cluster-hub.config` in `openclaw.json`.
///
/// Identity fields (`node_id`, `token`, `cluster_id`, `parent_id`) serialize
/// as explicit `null` when empty so that clearing them on `unregister`
/// actually clears the file through the deep merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Base URL of the hub (HTTP; the WS uplink derives from it).
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Human-readable node name.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Cluster-unique alias for @-mentions.
    #[serde(default)]
    pub node_alias: String,

    /// Node id issued at registration; `None` until registered.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Bearer token issued at registration.
    #[serde(default)]
    pub token: Option<String>,

    /// Cluster id issued at registration.
    #[serde(default)]
    pub cluster_id: Option<String>,

    /// Parent node id; `None` for a root node.
    #[serde(default)]
    pub parent_id: Option<String>,

    /// Capability strings advertised at registration.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Routing mode for self-targeted tasks.
    #[serde(default)]
    pub self_task_mode: SelfTaskMode,

    /// Dispatch-slot bound; clamped to `[1, 10]` at use sites.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Heartbeat interval while connected.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Fixed reconnect delay after an unintentional close.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Overall deadline for a local agent run.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Peer directory cache TTL.
    #[serde(default = "default_node_cache_ttl_ms")]
    pub node_cache_ttl_ms: u64,

    /// Port of the local agent gateway on 127.0.0.1.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,

    /// Auth token for the local agent gateway, when it requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_token: Option<String>,

    /// Optional admin key sent as `X-Admin-Key` on hub requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,

    /// Override for the store directory; defaults to `~/.openclaw/hub-data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            node_name: default_node_name(),
            node_alias: String::new(),
            node_id: None,
            token: None,
            cluster_id: None,
            parent_id: None,
            capabilities: Vec::new(),
            self_task_mode: SelfTaskMode::default(),
            max_concurrent: default_max_concurrent(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            node_cache_ttl_ms: default_node_cache_ttl_ms(),
            gateway_port: default_gateway_port(),
            gateway_token: None,
            admin_key: None,
            data_dir: None,
        }
    }
}

impl HubConfig {
    /// Resolved store directory.
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".openclaw")
                .join("hub-data"),
        }
    }

    /// Dispatch-slot bound, clamped to `[1, 10]`.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.clamp(1, 10)
    }

    /// Whether the node holds a full identity.
    pub fn is_registered(&self) -> bool {
        self.node_id.is_some() && self.token.is_some()
    }
}

/// Recursive merge of `patch` into `target`.
///
/// Object branches merge key-by-key; any other value (scalars, arrays, null)
/// replaces the target leaf wholly. A `null` leaf in the patch therefore
/// clears the corresponding key's value.
pub fn deep_merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match target_map.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => {
            *slot = value.clone();
        }
    }
}

/// Path of the plugin branch inside the user config document.
const PLUGIN_BRANCH: [&str; 4] = ["plugins", "entries", "cluster-hub", "config"];

/// Load/patch access to the user's `openclaw.json`.
///
/// The file holds settings for many plugins; this type only ever reads and
/// rewrites the `plugins.entries.cluster-hub.config` branch, preserving
/// everything else via [`deep_merge`].
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    /// Point at an `openclaw.json` document.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the underlying document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the plugin config branch.
    ///
    /// A missing file or missing branch yields the default config; a file
    /// that exists but fails to parse is an error (it must not be clobbered
    /// by a later save).
    pub async fn load(&self) -> HubResult<HubConfig> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "config file missing, using defaults");
                return Ok(HubConfig::default());
            }
            Err(e) => return Err(HubError::Config(format!("read {}: {}", self.path.display(), e))),
        };

        let doc: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| HubError::Config(format!("parse {}: {}", self.path.display(), e)))?;

        let mut branch = &doc;
        for key in PLUGIN_BRANCH {
            match branch.get(key) {
                Some(next) => branch = next,
                None => return Ok(HubConfig::default()),
            }
        }

        serde_json::from_value(branch.clone())
            .map_err(|e| HubError::Config(format!("plugin config in {}: {}", self.path.display(), e)))
    }

    /// Deep-merge the given config into the plugin branch and rewrite the
    /// document atomically (write temp, rename).
    pub async fn save(&self, config: &HubConfig) -> HubResult<()> {
        let mut doc = match fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| HubError::Config(format!("parse {}: {}", self.path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                serde_json::Value::Object(serde_json::Map::new())
            }
            Err(e) => return Err(HubError::Config(format!("read {}: {}", self.path.display(), e))),
        };

        // Wrap the config in its branch path, innermost first.
        let mut patch = serde_json::to_value(config)?;
        for key in PLUGIN_BRANCH.iter().rev() {
            patch = serde_json::json!({ *key: patch });
        }
        deep_merge(&mut doc, &patch);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        let pretty = serde_json::to_string_pretty(&doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, pretty)
            .await
            .map_err(|e| HubError::Config(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| HubError::Config(format!("rename {}: {}", self.path.display(), e)))?;

        debug!(path = %self.path.display(), "plugin config saved");
        Ok(())
    }

    /// [`save`](Self::save) that logs instead of failing; used on paths where
    /// config persistence must not abort the operation that triggered it.
    pub async fn save_best_effort(&self, config: &HubConfig) {
        if let Err(e) = self.save(config).await {
            warn!(error = %e, "failed to persist plugin config");
        }
    }
}
