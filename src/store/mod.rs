//! Persistent JSON-backed stores.
//!
//! Four stores share one write discipline: every mutation schedules a
//! coalesced save (debounced ~1.5 s, deduplicated per store), `flush()`
//! writes immediately and is called on shutdown, and files are replaced
//! atomically (write temp, rename). Loads are best-effort — a missing,
//! unreadable, or malformed file yields an empty store, and a corrupt
//! per-peer chat file is skipped in isolation.
//!
//! Disk errors are swallowed at the store boundary: the write is logged at
//! `warn` and the in-memory state stays authoritative, so the next debounced
//! save retries.

mod chat;
mod node_events;
mod received;
mod sent;

pub use chat::ChatStore;
pub use node_events::NodeEventStore;
pub use received::ReceivedTaskStore;
pub use sent::{SentTaskFilter, SentTaskStore, TaskSummary};

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::warn;

/// Debounce window for coalesced saves.
pub(crate) const SAVE_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Envelope version written into every store file.
pub(crate) const STORE_VERSION: u32 = 1;

/// Replace `path` atomically with `contents`.
pub(crate) async fn write_atomic(path: &Path, contents: String) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await
}

/// Replace `path` atomically, logging instead of failing.
///
/// Store state stays dirty in memory, so a failed write is retried by
/// whichever mutation schedules the next save.
pub(crate) async fn write_atomic_best_effort(path: &Path, contents: String) {
    if let Err(e) = write_atomic(path, contents).await {
        warn!(path = %path.display(), error = %e, "store write failed; will retry on next save");
    }
}

/// Per-store debounce of background saves.
///
/// The first `schedule` after an idle period spawns a timer task; further
/// calls within the window are absorbed. The pending flag clears before the
/// save runs, so a mutation racing the write re-arms the timer and the new
/// state is picked up by the next pass.
#[derive(Debug, Clone)]
pub(crate) struct SaveScheduler {
    pending: Arc<AtomicBool>,
    delay: Duration,
}

impl SaveScheduler {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            pending: Arc::new(AtomicBool::new(false)),
            delay,
        }
    }

    /// Schedule `save` to run after the debounce window, unless one is
    /// already pending.
    pub(crate) fn schedule<F>(&self, save: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = Arc::clone(&self.pending);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.store(false, Ordering::Release);
            save.await;
        });
    }
}
