//! Seam to the external document-merge engine
//!
//! The session layer never interprets document updates; it only frames them,
//! relays them, and tags where they came from so the merge engine's own
//! change notifications can distinguish local edits from remote ones.

use anyhow::Result;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// Where an update originated; remote updates carry the sending peer's pubkey
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Peer(String),
}

impl UpdateOrigin {
    pub fn is_local(&self) -> bool {
        matches!(self, UpdateOrigin::Local)
    }
}

/// Change notification emitted by the document model
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub update: Vec<u8>,
    pub origin: UpdateOrigin,
}

/// Conflict-free document model consumed by the session layer
pub trait DocumentModel: Send + Sync + 'static {
    /// Merge an update into the document, tagged with its origin
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()>;

    /// Encode the entire current document state for a full-state handoff
    fn encode_full_state(&self) -> Result<Vec<u8>>;
}

/// Minimal built-in model: an append-only byte log whose full state is the
/// concatenation of every applied update. Enough to run the binary and the
/// tests; real deployments plug a CRDT behind [`DocumentModel`] instead.
pub struct UpdateLog {
    log: Mutex<Vec<u8>>,
    updates: mpsc::Sender<DocUpdate>,
}

impl UpdateLog {
    pub fn new(updates: mpsc::Sender<DocUpdate>) -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            updates,
        }
    }

    /// Convenience constructor returning the model plus the notification
    /// stream the session manager consumes
    pub fn channel(capacity: usize) -> (std::sync::Arc<Self>, mpsc::Receiver<DocUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (std::sync::Arc::new(Self::new(tx)), rx)
    }

    /// Current document contents
    pub fn contents(&self) -> Vec<u8> {
        self.log.lock().expect("log poisoned").clone()
    }
}

impl DocumentModel for UpdateLog {
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        self.log
            .lock()
            .expect("log poisoned")
            .extend_from_slice(update);

        let notification = DocUpdate {
            update: update.to_vec(),
            origin,
        };
        if self.updates.try_send(notification).is_err() {
            warn!("Document update channel full, notification dropped");
        }
        Ok(())
    }

    fn encode_full_state(&self) -> Result<Vec<u8>> {
        Ok(self.contents())
    }
}
