use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use vuhlp_providers::ProviderSession;

/// A provider session shared with exactly one executing turn at a time.
pub type SessionHandle = Arc<Mutex<Box<dyn ProviderSession>>>;

struct SessionEntry {
    handle: SessionHandle,
    session_id: String,
    reset_commands: Vec<String>,
}

/// Maps (run, node) to the long-lived provider session backing the node.
/// Lookup returns `None` before the node's first turn; `reset` closes the
/// session so the next turn opens a fresh one.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<RwLock<HashMap<(String, String), SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, run_id: &str, node_id: &str) -> Option<SessionHandle> {
        self.entries
            .read()
            .await
            .get(&(run_id.to_string(), node_id.to_string()))
            .map(|entry| entry.handle.clone())
    }

    pub async fn session_id(&self, run_id: &str, node_id: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&(run_id.to_string(), node_id.to_string()))
            .map(|entry| entry.session_id.clone())
    }

    pub async fn insert(
        &self,
        run_id: &str,
        node_id: &str,
        session: Box<dyn ProviderSession>,
        reset_commands: Vec<String>,
    ) -> SessionHandle {
        let session_id = session.session_id();
        let handle: SessionHandle = Arc::new(Mutex::new(session));
        self.entries.write().await.insert(
            (run_id.to_string(), node_id.to_string()),
            SessionEntry {
                handle: handle.clone(),
                session_id,
                reset_commands,
            },
        );
        handle
    }

    /// Closes and removes the node's session. Returns false when there was
    /// none to reset.
    pub async fn reset(&self, run_id: &str, node_id: &str) -> bool {
        let entry = self
            .entries
            .write()
            .await
            .remove(&(run_id.to_string(), node_id.to_string()));
        let Some(entry) = entry else {
            return false;
        };
        let mut session = entry.handle.lock().await;
        if let Err(err) = session.abort().await {
            tracing::warn!(run_id, node_id, error = %err, "session abort during reset failed");
        }
        true
    }

    pub async fn reset_commands(&self, run_id: &str, node_id: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .get(&(run_id.to_string(), node_id.to_string()))
            .map(|entry| entry.reset_commands.clone())
            .unwrap_or_default()
    }

    pub async fn clear_run(&self, run_id: &str) {
        self.entries
            .write()
            .await
            .retain(|(run, _), _| run != run_id);
    }
}
