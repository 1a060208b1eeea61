use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Issues and tracks cancellation tokens keyed by scope string. Run loops
/// use the run id, node turns use `run/node`, so cancelling a run prefix
/// reaches every in-flight turn of that run.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn_key(run_id: &str, node_id: &str) -> String {
        format!("{run_id}/{node_id}")
    }

    /// Fresh token for the scope, replacing any previous one.
    pub async fn create(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.register(key, token.clone()).await;
        token
    }

    /// Tracks an externally created token (e.g. a child of a run token)
    /// under the scope.
    pub async fn register(&self, key: &str, token: CancellationToken) {
        self.tokens.write().await.insert(key.to_string(), token);
    }

    pub async fn get(&self, key: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(key).cloned()
    }

    pub async fn cancel(&self, key: &str) -> bool {
        match self.tokens.read().await.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every scope under `prefix` (the run id); returns the count.
    pub async fn cancel_prefix(&self, prefix: &str) -> usize {
        let tokens = self.tokens.read().await;
        let mut cancelled = 0;
        for (key, token) in tokens.iter() {
            if key == prefix || key.starts_with(&format!("{prefix}/")) {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub async fn remove(&self, key: &str) {
        self.tokens.write().await.remove(key);
    }
}
