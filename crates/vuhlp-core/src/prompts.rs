use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;

use vuhlp_types::{PendingPrompt, PromptSource, PromptStatus, RunEvent};

use crate::event_bus::EventBus;

/// Append-only per-run list of prompts awaiting dispatch. Transitions are
/// only legal from `pending`.
#[derive(Clone)]
pub struct PromptQueue {
    prompts: Arc<RwLock<HashMap<String, Vec<PendingPrompt>>>>,
    bus: EventBus,
}

impl PromptQueue {
    pub fn new(bus: EventBus) -> Self {
        Self {
            prompts: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    pub async fn enqueue(
        &self,
        run_id: &str,
        target_node_id: &str,
        source: PromptSource,
        content: impl Into<String>,
    ) -> PendingPrompt {
        let prompt = PendingPrompt {
            id: vuhlp_types::new_id("prm"),
            run_id: run_id.to_string(),
            target_node_id: target_node_id.to_string(),
            source,
            content: content.into(),
            status: PromptStatus::Pending,
            created_at: Utc::now(),
        };
        self.prompts
            .write()
            .await
            .entry(run_id.to_string())
            .or_default()
            .push(prompt.clone());
        prompt
    }

    pub async fn mark_sent(&self, id: &str) -> bool {
        self.transition(id, PromptStatus::Sent, None).await
    }

    pub async fn cancel(&self, id: &str, reason: Option<&str>) -> bool {
        self.transition(id, PromptStatus::Cancelled, reason).await
    }

    /// Edits the prompt text; only while still pending.
    pub async fn modify_content(&self, id: &str, content: &str) -> bool {
        let mut prompts = self.prompts.write().await;
        for list in prompts.values_mut() {
            if let Some(prompt) = list.iter_mut().find(|p| p.id == id) {
                if prompt.status != PromptStatus::Pending {
                    return false;
                }
                prompt.content = content.to_string();
                return true;
            }
        }
        false
    }

    async fn transition(&self, id: &str, status: PromptStatus, reason: Option<&str>) -> bool {
        let transitioned = {
            let mut prompts = self.prompts.write().await;
            let mut found = None;
            'runs: for list in prompts.values_mut() {
                if let Some(prompt) = list.iter_mut().find(|p| p.id == id) {
                    if prompt.status != PromptStatus::Pending {
                        return false;
                    }
                    prompt.status = status;
                    found = Some((prompt.run_id.clone(), prompt.id.clone()));
                    break 'runs;
                }
            }
            found
        };
        let Some((run_id, prompt_id)) = transitioned else {
            return false;
        };
        self.bus.publish(RunEvent::new(
            run_id,
            "node.progress",
            json!({
                "promptId": prompt_id,
                "promptStatus": status,
                "reason": reason,
            }),
        ));
        true
    }

    pub async fn for_run(&self, run_id: &str) -> Vec<PendingPrompt> {
        self.prompts
            .read()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn pending_for_run(&self, run_id: &str) -> Vec<PendingPrompt> {
        self.for_run(run_id)
            .await
            .into_iter()
            .filter(|p| p.status == PromptStatus::Pending)
            .collect()
    }

    pub async fn for_source(&self, run_id: &str, source: PromptSource) -> Vec<PendingPrompt> {
        self.for_run(run_id)
            .await
            .into_iter()
            .filter(|p| p.source == source)
            .collect()
    }

    /// Cancels still-pending prompts of the run with reason `run_cleared`
    /// and drops the list; returns how many were cancelled.
    pub async fn clear_run(&self, run_id: &str) -> usize {
        let pending: Vec<String> = self
            .pending_for_run(run_id)
            .await
            .into_iter()
            .map(|p| p.id)
            .collect();
        let mut cancelled = 0;
        for id in &pending {
            if self.cancel(id, Some("run_cleared")).await {
                cancelled += 1;
            }
        }
        self.prompts.write().await.remove(run_id);
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue() -> (PromptQueue, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (PromptQueue::new(EventBus::new(dir.path())), dir)
    }

    #[tokio::test]
    async fn transitions_only_apply_while_pending() {
        let (queue, _dir) = queue();
        let prompt = queue
            .enqueue("run_1", "node_a", PromptSource::Orchestrator, "do the thing")
            .await;

        assert!(queue.modify_content(&prompt.id, "do it carefully").await);
        assert!(queue.mark_sent(&prompt.id).await);
        assert!(!queue.cancel(&prompt.id, None).await);
        assert!(!queue.modify_content(&prompt.id, "too late").await);

        let prompts = queue.for_run("run_1").await;
        assert_eq!(prompts[0].status, PromptStatus::Sent);
        assert_eq!(prompts[0].content, "do it carefully");
    }

    #[tokio::test]
    async fn queries_filter_by_source() {
        let (queue, _dir) = queue();
        queue
            .enqueue("run_1", "node_a", PromptSource::Orchestrator, "auto")
            .await;
        queue.enqueue("run_1", "node_a", PromptSource::User, "manual").await;

        let user = queue.for_source("run_1", PromptSource::User).await;
        assert_eq!(user.len(), 1);
        assert_eq!(user[0].content, "manual");
    }

    #[tokio::test]
    async fn clear_run_cancels_pending_prompts() {
        let (queue, _dir) = queue();
        let kept = queue
            .enqueue("run_1", "node_a", PromptSource::Orchestrator, "one")
            .await;
        queue.mark_sent(&kept.id).await;
        queue
            .enqueue("run_1", "node_a", PromptSource::Orchestrator, "two")
            .await;
        queue
            .enqueue("run_1", "node_b", PromptSource::User, "three")
            .await;

        assert_eq!(queue.clear_run("run_1").await, 2);
        assert!(queue.for_run("run_1").await.is_empty());
    }
}
