use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::RwLock;

use vuhlp_types::{ChatMessage, ChatRole, InteractionMode, RunEvent};

use crate::event_bus::EventBus;

/// At most this many messages are retained per run; oldest drop first.
const MAX_HISTORY_PER_RUN: usize = 50;

#[derive(Debug, Clone)]
pub struct SendMessageParams {
    pub run_id: String,
    /// `None` addresses the run (orphan candidate).
    pub node_id: Option<String>,
    pub content: String,
    /// Interrupt-triggering messages wake the scheduler immediately.
    pub interrupt: bool,
}

/// Queue of user messages addressed to a run or a specific node, with
/// processed/unprocessed state and per-run / per-node interaction modes.
#[derive(Clone)]
pub struct ChatManager {
    messages: Arc<RwLock<HashMap<String, VecDeque<ChatMessage>>>>,
    run_modes: Arc<RwLock<HashMap<String, InteractionMode>>>,
    node_modes: Arc<RwLock<HashMap<(String, String), InteractionMode>>>,
    bus: EventBus,
}

impl ChatManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
            run_modes: Arc::new(RwLock::new(HashMap::new())),
            node_modes: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    pub async fn send_message(&self, params: SendMessageParams) -> ChatMessage {
        let message = ChatMessage {
            id: vuhlp_types::new_id("msg"),
            run_id: params.run_id.clone(),
            node_id: params.node_id.clone(),
            role: ChatRole::User,
            content: params.content.clone(),
            created_at: Utc::now(),
            processed: false,
            interrupted_execution: params.interrupt,
        };

        {
            let mut messages = self.messages.write().await;
            let queue = messages.entry(params.run_id.clone()).or_default();
            queue.push_back(message.clone());
            while queue.len() > MAX_HISTORY_PER_RUN {
                queue.pop_front();
            }
        }

        self.bus.publish(RunEvent::new(
            &params.run_id,
            "message.user",
            json!({
                "messageId": message.id,
                "nodeId": message.node_id,
                "content": message.content,
                "queued": !params.interrupt,
            }),
        ));

        message
    }

    /// Unprocessed messages. With a node id, messages for that node plus
    /// run-level messages; without one, every unprocessed message.
    pub async fn pending_messages(&self, run_id: &str, node_id: Option<&str>) -> Vec<ChatMessage> {
        let messages = self.messages.read().await;
        let Some(queue) = messages.get(run_id) else {
            return Vec::new();
        };
        queue
            .iter()
            .filter(|m| !m.processed)
            .filter(|m| match node_id {
                Some(node) => m.node_id.as_deref() == Some(node) || m.node_id.is_none(),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Unprocessed messages matched by an arbitrary selector, without
    /// consuming them. Used for inbox accounting.
    pub async fn pending_matching(
        &self,
        run_id: &str,
        selector: impl Fn(&ChatMessage) -> bool,
    ) -> Vec<ChatMessage> {
        let messages = self.messages.read().await;
        let Some(queue) = messages.get(run_id) else {
            return Vec::new();
        };
        queue
            .iter()
            .filter(|m| !m.processed && selector(m))
            .cloned()
            .collect()
    }

    /// Atomically collects all unprocessed messages matching the selector,
    /// marks them processed and returns a formatted prompt block plus the
    /// consumed list (insertion order). The block is empty when nothing
    /// matched.
    pub async fn consume_messages(
        &self,
        run_id: &str,
        selector: impl Fn(&ChatMessage) -> bool,
    ) -> (String, Vec<ChatMessage>) {
        let mut messages = self.messages.write().await;
        let Some(queue) = messages.get_mut(run_id) else {
            return (String::new(), Vec::new());
        };

        let mut consumed = Vec::new();
        for message in queue.iter_mut() {
            if !message.processed && selector(message) {
                message.processed = true;
                consumed.push(message.clone());
            }
        }

        (format_chat_block(&consumed), consumed)
    }

    /// Every retained message of a run, processed or not.
    pub async fn history(&self, run_id: &str) -> Vec<ChatMessage> {
        self.messages
            .read()
            .await
            .get(run_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear_run(&self, run_id: &str) {
        self.messages.write().await.remove(run_id);
        self.run_modes.write().await.remove(run_id);
        self.node_modes
            .write()
            .await
            .retain(|(run, _), _| run != run_id);
    }

    // ------------------------------------------------------------------
    // Interaction mode
    // ------------------------------------------------------------------

    pub async fn run_interaction_mode(&self, run_id: &str) -> InteractionMode {
        self.run_modes
            .read()
            .await
            .get(run_id)
            .copied()
            .unwrap_or(InteractionMode::Autonomous)
    }

    pub async fn set_run_interaction_mode(&self, run_id: &str, mode: InteractionMode) {
        let changed = {
            let mut modes = self.run_modes.write().await;
            let previous = modes.insert(run_id.to_string(), mode);
            previous != Some(mode)
        };
        if changed {
            self.bus.publish(RunEvent::new(
                run_id,
                "run.mode",
                json!({ "scope": "run", "interactionMode": mode }),
            ));
        }
    }

    pub async fn node_interaction_mode(&self, run_id: &str, node_id: &str) -> InteractionMode {
        self.node_modes
            .read()
            .await
            .get(&(run_id.to_string(), node_id.to_string()))
            .copied()
            .unwrap_or(InteractionMode::Autonomous)
    }

    pub async fn set_node_interaction_mode(
        &self,
        run_id: &str,
        node_id: &str,
        mode: InteractionMode,
    ) {
        let changed = {
            let mut modes = self.node_modes.write().await;
            let previous = modes.insert((run_id.to_string(), node_id.to_string()), mode);
            previous != Some(mode)
        };
        if changed {
            self.bus.publish(RunEvent::new(
                run_id,
                "run.mode",
                json!({ "scope": "node", "nodeId": node_id, "interactionMode": mode }),
            ));
        }
    }
}

fn format_chat_block(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let mut block = String::from("--- USER CHAT MESSAGES ---\n");
    for message in messages {
        let scope = message.node_id.as_deref().unwrap_or("run");
        let ts = message.created_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        block.push_str(&format!("[{scope}] [{ts}]: {}\n", message.content));
    }
    block.push_str("--- USER CHAT MESSAGES ---");
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager() -> (ChatManager, EventBus, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path());
        (ChatManager::new(bus.clone()), bus, dir)
    }

    fn send(run: &str, node: Option<&str>, content: &str) -> SendMessageParams {
        SendMessageParams {
            run_id: run.to_string(),
            node_id: node.map(str::to_string),
            content: content.to_string(),
            interrupt: true,
        }
    }

    #[tokio::test]
    async fn node_filter_includes_run_level_messages() {
        let (chat, _bus, _dir) = manager();
        chat.send_message(send("run_1", Some("node_a"), "for a")).await;
        chat.send_message(send("run_1", Some("node_b"), "for b")).await;
        chat.send_message(send("run_1", None, "for anyone")).await;

        let for_a = chat.pending_messages("run_1", Some("node_a")).await;
        let contents: Vec<&str> = for_a.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["for a", "for anyone"]);

        let all = chat.pending_messages("run_1", None).await;
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn consume_marks_processed_and_formats_block() {
        let (chat, _bus, _dir) = manager();
        chat.send_message(send("run_1", Some("node_a"), "first")).await;
        chat.send_message(send("run_1", None, "second")).await;

        let (block, consumed) = chat
            .consume_messages("run_1", |m| {
                m.node_id.as_deref() == Some("node_a") || m.node_id.is_none()
            })
            .await;
        assert_eq!(consumed.len(), 2);
        assert!(block.starts_with("--- USER CHAT MESSAGES ---"));
        assert!(block.contains("[node_a]"));
        assert!(block.contains("[run]"));
        assert!(block.contains("first"));
        assert!(block.contains("second"));

        let (block2, consumed2) = chat.consume_messages("run_1", |_| true).await;
        assert!(consumed2.is_empty());
        assert!(block2.is_empty());
    }

    #[tokio::test]
    async fn history_is_bounded_fifo() {
        let (chat, _bus, _dir) = manager();
        for n in 0..60 {
            chat.send_message(send("run_1", None, &format!("msg {n}"))).await;
        }
        let history = chat.history("run_1").await;
        assert_eq!(history.len(), 50);
        assert_eq!(history.first().unwrap().content, "msg 10");
        assert_eq!(history.last().unwrap().content, "msg 59");
    }

    #[tokio::test]
    async fn queued_flag_distinguishes_non_interrupt_messages() {
        let (chat, bus, _dir) = manager();
        let mut sub = bus.subscribe(Some("run_1".to_string()));
        chat.send_message(SendMessageParams {
            run_id: "run_1".to_string(),
            node_id: None,
            content: "later".to_string(),
            interrupt: false,
        })
        .await;
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, "message.user");
        assert_eq!(event.properties["queued"], true);
    }

    #[tokio::test]
    async fn interaction_mode_change_emits_once() {
        let (chat, bus, _dir) = manager();
        let mut sub = sub_events(&bus);

        chat.set_run_interaction_mode("run_1", InteractionMode::Manual).await;
        chat.set_run_interaction_mode("run_1", InteractionMode::Manual).await;
        chat.set_run_interaction_mode("run_1", InteractionMode::Autonomous).await;

        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_type, "run.mode");
        assert_eq!(first.properties["interactionMode"], "manual");
        let second = sub.recv().await.unwrap();
        assert_eq!(second.properties["interactionMode"], "autonomous");

        assert_eq!(
            chat.run_interaction_mode("run_1").await,
            InteractionMode::Autonomous
        );
        assert_eq!(
            chat.node_interaction_mode("run_1", "node_a").await,
            InteractionMode::Autonomous
        );
    }

    fn sub_events(bus: &EventBus) -> crate::event_bus::EventSubscription {
        bus.subscribe(Some("run_1".to_string()))
    }
}
