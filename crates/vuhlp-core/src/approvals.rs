use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use vuhlp_types::{
    ApprovalRequest, ApprovalResolution, ApprovalStatus, RunEvent, ToolCall,
};

use crate::event_bus::EventBus;

/// Parameters for one approval gate.
#[derive(Debug, Clone)]
pub struct ApprovalParams {
    pub run_id: String,
    pub node_id: String,
    pub tool: ToolCall,
    pub context: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Per-tool-call gate. A `request_approval` call blocks until a resolver or
/// the timeout transitions the request out of pending; each request resolves
/// exactly once.
#[derive(Clone)]
pub struct ApprovalQueue {
    requests: Arc<RwLock<HashMap<String, ApprovalRequest>>>,
    order: Arc<RwLock<Vec<String>>>,
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<ApprovalResolution>>>>>,
    bus: EventBus,
    auto_deny_on_timeout: bool,
}

impl ApprovalQueue {
    pub fn new(bus: EventBus) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            order: Arc::new(RwLock::new(Vec::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
            bus,
            auto_deny_on_timeout: true,
        }
    }

    /// Disables the expiry timer; timed-out requests then stay pending.
    pub fn with_auto_deny_on_timeout(mut self, enabled: bool) -> Self {
        self.auto_deny_on_timeout = enabled;
        self
    }

    /// Registers the request, emits `approval.requested` and blocks until it
    /// is resolved. Cancelling the token resolves the request as denied with
    /// "stopped" feedback so the 1:1 requested/resolved pairing holds.
    pub async fn request_approval(
        &self,
        params: ApprovalParams,
        cancel: CancellationToken,
    ) -> ApprovalResolution {
        let timeout_ms = params.timeout_ms.filter(|ms| *ms > 0);
        let now = Utc::now();
        let request = ApprovalRequest {
            id: vuhlp_types::new_id("apr"),
            run_id: params.run_id.clone(),
            node_id: params.node_id.clone(),
            tool: params.tool.clone(),
            context: params.context.clone(),
            status: ApprovalStatus::Pending,
            created_at: now,
            resolved_at: None,
            timeout_ms,
            timeout_at: timeout_ms.map(|ms| now + Duration::milliseconds(ms as i64)),
            resolution: None,
        };
        let id = request.id.clone();

        let (tx, mut rx) = watch::channel(None);
        {
            self.requests.write().await.insert(id.clone(), request.clone());
            self.order.write().await.push(id.clone());
            self.waiters.write().await.insert(id.clone(), tx);
        }

        self.bus.publish(RunEvent::new(
            &params.run_id,
            "approval.requested",
            json!({
                "approvalId": id,
                "nodeId": params.node_id,
                "tool": params.tool,
                "context": params.context,
                "timeoutMs": timeout_ms,
            }),
        ));

        if let Some(ms) = timeout_ms {
            if self.auto_deny_on_timeout {
                let queue = self.clone();
                let timer_id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                    let feedback = format!("Approval timed out after {ms} ms");
                    queue
                        .resolve(&timer_id, ApprovalStatus::Timeout, None, Some(feedback))
                        .await;
                });
            }
        }

        loop {
            let current = rx.borrow().clone();
            if let Some(resolution) = current {
                self.waiters.write().await.remove(&id);
                return resolution;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.deny(&id, Some("stopped".to_string())).await;
                    // deny either won the race or someone else already
                    // resolved; either way the recorded resolution is final.
                    let recorded = self
                        .requests
                        .read()
                        .await
                        .get(&id)
                        .and_then(|r| r.resolution.clone());
                    self.waiters.write().await.remove(&id);
                    return recorded.unwrap_or(ApprovalResolution {
                        status: ApprovalStatus::Denied,
                        modified_args: None,
                        feedback: Some("stopped".to_string()),
                    });
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped without a value; treat as denial.
                        self.waiters.write().await.remove(&id);
                        return ApprovalResolution {
                            status: ApprovalStatus::Denied,
                            modified_args: None,
                            feedback: Some("approval channel closed".to_string()),
                        };
                    }
                }
            }
        }
    }

    pub async fn approve(&self, id: &str, feedback: Option<String>) -> bool {
        self.resolve(id, ApprovalStatus::Approved, None, feedback).await
    }

    pub async fn deny(&self, id: &str, feedback: Option<String>) -> bool {
        self.resolve(id, ApprovalStatus::Denied, None, feedback).await
    }

    pub async fn modify(&self, id: &str, modified_args: Value, feedback: Option<String>) -> bool {
        self.resolve(id, ApprovalStatus::Modified, Some(modified_args), feedback)
            .await
    }

    /// Pending -> terminal exactly once; returns false if the request is
    /// unknown or already resolved.
    async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        modified_args: Option<Value>,
        feedback: Option<String>,
    ) -> bool {
        let resolution = ApprovalResolution {
            status,
            modified_args,
            feedback,
        };
        let (run_id, node_id) = {
            let mut requests = self.requests.write().await;
            let Some(request) = requests.get_mut(id) else {
                return false;
            };
            if request.status.is_terminal() {
                return false;
            }
            request.status = status;
            request.resolved_at = Some(Utc::now());
            request.resolution = Some(resolution.clone());
            (request.run_id.clone(), request.node_id.clone())
        };

        self.bus.publish(RunEvent::new(
            &run_id,
            "approval.resolved",
            json!({
                "approvalId": id,
                "nodeId": node_id,
                "status": status,
                "modifiedArgs": resolution.modified_args,
                "feedback": resolution.feedback,
            }),
        ));

        if let Some(waiter) = self.waiters.read().await.get(id).cloned() {
            let _ = waiter.send(Some(resolution));
        }
        true
    }

    /// Denies all still-pending requests of a run; returns the count.
    pub async fn cancel_for_run(&self, run_id: &str) -> usize {
        let pending = self.pending_ids(|r| r.run_id == run_id).await;
        let mut cancelled = 0;
        for id in pending {
            if self.deny(&id, Some("run stopped".to_string())).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Denies all still-pending requests of a node; returns the count.
    pub async fn cancel_for_node(&self, node_id: &str) -> usize {
        let pending = self.pending_ids(|r| r.node_id == node_id).await;
        let mut cancelled = 0;
        for id in pending {
            if self.deny(&id, Some("node stopped".to_string())).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    async fn pending_ids(&self, filter: impl Fn(&ApprovalRequest) -> bool) -> Vec<String> {
        let requests = self.requests.read().await;
        let order = self.order.read().await;
        order
            .iter()
            .filter_map(|id| requests.get(id))
            .filter(|r| r.status == ApprovalStatus::Pending && filter(r))
            .map(|r| r.id.clone())
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<ApprovalRequest> {
        self.requests.read().await.get(id).cloned()
    }

    pub async fn get_pending(&self) -> Vec<ApprovalRequest> {
        self.collect(|r| r.status == ApprovalStatus::Pending).await
    }

    pub async fn get_pending_for_run(&self, run_id: &str) -> Vec<ApprovalRequest> {
        self.collect(|r| r.status == ApprovalStatus::Pending && r.run_id == run_id)
            .await
    }

    pub async fn get_pending_for_node(&self, node_id: &str) -> Vec<ApprovalRequest> {
        self.collect(|r| r.status == ApprovalStatus::Pending && r.node_id == node_id)
            .await
    }

    pub async fn get_all(&self) -> Vec<ApprovalRequest> {
        self.collect(|_| true).await
    }

    async fn collect(&self, filter: impl Fn(&ApprovalRequest) -> bool) -> Vec<ApprovalRequest> {
        let requests = self.requests.read().await;
        let order = self.order.read().await;
        order
            .iter()
            .filter_map(|id| requests.get(id))
            .filter(|r| filter(r))
            .cloned()
            .collect()
    }

    /// Removes terminal entries; returns how many were dropped.
    pub async fn clear_resolved(&self) -> usize {
        let mut requests = self.requests.write().await;
        let mut order = self.order.write().await;
        let before = requests.len();
        requests.retain(|_, r| r.status == ApprovalStatus::Pending);
        order.retain(|id| requests.contains_key(id));
        before - requests.len()
    }
}
