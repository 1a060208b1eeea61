// Per-run cooperative loop driving the graph: wakes nodes with input,
// consumes envelopes and chat, bounds concurrency with the fair turn
// limiter, and dispatches outputs along outgoing edges. The loop is the
// catch-site for everything the run engine does; no error escapes it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use vuhlp_core::{ApprovalQueue, CancellationRegistry, ChatManager, EventBus, RunPatch, RunStore};
use vuhlp_types::{
    ChatMessage, Envelope, EnvelopePayload, InteractionMode, NodeControl, NodeStatus,
    OrchestrationMode, Result, Run, RunEvent, RunStatus, VuhlpError,
};

use crate::executor::{NodeExecutor, TurnRequest};
use crate::limiter::TurnLimiter;
use crate::stall::StallDetector;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrency: usize,
    /// Consecutive scheduler-initiated turns a node may take without fresh
    /// user input before the run pauses.
    pub max_iterations: u32,
    pub tick: Duration,
    pub idle_tick: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            max_iterations: 3,
            tick: Duration::from_millis(200),
            idle_tick: Duration::from_millis(500),
        }
    }
}

struct RunLoopHandle {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct GraphScheduler {
    store: RunStore,
    bus: EventBus,
    chat: ChatManager,
    approvals: ApprovalQueue,
    cancellations: CancellationRegistry,
    executor: Arc<NodeExecutor>,
    stall: StallDetector,
    settings: SchedulerSettings,
    loops: Arc<RwLock<HashMap<String, RunLoopHandle>>>,
}

impl GraphScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: RunStore,
        bus: EventBus,
        chat: ChatManager,
        approvals: ApprovalQueue,
        cancellations: CancellationRegistry,
        executor: Arc<NodeExecutor>,
        stall: StallDetector,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            bus,
            chat,
            approvals,
            cancellations,
            executor,
            stall,
            settings,
            loops: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn is_running(&self, run_id: &str) -> bool {
        self.loops.read().await.contains_key(run_id)
    }

    /// Starts the per-run loop. The run transitions to `running`.
    pub async fn start(&self, run_id: &str) -> Result<()> {
        if self.is_running(run_id).await {
            return Err(VuhlpError::InvalidOperation(format!(
                "run {run_id} is already scheduled"
            )));
        }
        self.store.get_run(run_id).await?;

        let cancel = self.cancellations.create(run_id).await;
        let (pause_tx, pause_rx) = watch::channel(false);
        self.loops.write().await.insert(
            run_id.to_string(),
            RunLoopHandle {
                cancel: cancel.clone(),
                pause: pause_tx,
            },
        );

        let run = self
            .store
            .patch_run(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Running),
                    ..RunPatch::default()
                },
            )
            .await?;
        self.bus.publish(RunEvent::new(
            run_id,
            "run.patch",
            json!({ "status": run.status }),
        ));

        let scheduler = self.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            scheduler.run_loop(run_id.clone(), cancel, pause_rx).await;
            scheduler.loops.write().await.remove(&run_id);
            tracing::debug!(%run_id, "scheduler loop exited");
        });
        Ok(())
    }

    /// Installs the pause handle. In-flight turns run to completion.
    pub async fn pause(&self, run_id: &str) -> Result<()> {
        {
            let loops = self.loops.read().await;
            let handle = loops
                .get(run_id)
                .ok_or_else(|| VuhlpError::NotFound(format!("scheduler for run {run_id}")))?;
            let _ = handle.pause.send(true);
        }
        let run = self
            .store
            .patch_run(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Paused),
                    ..RunPatch::default()
                },
            )
            .await?;
        self.bus.publish(RunEvent::new(
            run_id,
            "run.patch",
            json!({ "status": run.status }),
        ));
        Ok(())
    }

    /// Releases the pause handle (also the stall-initiated pause).
    pub async fn resume(&self, run_id: &str) -> Result<()> {
        let run = self
            .store
            .patch_run(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Running),
                    ..RunPatch::default()
                },
            )
            .await?;
        self.bus.publish(RunEvent::new(
            run_id,
            "run.patch",
            json!({ "status": run.status }),
        ));
        let loops = self.loops.read().await;
        if let Some(handle) = loops.get(run_id) {
            let _ = handle.pause.send(false);
        }
        Ok(())
    }

    /// Aborts the loop, cancels in-flight turn tokens and resolves pending
    /// approvals as denied ("stopped"). In-flight turns observe their
    /// cancellation token and finish as cancelled.
    pub async fn stop(&self, run_id: &str) -> Result<()> {
        let run = self
            .store
            .patch_run(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Stopped),
                    ..RunPatch::default()
                },
            )
            .await?;
        self.bus.publish(RunEvent::new(
            run_id,
            "run.patch",
            json!({ "status": run.status }),
        ));

        // Turn tokens first, so an approval waiter that wakes up observes
        // its cancellation before resuming the stream.
        self.cancellations.cancel_prefix(run_id).await;
        let denied = self.approvals.cancel_for_run(run_id).await;
        if denied > 0 {
            tracing::info!(run_id, denied, "denied pending approvals on stop");
        }

        if let Some(handle) = self.loops.read().await.get(run_id) {
            handle.cancel.cancel();
            let _ = handle.pause.send(false);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loop body
    // ------------------------------------------------------------------

    async fn run_loop(
        &self,
        run_id: String,
        cancel: CancellationToken,
        mut pause_rx: watch::Receiver<bool>,
    ) {
        let limiter = TurnLimiter::new(self.settings.max_concurrency);
        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let turns_without_input: Arc<Mutex<HashMap<String, u32>>> =
            Arc::new(Mutex::new(HashMap::new()));

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Pause handle: wait for release or abort.
            while *pause_rx.borrow() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = pause_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            let run = match self.store.get_run(&run_id).await {
                Ok(run) => run,
                Err(_) => break,
            };
            match run.status {
                RunStatus::Paused => {
                    if !sleep_or_cancel(&cancel, self.settings.tick).await {
                        break;
                    }
                    continue;
                }
                RunStatus::Stopped | RunStatus::Failed => break,
                _ => {}
            }

            // INTERACTIVE runs idle until the user says something.
            let interactive = run.mode == OrchestrationMode::Interactive
                || self.chat.run_interaction_mode(&run_id).await == InteractionMode::Manual;
            let pending_chat = self.chat.pending_messages(&run_id, None).await;
            let in_flight_count = in_flight.lock().await.len();
            if interactive && pending_chat.is_empty() && in_flight_count == 0 {
                if !sleep_or_cancel(&cancel, self.settings.idle_tick).await {
                    break;
                }
                continue;
            }

            self.wake_for_chat(&run, &pending_chat).await;
            self.wake_for_envelopes(&run).await;
            self.refresh_inboxes(&run_id).await;

            // Re-read after wake-ups so the ready scan sees fresh statuses.
            let run = match self.store.get_run(&run_id).await {
                Ok(run) => run,
                Err(_) => break,
            };
            if run.status == RunStatus::Completed
                && run.nodes.values().any(|n| n.status == NodeStatus::Queued)
            {
                // New input re-activates a completed run.
                if let Ok(updated) = self
                    .store
                    .patch_run(
                        &run_id,
                        RunPatch {
                            status: Some(RunStatus::Running),
                            ..RunPatch::default()
                        },
                    )
                    .await
                {
                    self.bus.publish(RunEvent::new(
                        &run_id,
                        "run.patch",
                        json!({ "status": updated.status }),
                    ));
                }
            }

            let ready: Vec<String> = {
                let in_flight = in_flight.lock().await;
                run.nodes
                    .values()
                    .filter(|n| n.status == NodeStatus::Queued && !in_flight.contains(&n.id))
                    .map(|n| n.id.clone())
                    .collect()
            };

            for node_id in ready {
                if cancel.is_cancelled() {
                    break;
                }

                let spent = turns_without_input
                    .lock()
                    .await
                    .get(&node_id)
                    .copied()
                    .unwrap_or(0);
                if spent >= self.settings.max_iterations {
                    tracing::warn!(
                        %run_id,
                        %node_id,
                        spent,
                        "iteration budget exhausted without user input; pausing run"
                    );
                    if let Ok(updated) = self
                        .store
                        .patch_run(
                            &run_id,
                            RunPatch {
                                status: Some(RunStatus::Paused),
                                ..RunPatch::default()
                            },
                        )
                        .await
                    {
                        self.bus.publish(RunEvent::new(
                            &run_id,
                            "run.patch",
                            json!({ "status": updated.status, "reason": "iteration_budget" }),
                        ));
                    }
                    break;
                }

                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = limiter.acquire() => permit,
                };
                in_flight.lock().await.insert(node_id.clone());

                let scheduler = self.clone();
                let run_id = run_id.clone();
                let run_cancel = cancel.clone();
                let in_flight = in_flight.clone();
                let turns_without_input = turns_without_input.clone();
                tokio::spawn(async move {
                    scheduler
                        .execute_node_turn(&run_id, &node_id, run_cancel, turns_without_input)
                        .await;
                    in_flight.lock().await.remove(&node_id);
                    drop(permit);
                });
            }

            if in_flight.lock().await.is_empty() {
                self.maybe_complete_run(&run_id).await;
            }

            if !sleep_or_cancel(&cancel, self.settings.tick).await {
                break;
            }
        }
    }

    async fn execute_node_turn(
        &self,
        run_id: &str,
        node_id: &str,
        run_cancel: CancellationToken,
        turns_without_input: Arc<Mutex<HashMap<String, u32>>>,
    ) {
        let envelopes = match self.store.consume_envelopes_for(run_id, node_id).await {
            Ok(envelopes) => envelopes,
            Err(err) => {
                tracing::error!(run_id, node_id, error = %err, "failed to consume envelopes");
                Vec::new()
            }
        };

        let chat_context = match self.store.get_run(run_id).await {
            Ok(run) => {
                let selector = adoption_selector(&run, node_id);
                let (block, consumed) = self.chat.consume_messages(run_id, selector).await;
                {
                    let mut turns = turns_without_input.lock().await;
                    if consumed.is_empty() {
                        *turns.entry(node_id.to_string()).or_insert(0) += 1;
                    } else {
                        turns.insert(node_id.to_string(), 0);
                        // Fresh user input also resets the stall window.
                        self.stall.reset_node(run_id, node_id);
                    }
                }
                (!block.is_empty()).then_some(block)
            }
            Err(_) => None,
        };

        if let Ok(count) = self.store.refresh_inbox(run_id, node_id, 0).await {
            self.bus.publish(RunEvent::new(
                run_id,
                "node.patch",
                json!({ "nodeId": node_id, "inboxCount": count }),
            ));
        }

        let turn_cancel = run_cancel.child_token();
        let turn_key = CancellationRegistry::turn_key(run_id, node_id);
        self.cancellations.register(&turn_key, turn_cancel.clone()).await;

        let outcome = self
            .executor
            .run_turn(TurnRequest {
                run_id: run_id.to_string(),
                node_id: node_id.to_string(),
                envelopes,
                chat_context,
                cancel: turn_cancel,
            })
            .await;
        self.cancellations.remove(&turn_key).await;

        match outcome {
            Ok(outcome) => {
                if outcome.status == NodeStatus::Completed {
                    if let Some(output) = &outcome.output {
                        self.dispatch_output(run_id, node_id, output).await;
                    }
                }
            }
            Err(err) => {
                tracing::error!(run_id, node_id, error = %err, "node turn errored");
            }
        }
    }

    /// One envelope per outgoing edge, FIFO; wakes each target unless it is
    /// under manual control.
    async fn dispatch_output(&self, run_id: &str, from_node: &str, output: &str) {
        let run = match self.store.get_run(run_id).await {
            Ok(run) => run,
            Err(_) => return,
        };

        for edge in run.edges.values() {
            let target = if edge.from_node_id == from_node {
                edge.to_node_id.clone()
            } else if edge.bidirectional && edge.to_node_id == from_node {
                edge.from_node_id.clone()
            } else {
                continue;
            };

            let envelope = Envelope::handoff(from_node, &target, EnvelopePayload::message(output));
            match self.store.push_envelope(run_id, &edge.id, envelope.clone()).await {
                Ok(()) => {
                    self.bus.publish(RunEvent::new(
                        run_id,
                        "handoff.sent",
                        json!({ "edgeId": edge.id, "envelope": envelope }),
                    ));
                }
                Err(err) => {
                    // Dispatch failure skips the offending edge; the source
                    // node's turn is unaffected.
                    tracing::warn!(run_id, edge_id = %edge.id, error = %err, "envelope dispatch failed");
                    continue;
                }
            }

            match self.store.get_node(run_id, &target).await {
                Ok(node) => {
                    if node.control == NodeControl::Manual {
                        continue;
                    }
                    if !matches!(node.status, NodeStatus::Queued | NodeStatus::Running) {
                        self.set_queued(run_id, &target).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(run_id, target = %target, error = %err, "handoff target missing");
                }
            }
        }
    }

    /// The wake-up rule: targets of unprocessed chat become queued; orphan
    /// (run-level or dead-target) messages wake the root orchestrator, or
    /// the lowest-id active node once the root is terminal.
    async fn wake_for_chat(&self, run: &Run, pending: &[ChatMessage]) {
        let mut wake: Vec<String> = Vec::new();
        let mut has_orphans = false;

        for message in pending {
            match message.node_id.as_deref() {
                Some(target) if run.nodes.contains_key(target) => {
                    if !wake.iter().any(|w| w == target) {
                        wake.push(target.to_string());
                    }
                }
                _ => has_orphans = true,
            }
        }

        if has_orphans {
            let adopter = if root_is_terminal(run) {
                lowest_adoptable(run)
            } else {
                run.root_node_id.clone()
            };
            if let Some(adopter) = adopter {
                if !wake.iter().any(|w| w == &adopter) {
                    wake.push(adopter);
                }
            }
        }

        for node_id in wake {
            let Some(node) = run.nodes.get(&node_id) else {
                continue;
            };
            if matches!(node.status, NodeStatus::Queued | NodeStatus::Running) {
                continue;
            }
            self.set_queued(&run.id, &node_id).await;
        }
    }

    /// A handoff delivered while its target was mid-turn leaves envelopes
    /// behind; this scan re-queues any auto node with pending input.
    async fn wake_for_envelopes(&self, run: &Run) {
        let mut targets: Vec<String> = Vec::new();
        for edge in run.edges.values() {
            for envelope in &edge.pending_envelopes {
                if !targets.iter().any(|t| t == &envelope.to_node_id) {
                    targets.push(envelope.to_node_id.clone());
                }
            }
        }
        for node_id in targets {
            let Some(node) = run.nodes.get(&node_id) else {
                continue;
            };
            if node.control == NodeControl::Manual {
                continue;
            }
            if matches!(node.status, NodeStatus::Queued | NodeStatus::Running) {
                continue;
            }
            self.set_queued(&run.id, &node_id).await;
        }
    }

    async fn set_queued(&self, run_id: &str, node_id: &str) {
        match self
            .store
            .set_node_status(run_id, node_id, NodeStatus::Queued)
            .await
        {
            Ok(_) => {
                self.bus.publish(RunEvent::new(
                    run_id,
                    "node.patch",
                    json!({ "nodeId": node_id, "status": NodeStatus::Queued }),
                ));
            }
            Err(err) => {
                tracing::warn!(run_id, node_id, error = %err, "failed to queue node");
            }
        }
    }

    /// Keeps `inbox_count` equal to pending envelopes plus chat accepted by
    /// the node's adoption selector; publishes changes only.
    async fn refresh_inboxes(&self, run_id: &str) {
        let Ok(run) = self.store.get_run(run_id).await else {
            return;
        };
        for node in run.nodes.values() {
            let selector = adoption_selector(&run, &node.id);
            let chat_count = self.chat.pending_matching(run_id, selector).await.len();
            if let Ok(count) = self.store.refresh_inbox(run_id, &node.id, chat_count).await {
                if count != node.inbox_count {
                    self.bus.publish(RunEvent::new(
                        run_id,
                        "node.patch",
                        json!({ "nodeId": node.id, "inboxCount": count }),
                    ));
                }
            }
        }
    }

    /// A running run with every node terminal and nothing queued anywhere
    /// has finished its work.
    async fn maybe_complete_run(&self, run_id: &str) {
        let Ok(run) = self.store.get_run(run_id).await else {
            return;
        };
        if run.status != RunStatus::Running || run.nodes.is_empty() {
            return;
        }
        let all_terminal = run.nodes.values().all(|n| n.status.is_terminal());
        if !all_terminal {
            return;
        }
        let envelopes_pending = run
            .edges
            .values()
            .any(|e| !e.pending_envelopes.is_empty());
        let chat_pending = !self.chat.pending_messages(run_id, None).await.is_empty();
        if envelopes_pending || chat_pending {
            return;
        }
        if let Ok(updated) = self
            .store
            .patch_run(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Completed),
                    ..RunPatch::default()
                },
            )
            .await
        {
            self.bus.publish(RunEvent::new(
                run_id,
                "run.patch",
                json!({ "status": updated.status }),
            ));
        }
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Root terminality for orphan adoption. Cancelled roots keep their claim
/// until deleted.
fn root_is_terminal(run: &Run) -> bool {
    match run.root_node() {
        Some(root) => matches!(
            root.status,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        ),
        None => true,
    }
}

/// Lowest-id node eligible to adopt orphans once the root is terminal:
/// queued/running first, completed (re-activatable) as fallback.
fn lowest_adoptable(run: &Run) -> Option<String> {
    let root = run.root_node_id.as_deref();
    if let Some(node) = run.nodes.values().find(|n| {
        Some(n.id.as_str()) != root
            && matches!(n.status, NodeStatus::Queued | NodeStatus::Running)
    }) {
        return Some(node.id.clone());
    }
    run.nodes
        .values()
        .find(|n| Some(n.id.as_str()) != root && n.status == NodeStatus::Completed)
        .map(|n| n.id.clone())
}

/// Selector the scheduler hands to `consume_messages`: direct match, root
/// adoption of run-level messages, and lowest-active adoption of orphans
/// once the root is terminal.
pub fn adoption_selector(run: &Run, executing_node: &str) -> impl Fn(&ChatMessage) -> bool {
    let executing = executing_node.to_string();
    let root_terminal = root_is_terminal(run);
    let is_root = run.root_node_id.as_deref() == Some(executing_node);
    let is_lowest = lowest_adoptable(run).as_deref() == Some(executing_node);
    let existing: HashSet<String> = run.nodes.keys().cloned().collect();
    let terminal: HashSet<String> = run
        .nodes
        .values()
        .filter(|n| n.status.is_terminal())
        .map(|n| n.id.clone())
        .collect();

    move |message: &ChatMessage| match message.node_id.as_deref() {
        Some(target) if target == executing => true,
        None => {
            if root_terminal {
                is_lowest
            } else {
                is_root
            }
        }
        Some(target) => {
            let orphaned = !existing.contains(target) || terminal.contains(target);
            root_terminal && orphaned && is_lowest
        }
    }
}
