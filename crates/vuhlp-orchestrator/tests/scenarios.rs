// End-to-end scheduler scenarios driven by the mock provider.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::{tempdir, TempDir};

use vuhlp_core::{
    ApprovalQueue, CancellationRegistry, ChatManager, EventBus, EventSubscription, RoleRegistry,
    RunStore, SendMessageParams, SessionRegistry,
};
use vuhlp_orchestrator::{
    GraphScheduler, NodeExecutor, SchedulerSettings, StallDetector,
};
use vuhlp_providers::{MockProvider, ProviderRegistry, ToolDecision};
use vuhlp_types::{
    ApprovalStatus, Edge, EdgeType, GlobalMode, Node, NodeStatus, OrchestrationMode, RunEvent,
    RunStatus, ToolRisk,
};

struct Harness {
    _dir: TempDir,
    bus: EventBus,
    store: RunStore,
    chat: ChatManager,
    approvals: ApprovalQueue,
    scheduler: GraphScheduler,
    providers: ProviderRegistry,
}

async fn harness(approval_timeout_ms: Option<u64>) -> Harness {
    let dir = tempdir().unwrap();
    let bus = EventBus::new(dir.path());
    let store = RunStore::new(dir.path());
    let chat = ChatManager::new(bus.clone());
    let approvals = ApprovalQueue::new(bus.clone());
    let sessions = SessionRegistry::new();
    let cancellations = CancellationRegistry::new();
    let providers = ProviderRegistry::new();
    let roles = RoleRegistry::new(dir.path()).await.unwrap();
    let stall = StallDetector::new();

    let executor = Arc::new(
        NodeExecutor::new(
            store.clone(),
            bus.clone(),
            approvals.clone(),
            sessions.clone(),
            providers.clone(),
            roles,
            stall.clone(),
        )
        .with_approval_timeout_ms(approval_timeout_ms),
    );

    let settings = SchedulerSettings {
        max_concurrency: 3,
        max_iterations: 5,
        tick: Duration::from_millis(50),
        idle_tick: Duration::from_millis(100),
    };
    let scheduler = GraphScheduler::new(
        store.clone(),
        bus.clone(),
        chat.clone(),
        approvals.clone(),
        cancellations,
        executor,
        stall,
        settings,
    );

    Harness {
        _dir: dir,
        bus,
        store,
        chat,
        approvals,
        scheduler,
        providers,
    }
}

async fn register_mock(harness: &Harness, name: &str) -> Arc<MockProvider> {
    let provider = Arc::new(MockProvider::named(name));
    harness.providers.register(provider.clone()).await;
    provider
}

fn node_with_id(id: &str, provider: &str) -> Node {
    let mut node = Node::new(id, "implementer", provider);
    node.id = id.to_string();
    node
}

async fn wait_for<F, Fut>(mut check: F, timeout_ms: u64, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn drain_events(sub: &mut EventSubscription) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), sub.recv()).await
    {
        events.push(event);
    }
    events
}

fn event_types(events: &[RunEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

// Scenario: a single mock-backed node runs one turn and completes, leaving
// the output on the node, an output artifact, and the expected event trail.
#[tokio::test]
async fn single_node_completion() {
    let h = harness(None).await;
    let mock = register_mock(&h, "mock").await;
    mock.push_script(vec![
        json!({ "type": "agent_message", "text": "ok" }),
        json!({ "type": "turn_complete", "output": "ok" }),
    ])
    .await;

    let run = h
        .store
        .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
        .await;
    h.store
        .add_node(&run.id, node_with_id("node_a", "mock"))
        .await
        .unwrap();

    let mut sub = h.bus.subscribe(Some(run.id.clone()));
    h.scheduler.start(&run.id).await.unwrap();

    let store = h.store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store.clone();
            let run_id = run_id.clone();
            async move {
                store
                    .get_node(&run_id, "node_a")
                    .await
                    .map(|n| n.status == NodeStatus::Completed)
                    .unwrap_or(false)
            }
        },
        5_000,
        "node completion",
    )
    .await;

    let node = h.store.get_node(&run.id, "node_a").await.unwrap();
    assert_eq!(node.last_output.as_deref(), Some("ok"));
    assert_eq!(node.turn_count, 1);

    let snapshot = h.store.get_run(&run.id).await.unwrap();
    assert!(
        !snapshot.artifacts.is_empty(),
        "completed turn should leave an output artifact"
    );

    let events = drain_events(&mut sub).await;
    let types = event_types(&events);
    assert!(types.contains(&"turn.started"));
    assert!(types.contains(&"message.assistant.final"));
    assert!(types.contains(&"turn.completed"));
    let final_event = events
        .iter()
        .find(|e| e.event_type == "message.assistant.final")
        .unwrap();
    assert_eq!(final_event.properties["content"], "ok");

    h.scheduler.stop(&run.id).await.unwrap();
}

// Scenario: a gated node proposes a destructive shell command; the queue
// classifies it high, the user denies it, the tool is aborted and the turn
// still completes.
#[tokio::test]
async fn approval_gating_denial() {
    let h = harness(None).await;
    let mock = register_mock(&h, "mock").await;
    mock.push_script(vec![
        json!({ "type": "tool_call", "id": "t1", "name": "Bash",
                "args": { "command": "rm -rf /tmp/x" } }),
        json!({ "type": "agent_message", "text": "done" }),
        json!({ "type": "turn_complete", "output": "done" }),
    ])
    .await;

    let run = h
        .store
        .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
        .await;
    h.store
        .add_node(&run.id, node_with_id("node_a", "mock"))
        .await
        .unwrap();

    let mut sub = h.bus.subscribe(Some(run.id.clone()));
    h.scheduler.start(&run.id).await.unwrap();

    let approvals = h.approvals.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let approvals = approvals.clone();
            let run_id = run_id.clone();
            async move { !approvals.get_pending_for_run(&run_id).await.is_empty() }
        },
        5_000,
        "pending approval",
    )
    .await;

    let pending = h.approvals.get_pending_for_run(&run.id).await;
    assert_eq!(pending[0].tool.risk, ToolRisk::High);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.approvals.deny(&pending[0].id, Some("risky".to_string())).await);

    let store = h.store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store.clone();
            let run_id = run_id.clone();
            async move {
                store
                    .get_node(&run_id, "node_a")
                    .await
                    .map(|n| n.status == NodeStatus::Completed)
                    .unwrap_or(false)
            }
        },
        5_000,
        "node completion after denial",
    )
    .await;

    assert_eq!(
        mock.resolutions().await,
        vec![(
            "t1".to_string(),
            ToolDecision::Denied {
                feedback: Some("risky".to_string())
            }
        )]
    );

    let events = drain_events(&mut sub).await;
    let requested: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "approval.requested")
        .collect();
    assert_eq!(requested.len(), 1);
    let resolved = events
        .iter()
        .find(|e| e.event_type == "approval.resolved")
        .unwrap();
    assert_eq!(resolved.properties["status"], "denied");
    assert_eq!(resolved.properties["feedback"], "risky");

    h.scheduler.stop(&run.id).await.unwrap();
}

// Scenario: same gate, but nobody answers; the configured timeout resolves
// the approval as timeout and the turn continues.
#[tokio::test]
async fn approval_timeout_resolves_without_user() {
    let h = harness(Some(400)).await;
    let mock = register_mock(&h, "mock").await;
    mock.push_script(vec![
        json!({ "type": "tool_call", "id": "t1", "name": "Bash",
                "args": { "command": "rm -rf /tmp/x" } }),
        json!({ "type": "turn_complete", "output": "after timeout" }),
    ])
    .await;

    let run = h
        .store
        .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
        .await;
    h.store
        .add_node(&run.id, node_with_id("node_a", "mock"))
        .await
        .unwrap();

    h.scheduler.start(&run.id).await.unwrap();

    let store = h.store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store.clone();
            let run_id = run_id.clone();
            async move {
                store
                    .get_node(&run_id, "node_a")
                    .await
                    .map(|n| n.status == NodeStatus::Completed)
                    .unwrap_or(false)
            }
        },
        5_000,
        "node completion after timeout",
    )
    .await;

    let all = h.approvals.get_all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, ApprovalStatus::Timeout);
    let feedback = all[0]
        .resolution
        .as_ref()
        .and_then(|r| r.feedback.clone())
        .unwrap();
    assert!(feedback.contains("timed out"));

    let resolutions = mock.resolutions().await;
    assert!(matches!(resolutions[0].1, ToolDecision::Denied { .. }));

    h.scheduler.stop(&run.id).await.unwrap();
}

// Scenario: run-level messages go to the live root; once the root is
// terminal the lowest-id active node adopts them.
#[tokio::test]
async fn orphan_adoption_moves_to_lowest_active_node() {
    let h = harness(None).await;
    register_mock(&h, "mock").await;

    let run = h
        .store
        .create_run(OrchestrationMode::Interactive, GlobalMode::Implementation, None)
        .await;
    h.store
        .add_node(&run.id, node_with_id("node_a_root", "mock"))
        .await
        .unwrap();
    h.store
        .add_node(&run.id, node_with_id("node_b_child", "mock"))
        .await
        .unwrap();
    h.store.set_root_node(&run.id, "node_a_root").await.unwrap();

    h.chat
        .send_message(SendMessageParams {
            run_id: run.id.clone(),
            node_id: None,
            content: "Hello".to_string(),
            interrupt: true,
        })
        .await;

    h.scheduler.start(&run.id).await.unwrap();

    let store = h.store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store.clone();
            let run_id = run_id.clone();
            async move {
                let root = store.get_node(&run_id, "node_a_root").await;
                let child = store.get_node(&run_id, "node_b_child").await;
                matches!(
                    (root, child),
                    (Ok(r), Ok(c))
                        if r.status == NodeStatus::Completed && c.status == NodeStatus::Completed
                )
            }
        },
        5_000,
        "first round of turns",
    )
    .await;

    let root = h.store.get_node(&run.id, "node_a_root").await.unwrap();
    assert!(
        root.last_output.as_deref().unwrap_or("").contains("Hello"),
        "live root consumes the run-level message"
    );
    let child = h.store.get_node(&run.id, "node_b_child").await.unwrap();
    assert!(!child.last_output.as_deref().unwrap_or("").contains("Hello"));
    let root_turns = root.turn_count;

    h.chat
        .send_message(SendMessageParams {
            run_id: run.id.clone(),
            node_id: None,
            content: "Again".to_string(),
            interrupt: true,
        })
        .await;

    let store = h.store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store.clone();
            let run_id = run_id.clone();
            async move {
                store
                    .get_node(&run_id, "node_b_child")
                    .await
                    .map(|c| c.last_output.as_deref().unwrap_or("").contains("Again"))
                    .unwrap_or(false)
            }
        },
        5_000,
        "child adopting the orphan message",
    )
    .await;

    let root = h.store.get_node(&run.id, "node_a_root").await.unwrap();
    assert_eq!(
        root.turn_count, root_turns,
        "terminal root must not be woken for orphans"
    );

    h.scheduler.stop(&run.id).await.unwrap();
}

// Scenario: A -> B handoff. A's output travels as an envelope, B wakes,
// consumes it, and the edge drains.
#[tokio::test]
async fn handoff_dispatch_wakes_target() {
    let h = harness(None).await;
    let mock_a = register_mock(&h, "mock_a").await;
    register_mock(&h, "mock_b").await;
    mock_a
        .push_script(vec![json!({ "type": "turn_complete", "output": "spec done" })])
        .await;

    let run = h
        .store
        .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
        .await;
    h.store
        .add_node(&run.id, node_with_id("node_a", "mock_a"))
        .await
        .unwrap();
    h.store
        .add_node(&run.id, node_with_id("node_b", "mock_b"))
        .await
        .unwrap();
    let mut edge = Edge::new("node_a", "node_b", EdgeType::Handoff);
    edge.id = "edge_ab".to_string();
    h.store.add_edge(&run.id, edge).await.unwrap();

    let mut sub = h.bus.subscribe(Some(run.id.clone()));
    h.scheduler.start(&run.id).await.unwrap();

    let store = h.store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store.clone();
            let run_id = run_id.clone();
            async move {
                store
                    .get_node(&run_id, "node_b")
                    .await
                    .map(|n| n.last_output.as_deref().unwrap_or("").contains("spec done"))
                    .unwrap_or(false)
            }
        },
        5_000,
        "B consuming A's handoff",
    )
    .await;

    let snapshot = h.store.get_run(&run.id).await.unwrap();
    assert!(
        snapshot.edges["edge_ab"].pending_envelopes.is_empty(),
        "consumed envelopes leave the edge"
    );

    let events = drain_events(&mut sub).await;
    let handoff = events
        .iter()
        .find(|e| e.event_type == "handoff.sent")
        .expect("handoff.sent event");
    assert_eq!(handoff.properties["envelope"]["payload"]["message"], "spec done");
    assert_eq!(handoff.properties["edgeId"], "edge_ab");

    h.scheduler.stop(&run.id).await.unwrap();
}

// Scenario: stopping a run exits the loop, denies the blocked approval with
// "stopped" feedback, cancels the in-flight turn and leaves the run stopped.
#[tokio::test]
async fn stop_cancels_approvals_and_turns() {
    let h = harness(None).await;
    let mock_a = register_mock(&h, "mock_a").await;
    register_mock(&h, "mock_rest").await;
    mock_a
        .push_script(vec![json!({ "type": "tool_call", "id": "t1", "name": "Bash",
                                  "args": { "command": "sleep 60" } })])
        .await;

    let run = h
        .store
        .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
        .await;
    h.store
        .add_node(&run.id, node_with_id("node_a", "mock_a"))
        .await
        .unwrap();
    h.store
        .add_node(&run.id, node_with_id("node_b", "mock_rest"))
        .await
        .unwrap();
    h.store
        .add_node(&run.id, node_with_id("node_c", "mock_rest"))
        .await
        .unwrap();

    h.scheduler.start(&run.id).await.unwrap();

    let approvals = h.approvals.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let approvals = approvals.clone();
            let run_id = run_id.clone();
            async move { !approvals.get_pending_for_run(&run_id).await.is_empty() }
        },
        5_000,
        "approval blocking node_a",
    )
    .await;

    h.scheduler.stop(&run.id).await.unwrap();

    let scheduler = h.scheduler.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let scheduler = scheduler.clone();
            let run_id = run_id.clone();
            async move { !scheduler.is_running(&run_id).await }
        },
        5_000,
        "scheduler loop exit",
    )
    .await;

    let store = h.store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store.clone();
            let run_id = run_id.clone();
            async move {
                store
                    .get_node(&run_id, "node_a")
                    .await
                    .map(|n| n.status == NodeStatus::Cancelled)
                    .unwrap_or(false)
            }
        },
        5_000,
        "in-flight turn cancellation",
    )
    .await;

    let snapshot = h.store.get_run(&run.id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Stopped);

    let all = h.approvals.get_all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, ApprovalStatus::Denied);
    assert!(all[0]
        .resolution
        .as_ref()
        .and_then(|r| r.feedback.as_deref())
        .unwrap()
        .contains("stopped"));
}

// Agent management: a delegating node spawns a child and the engine wires
// an edge to it when the node may manage its own edges.
#[tokio::test]
async fn spawn_node_creates_child_with_edge() {
    let h = harness(None).await;
    let mock = register_mock(&h, "mock").await;
    mock.push_script(vec![
        json!({ "type": "tool_call", "id": "t1", "name": "spawn_node",
                "args": { "label": "worker", "role": "implementer" } }),
        json!({ "type": "turn_complete", "output": "delegated" }),
    ])
    .await;

    let run = h
        .store
        .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
        .await;
    let mut node = node_with_id("node_a", "mock");
    node.permissions.agent_management_requires_approval = false;
    node.capabilities.edge_management = vuhlp_types::EdgeScope::SelfOnly;
    h.store.add_node(&run.id, node).await.unwrap();

    h.scheduler.start(&run.id).await.unwrap();

    let store = h.store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store.clone();
            let run_id = run_id.clone();
            async move {
                store
                    .get_run(&run_id)
                    .await
                    .map(|r| r.nodes.len() == 2 && !r.edges.is_empty())
                    .unwrap_or(false)
            }
        },
        5_000,
        "spawned child and connecting edge",
    )
    .await;

    let snapshot = h.store.get_run(&run.id).await.unwrap();
    let child = snapshot
        .nodes
        .values()
        .find(|n| n.label == "worker")
        .expect("spawned node");
    assert_eq!(child.role, "implementer");
    let edge = snapshot.edges.values().next().unwrap();
    assert_eq!(edge.from_node_id, "node_a");
    assert_eq!(edge.to_node_id, child.id);
    // No approval queue traffic when agent management is unrestricted.
    assert!(h.approvals.get_all().await.is_empty());

    h.scheduler.stop(&run.id).await.unwrap();
}

// Agent management: send_handoff delivers an envelope directly, creating
// the missing edge, and the target consumes it on its next turn.
#[tokio::test]
async fn send_handoff_reaches_target_node() {
    let h = harness(None).await;
    let mock_a = register_mock(&h, "mock_a").await;
    register_mock(&h, "mock_b").await;
    mock_a
        .push_script(vec![
            json!({ "type": "tool_call", "id": "t1", "name": "send_handoff",
                    "args": { "toNodeId": "node_b", "message": "direct ping" } }),
            json!({ "type": "turn_complete" }),
        ])
        .await;

    let run = h
        .store
        .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
        .await;
    let mut sender = node_with_id("node_a", "mock_a");
    sender.permissions.agent_management_requires_approval = false;
    sender.capabilities.edge_management = vuhlp_types::EdgeScope::SelfOnly;
    h.store.add_node(&run.id, sender).await.unwrap();
    h.store
        .add_node(&run.id, node_with_id("node_b", "mock_b"))
        .await
        .unwrap();

    h.scheduler.start(&run.id).await.unwrap();

    let store = h.store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store.clone();
            let run_id = run_id.clone();
            async move {
                store
                    .get_node(&run_id, "node_b")
                    .await
                    .map(|n| n.last_output.as_deref().unwrap_or("").contains("direct ping"))
                    .unwrap_or(false)
            }
        },
        5_000,
        "target consuming the direct handoff",
    )
    .await;

    let snapshot = h.store.get_run(&run.id).await.unwrap();
    assert!(snapshot
        .edges
        .values()
        .any(|e| e.from_node_id == "node_a" && e.to_node_id == "node_b"));

    h.scheduler.stop(&run.id).await.unwrap();
}

// Boundary: max-concurrency 1 serializes turns in ascending node-id order.
#[tokio::test]
async fn max_concurrency_one_serializes_in_id_order() {
    let dir = tempdir().unwrap();
    let bus = EventBus::new(dir.path());
    let store = RunStore::new(dir.path());
    let chat = ChatManager::new(bus.clone());
    let approvals = ApprovalQueue::new(bus.clone());
    let sessions = SessionRegistry::new();
    let cancellations = CancellationRegistry::new();
    let providers = ProviderRegistry::new();
    providers.register(Arc::new(MockProvider::named("mock"))).await;
    let roles = RoleRegistry::new(dir.path()).await.unwrap();
    let stall = StallDetector::new();
    let executor = Arc::new(NodeExecutor::new(
        store.clone(),
        bus.clone(),
        approvals.clone(),
        sessions.clone(),
        providers.clone(),
        roles,
        stall.clone(),
    ));
    let scheduler = GraphScheduler::new(
        store.clone(),
        bus.clone(),
        chat.clone(),
        approvals,
        cancellations,
        executor,
        stall,
        SchedulerSettings {
            max_concurrency: 1,
            max_iterations: 5,
            tick: Duration::from_millis(50),
            idle_tick: Duration::from_millis(100),
        },
    );

    let run = store
        .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
        .await;
    for id in ["node_c", "node_a", "node_b"] {
        store.add_node(&run.id, node_with_id(id, "mock")).await.unwrap();
    }

    let mut sub = bus.subscribe(Some(run.id.clone()));
    scheduler.start(&run.id).await.unwrap();

    let store_c = store.clone();
    let run_id = run.id.clone();
    wait_for(
        || {
            let store = store_c.clone();
            let run_id = run_id.clone();
            async move {
                let Ok(run) = store.get_run(&run_id).await else {
                    return false;
                };
                run.nodes.values().all(|n| n.status == NodeStatus::Completed)
            }
        },
        5_000,
        "all three nodes completing",
    )
    .await;

    let events = drain_events(&mut sub).await;
    let started_order: Vec<String> = events
        .iter()
        .filter(|e| e.event_type == "turn.started")
        .map(|e| e.properties["nodeId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(started_order, vec!["node_a", "node_b", "node_c"]);

    scheduler.stop(&run.id).await.unwrap();
}
