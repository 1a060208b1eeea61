// Core type definitions for the run engine: runs, nodes, edges, envelopes,
// chat, artifacts, prompts and approvals.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Run
// ============================================================================

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }
}

/// Whether the scheduler drives the graph autonomously or waits for the
/// user between turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrchestrationMode {
    Auto,
    Interactive,
}

/// Run-wide posture: planning restricts writes to documentation,
/// implementation allows code changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GlobalMode {
    Planning,
    Implementation,
}

/// A single execution of a user-defined agent graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub mode: OrchestrationMode,
    pub global_mode: GlobalMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered node-id -> node; iteration order is ascending id, which the
    /// scheduler relies on as its deterministic tie-break.
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub edges: BTreeMap<String, Edge>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
}

impl Run {
    pub fn new(mode: OrchestrationMode, global_mode: GlobalMode) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id("run"),
            status: RunStatus::Queued,
            mode,
            global_mode,
            created_at: now,
            updated_at: now,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            root_node_id: None,
            workspace_root: None,
        }
    }

    /// The root orchestrator, if set and still present in the graph.
    pub fn root_node(&self) -> Option<&Node> {
        self.root_node_id.as_ref().and_then(|id| self.nodes.get(id))
    }

    pub fn to_summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            status: self.status,
            mode: self.mode,
            global_mode: self.global_mode,
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Lightweight listing shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub status: RunStatus,
    pub mode: OrchestrationMode,
    pub global_mode: GlobalMode,
    pub node_count: usize,
    pub edge_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Node
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    /// Terminal for orphan-adoption purposes: the node will not consume
    /// input without being re-activated.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

/// Whether the scheduler may wake this node automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeControl {
    Auto,
    Manual,
}

/// Scope of edge management a node's tool calls may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeScope {
    None,
    #[serde(rename = "self")]
    SelfOnly,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapabilities {
    #[serde(default)]
    pub write_code: bool,
    #[serde(default)]
    pub write_docs: bool,
    #[serde(default)]
    pub run_commands: bool,
    #[serde(default)]
    pub delegate_only: bool,
    #[serde(default = "default_edge_scope")]
    pub edge_management: EdgeScope,
}

fn default_edge_scope() -> EdgeScope {
    EdgeScope::None
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            write_code: false,
            write_docs: true,
            run_commands: false,
            delegate_only: false,
            edge_management: EdgeScope::None,
        }
    }
}

/// Tool-call gating for the external CLI: `skip` auto-approves every
/// proposed tool, `gated` routes each proposal through the approval queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliPermissionMode {
    Skip,
    Gated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePermissions {
    pub cli_permissions: CliPermissionMode,
    #[serde(default)]
    pub agent_management_requires_approval: bool,
}

impl Default for NodePermissions {
    fn default() -> Self {
        Self {
            cli_permissions: CliPermissionMode::Gated,
            agent_management_requires_approval: true,
        }
    }
}

/// Handle onto the external tool session backing a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub reset_commands: Vec<String>,
}

/// A worker inside a run bound to one external command-line tool session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub label: String,
    pub role: String,
    pub provider: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
    #[serde(default)]
    pub permissions: NodePermissions,
    #[serde(default)]
    pub session: SessionDescriptor,
    pub control: NodeControl,
    #[serde(default)]
    pub turn_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
    /// Pending envelopes on incoming edges + queued chat for this node.
    #[serde(default)]
    pub inbox_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Node {
    pub fn new(label: impl Into<String>, role: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: crate::new_id("node"),
            label: label.into(),
            role: role.into(),
            provider: provider.into(),
            status: NodeStatus::Queued,
            capabilities: NodeCapabilities::default(),
            permissions: NodePermissions::default(),
            session: SessionDescriptor::default(),
            control: NodeControl::Auto,
            turn_count: 0,
            last_output: None,
            inbox_count: 0,
            summary: None,
        }
    }
}

// ============================================================================
// Edges & envelopes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Handoff,
    Report,
}

/// A directed channel carrying envelopes from one node to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    #[serde(default)]
    pub bidirectional: bool,
    pub edge_type: EdgeType,
    #[serde(default)]
    pub label: String,
    /// FIFO; envelopes accumulate until the target node consumes them.
    #[serde(default)]
    pub pending_envelopes: Vec<Envelope>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, edge_type: EdgeType) -> Self {
        Self {
            id: crate::new_id("edge"),
            from_node_id: from.into(),
            to_node_id: to.into(),
            bidirectional: false,
            edge_type,
            label: String::new(),
            pending_envelopes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Handoff,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseExpectation {
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopePayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    #[serde(default)]
    pub artifact_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EnvelopeStatus>,
    #[serde(default = "default_response_expectation")]
    pub response_expectation: ResponseExpectation,
}

fn default_response_expectation() -> ResponseExpectation {
    ResponseExpectation::None
}

impl EnvelopePayload {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            record: None,
            artifact_refs: Vec::new(),
            status: None,
            response_expectation: ResponseExpectation::None,
        }
    }
}

/// One message (handoff or signal) flowing along an edge; consumed exactly
/// once by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub kind: EnvelopeKind,
    pub from_node_id: String,
    pub to_node_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: EnvelopePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Envelope {
    pub fn handoff(from: impl Into<String>, to: impl Into<String>, payload: EnvelopePayload) -> Self {
        Self {
            id: crate::new_id("env"),
            kind: EnvelopeKind::Handoff,
            from_node_id: from.into(),
            to_node_id: to.into(),
            created_at: Utc::now(),
            payload,
            context_ref: None,
            meta: None,
        }
    }
}

// ============================================================================
// Chat
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// A user/assistant/system message addressed to a run or a specific node.
/// `node_id == None` means run-level; such messages are orphan candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub interrupted_execution: bool,
}

/// Per-run or per-node interaction mode stored by the chat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    Autonomous,
    Manual,
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Diff,
    Prompt,
    Log,
    Transcript,
    Contextpack,
    Report,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub kind: ArtifactKind,
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ArtifactMeta>,
}

// ============================================================================
// Pending prompts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    Orchestrator,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Pending,
    Sent,
    Cancelled,
}

/// An orchestrator-generated or user-edited prompt awaiting dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPrompt {
    pub id: String,
    pub run_id: String,
    pub target_node_id: String,
    pub source: PromptSource,
    pub content: String,
    pub status: PromptStatus,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Approvals & tools
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRisk {
    Low,
    Medium,
    High,
}

/// A tool proposed by the external agent during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub risk: ToolRisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Modified,
    Timeout,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The single resolution a waiter observes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResolution {
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// A gate awaiting human decision on a tool proposed by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub tool: ToolCall,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ApprovalResolution>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_iterate_in_ascending_order() {
        let mut run = Run::new(OrchestrationMode::Auto, GlobalMode::Implementation);
        for id in ["node_c", "node_a", "node_b"] {
            let mut node = Node::new(id, "implementer", "mock");
            node.id = id.to_string();
            run.nodes.insert(node.id.clone(), node);
        }
        let ids: Vec<&str> = run.nodes.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["node_a", "node_b", "node_c"]);
    }

    #[test]
    fn run_status_terminal_set() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn serde_round_trip_keeps_wire_names() {
        let node = Node::new("root", "orchestrator", "claude");
        let value = serde_json::to_value(&node).unwrap();
        assert!(value.get("inboxCount").is_some());
        assert_eq!(value["control"], "AUTO");
        assert_eq!(value["permissions"]["cliPermissions"], "gated");
        let back: Node = serde_json::from_value(value).unwrap();
        assert_eq!(back.label, "root");
    }
}
