// Executes exactly one turn of one node: builds the prompt from the role
// template, incoming envelopes and chat context, streams the provider session
// through the event mapper onto the bus, and gates proposed tools on the
// approval queue.

use std::collections::HashMap;
use std::path::Path;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use vuhlp_core::{
    ApprovalParams, ApprovalQueue, EventBus, NodePatch, RoleRegistry, RunStore, SessionRegistry,
};
use vuhlp_providers::{
    CanonicalEvent, ProviderRegistry, SessionMapper, ToolDecision,
};
use vuhlp_types::{
    ApprovalStatus, ArtifactKind, Edge, EdgeScope, EdgeType, Envelope, EnvelopeKind,
    EnvelopePayload, GlobalMode, Node, NodeStatus, Result, RunEvent,
};

use crate::stall::{StallDetector, StallEvidence};

/// Inputs for one node turn.
pub struct TurnRequest {
    pub run_id: String,
    pub node_id: String,
    pub envelopes: Vec<Envelope>,
    pub chat_context: Option<String>,
    pub cancel: CancellationToken,
}

/// How the turn ended, with the captured output when it completed.
#[derive(Debug)]
pub struct TurnOutcome {
    pub status: NodeStatus,
    pub output: Option<String>,
    pub stall: Option<StallEvidence>,
}

#[derive(Clone)]
pub struct NodeExecutor {
    store: RunStore,
    bus: EventBus,
    approvals: ApprovalQueue,
    sessions: SessionRegistry,
    providers: ProviderRegistry,
    roles: RoleRegistry,
    stall: StallDetector,
    approval_timeout_ms: Option<u64>,
    verification_commands: Vec<String>,
}

impl NodeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: RunStore,
        bus: EventBus,
        approvals: ApprovalQueue,
        sessions: SessionRegistry,
        providers: ProviderRegistry,
        roles: RoleRegistry,
        stall: StallDetector,
    ) -> Self {
        Self {
            store,
            bus,
            approvals,
            sessions,
            providers,
            roles,
            stall,
            approval_timeout_ms: None,
            verification_commands: Vec::new(),
        }
    }

    /// Default approval timeout applied to gated tools; none by default.
    pub fn with_approval_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.approval_timeout_ms = timeout_ms;
        self
    }

    pub fn with_verification_commands(mut self, commands: Vec<String>) -> Self {
        self.verification_commands = commands;
        self
    }

    pub async fn run_turn(&self, req: TurnRequest) -> Result<TurnOutcome> {
        let run = self.store.get_run(&req.run_id).await?;
        let node = self.store.get_node(&req.run_id, &req.node_id).await?;
        let role = self.roles.get(Some(&node.role)).await;

        let prompt = build_turn_prompt(
            &role.template,
            run.global_mode,
            &req.envelopes,
            req.chat_context.as_deref(),
        );

        let node = self.store.begin_turn(&req.run_id, &req.node_id).await?;
        self.publish(
            &req.run_id,
            "node.patch",
            json!({
                "nodeId": req.node_id,
                "status": NodeStatus::Running,
                "turnCount": node.turn_count,
            }),
        );
        self.publish(
            &req.run_id,
            "turn.started",
            json!({ "nodeId": req.node_id, "turn": node.turn_count }),
        );

        match self.drive_session(&req, &run.workspace_root, &node, &prompt).await {
            Ok(TurnEnd::Completed {
                output,
                summary,
                stall,
            }) => self.finish_completed(&req, output, summary, stall).await,
            Ok(TurnEnd::Interrupted) => self.finish_interrupted(&req).await,
            Err(err) => self.finish_failed(&req, &err.to_string()).await,
        }
    }

    async fn drive_session(
        &self,
        req: &TurnRequest,
        workspace_root: &Option<String>,
        node: &Node,
        prompt: &str,
    ) -> anyhow::Result<TurnEnd> {
        let provider = self.providers.select(Some(&node.provider)).await?;
        let handle = match self.sessions.lookup(&req.run_id, &req.node_id).await {
            Some(handle) => handle,
            None => {
                let workspace = workspace_root.as_deref().map(Path::new);
                let session = provider.open_session(workspace).await?;
                self.sessions
                    .insert(
                        &req.run_id,
                        &req.node_id,
                        session,
                        node.session.reset_commands.clone(),
                    )
                    .await
            }
        };

        let mut session = handle.lock().await;
        let _ = self
            .store
            .set_session_id(&req.run_id, &req.node_id, Some(session.session_id()))
            .await;

        let mut mapper = SessionMapper::new(provider.dialect());
        let mut stream = session.run_turn(prompt, req.cancel.clone()).await?;

        // Modified approvals substitute args in later started/completed events.
        let mut tool_args: HashMap<String, Value> = HashMap::new();
        let mut final_message: Option<String> = None;
        let mut last_diff: Option<String> = None;
        let mut turn_output: Option<String> = None;
        let mut turn_summary: Option<String> = None;
        let mut saw_final = false;

        'stream: while let Some(frame) = stream.next().await {
            if req.cancel.is_cancelled() {
                return Ok(TurnEnd::Interrupted);
            }
            let frame = frame?;

            for event in mapper.map_frame(&frame) {
                match event {
                    CanonicalEvent::Session { session_id } => {
                        let _ = self
                            .store
                            .set_session_id(&req.run_id, &req.node_id, Some(session_id))
                            .await;
                    }
                    CanonicalEvent::MessageDelta { delta, index } => {
                        self.publish(
                            &req.run_id,
                            "message.assistant.delta",
                            json!({
                                "nodeId": req.node_id,
                                "delta": delta,
                                "index": index,
                                "channel": "text",
                            }),
                        );
                    }
                    CanonicalEvent::MessageReasoning { content } => {
                        self.publish(
                            &req.run_id,
                            "message.assistant.delta",
                            json!({
                                "nodeId": req.node_id,
                                "delta": content,
                                "channel": "reasoning",
                            }),
                        );
                    }
                    CanonicalEvent::MessageFinal {
                        content,
                        token_count,
                    } => {
                        self.publish(
                            &req.run_id,
                            "message.assistant.final",
                            json!({
                                "nodeId": req.node_id,
                                "content": content,
                                "tokenCount": token_count,
                            }),
                        );
                        final_message = Some(content);
                    }
                    CanonicalEvent::Progress { message } => {
                        self.publish(
                            &req.run_id,
                            "node.progress",
                            json!({ "nodeId": req.node_id, "message": message }),
                        );
                    }
                    CanonicalEvent::ToolProposed { tool } => {
                        tool_args.insert(tool.id.clone(), tool.args.clone());
                        self.publish(
                            &req.run_id,
                            "tool.proposed",
                            json!({ "nodeId": req.node_id, "tool": tool }),
                        );

                        // spawn_node / send_handoff are serviced by the
                        // engine, under their own permission gate.
                        let engine_tool = is_agent_management_tool(&tool.name);
                        let gated = if engine_tool {
                            node.permissions.agent_management_requires_approval
                        } else {
                            matches!(
                                node.permissions.cli_permissions,
                                vuhlp_types::CliPermissionMode::Gated
                            )
                        };

                        let resolution = if gated {
                            self.approvals
                                .request_approval(
                                    ApprovalParams {
                                        run_id: req.run_id.clone(),
                                        node_id: req.node_id.clone(),
                                        tool: tool.clone(),
                                        context: None,
                                        timeout_ms: self.approval_timeout_ms,
                                    },
                                    req.cancel.clone(),
                                )
                                .await
                        } else {
                            vuhlp_types::ApprovalResolution {
                                status: ApprovalStatus::Approved,
                                modified_args: None,
                                feedback: None,
                            }
                        };

                        match resolution.status {
                            ApprovalStatus::Approved | ApprovalStatus::Modified => {
                                let args = resolution
                                    .modified_args
                                    .clone()
                                    .unwrap_or_else(|| tool.args.clone());
                                tool_args.insert(tool.id.clone(), args.clone());
                                let decision =
                                    if resolution.status == ApprovalStatus::Modified {
                                        ToolDecision::Modified {
                                            args: args.clone(),
                                            feedback: resolution.feedback.clone(),
                                        }
                                    } else {
                                        ToolDecision::Approved
                                    };
                                session.resolve_tool(&tool.id, decision).await?;

                                if engine_tool {
                                    self.publish(
                                        &req.run_id,
                                        "tool.started",
                                        json!({
                                            "nodeId": req.node_id,
                                            "toolId": tool.id,
                                            "args": args,
                                        }),
                                    );
                                    let completed = match self
                                        .handle_agent_management(req, node, &tool.name, &args)
                                        .await
                                    {
                                        Ok(result) => json!({
                                            "nodeId": req.node_id,
                                            "toolId": tool.id,
                                            "result": result,
                                            "args": args,
                                        }),
                                        Err(err) => json!({
                                            "nodeId": req.node_id,
                                            "toolId": tool.id,
                                            "error": err.to_string(),
                                            "args": args,
                                        }),
                                    };
                                    self.publish(&req.run_id, "tool.completed", completed);
                                }
                            }
                            // Denied and timeout both abort the tool, not
                            // the turn.
                            _ => {
                                session
                                    .resolve_tool(
                                        &tool.id,
                                        ToolDecision::Denied {
                                            feedback: resolution.feedback.clone(),
                                        },
                                    )
                                    .await?;
                            }
                        }
                        if req.cancel.is_cancelled() {
                            return Ok(TurnEnd::Interrupted);
                        }
                    }
                    CanonicalEvent::ToolStarted { tool_id } => {
                        self.publish(
                            &req.run_id,
                            "tool.started",
                            json!({
                                "nodeId": req.node_id,
                                "toolId": tool_id,
                                "args": tool_args.get(&tool_id),
                            }),
                        );
                    }
                    CanonicalEvent::ToolCompleted {
                        tool_id,
                        result,
                        error,
                        duration_ms,
                    } => {
                        self.publish(
                            &req.run_id,
                            "tool.completed",
                            json!({
                                "nodeId": req.node_id,
                                "toolId": tool_id,
                                "result": result,
                                "error": error,
                                "durationMs": duration_ms,
                                "args": tool_args.get(&tool_id),
                            }),
                        );
                    }
                    CanonicalEvent::Diff { name, patch } => {
                        last_diff = Some(patch.clone());
                        match self
                            .store
                            .add_artifact(
                                &req.run_id,
                                &req.node_id,
                                ArtifactKind::Diff,
                                &name,
                                &patch,
                                None,
                            )
                            .await
                        {
                            Ok(artifact) => self.publish(
                                &req.run_id,
                                "artifact.created",
                                json!({ "nodeId": req.node_id, "artifact": artifact }),
                            ),
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to persist diff artifact")
                            }
                        }
                    }
                    CanonicalEvent::Log { name, content } => {
                        match self
                            .store
                            .add_artifact(
                                &req.run_id,
                                &req.node_id,
                                ArtifactKind::Log,
                                &name,
                                &content,
                                None,
                            )
                            .await
                        {
                            Ok(artifact) => self.publish(
                                &req.run_id,
                                "artifact.created",
                                json!({ "nodeId": req.node_id, "artifact": artifact }),
                            ),
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to persist log artifact")
                            }
                        }
                    }
                    CanonicalEvent::Json { name, payload } => {
                        self.publish(
                            &req.run_id,
                            "node.progress",
                            json!({ "nodeId": req.node_id, "name": name, "payload": payload }),
                        );
                    }
                    CanonicalEvent::Final { output, summary } => {
                        turn_output = output;
                        turn_summary = summary;
                        saw_final = true;
                        break 'stream;
                    }
                }
            }
        }

        if req.cancel.is_cancelled() && !saw_final {
            return Ok(TurnEnd::Interrupted);
        }

        let output = turn_output.or(final_message);
        // Record the stall digest while the diff is at hand; evidence is
        // surfaced by the caller of run_turn.
        let verification_failure =
            detect_verification_failure(output.as_deref(), &self.verification_commands);
        let stall = self.stall.record_turn(
            &req.run_id,
            &req.node_id,
            output.as_deref(),
            last_diff.as_deref(),
            verification_failure.as_deref(),
        );

        Ok(TurnEnd::Completed {
            output,
            summary: turn_summary,
            stall,
        })
    }

    /// Services a spawn_node / send_handoff tool call against the run graph
    /// on behalf of the proposing node.
    async fn handle_agent_management(
        &self,
        req: &TurnRequest,
        proposer: &Node,
        tool_name: &str,
        args: &Value,
    ) -> anyhow::Result<Value> {
        match tool_name.trim().to_lowercase().as_str() {
            "spawn_node" => {
                let label = args
                    .get("label")
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent");
                let role_name = args
                    .get("role")
                    .and_then(|v| v.as_str())
                    .unwrap_or("implementer");
                let role = self.roles.get(Some(role_name)).await;
                let provider = args
                    .get("provider")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or(role.provider)
                    .unwrap_or_else(|| proposer.provider.clone());

                let node = Node::new(label, role_name, provider);
                let node = self.store.add_node(&req.run_id, node).await?;
                self.publish(
                    &req.run_id,
                    "node.patch",
                    json!({ "nodeId": node.id, "node": node }),
                );

                let mut edge_id = None;
                if proposer.capabilities.edge_management != EdgeScope::None {
                    let edge = Edge::new(&req.node_id, &node.id, EdgeType::Handoff);
                    let edge = self.store.add_edge(&req.run_id, edge).await?;
                    self.publish(
                        &req.run_id,
                        "edge.created",
                        json!({ "edgeId": edge.id, "edge": edge }),
                    );
                    edge_id = Some(edge.id);
                }

                Ok(json!({ "nodeId": node.id, "edgeId": edge_id }))
            }
            "send_handoff" => {
                let target = args
                    .get("toNodeId")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("send_handoff requires toNodeId"))?;
                let message = args
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                self.store.get_node(&req.run_id, target).await?;

                let run = self.store.get_run(&req.run_id).await?;
                let existing = run
                    .edges
                    .values()
                    .find(|e| {
                        (e.from_node_id == req.node_id && e.to_node_id == target)
                            || (e.bidirectional
                                && e.from_node_id == target
                                && e.to_node_id == req.node_id)
                    })
                    .map(|e| e.id.clone());
                let edge_id = match existing {
                    Some(id) => id,
                    None => {
                        if proposer.capabilities.edge_management == EdgeScope::None {
                            anyhow::bail!(
                                "no edge to {target} and the node may not manage edges"
                            );
                        }
                        let edge = Edge::new(&req.node_id, target, EdgeType::Handoff);
                        let edge = self.store.add_edge(&req.run_id, edge).await?;
                        self.publish(
                            &req.run_id,
                            "edge.created",
                            json!({ "edgeId": edge.id, "edge": edge }),
                        );
                        edge.id
                    }
                };

                let mut envelope =
                    Envelope::handoff(&req.node_id, target, EnvelopePayload::message(message));
                if args.get("kind").and_then(|v| v.as_str()) == Some("signal") {
                    envelope.kind = EnvelopeKind::Signal;
                }
                self.store
                    .push_envelope(&req.run_id, &edge_id, envelope.clone())
                    .await?;
                self.publish(
                    &req.run_id,
                    "handoff.sent",
                    json!({ "edgeId": edge_id, "envelope": envelope }),
                );
                Ok(json!({ "envelopeId": envelope.id }))
            }
            other => anyhow::bail!("unknown agent management tool `{other}`"),
        }
    }

    async fn finish_completed(
        &self,
        req: &TurnRequest,
        output: Option<String>,
        summary: Option<String>,
        stall: Option<StallEvidence>,
    ) -> Result<TurnOutcome> {
        let node = self
            .store
            .patch_node(
                &req.run_id,
                &req.node_id,
                NodePatch {
                    status: Some(NodeStatus::Completed),
                    last_output: output.clone(),
                    summary: summary.clone(),
                    ..NodePatch::default()
                },
            )
            .await?;

        if let Some(output_text) = &output {
            let name = format!("{}-turn{}-output.md", req.node_id, node.turn_count);
            match self
                .store
                .add_artifact(
                    &req.run_id,
                    &req.node_id,
                    ArtifactKind::Report,
                    &name,
                    output_text,
                    None,
                )
                .await
            {
                Ok(artifact) => self.publish(
                    &req.run_id,
                    "artifact.created",
                    json!({ "nodeId": req.node_id, "artifact": artifact }),
                ),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to persist output artifact")
                }
            }
        }

        self.publish(
            &req.run_id,
            "node.patch",
            json!({
                "nodeId": req.node_id,
                "status": NodeStatus::Completed,
                "lastOutput": output,
            }),
        );
        self.publish(
            &req.run_id,
            "turn.completed",
            json!({ "nodeId": req.node_id, "output": output }),
        );

        if let Some(evidence) = &stall {
            self.publish(
                &req.run_id,
                "run.stalled",
                json!({ "nodeId": req.node_id, "evidence": evidence }),
            );
            if let Ok(run) = self
                .store
                .patch_run(
                    &req.run_id,
                    vuhlp_core::RunPatch {
                        status: Some(vuhlp_types::RunStatus::Paused),
                        ..vuhlp_core::RunPatch::default()
                    },
                )
                .await
            {
                self.publish(&req.run_id, "run.patch", json!({ "status": run.status }));
            }
        }

        Ok(TurnOutcome {
            status: NodeStatus::Completed,
            output,
            stall,
        })
    }

    async fn finish_interrupted(&self, req: &TurnRequest) -> Result<TurnOutcome> {
        if let Some(handle) = self.sessions.lookup(&req.run_id, &req.node_id).await {
            let mut session = handle.lock().await;
            if let Err(err) = session.abort().await {
                tracing::warn!(error = %err, "session abort failed");
            }
        }
        self.store
            .set_node_status(&req.run_id, &req.node_id, NodeStatus::Cancelled)
            .await?;
        self.publish(
            &req.run_id,
            "node.patch",
            json!({ "nodeId": req.node_id, "status": NodeStatus::Cancelled }),
        );
        self.publish(
            &req.run_id,
            "turn.interrupted",
            json!({ "nodeId": req.node_id }),
        );
        Ok(TurnOutcome {
            status: NodeStatus::Cancelled,
            output: None,
            stall: None,
        })
    }

    async fn finish_failed(&self, req: &TurnRequest, error: &str) -> Result<TurnOutcome> {
        self.store
            .set_node_status(&req.run_id, &req.node_id, NodeStatus::Failed)
            .await?;
        self.publish(
            &req.run_id,
            "node.patch",
            json!({ "nodeId": req.node_id, "status": NodeStatus::Failed }),
        );
        self.publish(
            &req.run_id,
            "turn.failed",
            json!({ "nodeId": req.node_id, "error": error }),
        );
        Ok(TurnOutcome {
            status: NodeStatus::Failed,
            output: None,
            stall: None,
        })
    }

    fn publish(&self, run_id: &str, event_type: &str, properties: Value) {
        self.bus.publish(RunEvent::new(run_id, event_type, properties));
    }
}

enum TurnEnd {
    Completed {
        output: Option<String>,
        summary: Option<String>,
        stall: Option<StallEvidence>,
    },
    Interrupted,
}

fn build_turn_prompt(
    role_template: &str,
    global_mode: GlobalMode,
    envelopes: &[Envelope],
    chat_context: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if !role_template.is_empty() {
        prompt.push_str(role_template);
        prompt.push_str("\n\n");
    }
    match global_mode {
        GlobalMode::Planning => prompt.push_str(
            "Global mode: PLANNING. Restrict any writes to documentation and plan \
files; do not modify source code this turn.\n\n",
        ),
        GlobalMode::Implementation => {
            prompt.push_str("Global mode: IMPLEMENTATION. Code changes are allowed.\n\n")
        }
    }
    if !envelopes.is_empty() {
        prompt.push_str("--- INCOMING HANDOFFS ---\n");
        for envelope in envelopes {
            prompt.push_str(&format!(
                "[from {}] {}\n",
                envelope.from_node_id, envelope.payload.message
            ));
            if let Some(status) = &envelope.payload.status {
                if !status.ok {
                    prompt.push_str(&format!(
                        "  (reported failure: {})\n",
                        status.reason.as_deref().unwrap_or("unspecified")
                    ));
                }
            }
        }
        prompt.push('\n');
    }
    if let Some(chat) = chat_context {
        if !chat.is_empty() {
            prompt.push_str(chat);
            prompt.push('\n');
        }
    }
    prompt
}

fn is_agent_management_tool(name: &str) -> bool {
    matches!(
        name.trim().to_lowercase().as_str(),
        "spawn_node" | "send_handoff"
    )
}

fn detect_verification_failure(output: Option<&str>, commands: &[String]) -> Option<String> {
    let output = output?;
    if let Some(pos) = output
        .find("verification failed")
        .or_else(|| output.find("Verification failed"))
    {
        let line = output[pos..].lines().next().unwrap_or("verification failed");
        return Some(line.to_string());
    }
    let lowered = output.to_lowercase();
    for command in commands {
        let marker = format!("{} failed", command.to_lowercase());
        if lowered.contains(&marker) {
            return Some(marker);
        }
    }
    None
}
