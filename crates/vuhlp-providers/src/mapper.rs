// Normalizes heterogeneous provider stream frames into the canonical event
// set. This is the only module that understands provider dialects; adding a
// provider means adding a dialect arm here and nothing else changes.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use vuhlp_types::{ToolCall, ToolRisk};

/// Canonical events produced from one provider session's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    Session {
        session_id: String,
    },
    MessageDelta {
        delta: String,
        index: Option<u32>,
    },
    MessageReasoning {
        content: String,
    },
    MessageFinal {
        content: String,
        token_count: Option<u64>,
    },
    ToolProposed {
        tool: ToolCall,
    },
    ToolStarted {
        tool_id: String,
    },
    ToolCompleted {
        tool_id: String,
        result: Option<Value>,
        error: Option<String>,
        duration_ms: Option<u64>,
    },
    Diff {
        name: String,
        patch: String,
    },
    Log {
        name: String,
        content: String,
    },
    Json {
        name: String,
        payload: Value,
    },
    Progress {
        message: String,
    },
    Final {
        output: Option<String>,
        summary: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Claude,
    Codex,
    Gemini,
    Mock,
}

/// Stateful per-session normalizer: tracks pending tool ids so completions
/// match by id, and the last emitted final text so a trailing aggregate with
/// identical content is suppressed.
pub struct SessionMapper {
    dialect: Dialect,
    session_id: Option<String>,
    pending: HashMap<String, ToolCall>,
    started: HashSet<String>,
    last_final: Option<String>,
}

impl SessionMapper {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            session_id: None,
            pending: HashMap::new(),
            started: HashSet::new(),
            last_final: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn pending_tool(&self, tool_id: &str) -> Option<&ToolCall> {
        self.pending.get(tool_id)
    }

    /// Maps one dialect frame onto zero or more canonical events.
    pub fn map_frame(&mut self, frame: &Value) -> Vec<CanonicalEvent> {
        let raw = match self.dialect {
            Dialect::Mock => parse_mock(frame),
            Dialect::Claude => parse_claude(frame),
            Dialect::Codex => parse_codex(frame),
            Dialect::Gemini => parse_gemini(frame),
        };

        let mut out = Vec::with_capacity(raw.len());
        for event in raw {
            match event {
                RawEvent::Session { session_id } => {
                    self.session_id = Some(session_id.clone());
                    out.push(CanonicalEvent::Session { session_id });
                }
                RawEvent::Delta { delta, index } => {
                    out.push(CanonicalEvent::MessageDelta { delta, index });
                }
                RawEvent::Reasoning { content } => {
                    out.push(CanonicalEvent::MessageReasoning { content });
                }
                RawEvent::AggregateText {
                    content,
                    token_count,
                } => {
                    // A final already emitted with identical content means
                    // this aggregate is the provider repeating itself.
                    if self.last_final.as_deref() == Some(content.as_str()) {
                        continue;
                    }
                    self.last_final = Some(content.clone());
                    out.push(CanonicalEvent::MessageFinal {
                        content,
                        token_count,
                    });
                }
                RawEvent::ToolProposed { id, name, args } => {
                    let risk = classify_risk(&name, &args);
                    let tool = ToolCall {
                        id: id.clone(),
                        name,
                        args,
                        risk,
                    };
                    self.pending.insert(id, tool.clone());
                    out.push(CanonicalEvent::ToolProposed { tool });
                }
                RawEvent::ToolStarted { id } => {
                    if !self.pending.contains_key(&id) {
                        tracing::warn!(tool_id = %id, "tool started without proposal");
                        continue;
                    }
                    if self.started.insert(id.clone()) {
                        out.push(CanonicalEvent::ToolStarted { tool_id: id });
                    }
                }
                RawEvent::ToolCompleted {
                    id,
                    result,
                    error,
                    duration_ms,
                } => {
                    if !self.pending.contains_key(&id) {
                        out.push(CanonicalEvent::Progress {
                            message: format!("tool completion for unknown id {id}"),
                        });
                        continue;
                    }
                    // Dialects without an explicit begin frame still honor
                    // the proposed -> started -> completed pairing.
                    if self.started.insert(id.clone()) {
                        out.push(CanonicalEvent::ToolStarted {
                            tool_id: id.clone(),
                        });
                    }
                    self.pending.remove(&id);
                    self.started.remove(&id);
                    out.push(CanonicalEvent::ToolCompleted {
                        tool_id: id,
                        result,
                        error,
                        duration_ms,
                    });
                }
                RawEvent::Diff { name, patch } => out.push(CanonicalEvent::Diff { name, patch }),
                RawEvent::Log { name, content } => out.push(CanonicalEvent::Log { name, content }),
                RawEvent::Json { name, payload } => {
                    out.push(CanonicalEvent::Json { name, payload })
                }
                RawEvent::Progress { message } => out.push(CanonicalEvent::Progress { message }),
                RawEvent::Final { output, summary } => {
                    out.push(CanonicalEvent::Final { output, summary })
                }
            }
        }
        out
    }
}

/// Dialect-independent intermediate shape.
enum RawEvent {
    Session { session_id: String },
    Delta { delta: String, index: Option<u32> },
    Reasoning { content: String },
    AggregateText { content: String, token_count: Option<u64> },
    ToolProposed { id: String, name: String, args: Value },
    ToolStarted { id: String },
    ToolCompleted {
        id: String,
        result: Option<Value>,
        error: Option<String>,
        duration_ms: Option<u64>,
    },
    Diff { name: String, patch: String },
    Log { name: String, content: String },
    Json { name: String, payload: Value },
    Progress { message: String },
    Final { output: Option<String>, summary: Option<String> },
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn u64_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(|v| v.as_u64())
}

// ----------------------------------------------------------------------------
// Mock dialect
// ----------------------------------------------------------------------------

fn parse_mock(frame: &Value) -> Vec<RawEvent> {
    let Some(kind) = frame.get("type").and_then(|v| v.as_str()) else {
        return vec![RawEvent::Progress {
            message: "untyped provider frame".to_string(),
        }];
    };
    match kind {
        "session_started" => str_field(frame, "session_id")
            .map(|session_id| vec![RawEvent::Session { session_id }])
            .unwrap_or_default(),
        "agent_message_delta" => vec![RawEvent::Delta {
            delta: str_field(frame, "text").unwrap_or_default(),
            index: frame.get("index").and_then(|v| v.as_u64()).map(|v| v as u32),
        }],
        "agent_reasoning" => vec![RawEvent::Reasoning {
            content: str_field(frame, "text").unwrap_or_default(),
        }],
        "agent_message" => vec![RawEvent::AggregateText {
            content: str_field(frame, "text").unwrap_or_default(),
            token_count: u64_field(frame, "token_count"),
        }],
        "tool_call" => vec![RawEvent::ToolProposed {
            id: str_field(frame, "id").unwrap_or_else(|| vuhlp_types::new_id("tool")),
            name: str_field(frame, "name").unwrap_or_default(),
            args: frame.get("args").cloned().unwrap_or(Value::Null),
        }],
        "tool_call_begin" => str_field(frame, "id")
            .map(|id| vec![RawEvent::ToolStarted { id }])
            .unwrap_or_default(),
        "tool_call_end" => str_field(frame, "id")
            .map(|id| {
                vec![RawEvent::ToolCompleted {
                    id,
                    result: frame.get("result").cloned().filter(|v| !v.is_null()),
                    error: str_field(frame, "error"),
                    duration_ms: u64_field(frame, "duration_ms"),
                }]
            })
            .unwrap_or_default(),
        "diff" => vec![RawEvent::Diff {
            name: str_field(frame, "name").unwrap_or_else(|| "changes.patch".to_string()),
            patch: str_field(frame, "patch").unwrap_or_default(),
        }],
        "log" => vec![RawEvent::Log {
            name: str_field(frame, "name").unwrap_or_default(),
            content: str_field(frame, "content").unwrap_or_default(),
        }],
        "json" => vec![RawEvent::Json {
            name: str_field(frame, "name").unwrap_or_default(),
            payload: frame.get("payload").cloned().unwrap_or(Value::Null),
        }],
        "progress" => vec![RawEvent::Progress {
            message: str_field(frame, "message").unwrap_or_default(),
        }],
        "error" => vec![RawEvent::Progress {
            message: str_field(frame, "message").unwrap_or_else(|| "provider error".to_string()),
        }],
        "turn_complete" => vec![RawEvent::Final {
            output: str_field(frame, "output"),
            summary: str_field(frame, "summary"),
        }],
        other => vec![RawEvent::Progress {
            message: format!("unknown mock frame `{other}`"),
        }],
    }
}

// ----------------------------------------------------------------------------
// Claude dialect (stream-json)
// ----------------------------------------------------------------------------

fn parse_claude(frame: &Value) -> Vec<RawEvent> {
    let kind = frame.get("type").and_then(|v| v.as_str()).unwrap_or_default();
    match kind {
        "system" => str_field(frame, "session_id")
            .map(|session_id| vec![RawEvent::Session { session_id }])
            .unwrap_or_default(),
        "stream_event" => {
            let Some(event) = frame.get("event") else {
                return Vec::new();
            };
            let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or_default();
            if event_type != "content_block_delta" {
                return Vec::new();
            }
            let Some(delta) = event.get("delta") else {
                return Vec::new();
            };
            let index = event.get("index").and_then(|v| v.as_u64()).map(|v| v as u32);
            match delta.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                "text_delta" => vec![RawEvent::Delta {
                    delta: str_field(delta, "text").unwrap_or_default(),
                    index,
                }],
                "thinking_delta" => vec![RawEvent::Reasoning {
                    content: str_field(delta, "thinking").unwrap_or_default(),
                }],
                _ => Vec::new(),
            }
        }
        "assistant" => {
            let mut events = Vec::new();
            let blocks = frame
                .pointer("/message/content")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let mut text = String::new();
            for block in blocks {
                match block.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                    "text" => {
                        if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                            text.push_str(t);
                        }
                    }
                    "thinking" => {
                        if let Some(t) = block.get("thinking").and_then(|v| v.as_str()) {
                            events.push(RawEvent::Reasoning {
                                content: t.to_string(),
                            });
                        }
                    }
                    "tool_use" => events.push(RawEvent::ToolProposed {
                        id: str_field(&block, "id")
                            .unwrap_or_else(|| vuhlp_types::new_id("tool")),
                        name: str_field(&block, "name").unwrap_or_default(),
                        args: block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    _ => {}
                }
            }
            if !text.is_empty() {
                events.push(RawEvent::AggregateText {
                    content: text,
                    token_count: frame.pointer("/message/usage/output_tokens").and_then(|v| v.as_u64()),
                });
            }
            events
        }
        "user" => {
            let mut events = Vec::new();
            let blocks = frame
                .pointer("/message/content")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for block in blocks {
                if block.get("type").and_then(|v| v.as_str()) != Some("tool_result") {
                    continue;
                }
                let Some(id) = str_field(&block, "tool_use_id") else {
                    continue;
                };
                let is_error = block
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let content = block.get("content").cloned();
                events.push(RawEvent::ToolCompleted {
                    id,
                    result: if is_error { None } else { content.clone() },
                    error: if is_error {
                        content.and_then(|c| c.as_str().map(str::to_string))
                    } else {
                        None
                    },
                    duration_ms: None,
                });
            }
            events
        }
        "result" => {
            let mut events = Vec::new();
            let output = str_field(frame, "result");
            if let Some(text) = output.clone().filter(|t| !t.is_empty()) {
                events.push(RawEvent::AggregateText {
                    content: text,
                    token_count: frame.pointer("/usage/output_tokens").and_then(|v| v.as_u64()),
                });
            }
            events.push(RawEvent::Final {
                output,
                summary: None,
            });
            events
        }
        "error" => vec![RawEvent::Progress {
            message: str_field(frame, "message")
                .or_else(|| frame.pointer("/error/message").and_then(|v| v.as_str()).map(str::to_string))
                .unwrap_or_else(|| "provider error".to_string()),
        }],
        _ => Vec::new(),
    }
}

// ----------------------------------------------------------------------------
// Codex dialect (exec --json)
// ----------------------------------------------------------------------------

fn parse_codex(frame: &Value) -> Vec<RawEvent> {
    let Some(msg) = frame.get("msg") else {
        return Vec::new();
    };
    let kind = msg.get("type").and_then(|v| v.as_str()).unwrap_or_default();
    match kind {
        "session_configured" => str_field(msg, "session_id")
            .map(|session_id| vec![RawEvent::Session { session_id }])
            .unwrap_or_default(),
        "agent_message_delta" => vec![RawEvent::Delta {
            delta: str_field(msg, "delta").unwrap_or_default(),
            index: None,
        }],
        "agent_reasoning" => vec![RawEvent::Reasoning {
            content: str_field(msg, "text").unwrap_or_default(),
        }],
        "agent_message" => vec![RawEvent::AggregateText {
            content: str_field(msg, "message").unwrap_or_default(),
            token_count: None,
        }],
        "exec_approval_request" => vec![RawEvent::ToolProposed {
            id: str_field(msg, "call_id").unwrap_or_else(|| vuhlp_types::new_id("tool")),
            name: "shell".to_string(),
            args: serde_json::json!({ "command": command_string(msg.get("command")) }),
        }],
        // An auto-approved command surfaces here without a prior approval
        // request; synthesize the proposal to keep the pairing intact.
        "exec_command_begin" => {
            let id = str_field(msg, "call_id").unwrap_or_else(|| vuhlp_types::new_id("tool"));
            vec![
                RawEvent::ToolProposed {
                    id: id.clone(),
                    name: "shell".to_string(),
                    args: serde_json::json!({ "command": command_string(msg.get("command")) }),
                },
                RawEvent::ToolStarted { id },
            ]
        }
        "exec_command_end" => str_field(msg, "call_id")
            .map(|id| {
                let exit_code = msg.get("exit_code").and_then(|v| v.as_i64()).unwrap_or(0);
                let stdout = str_field(msg, "stdout").unwrap_or_default();
                let stderr = str_field(msg, "stderr").unwrap_or_default();
                vec![RawEvent::ToolCompleted {
                    id,
                    result: (exit_code == 0).then(|| Value::String(stdout)),
                    error: (exit_code != 0).then(|| {
                        format!("exit {exit_code}: {stderr}")
                    }),
                    duration_ms: u64_field(msg, "duration_ms"),
                }]
            })
            .unwrap_or_default(),
        "turn_diff" => vec![RawEvent::Diff {
            name: "turn.patch".to_string(),
            patch: str_field(msg, "unified_diff").unwrap_or_default(),
        }],
        "task_complete" => vec![RawEvent::Final {
            output: str_field(msg, "last_agent_message"),
            summary: None,
        }],
        "error" => vec![RawEvent::Progress {
            message: str_field(msg, "message").unwrap_or_else(|| "provider error".to_string()),
        }],
        _ => Vec::new(),
    }
}

fn command_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

// ----------------------------------------------------------------------------
// Gemini dialect
// ----------------------------------------------------------------------------

fn parse_gemini(frame: &Value) -> Vec<RawEvent> {
    let kind = frame.get("type").and_then(|v| v.as_str()).unwrap_or_default();
    match kind {
        "init" => str_field(frame, "session_id")
            .map(|session_id| vec![RawEvent::Session { session_id }])
            .unwrap_or_default(),
        "content" => vec![RawEvent::Delta {
            delta: str_field(frame, "delta").unwrap_or_default(),
            index: None,
        }],
        "thought" => vec![RawEvent::Reasoning {
            content: str_field(frame, "content").unwrap_or_default(),
        }],
        "message" => vec![RawEvent::AggregateText {
            content: str_field(frame, "content").unwrap_or_default(),
            token_count: u64_field(frame, "tokens"),
        }],
        "tool_call_request" => vec![RawEvent::ToolProposed {
            id: str_field(frame, "id").unwrap_or_else(|| vuhlp_types::new_id("tool")),
            name: str_field(frame, "name").unwrap_or_default(),
            args: frame.get("args").cloned().unwrap_or(Value::Null),
        }],
        "tool_execution_start" => str_field(frame, "id")
            .map(|id| vec![RawEvent::ToolStarted { id }])
            .unwrap_or_default(),
        "tool_call_response" => str_field(frame, "id")
            .map(|id| {
                vec![RawEvent::ToolCompleted {
                    id,
                    result: frame.get("response").cloned().filter(|v| !v.is_null()),
                    error: str_field(frame, "error"),
                    duration_ms: u64_field(frame, "duration_ms"),
                }]
            })
            .unwrap_or_default(),
        "result" => vec![RawEvent::Final {
            output: str_field(frame, "output"),
            summary: str_field(frame, "summary"),
        }],
        "error" => vec![RawEvent::Progress {
            message: str_field(frame, "message").unwrap_or_else(|| "provider error".to_string()),
        }],
        _ => Vec::new(),
    }
}

// ----------------------------------------------------------------------------
// Risk classification
// ----------------------------------------------------------------------------

const LOW_RISK_TOOLS: &[&str] = &[
    "read",
    "read_file",
    "glob",
    "grep",
    "search",
    "ls",
    "list",
    "webfetch",
    "websearch",
];

const MEDIUM_RISK_TOOLS: &[&str] = &[
    "write",
    "write_file",
    "edit",
    "apply_patch",
    "create_file",
    "todo_write",
    "mkdir",
];

const SHELL_TOOLS: &[&str] = &["bash", "shell", "run_command", "terminal", "cmd", "exec"];

const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "mkfs",
    "dd if=",
    ":(){",
    "git push --force",
    "git push -f",
    "chmod -r 777",
    "> /dev/sd",
    "shutdown",
    "reboot",
    "format c:",
    "del /s",
];

/// Declared risk for a proposed tool. Read-only allowlist maps low, common
/// writes medium, destructive shell commands high, unknown tools medium.
pub fn classify_risk(name: &str, args: &Value) -> ToolRisk {
    let normalized = name.trim().to_lowercase();

    if let Some(command) = extract_command(args) {
        let lowered = command.to_lowercase();
        if DESTRUCTIVE_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return ToolRisk::High;
        }
    }

    if SHELL_TOOLS.contains(&normalized.as_str()) {
        return ToolRisk::Medium;
    }
    if LOW_RISK_TOOLS.contains(&normalized.as_str()) {
        return ToolRisk::Low;
    }
    if MEDIUM_RISK_TOOLS.contains(&normalized.as_str()) {
        return ToolRisk::Medium;
    }
    ToolRisk::Medium
}

fn extract_command(args: &Value) -> Option<String> {
    for key in ["command", "cmd", "script"] {
        match args.get(key) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Array(parts)) => {
                return Some(
                    parts
                        .iter()
                        .filter_map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(" "),
                )
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map_all(mapper: &mut SessionMapper, frames: &[Value]) -> Vec<CanonicalEvent> {
        frames.iter().flat_map(|f| mapper.map_frame(f)).collect()
    }

    #[test]
    fn deltas_then_aggregate_emit_one_final() {
        let mut mapper = SessionMapper::new(Dialect::Mock);
        let events = map_all(
            &mut mapper,
            &[
                json!({"type": "agent_message_delta", "text": "hel"}),
                json!({"type": "agent_message_delta", "text": "lo"}),
                json!({"type": "agent_message", "text": "hello"}),
                json!({"type": "agent_message", "text": "hello"}),
                json!({"type": "turn_complete", "output": "hello"}),
            ],
        );

        let finals: Vec<&CanonicalEvent> = events
            .iter()
            .filter(|e| matches!(e, CanonicalEvent::MessageFinal { .. }))
            .collect();
        assert_eq!(finals.len(), 1);
        assert!(matches!(
            finals[0],
            CanonicalEvent::MessageFinal { content, .. } if content == "hello"
        ));
    }

    #[test]
    fn aggregate_only_text_still_emits_final() {
        let mut mapper = SessionMapper::new(Dialect::Claude);
        let events = map_all(
            &mut mapper,
            &[json!({"type": "result", "subtype": "success", "result": "done"})],
        );
        assert!(matches!(
            &events[0],
            CanonicalEvent::MessageFinal { content, .. } if content == "done"
        ));
        assert!(matches!(&events[1], CanonicalEvent::Final { output: Some(o), .. } if o == "done"));
    }

    #[test]
    fn claude_assistant_text_suppresses_duplicate_result_text() {
        let mut mapper = SessionMapper::new(Dialect::Claude);
        let events = map_all(
            &mut mapper,
            &[
                json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "answer"}]}}),
                json!({"type": "result", "subtype": "success", "result": "answer"}),
            ],
        );
        let finals = events
            .iter()
            .filter(|e| matches!(e, CanonicalEvent::MessageFinal { .. }))
            .count();
        assert_eq!(finals, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, CanonicalEvent::Final { .. })));
    }

    #[test]
    fn tool_lifecycle_pairs_by_id() {
        let mut mapper = SessionMapper::new(Dialect::Mock);
        let events = map_all(
            &mut mapper,
            &[
                json!({"type": "tool_call", "id": "t1", "name": "Bash", "args": {"command": "ls"}}),
                json!({"type": "tool_call_begin", "id": "t1"}),
                json!({"type": "tool_call_end", "id": "t1", "result": "ok", "duration_ms": 12}),
            ],
        );
        assert!(matches!(&events[0], CanonicalEvent::ToolProposed { tool } if tool.id == "t1"));
        assert!(matches!(&events[1], CanonicalEvent::ToolStarted { tool_id } if tool_id == "t1"));
        assert!(matches!(
            &events[2],
            CanonicalEvent::ToolCompleted { tool_id, duration_ms: Some(12), .. } if tool_id == "t1"
        ));
        assert!(mapper.pending_tool("t1").is_none());
    }

    #[test]
    fn completion_without_begin_synthesizes_started() {
        let mut mapper = SessionMapper::new(Dialect::Claude);
        let events = map_all(
            &mut mapper,
            &[
                json!({"type": "assistant", "message": {"content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"path": "x"}}
                ]}}),
                json!({"type": "user", "message": {"content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "file body"}
                ]}}),
            ],
        );
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                CanonicalEvent::ToolProposed { .. } => "proposed",
                CanonicalEvent::ToolStarted { .. } => "started",
                CanonicalEvent::ToolCompleted { .. } => "completed",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["proposed", "started", "completed"]);
    }

    #[test]
    fn codex_auto_approved_exec_keeps_pairing() {
        let mut mapper = SessionMapper::new(Dialect::Codex);
        let events = map_all(
            &mut mapper,
            &[
                json!({"id": "1", "msg": {"type": "exec_command_begin", "call_id": "c1", "command": ["ls", "-la"]}}),
                json!({"id": "2", "msg": {"type": "exec_command_end", "call_id": "c1", "exit_code": 0, "stdout": "files"}}),
            ],
        );
        assert!(matches!(
            &events[0],
            CanonicalEvent::ToolProposed { tool } if tool.args["command"] == "ls -la"
        ));
        assert!(matches!(&events[1], CanonicalEvent::ToolStarted { .. }));
        assert!(matches!(&events[2], CanonicalEvent::ToolCompleted { .. }));
    }

    #[test]
    fn error_frames_map_to_progress_not_final() {
        let mut mapper = SessionMapper::new(Dialect::Mock);
        let events = map_all(
            &mut mapper,
            &[json!({"type": "error", "message": "transient failure"})],
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            CanonicalEvent::Progress { message } if message == "transient failure"
        ));
    }

    #[test]
    fn risk_classification_tables() {
        assert_eq!(classify_risk("Read", &json!({"path": "a"})), ToolRisk::Low);
        assert_eq!(classify_risk("write", &json!({"path": "a"})), ToolRisk::Medium);
        assert_eq!(classify_risk("bash", &json!({"command": "ls"})), ToolRisk::Medium);
        assert_eq!(
            classify_risk("Bash", &json!({"command": "rm -rf /tmp/x"})),
            ToolRisk::High
        );
        assert_eq!(
            classify_risk("shell", &json!({"command": "sudo mkfs.ext4 /dev/sda1"})),
            ToolRisk::High
        );
        assert_eq!(classify_risk("mystery_tool", &json!({})), ToolRisk::Medium);
    }

    #[test]
    fn mapping_is_deterministic_across_replays() {
        let frames = vec![
            json!({"type": "session_started", "session_id": "s1"}),
            json!({"type": "agent_message_delta", "text": "a"}),
            json!({"type": "tool_call", "id": "t1", "name": "read", "args": {}}),
            json!({"type": "tool_call_begin", "id": "t1"}),
            json!({"type": "tool_call_end", "id": "t1", "result": "x"}),
            json!({"type": "agent_message", "text": "a"}),
            json!({"type": "turn_complete"}),
        ];
        let first = map_all(&mut SessionMapper::new(Dialect::Mock), &frames);
        let second = map_all(&mut SessionMapper::new(Dialect::Mock), &frames);
        assert_eq!(first, second);
    }
}
