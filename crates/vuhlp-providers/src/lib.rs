use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

pub mod mapper;

pub use mapper::{classify_risk, CanonicalEvent, Dialect, SessionMapper};

/// One frame of a provider session's stream, in that provider's dialect.
/// Only the event mapper understands the shape.
pub type ProviderFrame = Value;

pub type FrameStream = Pin<Box<dyn Stream<Item = anyhow::Result<ProviderFrame>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Claude,
    Codex,
    Gemini,
    Mock,
}

impl ProviderKind {
    pub fn dialect(self) -> Dialect {
        match self {
            Self::Claude => Dialect::Claude,
            Self::Codex => Dialect::Codex,
            Self::Gemini => Dialect::Gemini,
            Self::Mock => Dialect::Mock,
        }
    }
}

/// Configured binding for one external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// Decision fed back to a session for a proposed tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    Approved,
    Denied { feedback: Option<String> },
    Modified { args: Value, feedback: Option<String> },
}

/// A long-lived session against one external tool. Owned by at most one
/// node turn at a time.
#[async_trait]
pub trait ProviderSession: Send {
    fn session_id(&self) -> String;

    /// Runs one turn; the stream yields dialect frames until the turn's
    /// final frame. Cancelling the token ends the stream early.
    async fn run_turn(&mut self, prompt: &str, cancel: CancellationToken)
        -> anyhow::Result<FrameStream>;

    /// Feeds an approval decision back for a proposed tool so the session
    /// can continue, substitute args, or abort the tool.
    async fn resolve_tool(&mut self, tool_id: &str, decision: ToolDecision) -> anyhow::Result<()>;

    /// Aborts the in-flight turn, if any.
    async fn abort(&mut self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> String;
    fn dialect(&self) -> Dialect;
    async fn open_session(&self, workspace: Option<&Path>)
        -> anyhow::Result<Box<dyn ProviderSession>>;
}

/// Providers keyed by name. External CLI bindings are injected by the host
/// process; a mock is always available so a bare daemon can still run.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Arc::new(RwLock::new(Vec::new())),
            default_provider: Arc::new(RwLock::new(None)),
        }
    }

    /// Builds a registry from configured descriptors. Mock descriptors get
    /// the built-in mock; other kinds must be injected with `register` by
    /// the embedding process (child-process launch lives outside the
    /// engine). A registry with no providers falls back to one mock.
    pub async fn from_descriptors(descriptors: &HashMap<String, ProviderDescriptor>) -> Self {
        let registry = Self::new();
        for (name, descriptor) in descriptors {
            match descriptor.kind {
                ProviderKind::Mock => {
                    registry
                        .register(Arc::new(MockProvider::named(name.clone())))
                        .await;
                }
                kind => {
                    tracing::warn!(
                        provider = %name,
                        ?kind,
                        "no session launcher registered for provider; skipping"
                    );
                }
            }
        }
        if registry.providers.read().await.is_empty() {
            registry.register(Arc::new(MockProvider::named("mock"))).await;
        }
        registry
    }

    pub async fn register(&self, provider: Arc<dyn Provider>) {
        let mut providers = self.providers.write().await;
        providers.retain(|p| p.name() != provider.name());
        providers.push(provider);
    }

    pub async fn set_default(&self, name: Option<String>) {
        *self.default_provider.write().await = name;
    }

    pub async fn list(&self) -> Vec<String> {
        self.providers.read().await.iter().map(|p| p.name()).collect()
    }

    pub async fn select(&self, name: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.name()).collect::<Vec<_>>();

        if let Some(wanted) = name {
            if let Some(provider) = providers.iter().find(|p| p.name() == wanted) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                wanted,
                available.join(", ")
            );
        }

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_name) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.name() == default_name) {
                return Ok(provider.clone());
            }
        }

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Mock provider
// ============================================================================

#[derive(Default)]
struct MockState {
    /// Scripted turns, consumed front to back across all sessions.
    scripts: std::collections::VecDeque<Vec<ProviderFrame>>,
    /// Tool decisions fed back by the executor, for assertions.
    resolutions: Vec<(String, ToolDecision)>,
    aborted: bool,
}

/// Scriptable in-process provider used by tests and as the `mock` kind.
/// Unscripted turns echo the prompt and complete.
pub struct MockProvider {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Queues the frames for the next turn of any session on this provider.
    pub async fn push_script(&self, frames: Vec<ProviderFrame>) {
        self.state.lock().await.scripts.push_back(frames);
    }

    pub async fn resolutions(&self) -> Vec<(String, ToolDecision)> {
        self.state.lock().await.resolutions.clone()
    }

    pub async fn was_aborted(&self) -> bool {
        self.state.lock().await.aborted
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn dialect(&self) -> Dialect {
        Dialect::Mock
    }

    async fn open_session(
        &self,
        _workspace: Option<&Path>,
    ) -> anyhow::Result<Box<dyn ProviderSession>> {
        Ok(Box::new(MockSession {
            session_id: vuhlp_types::new_id("mocksess"),
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    session_id: String,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl ProviderSession for MockSession {
    fn session_id(&self) -> String {
        self.session_id.clone()
    }

    async fn run_turn(
        &mut self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<FrameStream> {
        let scripted = self.state.lock().await.scripts.pop_front();
        let frames = scripted.unwrap_or_else(|| {
            vec![
                json!({ "type": "agent_message", "text": format!("Echo: {prompt}") }),
                json!({ "type": "turn_complete" }),
            ]
        });
        let session_frame = json!({ "type": "session_started", "session_id": self.session_id });

        let stream = stream! {
            yield Ok::<ProviderFrame, anyhow::Error>(session_frame);
            for frame in frames {
                if cancel.is_cancelled() {
                    break;
                }
                // Yield control so cancellation and approvals interleave the
                // way a real child-process stream would.
                tokio::task::yield_now().await;
                yield Ok(frame);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn resolve_tool(&mut self, tool_id: &str, decision: ToolDecision) -> anyhow::Result<()> {
        self.state
            .lock()
            .await
            .resolutions
            .push((tool_id.to_string(), decision));
        Ok(())
    }

    async fn abort(&mut self) -> anyhow::Result<()> {
        self.state.lock().await.aborted = true;
        Ok(())
    }
}
