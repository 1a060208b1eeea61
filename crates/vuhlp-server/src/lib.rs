use std::sync::Arc;

use vuhlp_core::{
    ApprovalQueue, CancellationRegistry, ChatManager, EventBus, PromptQueue, RoleRegistry,
    RunStore, SessionRegistry, VuhlpConfig,
};
use vuhlp_orchestrator::{GraphScheduler, NodeExecutor, SchedulerSettings, StallDetector};
use vuhlp_providers::ProviderRegistry;

mod http;

pub use http::serve;

/// Shared state behind every handler: the run engine's singletons, wired
/// once at daemon startup.
#[derive(Clone)]
pub struct AppState {
    pub config: VuhlpConfig,
    pub bus: EventBus,
    pub store: RunStore,
    pub chat: ChatManager,
    pub approvals: ApprovalQueue,
    pub prompts: PromptQueue,
    pub sessions: SessionRegistry,
    pub cancellations: CancellationRegistry,
    pub providers: ProviderRegistry,
    pub roles: RoleRegistry,
    pub scheduler: GraphScheduler,
}

impl AppState {
    /// Builds the full engine from a config: bus and store on the data dir,
    /// queues on the bus, executor and scheduler on top.
    pub async fn build(config: VuhlpConfig, providers: ProviderRegistry) -> anyhow::Result<Self> {
        let data_dir = config.data_dir_path();
        let bus = EventBus::new(&data_dir);
        let store = RunStore::new(&data_dir);
        match store.load_persisted().await {
            Ok(loaded) if loaded > 0 => tracing::info!(loaded, "restored persisted runs"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "failed to restore persisted runs"),
        }
        let chat = ChatManager::new(bus.clone());
        let approvals = ApprovalQueue::new(bus.clone());
        let prompts = PromptQueue::new(bus.clone());
        let sessions = SessionRegistry::new();
        let cancellations = CancellationRegistry::new();
        let roles = RoleRegistry::new(&data_dir).await?;
        let stall = StallDetector::new();

        let executor = Arc::new(
            NodeExecutor::new(
                store.clone(),
                bus.clone(),
                approvals.clone(),
                sessions.clone(),
                providers.clone(),
                roles.clone(),
                stall.clone(),
            )
            .with_verification_commands(config.verification.commands.clone()),
        );

        let scheduler = GraphScheduler::new(
            store.clone(),
            bus.clone(),
            chat.clone(),
            approvals.clone(),
            cancellations.clone(),
            executor,
            stall,
            SchedulerSettings {
                max_concurrency: config.scheduler.max_concurrency,
                max_iterations: config.orchestration.max_iterations,
                ..SchedulerSettings::default()
            },
        );

        Ok(Self {
            config,
            bus,
            store,
            chat,
            approvals,
            prompts,
            sessions,
            cancellations,
            providers,
            roles,
            scheduler,
        })
    }
}
