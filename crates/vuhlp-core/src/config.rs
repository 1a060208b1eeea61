use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use vuhlp_providers::ProviderDescriptor;

pub const DEFAULT_DATA_DIR: &str = "./.vuhlp";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOptions {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    crate::DEFAULT_DAEMON_PORT
}

fn default_host() -> String {
    crate::DEFAULT_DAEMON_HOST.to_string()
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerOptions {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    3
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationOptions {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    3
}

impl Default for OrchestrationOptions {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceMode {
    Shared,
    Worktree,
    Copy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceOptions {
    #[serde(default = "default_workspace_mode")]
    pub mode: WorkspaceMode,
}

fn default_workspace_mode() -> WorkspaceMode {
    WorkspaceMode::Shared
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            mode: default_workspace_mode(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOptions {
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Daemon configuration, loaded from `<dataDir>/config.json`. Every field
/// has a default so a missing file yields a working daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VuhlpConfig {
    #[serde(default)]
    pub server: ServerOptions,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub scheduler: SchedulerOptions,
    #[serde(default)]
    pub orchestration: OrchestrationOptions,
    #[serde(default)]
    pub workspace: WorkspaceOptions,
    #[serde(default)]
    pub verification: VerificationOptions,
    #[serde(default)]
    pub providers: HashMap<String, ProviderDescriptor>,
    /// role-id -> provider name.
    #[serde(default)]
    pub roles: HashMap<String, String>,
}

fn default_data_dir() -> String {
    DEFAULT_DATA_DIR.to_string()
}

impl VuhlpConfig {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path).await {
            Ok(raw) => {
                let config = serde_json::from_str(&raw)?;
                Ok(config)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::with_defaults())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?).await?;
        Ok(())
    }

    fn with_defaults() -> Self {
        Self {
            data_dir: default_data_dir(),
            ..Self::default()
        }
    }

    pub fn data_dir_path(&self) -> PathBuf {
        if self.data_dir.trim().is_empty() {
            PathBuf::from(DEFAULT_DATA_DIR)
        } else {
            PathBuf::from(&self.data_dir)
        }
    }

    /// Provider name bound to a role, when configured.
    pub fn provider_for_role(&self, role: &str) -> Option<&str> {
        self.roles.get(role).map(String::as_str)
    }
}
