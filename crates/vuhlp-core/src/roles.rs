use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

/// A role template a node is bound to: the prompt preamble for its turns
/// plus an optional default provider binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTemplate {
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub template: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RoleFrontmatter {
    name: Option<String>,
    provider: Option<String>,
    hidden: Option<bool>,
}

/// Built-in roles plus user-defined ones from `<dataDir>/roles/*.md`
/// (YAML front-matter, markdown body as the template text).
#[derive(Clone)]
pub struct RoleRegistry {
    roles: Arc<RwLock<HashMap<String, RoleTemplate>>>,
    default_role: String,
}

impl RoleRegistry {
    pub async fn new(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let mut by_name = HashMap::new();
        for role in default_roles() {
            by_name.insert(role.name.clone(), role);
        }

        let dir: PathBuf = data_dir.into();
        for role in load_custom_roles(dir.join("roles")).await? {
            by_name.insert(role.name.clone(), role);
        }

        Ok(Self {
            roles: Arc::new(RwLock::new(by_name)),
            default_role: "implementer".to_string(),
        })
    }

    pub async fn list(&self) -> Vec<RoleTemplate> {
        let mut roles = self
            .roles
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        roles
    }

    /// Named role, falling back to the default when unknown.
    pub async fn get(&self, name: Option<&str>) -> RoleTemplate {
        let wanted = name.unwrap_or(&self.default_role);
        let roles = self.roles.read().await;
        roles
            .get(wanted)
            .cloned()
            .or_else(|| roles.get(&self.default_role).cloned())
            .unwrap_or_else(|| RoleTemplate {
                name: self.default_role.clone(),
                provider: None,
                hidden: false,
                template: String::new(),
            })
    }
}

fn default_roles() -> Vec<RoleTemplate> {
    vec![
        RoleTemplate {
            name: "orchestrator".to_string(),
            provider: None,
            hidden: false,
            template: "You coordinate a team of coding agents. Break the objective into \
handoffs for the connected nodes, review what comes back, and decide when the \
work is complete. Delegate rather than implementing yourself."
                .to_string(),
        },
        RoleTemplate {
            name: "planner".to_string(),
            provider: None,
            hidden: false,
            template: "You are a planning-focused engineering agent. Produce a concrete, \
ordered plan with acceptance criteria before any implementation starts. Keep \
plans short and grounded in the actual workspace."
                .to_string(),
        },
        RoleTemplate {
            name: "implementer".to_string(),
            provider: None,
            hidden: false,
            template: "You are an implementation-focused engineering agent working inside \
a local workspace. Prefer concrete changes over discussion; inspect the \
workspace before editing and report what you changed."
                .to_string(),
        },
        RoleTemplate {
            name: "reviewer".to_string(),
            provider: None,
            hidden: false,
            template: "You review changes produced by other agents. Check correctness \
against the stated goal, call out defects precisely, and confirm explicitly \
when the work passes."
                .to_string(),
        },
    ]
}

async fn load_custom_roles(dir: PathBuf) -> anyhow::Result<Vec<RoleTemplate>> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|v| v.to_str()) else {
            continue;
        };
        if ext != "md" {
            continue;
        }
        let raw = fs::read_to_string(&path).await?;
        if let Some(role) = parse_role_markdown(&raw, &path) {
            out.push(role);
        }
    }

    Ok(out)
}

fn parse_role_markdown(raw: &str, path: &Path) -> Option<RoleTemplate> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        return None;
    }
    let mut parts = trimmed.splitn(3, "---");
    let _ = parts.next();
    let frontmatter = parts.next()?.trim();
    let body = parts.next()?.trim().to_string();
    let parsed: RoleFrontmatter = serde_yaml::from_str(frontmatter).ok()?;
    let default_name = path.file_stem()?.to_string_lossy().to_string();
    Some(RoleTemplate {
        name: parsed.name.unwrap_or(default_name),
        provider: parsed.provider,
        hidden: parsed.hidden.unwrap_or(false),
        template: body,
    })
}
