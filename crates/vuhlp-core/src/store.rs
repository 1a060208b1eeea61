// Authoritative in-memory run state. Every mutation of Run/Node/Edge/Artifact
// goes through a method here; scheduler, executor and chat manager never hold
// references into the graph, only ids.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;

use vuhlp_types::{
    Artifact, ArtifactKind, ArtifactMeta, Edge, Envelope, GlobalMode, Node, NodeCapabilities,
    NodeControl, NodePermissions, NodeStatus, OrchestrationMode, Result, Run, RunStatus,
    RunSummary, VuhlpError,
};

/// Partial update applied to a run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub mode: Option<OrchestrationMode>,
    pub global_mode: Option<GlobalMode>,
}

/// Partial update applied to a node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    pub label: Option<String>,
    pub role: Option<String>,
    pub provider: Option<String>,
    pub status: Option<NodeStatus>,
    pub control: Option<NodeControl>,
    pub capabilities: Option<NodeCapabilities>,
    pub permissions: Option<NodePermissions>,
    pub last_output: Option<String>,
    pub summary: Option<String>,
}

#[derive(Clone)]
pub struct RunStore {
    runs: Arc<RwLock<std::collections::HashMap<String, Run>>>,
    data_dir: PathBuf,
}

impl RunStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            runs: Arc::new(RwLock::new(std::collections::HashMap::new())),
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    pub async fn create_run(
        &self,
        mode: OrchestrationMode,
        global_mode: GlobalMode,
        workspace_root: Option<String>,
    ) -> Run {
        let mut run = Run::new(mode, global_mode);
        run.workspace_root = workspace_root;
        self.runs.write().await.insert(run.id.clone(), run.clone());
        self.persist_snapshot(&run);
        run
    }

    /// Loads persisted run snapshots from `<dataDir>/runs/*/run.json` into
    /// memory. Runs that were live when the daemon exited come back as
    /// stopped; there is no replay-driven reconstruction.
    pub async fn load_persisted(&self) -> Result<usize> {
        let runs_dir = self.data_dir.join("runs");
        if !runs_dir.exists() {
            return Ok(0);
        }
        let entries = fs::read_dir(&runs_dir)
            .map_err(|e| VuhlpError::IoError(format!("failed to read runs dir: {e}")))?;

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path().join("run.json");
            if !path.exists() {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(mut run) = serde_json::from_str::<Run>(&raw) else {
                tracing::warn!(path = %path.display(), "skipping unparseable run snapshot");
                continue;
            };
            if !run.status.is_terminal() {
                run.status = RunStatus::Stopped;
            }
            let mut runs = self.runs.write().await;
            if !runs.contains_key(&run.id) {
                runs.insert(run.id.clone(), run);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))
    }

    pub async fn list_runs(&self) -> Vec<RunSummary> {
        let mut runs: Vec<RunSummary> = self
            .runs
            .read()
            .await
            .values()
            .map(Run::to_summary)
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        runs
    }

    pub async fn patch_run(&self, run_id: &str, patch: RunPatch) -> Result<Run> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(mode) = patch.mode {
            run.mode = mode;
        }
        if let Some(global_mode) = patch.global_mode {
            run.global_mode = global_mode;
        }
        run.updated_at = Utc::now();
        let snapshot = run.clone();
        drop(runs);
        self.persist_snapshot(&snapshot);
        Ok(snapshot)
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        let removed = self.runs.write().await.remove(run_id);
        if removed.is_none() {
            return Err(VuhlpError::NotFound(format!("run {run_id}")));
        }
        let dir = self.run_dir(run_id);
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                tracing::warn!(run_id, error = %err, "failed to remove run directory");
            }
        }
        Ok(())
    }

    pub async fn set_root_node(&self, run_id: &str, node_id: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        if !run.nodes.contains_key(node_id) {
            return Err(VuhlpError::Validation(format!(
                "root orchestrator {node_id} is not a node of run {run_id}"
            )));
        }
        run.root_node_id = Some(node_id.to_string());
        run.updated_at = Utc::now();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub async fn add_node(&self, run_id: &str, node: Node) -> Result<Node> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        if run.nodes.contains_key(&node.id) {
            return Err(VuhlpError::Validation(format!(
                "node id {} already exists in run {run_id}",
                node.id
            )));
        }
        run.nodes.insert(node.id.clone(), node.clone());
        run.updated_at = Utc::now();
        Ok(node)
    }

    /// Removes the node and, to keep edge endpoints valid, every edge that
    /// references it. Clears the root designation if it pointed here.
    pub async fn remove_node(&self, run_id: &str, node_id: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        if run.nodes.remove(node_id).is_none() {
            return Err(VuhlpError::NotFound(format!("node {node_id}")));
        }
        run.edges
            .retain(|_, edge| edge.from_node_id != node_id && edge.to_node_id != node_id);
        if run.root_node_id.as_deref() == Some(node_id) {
            run.root_node_id = None;
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    pub async fn get_node(&self, run_id: &str, node_id: &str) -> Result<Node> {
        let runs = self.runs.read().await;
        runs.get(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| VuhlpError::NotFound(format!("node {node_id}")))
    }

    pub async fn patch_node(&self, run_id: &str, node_id: &str, patch: NodePatch) -> Result<Node> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        let node = run
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("node {node_id}")))?;
        if let Some(label) = patch.label {
            node.label = label;
        }
        if let Some(role) = patch.role {
            node.role = role;
        }
        if let Some(provider) = patch.provider {
            node.provider = provider;
        }
        if let Some(status) = patch.status {
            node.status = status;
        }
        if let Some(control) = patch.control {
            node.control = control;
        }
        if let Some(capabilities) = patch.capabilities {
            node.capabilities = capabilities;
        }
        if let Some(permissions) = patch.permissions {
            node.permissions = permissions;
        }
        if let Some(last_output) = patch.last_output {
            node.last_output = Some(last_output);
        }
        if let Some(summary) = patch.summary {
            node.summary = Some(summary);
        }
        run.updated_at = Utc::now();
        Ok(run.nodes.get(node_id).cloned().expect("node just patched"))
    }

    pub async fn set_node_status(&self, run_id: &str, node_id: &str, status: NodeStatus) -> Result<Node> {
        self.patch_node(
            run_id,
            node_id,
            NodePatch {
                status: Some(status),
                ..NodePatch::default()
            },
        )
        .await
    }

    /// Bumps the turn counter and marks the node running in one step.
    pub async fn begin_turn(&self, run_id: &str, node_id: &str) -> Result<Node> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        let node = run
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("node {node_id}")))?;
        node.turn_count += 1;
        node.status = NodeStatus::Running;
        run.updated_at = Utc::now();
        Ok(node.clone())
    }

    pub async fn set_session_id(&self, run_id: &str, node_id: &str, session_id: Option<String>) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        let node = run
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("node {node_id}")))?;
        node.session.session_id = session_id;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Edges & envelopes
    // ------------------------------------------------------------------

    pub async fn add_edge(&self, run_id: &str, edge: Edge) -> Result<Edge> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        if !run.nodes.contains_key(&edge.from_node_id) {
            return Err(VuhlpError::Validation(format!(
                "edge source {} is not a node of run {run_id}",
                edge.from_node_id
            )));
        }
        if !run.nodes.contains_key(&edge.to_node_id) {
            return Err(VuhlpError::Validation(format!(
                "edge target {} is not a node of run {run_id}",
                edge.to_node_id
            )));
        }
        if edge.from_node_id == edge.to_node_id && !edge.bidirectional {
            return Err(VuhlpError::Validation(
                "self-loop edges must be bidirectional".to_string(),
            ));
        }
        run.edges.insert(edge.id.clone(), edge.clone());
        run.updated_at = Utc::now();
        Ok(edge)
    }

    pub async fn remove_edge(&self, run_id: &str, edge_id: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        if run.edges.remove(edge_id).is_none() {
            return Err(VuhlpError::NotFound(format!("edge {edge_id}")));
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    pub async fn push_envelope(&self, run_id: &str, edge_id: &str, envelope: Envelope) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        let edge = run
            .edges
            .get_mut(edge_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("edge {edge_id}")))?;
        edge.pending_envelopes.push(envelope);
        run.updated_at = Utc::now();
        Ok(())
    }

    /// Drains every envelope addressed to `node_id` from its incoming edges
    /// (including the reverse direction of bidirectional edges), preserving
    /// arrival order.
    pub async fn consume_envelopes_for(&self, run_id: &str, node_id: &str) -> Result<Vec<Envelope>> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        let mut consumed = Vec::new();
        for edge in run.edges.values_mut() {
            let incoming = edge.to_node_id == node_id
                || (edge.bidirectional && edge.from_node_id == node_id);
            if !incoming {
                continue;
            }
            let mut kept = Vec::new();
            for envelope in edge.pending_envelopes.drain(..) {
                if envelope.to_node_id == node_id {
                    consumed.push(envelope);
                } else {
                    kept.push(envelope);
                }
            }
            edge.pending_envelopes = kept;
        }
        consumed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if !consumed.is_empty() {
            run.updated_at = Utc::now();
        }
        Ok(consumed)
    }

    /// Count of envelopes currently addressed to `node_id`.
    pub async fn pending_envelope_count(&self, run_id: &str, node_id: &str) -> Result<usize> {
        let runs = self.runs.read().await;
        let run = runs
            .get(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        Ok(run
            .edges
            .values()
            .flat_map(|edge| edge.pending_envelopes.iter())
            .filter(|envelope| envelope.to_node_id == node_id)
            .count())
    }

    /// Re-derives `inbox_count = pending envelopes + queued chat` for a node.
    pub async fn refresh_inbox(&self, run_id: &str, node_id: &str, queued_chat: usize) -> Result<usize> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        let envelopes = run
            .edges
            .values()
            .flat_map(|edge| edge.pending_envelopes.iter())
            .filter(|envelope| envelope.to_node_id == node_id)
            .count();
        let node = run
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("node {node_id}")))?;
        node.inbox_count = envelopes + queued_chat;
        Ok(node.inbox_count)
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Writes the blob under `<dataDir>/runs/<runId>/artifacts/` and records
    /// the artifact on the run.
    pub async fn add_artifact(
        &self,
        run_id: &str,
        node_id: &str,
        kind: ArtifactKind,
        name: &str,
        content: &str,
        meta: Option<ArtifactMeta>,
    ) -> Result<Artifact> {
        let artifact_dir = self.run_dir(run_id).join("artifacts");
        fs::create_dir_all(&artifact_dir)
            .map_err(|e| VuhlpError::IoError(format!("failed to create artifacts dir: {e}")))?;
        let path = artifact_dir.join(name);
        atomic_write(&path, content)?;

        let artifact = Artifact {
            id: vuhlp_types::new_id("art"),
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            kind,
            name: name.to_string(),
            path: path.to_string_lossy().to_string(),
            created_at: Utc::now(),
            meta,
        };

        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?;
        if !run.nodes.contains_key(node_id) {
            return Err(VuhlpError::NotFound(format!("node {node_id}")));
        }
        run.artifacts.insert(artifact.id.clone(), artifact.clone());
        run.updated_at = Utc::now();
        Ok(artifact)
    }

    pub async fn get_artifact(&self, run_id: &str, artifact_id: &str) -> Result<(Artifact, String)> {
        let artifact = {
            let runs = self.runs.read().await;
            runs.get(run_id)
                .ok_or_else(|| VuhlpError::NotFound(format!("run {run_id}")))?
                .artifacts
                .get(artifact_id)
                .cloned()
                .ok_or_else(|| VuhlpError::NotFound(format!("artifact {artifact_id}")))?
        };
        let content = fs::read_to_string(&artifact.path)
            .map_err(|e| VuhlpError::IoError(format!("failed to read artifact: {e}")))?;
        Ok((artifact, content))
    }

    fn persist_snapshot(&self, run: &Run) {
        let dir = self.run_dir(&run.id);
        if let Err(err) = fs::create_dir_all(&dir) {
            tracing::warn!(run_id = %run.id, error = %err, "failed to create run dir");
            return;
        }
        match serde_json::to_string_pretty(run) {
            Ok(content) => {
                if let Err(err) = atomic_write(&dir.join("run.json"), &content) {
                    tracing::warn!(run_id = %run.id, error = %err, "failed to persist run snapshot");
                }
            }
            Err(err) => {
                tracing::warn!(run_id = %run.id, error = %err, "failed to serialize run snapshot")
            }
        }
    }
}

/// Atomic write using temp file and rename.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .map_err(|e| VuhlpError::IoError(format!("failed to write temp file: {e}")))?;
    fs::rename(&temp_path, path)
        .map_err(|e| VuhlpError::IoError(format!("failed to rename temp file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vuhlp_types::{EdgeType, EnvelopePayload};

    async fn store_with_run() -> (RunStore, Run, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let run = store
            .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
            .await;
        (store, run, dir)
    }

    fn node(id: &str) -> Node {
        let mut node = Node::new(id, "implementer", "mock");
        node.id = id.to_string();
        node
    }

    #[tokio::test]
    async fn duplicate_node_ids_are_rejected() {
        let (store, run, _dir) = store_with_run().await;
        store.add_node(&run.id, node("node_a")).await.unwrap();
        let err = store.add_node(&run.id, node("node_a")).await.unwrap_err();
        assert!(matches!(err, VuhlpError::Validation(_)));
    }

    #[tokio::test]
    async fn edges_require_existing_endpoints() {
        let (store, run, _dir) = store_with_run().await;
        store.add_node(&run.id, node("node_a")).await.unwrap();
        let err = store
            .add_edge(&run.id, Edge::new("node_a", "node_missing", EdgeType::Handoff))
            .await
            .unwrap_err();
        assert!(matches!(err, VuhlpError::Validation(_)));
    }

    #[tokio::test]
    async fn self_loop_requires_bidirectional() {
        let (store, run, _dir) = store_with_run().await;
        store.add_node(&run.id, node("node_a")).await.unwrap();
        let err = store
            .add_edge(&run.id, Edge::new("node_a", "node_a", EdgeType::Handoff))
            .await
            .unwrap_err();
        assert!(matches!(err, VuhlpError::Validation(_)));

        let mut edge = Edge::new("node_a", "node_a", EdgeType::Handoff);
        edge.bidirectional = true;
        store.add_edge(&run.id, edge).await.unwrap();
    }

    #[tokio::test]
    async fn removing_a_node_removes_its_edges() {
        let (store, run, _dir) = store_with_run().await;
        store.add_node(&run.id, node("node_a")).await.unwrap();
        store.add_node(&run.id, node("node_b")).await.unwrap();
        store
            .add_edge(&run.id, Edge::new("node_a", "node_b", EdgeType::Handoff))
            .await
            .unwrap();

        store.remove_node(&run.id, "node_b").await.unwrap();
        let run = store.get_run(&run.id).await.unwrap();
        assert!(run.edges.is_empty());
    }

    #[tokio::test]
    async fn envelopes_are_consumed_exactly_once_in_order() {
        let (store, run, _dir) = store_with_run().await;
        store.add_node(&run.id, node("node_a")).await.unwrap();
        store.add_node(&run.id, node("node_b")).await.unwrap();
        let edge = store
            .add_edge(&run.id, Edge::new("node_a", "node_b", EdgeType::Handoff))
            .await
            .unwrap();

        for text in ["first", "second", "third"] {
            let envelope =
                Envelope::handoff("node_a", "node_b", EnvelopePayload::message(text));
            store.push_envelope(&run.id, &edge.id, envelope).await.unwrap();
        }

        let consumed = store.consume_envelopes_for(&run.id, "node_b").await.unwrap();
        let messages: Vec<&str> = consumed.iter().map(|e| e.payload.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);

        let again = store.consume_envelopes_for(&run.id, "node_b").await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.pending_envelope_count(&run.id, "node_b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inbox_count_reflects_envelopes_plus_chat() {
        let (store, run, _dir) = store_with_run().await;
        store.add_node(&run.id, node("node_a")).await.unwrap();
        store.add_node(&run.id, node("node_b")).await.unwrap();
        let edge = store
            .add_edge(&run.id, Edge::new("node_a", "node_b", EdgeType::Handoff))
            .await
            .unwrap();
        let envelope = Envelope::handoff("node_a", "node_b", EnvelopePayload::message("hi"));
        store.push_envelope(&run.id, &edge.id, envelope).await.unwrap();

        let count = store.refresh_inbox(&run.id, "node_b", 2).await.unwrap();
        assert_eq!(count, 3);
        let node = store.get_node(&run.id, "node_b").await.unwrap();
        assert_eq!(node.inbox_count, 3);
    }

    #[tokio::test]
    async fn artifacts_are_written_and_served_back() {
        let (store, run, _dir) = store_with_run().await;
        store.add_node(&run.id, node("node_a")).await.unwrap();

        let artifact = store
            .add_artifact(
                &run.id,
                "node_a",
                ArtifactKind::Diff,
                "changes.patch",
                "--- a/x\n+++ b/x\n",
                None,
            )
            .await
            .unwrap();

        let (loaded, content) = store.get_artifact(&run.id, &artifact.id).await.unwrap();
        assert_eq!(loaded.name, "changes.patch");
        assert_eq!(content, "--- a/x\n+++ b/x\n");
    }

    #[tokio::test]
    async fn persisted_runs_reload_as_stopped() {
        let dir = tempdir().unwrap();
        let run_id = {
            let store = RunStore::new(dir.path());
            let run = store
                .create_run(OrchestrationMode::Auto, GlobalMode::Implementation, None)
                .await;
            store
                .patch_run(
                    &run.id,
                    RunPatch {
                        status: Some(RunStatus::Running),
                        ..RunPatch::default()
                    },
                )
                .await
                .unwrap();
            run.id
        };

        let store = RunStore::new(dir.path());
        assert_eq!(store.load_persisted().await.unwrap(), 1);
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn root_node_must_exist() {
        let (store, run, _dir) = store_with_run().await;
        let err = store.set_root_node(&run.id, "node_missing").await.unwrap_err();
        assert!(matches!(err, VuhlpError::Validation(_)));
    }
}
