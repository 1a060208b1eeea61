use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Turn digests kept per node for stall detection.
const WINDOW: usize = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TurnDigest {
    output_hash: Option<String>,
    diff_hash: Option<String>,
    verification_failure: Option<String>,
    summary: String,
}

/// Evidence attached to a `run.stalled` event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StallEvidence {
    pub output_hash: Option<String>,
    pub diff_hash: Option<String>,
    pub verification_failure: Option<String>,
    pub summaries: Vec<String>,
}

/// Rolling per-node history of completed-turn digests. A run is considered
/// stalled when the last two completed turns of a node produced an identical
/// output hash, an identical diff hash, or the same verification failure.
#[derive(Clone, Default)]
pub struct StallDetector {
    histories: Arc<Mutex<HashMap<(String, String), VecDeque<TurnDigest>>>>,
}

impl StallDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed turn; returns stall evidence when the window
    /// shows the node spinning in place.
    pub fn record_turn(
        &self,
        run_id: &str,
        node_id: &str,
        output: Option<&str>,
        diff: Option<&str>,
        verification_failure: Option<&str>,
    ) -> Option<StallEvidence> {
        let digest = TurnDigest {
            output_hash: output.map(stable_hash),
            diff_hash: diff.map(stable_hash),
            verification_failure: verification_failure.map(str::to_string),
            summary: summarize(output, verification_failure),
        };

        let mut histories = self.histories.lock().unwrap_or_else(|p| p.into_inner());
        let history = histories
            .entry((run_id.to_string(), node_id.to_string()))
            .or_default();
        history.push_back(digest);
        while history.len() > WINDOW {
            history.pop_front();
        }

        if history.len() < 2 {
            return None;
        }
        let last = &history[history.len() - 1];
        let prev = &history[history.len() - 2];

        let same_output = last.output_hash.is_some() && last.output_hash == prev.output_hash;
        let same_diff = last.diff_hash.is_some() && last.diff_hash == prev.diff_hash;
        let repeated_failure = last.verification_failure.is_some()
            && last.verification_failure == prev.verification_failure;

        if !(same_output || same_diff || repeated_failure) {
            return None;
        }

        Some(StallEvidence {
            output_hash: last.output_hash.clone(),
            diff_hash: last.diff_hash.clone(),
            verification_failure: last.verification_failure.clone(),
            summaries: history.iter().map(|d| d.summary.clone()).collect(),
        })
    }

    /// Forgets a node's history, e.g. after fresh user input.
    pub fn reset_node(&self, run_id: &str, node_id: &str) {
        self.histories
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(run_id.to_string(), node_id.to_string()));
    }

    pub fn clear_run(&self, run_id: &str) {
        self.histories
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|(run, _), _| run != run_id);
    }
}

fn stable_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn summarize(output: Option<&str>, verification_failure: Option<&str>) -> String {
    if let Some(failure) = verification_failure {
        return format!("verification failure: {failure}");
    }
    let text = output.unwrap_or("<no output>");
    let mut summary: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        summary.push('…');
    }
    summary
}
