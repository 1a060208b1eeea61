use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical event envelope broadcast on the bus and appended to the
/// per-run `events.jsonl` log. The payload is type-discriminated by
/// `event_type` and flattened into the JSON object, so one line reads
/// `{ "id", "runId", "ts", "type", ...payload }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub id: String,
    pub run_id: String,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub properties: Value,
}

impl RunEvent {
    pub fn new(run_id: impl Into<String>, event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            id: crate::new_id("evt"),
            run_id: run_id.into(),
            ts: Utc::now(),
            event_type: event_type.into(),
            properties,
        }
    }
}
