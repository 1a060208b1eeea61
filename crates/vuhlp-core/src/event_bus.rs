use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use vuhlp_types::RunEvent;

const CHANNEL_CAPACITY: usize = 2048;
const REPLAY_BLOCK_SIZE: u64 = 64 * 1024;

/// One page of replayed events, chronologically ordered.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<RunEvent>,
    pub next_cursor: Option<u64>,
    pub has_more: bool,
}

/// In-process publish/subscribe plus a durable per-run `events.jsonl` log.
///
/// Publication order within a run is strict: each event gets a timestamp
/// greater than the previous one for that run. The append is flushed and
/// fsynced before subscribers see the event; a failed append is logged and
/// the in-memory publish still proceeds so live subscribers are not starved.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
    data_dir: PathBuf,
    last_ts: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            data_dir: data_dir.as_ref().to_path_buf(),
            last_ts: Arc::new(Mutex::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn log_path(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id).join("events.jsonl")
    }

    pub fn publish(&self, mut event: RunEvent) {
        // Zero-padded sequence ids sort in publication order, which is what
        // WebSocket clients rely on when resuming via the replay endpoint.
        event.id = format!("evt_{:016x}", self.seq.fetch_add(1, Ordering::Relaxed));
        {
            let mut last = self.last_ts.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(prev) = last.get(&event.run_id) {
                if event.ts <= *prev {
                    event.ts = *prev + Duration::milliseconds(1);
                }
            }
            last.insert(event.run_id.clone(), event.ts);
        }

        if let Err(err) = self.append_durable(&event) {
            tracing::error!(run_id = %event.run_id, error = %err, "event log append failed");
        }

        let _ = self.tx.send(event);
    }

    fn append_durable(&self, event: &RunEvent) -> anyhow::Result<()> {
        let path = self.log_path(&event.run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Subscribe to the live stream, optionally filtered to one run.
    pub fn subscribe(&self, run_id: Option<String>) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            run_id,
        }
    }

    /// Page backward through the on-disk log. `before` is a byte offset from
    /// a previous page's `next_cursor`; events strictly before it are read.
    pub fn replay(&self, run_id: &str, limit: usize, before: Option<u64>) -> anyhow::Result<EventPage> {
        self.replay_blocks(run_id, limit, before, REPLAY_BLOCK_SIZE)
    }

    fn replay_blocks(
        &self,
        run_id: &str,
        limit: usize,
        before: Option<u64>,
        block_size: u64,
    ) -> anyhow::Result<EventPage> {
        let path = self.log_path(run_id);
        if limit == 0 || !path.exists() {
            return Ok(EventPage {
                events: Vec::new(),
                next_cursor: None,
                has_more: false,
            });
        }

        let mut file = fs::File::open(&path)?;
        let len = file.metadata()?.len();
        let end = before.unwrap_or(len).min(len);
        if end == 0 {
            return Ok(EventPage {
                events: Vec::new(),
                next_cursor: None,
                has_more: false,
            });
        }

        // Grow the tail region backward one block at a time until it holds
        // enough complete lines. A region starting mid-file may begin with a
        // partial line, so one extra newline is required before stopping.
        let mut region_start = end;
        let mut buf: Vec<u8> = Vec::new();
        loop {
            if region_start == 0 {
                break;
            }
            let next_start = region_start.saturating_sub(block_size);
            let chunk_len = (region_start - next_start) as usize;
            let mut chunk = vec![0u8; chunk_len];
            file.seek(SeekFrom::Start(next_start))?;
            file.read_exact(&mut chunk)?;
            chunk.extend_from_slice(&buf);
            buf = chunk;
            region_start = next_start;

            let newlines = buf.iter().filter(|b| **b == b'\n').count();
            let needed = if region_start == 0 { limit } else { limit + 1 };
            if newlines > needed {
                break;
            }
        }

        // Collect complete lines with their absolute byte offsets.
        let mut lines: Vec<(u64, &[u8])> = Vec::new();
        let mut line_start = 0usize;
        for (idx, byte) in buf.iter().enumerate() {
            if *byte == b'\n' {
                let abs = region_start + line_start as u64;
                lines.push((abs, &buf[line_start..idx]));
                line_start = idx + 1;
            }
        }
        if region_start > 0 && !lines.is_empty() {
            // First entry may be a partial line cut by the block boundary.
            lines.remove(0);
        }

        let keep_from = lines.len().saturating_sub(limit);
        let page: Vec<(u64, &[u8])> = lines.split_off(keep_from);
        let first_offset = page.first().map(|(offset, _)| *offset);

        let mut events = Vec::with_capacity(page.len());
        for (_, raw) in &page {
            match serde_json::from_slice::<RunEvent>(raw) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(run_id, error = %err, "skipping unparseable event log line")
                }
            }
        }

        let has_more = first_offset.map(|offset| offset > 0).unwrap_or(false);
        Ok(EventPage {
            events,
            next_cursor: if has_more { first_offset } else { None },
            has_more,
        })
    }
}

/// A live subscription. Lagged receivers do not block the publisher; dropped
/// events surface as a single `event.gap` marker carrying the count.
pub struct EventSubscription {
    rx: broadcast::Receiver<RunEvent>,
    run_id: Option<String>,
}

impl EventSubscription {
    /// Next matching event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(wanted) = &self.run_id {
                        if &event.run_id != wanted {
                            continue;
                        }
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    let run_id = self.run_id.clone().unwrap_or_default();
                    return Some(RunEvent::new(
                        run_id,
                        "event.gap",
                        serde_json::json!({ "dropped": missed }),
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn event(run_id: &str, n: usize) -> RunEvent {
        RunEvent::new(run_id, "node.progress", json!({ "n": n }))
    }

    #[tokio::test]
    async fn publish_appends_before_subscribers_observe() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path());
        let mut sub = bus.subscribe(Some("run_1".to_string()));

        bus.publish(event("run_1", 1));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.properties["n"], 1);

        let raw = fs::read_to_string(dir.path().join("runs/run_1/events.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 1);
        assert!(raw.contains("node.progress"));
    }

    #[tokio::test]
    async fn timestamps_are_strictly_increasing_per_run() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path());
        let mut sub = bus.subscribe(Some("run_1".to_string()));

        for n in 0..5 {
            bus.publish(event("run_1", n));
        }

        let mut previous = None;
        for _ in 0..5 {
            let received = sub.recv().await.unwrap();
            if let Some(prev) = previous {
                assert!(received.ts > prev, "expected strictly increasing timestamps");
            }
            previous = Some(received.ts);
        }
    }

    #[tokio::test]
    async fn event_ids_are_monotonic_in_publication_order() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path());
        let mut sub = bus.subscribe(None);

        bus.publish(event("run_a", 1));
        bus.publish(event("run_b", 2));
        bus.publish(event("run_a", 3));

        let mut previous = String::new();
        for _ in 0..3 {
            let received = sub.recv().await.unwrap();
            assert!(received.id > previous);
            previous = received.id;
        }
    }

    #[tokio::test]
    async fn subscription_filters_by_run() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path());
        let mut sub = bus.subscribe(Some("run_b".to_string()));

        bus.publish(event("run_a", 1));
        bus.publish(event("run_b", 2));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.run_id, "run_b");
    }

    #[test]
    fn replay_pages_backward_in_chronological_order() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path());
        for n in 0..10 {
            bus.publish(event("run_1", n));
        }

        let page = bus.replay("run_1", 3, None).unwrap();
        assert_eq!(page.events.len(), 3);
        assert_eq!(page.events[0].properties["n"], 7);
        assert_eq!(page.events[2].properties["n"], 9);
        assert!(page.has_more);
        let cursor = page.next_cursor.expect("cursor while more pages remain");

        let page2 = bus.replay("run_1", 3, Some(cursor)).unwrap();
        assert_eq!(page2.events[0].properties["n"], 4);
        assert_eq!(page2.events[2].properties["n"], 6);

        // Walk to the beginning; collected pages reconstruct the full log.
        let mut all: Vec<i64> = Vec::new();
        let mut cursor = None;
        loop {
            let page = bus.replay("run_1", 3, cursor).unwrap();
            let ns: Vec<i64> = page
                .events
                .iter()
                .map(|e| e.properties["n"].as_i64().unwrap())
                .collect();
            all.splice(0..0, ns);
            if !page.has_more {
                assert!(page.next_cursor.is_none());
                break;
            }
            cursor = page.next_cursor;
        }
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn replay_crosses_block_boundaries() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path());
        for n in 0..20 {
            bus.publish(event("run_1", n));
        }

        // Tiny blocks force the tail scan to stitch partial lines together.
        let page = bus.replay_blocks("run_1", 8, None, 32).unwrap();
        assert_eq!(page.events.len(), 8);
        let ns: Vec<i64> = page
            .events
            .iter()
            .map(|e| e.properties["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, (12..20).collect::<Vec<_>>());
        assert!(page.has_more);
    }

    #[test]
    fn replay_of_missing_run_is_empty() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path());
        let page = bus.replay("run_missing", 10, None).unwrap();
        assert!(page.events.is_empty());
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }
}
