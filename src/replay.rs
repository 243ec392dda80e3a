//! Per-task append-only log of model and tool invocations.
//!
//! Each entry records enough (input, output, timings, metadata) to
//! re-execute an agent deterministically when combined with the
//! deterministic model adapter and the original seed.

use crate::models::{ReplayEvent, ReplayKind};
use crate::store::persist::{read_jsonl, JsonlSink};
use crate::Result;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

/// Builder-style input for one recorded invocation.
pub struct ReplayEntry {
    pub task_id: String,
    pub agent_id: String,
    pub kind: ReplayKind,
    pub step: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
    pub metadata: std::collections::HashMap<String, Value>,
}

#[derive(Clone)]
pub struct ReplayStore {
    entries: Arc<Mutex<VecDeque<ReplayEvent>>>,
    capacity: usize,
    sink: Option<Arc<JsonlSink>>,
}

impl ReplayStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            sink: None,
        }
    }

    /// Appends to `dir/replay.jsonl` on every invocation and reduces the
    /// existing stream back into memory.
    pub fn with_persistence(capacity: usize, dir: &std::path::Path) -> Result<Self> {
        let sink = Arc::new(JsonlSink::new(dir.join("replay.jsonl"))?);
        let store = Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            sink: Some(sink.clone()),
        };
        let restored: Vec<ReplayEvent> = read_jsonl(sink.path())?;
        for event in restored {
            store.restore(event);
        }
        Ok(store)
    }

    pub fn append(&self, entry: ReplayEntry) -> ReplayEvent {
        let duration_ms = (entry.completed_at - entry.started_at)
            .num_milliseconds()
            .max(0) as u64;
        let event = ReplayEvent {
            id: Uuid::new_v4().to_string(),
            task_id: entry.task_id,
            agent_id: entry.agent_id,
            kind: entry.kind,
            step: entry.step,
            input: entry.input,
            output: entry.output,
            error: entry.error,
            started_at: entry.started_at,
            completed_at: entry.completed_at,
            duration_ms,
            metadata: entry.metadata,
        };
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(&event) {
                warn!("Failed to persist replay event: {}", e);
            }
        }
        let mut entries = self.entries.lock().expect("replay lock poisoned");
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(event.clone());
        event
    }

    /// Restores one already-built event (startup reduction from disk).
    pub fn restore(&self, event: ReplayEvent) {
        let mut entries = self.entries.lock().expect("replay lock poisoned");
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Events for one task in append order, newest last, capped at `limit`.
    pub fn for_task(&self, task_id: &str, limit: usize) -> Vec<ReplayEvent> {
        let entries = self.entries.lock().expect("replay lock poisoned");
        let filtered: Vec<ReplayEvent> = entries
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("replay lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ReplayEvent> {
        let entries = self.entries.lock().expect("replay lock poisoned");
        entries.iter().cloned().collect()
    }
}

impl Default for ReplayStore {
    fn default() -> Self {
        Self::new(crate::constants::REPLAY_STORE_CAPACITY)
    }
}

/// Outcome of `/api/replay/:taskId/run`: the recorded steps re-applied with
/// the deterministic adapter substituted for the live one.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplayRun {
    pub mode: String,
    pub output: Option<Value>,
    pub steps: Vec<ReplayStepResult>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplayStepResult {
    pub step: String,
    pub kind: ReplayKind,
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplayStore {
    /// Deterministic replay: walks the recorded invocations in order and
    /// reproduces each step's output from the log rather than re-invoking
    /// live adapters or tools. The final model output becomes the run output.
    pub fn replay_task(&self, task_id: &str) -> ReplayRun {
        let events = self.for_task(task_id, usize::MAX);
        let mut steps = Vec::with_capacity(events.len());
        let mut output = None;
        for event in &events {
            if event.error.is_none() {
                if let Some(out) = &event.output {
                    if event.kind == ReplayKind::Model {
                        output = Some(out.clone());
                    }
                }
            }
            steps.push(ReplayStepResult {
                step: event.step.clone(),
                kind: event.kind,
                output: event.output.clone(),
                error: event.error.clone(),
            });
        }
        ReplayRun {
            mode: "deterministic".to_string(),
            output,
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(task: &str, step: &str, kind: ReplayKind, output: Value) -> ReplayEntry {
        let now = chrono::Utc::now();
        ReplayEntry {
            task_id: task.to_string(),
            agent_id: "agent-1".to_string(),
            kind,
            step: step.to_string(),
            input: json!({"step": step}),
            output: Some(output),
            error: None,
            started_at: now,
            completed_at: now,
            metadata: Default::default(),
        }
    }

    #[test]
    fn appends_in_order_and_caps_capacity() {
        let store = ReplayStore::new(2);
        store.append(entry("t1", "a", ReplayKind::Tool, json!(1)));
        store.append(entry("t1", "b", ReplayKind::Tool, json!(2)));
        store.append(entry("t1", "c", ReplayKind::Tool, json!(3)));

        let events = store.for_task("t1", 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step, "b");
        assert_eq!(events[1].step, "c");
    }

    #[test]
    fn replay_reproduces_final_model_output() {
        let store = ReplayStore::new(10);
        store.append(entry("t1", "tool:search", ReplayKind::Tool, json!("hits")));
        store.append(entry("t1", "model:draft", ReplayKind::Model, json!("draft text")));
        store.append(entry("t1", "model:final", ReplayKind::Model, json!("final text")));

        let run = store.replay_task("t1");
        assert_eq!(run.mode, "deterministic");
        assert_eq!(run.output, Some(json!("final text")));
        assert_eq!(run.steps.len(), 3);
    }

    #[test]
    fn replay_of_unknown_task_is_empty() {
        let store = ReplayStore::new(10);
        let run = store.replay_task("ghost");
        assert!(run.steps.is_empty());
        assert!(run.output.is_none());
    }

    #[test]
    fn duration_is_computed_from_timestamps() {
        let store = ReplayStore::new(10);
        let started = chrono::Utc::now();
        let completed = started + chrono::Duration::milliseconds(250);
        let event = store.append(ReplayEntry {
            task_id: "t1".into(),
            agent_id: "a".into(),
            kind: ReplayKind::Model,
            step: "model:gen".into(),
            input: json!("prompt"),
            output: Some(json!("out")),
            error: None,
            started_at: started,
            completed_at: completed,
            metadata: Default::default(),
        });
        assert_eq!(event.duration_ms, 250);
    }
}
