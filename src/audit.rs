//! Append-only ring buffer of security-relevant events.
//!
//! Components only write; reads happen through the query API behind
//! `/api/audit`. Oldest entries drop FIFO past the capacity.

use crate::models::{AuditEvent, AuditKind};
use crate::store::persist::{read_jsonl, JsonlSink};
use crate::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AuditLog {
    entries: Arc<Mutex<VecDeque<AuditEvent>>>,
    capacity: usize,
    sink: Option<Arc<JsonlSink>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            sink: None,
        }
    }

    /// Appends to `dir/audit.jsonl` on every record and reduces whatever is
    /// already on disk back into the ring.
    pub fn with_persistence(capacity: usize, dir: &std::path::Path) -> Result<Self> {
        let sink = Arc::new(JsonlSink::new(dir.join("audit.jsonl"))?);
        let log = Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            sink: Some(sink.clone()),
        };
        let restored: Vec<AuditEvent> = read_jsonl(sink.path())?;
        {
            let mut entries = log.entries.lock().expect("audit lock poisoned");
            for event in restored {
                if entries.len() >= capacity {
                    entries.pop_front();
                }
                entries.push_back(event);
            }
        }
        Ok(log)
    }

    pub fn record(&self, event: AuditEvent) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(&event) {
                warn!("Failed to persist audit event: {}", e);
            }
        }
        let mut entries = self.entries.lock().expect("audit lock poisoned");
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        debug!(
            kind = ?event.kind,
            agent = %event.agent_id,
            tool = event.tool_name.as_deref().unwrap_or("-"),
            "audit event"
        );
        entries.push_back(event);
    }

    /// Recent events, newest last, optionally filtered by task id.
    pub fn query(&self, task_id: Option<&str>, limit: usize) -> Vec<AuditEvent> {
        let entries = self.entries.lock().expect("audit lock poisoned");
        let filtered: Vec<AuditEvent> = entries
            .iter()
            .filter(|e| task_id.map(|id| e.task_id.as_deref() == Some(id)).unwrap_or(true))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }

    pub fn count_by_kind(&self, kind: AuditKind) -> usize {
        let entries = self.entries.lock().expect("audit lock poisoned");
        entries.iter().filter(|e| e.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries in order; used by persistence.
    pub fn snapshot(&self) -> Vec<AuditEvent> {
        let entries = self.entries.lock().expect("audit lock poisoned");
        entries.iter().cloned().collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(crate::constants::AUDIT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_drops_oldest_fifo() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.record(
                AuditEvent::new(AuditKind::ToolCall, "agent-1")
                    .with_detail("seq", json!(i)),
            );
        }
        assert_eq!(log.len(), 3);
        let entries = log.query(None, 10);
        assert_eq!(entries[0].details["seq"], 2);
        assert_eq!(entries[2].details["seq"], 4);
    }

    #[test]
    fn query_filters_by_task() {
        let log = AuditLog::new(10);
        log.record(AuditEvent::new(AuditKind::PermissionDenied, "a").with_task("t1"));
        log.record(AuditEvent::new(AuditKind::ToolCall, "a").with_task("t2"));
        log.record(AuditEvent::new(AuditKind::ToolTimeout, "a").with_task("t1"));

        let t1 = log.query(Some("t1"), 10);
        assert_eq!(t1.len(), 2);
        assert!(t1.iter().all(|e| e.task_id.as_deref() == Some("t1")));
    }

    #[test]
    fn limit_keeps_newest() {
        let log = AuditLog::new(10);
        for _ in 0..4 {
            log.record(AuditEvent::new(AuditKind::ToolCall, "a"));
        }
        log.record(AuditEvent::new(AuditKind::RateLimitExceeded, "a"));
        let recent = log.query(None, 1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, AuditKind::RateLimitExceeded);
    }
}
