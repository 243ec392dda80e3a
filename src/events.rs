//! In-process publish/subscribe of typed task events.
//!
//! Delivery is at-most-once per subscription; ordering per task id follows
//! publish order. A bounded per-task replay buffer lets late subscribers
//! catch up on the last events immediately.

use crate::constants::{EVENT_CHANNEL_CAPACITY, EVENT_REPLAY_WINDOW};
use crate::models::TaskEvent;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::trace;

struct Inner {
    sender: broadcast::Sender<TaskEvent>,
    replay: HashMap<String, VecDeque<TaskEvent>>,
}

#[derive(Clone)]
pub struct EventBus {
    // Publishing appends to the replay window and broadcasts under one lock,
    // so per-task ordering is the lock acquisition order.
    inner: Arc<Mutex<Inner>>,
}

/// Filtered view of the bus handed to one subscriber.
pub struct Subscription {
    rx: broadcast::Receiver<TaskEvent>,
    task_id: Option<String>,
    types: Option<HashSet<String>>,
    /// Buffered events delivered before any live ones.
    replay: VecDeque<TaskEvent>,
}

impl Subscription {
    fn matches(&self, event: &TaskEvent) -> bool {
        if let Some(task_id) = &self.task_id {
            if &event.task_id != task_id {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        true
    }

    /// Discards the buffered replay window; only live events follow. Used
    /// by subscribers that already hold a current snapshot.
    pub fn drain_replay(&mut self) {
        self.replay.clear();
    }

    /// Next matching event. Returns `None` once the bus is gone.
    /// A lagged receiver skips what it missed; delivery is at-most-once.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!("Event subscription lagged, skipped {}", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sender,
                replay: HashMap::new(),
            })),
        }
    }

    /// Publishes one event; fills the task's replay window and fans out to
    /// live subscribers. Publishing never fails: with no subscribers the
    /// event still lands in the replay buffer.
    pub fn publish(&self, event: TaskEvent) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let buffer = inner
            .replay
            .entry(event.task_id.clone())
            .or_insert_with(VecDeque::new);
        if buffer.len() >= EVENT_REPLAY_WINDOW {
            buffer.pop_front();
        }
        buffer.push_back(event.clone());
        let _ = inner.sender.send(event);
    }

    /// Subscribes with optional task-id and type-set filters. The returned
    /// subscription first yields the matching replay window, then live
    /// events.
    pub fn subscribe(
        &self,
        task_id: Option<&str>,
        types: Option<&[&str]>,
    ) -> Subscription {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        let types: Option<HashSet<String>> =
            types.map(|t| t.iter().map(|s| s.to_string()).collect());

        let replay: VecDeque<TaskEvent> = match task_id {
            Some(id) => inner
                .replay
                .get(id)
                .map(|buf| {
                    buf.iter()
                        .filter(|e| {
                            types
                                .as_ref()
                                .map(|t| t.contains(&e.event_type))
                                .unwrap_or(true)
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            None => VecDeque::new(),
        };

        Subscription {
            rx: inner.sender.subscribe(),
            task_id: task_id.map(|s| s.to_string()),
            types,
            replay,
        }
    }

    /// Snapshot of the replay window for one task.
    pub fn buffered(&self, task_id: &str) -> Vec<TaskEvent> {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        inner
            .replay
            .get(task_id)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops the replay window of a deleted task.
    pub fn forget_task(&self, task_id: &str) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.replay.remove(task_id);
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        inner.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_in_publish_order_per_task() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Some("t1"), None);

        bus.publish(TaskEvent::new("task.started", "t1", json!({})));
        bus.publish(TaskEvent::new("task.progress", "t1", json!({"pct": 50})));
        bus.publish(TaskEvent::new("task.started", "t2", json!({})));
        bus.publish(TaskEvent::new("task.completed", "t1", json!({})));

        assert_eq!(sub.recv().await.unwrap().event_type, "task.started");
        assert_eq!(sub.recv().await.unwrap().event_type, "task.progress");
        assert_eq!(sub.recv().await.unwrap().event_type, "task.completed");
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay_window() {
        let bus = EventBus::new();
        bus.publish(TaskEvent::new("task.started", "t1", json!({})));
        bus.publish(TaskEvent::new("task.progress", "t1", json!({"pct": 10})));

        let mut sub = bus.subscribe(Some("t1"), None);
        assert_eq!(sub.recv().await.unwrap().event_type, "task.started");
        assert_eq!(sub.recv().await.unwrap().event_type, "task.progress");
    }

    #[tokio::test]
    async fn replay_window_is_bounded_drop_oldest() {
        let bus = EventBus::new();
        for i in 0..(EVENT_REPLAY_WINDOW + 10) {
            bus.publish(TaskEvent::new("task.progress", "t1", json!({ "i": i })));
        }
        let buffered = bus.buffered("t1");
        assert_eq!(buffered.len(), EVENT_REPLAY_WINDOW);
        assert_eq!(buffered[0].data["i"], 10);
    }

    #[tokio::test]
    async fn type_filter_applies_to_replay_and_live() {
        let bus = EventBus::new();
        bus.publish(TaskEvent::new("task.started", "t1", json!({})));
        bus.publish(TaskEvent::new("tool.called", "t1", json!({})));

        let mut sub = bus.subscribe(Some("t1"), Some(&["tool.called", "tool.completed"]));
        assert_eq!(sub.recv().await.unwrap().event_type, "tool.called");

        bus.publish(TaskEvent::new("task.progress", "t1", json!({})));
        bus.publish(TaskEvent::new("tool.completed", "t1", json!({})));
        assert_eq!(sub.recv().await.unwrap().event_type, "tool.completed");
    }

    #[tokio::test]
    async fn forget_task_clears_buffer() {
        let bus = EventBus::new();
        bus.publish(TaskEvent::new("task.started", "t1", json!({})));
        bus.forget_task("t1");
        assert!(bus.buffered("t1").is_empty());
    }
}
