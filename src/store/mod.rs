//! Canonical record of every submitted task.
//!
//! Single source of truth for external task identity: HTTP history queries,
//! conversation linkage, retry lineage, and per-agent stats all read from
//! here. Every status change pushes a projection onto the event bus.

pub mod persist;

use crate::constants::{AGENT_STATS_WINDOW_HOURS, MAX_STORED_TASKS};
use crate::events::EventBus;
use crate::models::{TaskEvent, TaskRecord, TaskStatus};
use crate::{MaestroError, Result};
use persist::JsonlSink;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Persisted mutation; the on-disk stream is reduced last-wins by id.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskStoreOp {
    Put { task: TaskRecord },
    Delete { id: String },
    Clear,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub agent_id: String,
    pub window_hours: i64,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub success_rate_percent: f64,
    pub avg_execution_time_ms: f64,
    pub top_failure_reasons: Vec<(String, u64)>,
    /// Wired through; emits 0 until a cost model exists.
    pub estimated_cost: f64,
}

#[derive(Clone)]
pub struct TaskStore {
    tasks: Arc<RwLock<HashMap<String, TaskRecord>>>,
    events: EventBus,
    sink: Option<Arc<JsonlSink>>,
}

impl TaskStore {
    pub fn new(events: EventBus) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            events,
            sink: None,
        }
    }

    /// Enables JSONL persistence under `dir/tasks.jsonl` and loads whatever
    /// is already there.
    pub async fn with_persistence(events: EventBus, dir: &std::path::Path) -> Result<Self> {
        let sink = Arc::new(JsonlSink::new(dir.join("tasks.jsonl"))?);
        let store = Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            events,
            sink: Some(sink.clone()),
        };
        let ops: Vec<TaskStoreOp> = persist::read_jsonl(sink.path())?;
        let count = ops.len();
        {
            let mut tasks = store.tasks.write().await;
            for op in ops {
                match op {
                    TaskStoreOp::Put { task } => {
                        tasks.insert(task.id.clone(), task);
                    }
                    TaskStoreOp::Delete { id } => {
                        tasks.remove(&id);
                    }
                    TaskStoreOp::Clear => tasks.clear(),
                }
            }
            info!("Restored {} task records from {} ops on disk", tasks.len(), count);
        }
        Ok(store)
    }

    fn persist(&self, op: &TaskStoreOp) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(op) {
                warn!("Failed to persist task store op: {}", e);
            }
        }
    }

    fn project(&self, record: &TaskRecord) {
        self.events.publish(TaskEvent::new(
            "task.updated",
            record.id.clone(),
            serde_json::to_value(record).unwrap_or_default(),
        ));
    }

    /// Creates a record; the id must be free.
    pub async fn create(&self, record: TaskRecord) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&record.id) {
            return Err(MaestroError::Validation(format!(
                "task {} already exists",
                record.id
            )));
        }
        if tasks.len() >= MAX_STORED_TASKS {
            // FIFO trim of the oldest terminal record.
            if let Some(oldest) = tasks
                .values()
                .filter(|t| t.status.is_terminal())
                .min_by_key(|t| t.started_at)
                .map(|t| t.id.clone())
            {
                tasks.remove(&oldest);
            }
        }
        self.persist(&TaskStoreOp::Put {
            task: record.clone(),
        });
        self.project(&record);
        debug!("Created task record {}", record.id);
        tasks.insert(record.id.clone(), record);
        Ok(())
    }

    /// Applies a mutation. Status transitions are checked for monotonicity:
    /// an attempt to leave a terminal state is rejected.
    pub async fn update<F>(&self, task_id: &str, mutate: F) -> Result<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .get_mut(task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("task {task_id}")))?;
        let before = record.status;
        // Mutate a copy so a rejected transition leaves nothing behind.
        let mut candidate = record.clone();
        mutate(&mut candidate);
        if candidate.status != before && !before.can_transition_to(candidate.status) {
            return Err(MaestroError::Validation(format!(
                "invalid status transition {before} -> {} for task {task_id}",
                candidate.status
            )));
        }
        *record = candidate;
        let snapshot = record.clone();
        drop(tasks);
        self.persist(&TaskStoreOp::Put {
            task: snapshot.clone(),
        });
        self.project(&snapshot);
        Ok(snapshot)
    }

    pub async fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<TaskRecord> {
        self.update(task_id, |record| {
            record.status = status;
        })
        .await
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        let tasks = self.tasks.read().await;
        tasks.get(task_id).cloned()
    }

    /// Records sorted by `started_at`; `descending` gives newest first.
    pub async fn list(&self, limit: usize, descending: bool) -> Vec<TaskRecord> {
        let tasks = self.tasks.read().await;
        let mut records: Vec<TaskRecord> = tasks.values().cloned().collect();
        records.sort_by_key(|r| r.started_at);
        if descending {
            records.reverse();
        }
        records.truncate(limit);
        records
    }

    pub async fn active(&self) -> Vec<TaskRecord> {
        let tasks = self.tasks.read().await;
        let mut records: Vec<TaskRecord> = tasks
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Binds a task to a conversation thread.
    pub async fn link_conversation(&self, task_id: &str, conversation_id: &str) -> Result<()> {
        self.update(task_id, |record| {
            record.conversation_id = Some(conversation_id.to_string());
        })
        .await
        .map(|_| ())
    }

    /// Resolves the canonical conversation id for a claimed one: the thread
    /// root's own id. Never trusts the client value alone.
    pub async fn canonical_conversation_id(&self, claimed: &str) -> Option<String> {
        let tasks = self.tasks.read().await;
        let root = tasks.get(claimed)?;
        Some(match &root.conversation_id {
            Some(existing) => existing.clone(),
            None => root.id.clone(),
        })
    }

    /// Prior turns of a conversation, oldest first, as (input, output).
    /// `exclude_id` drops the in-flight task itself from its own context.
    pub async fn conversation_turns(
        &self,
        conversation_id: &str,
        exclude_id: Option<&str>,
    ) -> Vec<(String, Option<String>)> {
        let tasks = self.tasks.read().await;
        let mut members: Vec<&TaskRecord> = tasks
            .values()
            .filter(|r| {
                (r.conversation_id.as_deref() == Some(conversation_id)
                    || r.id == conversation_id)
                    && Some(r.id.as_str()) != exclude_id
            })
            .collect();
        members.sort_by_key(|r| r.started_at);
        members
            .iter()
            .map(|r| (r.input.clone(), r.output.clone()))
            .collect()
    }

    /// Deletes a task. When the task belongs to a conversation, the whole
    /// conversation goes with it. Returns the deleted ids.
    pub async fn delete(&self, task_id: &str) -> Result<Vec<String>> {
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .get(task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("task {task_id}")))?;
        let conversation = record
            .conversation_id
            .clone()
            .unwrap_or_else(|| record.id.clone());

        let doomed: Vec<String> = tasks
            .values()
            .filter(|r| {
                r.id == task_id
                    || r.id == conversation
                    || r.conversation_id.as_deref() == Some(conversation.as_str())
            })
            .map(|r| r.id.clone())
            .collect();
        for id in &doomed {
            tasks.remove(id);
            self.persist(&TaskStoreOp::Delete { id: id.clone() });
            self.events.forget_task(id);
        }
        info!("Deleted {} task(s) for conversation {}", doomed.len(), conversation);
        Ok(doomed)
    }

    pub async fn clear(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let count = tasks.len();
        tasks.clear();
        self.persist(&TaskStoreOp::Clear);
        count
    }

    /// Rebuilds the slot for a terminal task id so a retry can reuse it.
    /// An active prior run yields `TASK_RUNNING`.
    pub async fn begin_retry(&self, task_id: &str, input: Option<String>) -> Result<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let prior = tasks
            .get(task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("task {task_id}")))?;
        if !prior.status.is_terminal() {
            return Err(MaestroError::TaskRunning {
                task_id: task_id.to_string(),
            });
        }
        let mut record = TaskRecord::new(task_id, input.unwrap_or_else(|| prior.input.clone()));
        record.conversation_id = prior.conversation_id.clone();
        record.generation = prior.generation.clone();
        record.original_task_id = Some(
            prior
                .original_task_id
                .clone()
                .unwrap_or_else(|| prior.id.clone()),
        );
        record.retry_count = prior.retry_count + 1;
        record.is_retry = true;
        tasks.insert(record.id.clone(), record.clone());
        drop(tasks);
        self.persist(&TaskStoreOp::Put {
            task: record.clone(),
        });
        self.project(&record);
        Ok(record)
    }

    /// Creates a new retry record under a fresh id, linked to the original.
    /// The original's retry count increases by one.
    pub async fn create_linked_retry(&self, original_id: &str) -> Result<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let original = tasks
            .get_mut(original_id)
            .ok_or_else(|| MaestroError::NotFound(format!("task {original_id}")))?;
        original.retry_count += 1;
        let original_snapshot = original.clone();

        let mut record = TaskRecord::new(
            uuid::Uuid::new_v4().to_string(),
            original_snapshot.input.clone(),
        );
        record.conversation_id = original_snapshot.conversation_id.clone();
        record.generation = original_snapshot.generation.clone();
        record.original_task_id = Some(original_id.to_string());
        record.is_retry = true;
        tasks.insert(record.id.clone(), record.clone());
        drop(tasks);
        self.persist(&TaskStoreOp::Put {
            task: original_snapshot,
        });
        self.persist(&TaskStoreOp::Put {
            task: record.clone(),
        });
        self.project(&record);
        Ok(record)
    }

    /// Per-agent stats over the recent window.
    pub async fn agent_stats(&self, agent_id: &str) -> AgentStats {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(AGENT_STATS_WINDOW_HOURS);
        let tasks = self.tasks.read().await;
        let mut total = 0u64;
        let mut completed = 0u64;
        let mut failed = 0u64;
        let mut cancelled = 0u64;
        let mut duration_sum = 0u64;
        let mut duration_count = 0u64;
        let mut reasons: HashMap<String, u64> = HashMap::new();

        for record in tasks.values() {
            if record.agent_id.as_deref() != Some(agent_id) || record.started_at < cutoff {
                continue;
            }
            total += 1;
            match record.status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => {
                    failed += 1;
                    let reason = record
                        .error_code
                        .clone()
                        .or_else(|| record.error.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    *reasons.entry(reason).or_default() += 1;
                }
                TaskStatus::Cancelled => cancelled += 1,
                _ => {}
            }
            if let Some(ms) = record.duration_ms {
                duration_sum += ms;
                duration_count += 1;
            }
        }

        let settled = completed + failed;
        let mut top_failure_reasons: Vec<(String, u64)> = reasons.into_iter().collect();
        top_failure_reasons.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top_failure_reasons.truncate(5);

        AgentStats {
            agent_id: agent_id.to_string(),
            window_hours: AGENT_STATS_WINDOW_HOURS,
            total,
            completed,
            failed,
            cancelled,
            success_rate_percent: if settled == 0 {
                0.0
            } else {
                completed as f64 * 100.0 / settled as f64
            },
            avg_execution_time_ms: if duration_count == 0 {
                0.0
            } else {
                duration_sum as f64 / duration_count as f64
            },
            top_failure_reasons,
            estimated_cost: 0.0,
        }
    }
}
