//! Per-task execution contexts: variable bag, step history, deadlines.

use crate::{MaestroError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// One entry of the ordered step history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub agent: String,
    pub action: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Snapshot of one task's execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    pub depth: u32,
    pub variables: HashMap<String, Value>,
    pub steps: Vec<StepRecord>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    /// Absolute wall-clock deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
}

impl TaskContext {
    fn new(task_id: &str, parent_task_id: Option<&str>, depth: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: None,
            parent_task_id: parent_task_id.map(|s| s.to_string()),
            depth,
            variables: HashMap::new(),
            steps: Vec::new(),
            start_time: chrono::Utc::now(),
            deadline: None,
        }
    }
}

/// Owner of all live execution contexts, keyed by task id.
#[derive(Clone)]
pub struct ContextManager {
    contexts: Arc<RwLock<HashMap<String, TaskContext>>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a fresh context. A child inherits the parent's variables as a
    /// snapshot taken now; later parent mutations do not propagate.
    pub async fn create_context(
        &self,
        task_id: &str,
        parent_task_id: Option<&str>,
    ) -> TaskContext {
        let mut contexts = self.contexts.write().await;
        let mut context = match parent_task_id.and_then(|p| contexts.get(p)) {
            Some(parent) => {
                let mut child = TaskContext::new(task_id, parent_task_id, parent.depth + 1);
                child.variables = parent.variables.clone();
                child.deadline = parent.deadline;
                child
            }
            None => TaskContext::new(task_id, parent_task_id, 0),
        };
        context.task_id = task_id.to_string();
        contexts.insert(task_id.to_string(), context.clone());
        debug!("Created context for task {} (depth {})", task_id, context.depth);
        context
    }

    /// Copies the parent's variables into an existing child context
    /// (snapshot semantics: the copy reflects the parent at call time).
    pub async fn inherit_from_parent(&self, child_id: &str) -> Result<()> {
        let mut contexts = self.contexts.write().await;
        let parent_vars = {
            let child = contexts
                .get(child_id)
                .ok_or_else(|| MaestroError::NotFound(format!("context {child_id}")))?;
            let parent_id = child
                .parent_task_id
                .clone()
                .ok_or_else(|| MaestroError::execution("context has no parent"))?;
            contexts
                .get(&parent_id)
                .ok_or_else(|| MaestroError::NotFound(format!("context {parent_id}")))?
                .variables
                .clone()
        };
        let child = contexts.get_mut(child_id).expect("checked above");
        for (key, value) in parent_vars {
            child.variables.entry(key).or_insert(value);
        }
        Ok(())
    }

    pub async fn set_variable(&self, task_id: &str, key: &str, value: Value) -> Result<()> {
        let mut contexts = self.contexts.write().await;
        let context = contexts
            .get_mut(task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("context {task_id}")))?;
        context.variables.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn get_variable(&self, task_id: &str, key: &str) -> Option<Value> {
        let contexts = self.contexts.read().await;
        contexts
            .get(task_id)
            .and_then(|c| c.variables.get(key).cloned())
    }

    pub async fn set_agent(&self, task_id: &str, agent_id: &str) {
        let mut contexts = self.contexts.write().await;
        if let Some(context) = contexts.get_mut(task_id) {
            context.agent_id = Some(agent_id.to_string());
        }
    }

    /// Sets an absolute deadline. The executor refuses to launch further
    /// children once it is past.
    pub async fn set_deadline(&self, task_id: &str, deadline: chrono::DateTime<chrono::Utc>) {
        let mut contexts = self.contexts.write().await;
        if let Some(context) = contexts.get_mut(task_id) {
            context.deadline = Some(deadline);
        }
    }

    /// Pure read: true when no deadline is set or it has not passed.
    pub async fn is_within_deadline(&self, task_id: &str) -> bool {
        let contexts = self.contexts.read().await;
        match contexts.get(task_id).and_then(|c| c.deadline) {
            Some(deadline) => chrono::Utc::now() <= deadline,
            None => true,
        }
    }

    /// Appends one step; duration is measured from the previous step's
    /// timestamp, or from `start_time` for the first step.
    pub async fn record_step(
        &self,
        task_id: &str,
        agent: &str,
        action: &str,
        input: Value,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut contexts = self.contexts.write().await;
        let context = contexts
            .get_mut(task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("context {task_id}")))?;
        let now = chrono::Utc::now();
        let since = context
            .steps
            .last()
            .map(|s| s.timestamp)
            .unwrap_or(context.start_time);
        let duration_ms = (now - since).num_milliseconds().max(0) as u64;
        context.steps.push(StepRecord {
            timestamp: now,
            agent: agent.to_string(),
            action: action.to_string(),
            input,
            output,
            error,
            duration_ms,
        });
        Ok(())
    }

    pub async fn snapshot(&self, task_id: &str) -> Option<TaskContext> {
        let contexts = self.contexts.read().await;
        contexts.get(task_id).cloned()
    }

    /// Removes the per-task state. The executor calls this on every exit
    /// path.
    pub async fn cleanup_context(&self, task_id: &str) {
        let mut contexts = self.contexts.write().await;
        if contexts.remove(task_id).is_some() {
            debug!("Cleaned up context for task {}", task_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn child_inherits_parent_variables_as_snapshot() {
        let manager = ContextManager::new();
        manager.create_context("parent", None).await;
        manager
            .set_variable("parent", "lang", json!("rust"))
            .await
            .unwrap();

        let child = manager.create_context("child", Some("parent")).await;
        assert_eq!(child.variables["lang"], json!("rust"));
        assert_eq!(child.depth, 1);

        // Later parent mutations do not propagate.
        manager
            .set_variable("parent", "lang", json!("go"))
            .await
            .unwrap();
        assert_eq!(
            manager.get_variable("child", "lang").await,
            Some(json!("rust"))
        );
    }

    #[tokio::test]
    async fn step_history_is_ordered_with_durations() {
        let manager = ContextManager::new();
        manager.create_context("t1", None).await;
        manager
            .record_step("t1", "agent-1", "plan", json!("in"), Some(json!("out")), None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        manager
            .record_step("t1", "agent-1", "act", json!("in2"), None, Some("boom".into()))
            .await
            .unwrap();

        let context = manager.snapshot("t1").await.unwrap();
        assert_eq!(context.steps.len(), 2);
        assert_eq!(context.steps[0].action, "plan");
        assert_eq!(context.steps[1].action, "act");
        assert!(context.steps[1].duration_ms >= 10);
        assert_eq!(context.steps[1].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn inherit_from_parent_takes_a_fresh_snapshot() {
        let manager = ContextManager::new();
        manager.create_context("parent", None).await;
        manager.create_context("child", Some("parent")).await;
        manager
            .set_variable("parent", "late", json!("value"))
            .await
            .unwrap();
        // Created before the variable existed; a second snapshot picks it up.
        assert!(manager.get_variable("child", "late").await.is_none());
        manager.inherit_from_parent("child").await.unwrap();
        assert_eq!(
            manager.get_variable("child", "late").await,
            Some(json!("value"))
        );

        // Child-local values are not overwritten by the snapshot.
        manager
            .set_variable("child", "own", json!("mine"))
            .await
            .unwrap();
        manager
            .set_variable("parent", "own", json!("theirs"))
            .await
            .unwrap();
        manager.inherit_from_parent("child").await.unwrap();
        assert_eq!(
            manager.get_variable("child", "own").await,
            Some(json!("mine"))
        );
    }

    #[tokio::test]
    async fn deadline_checks_are_pure_reads() {
        let manager = ContextManager::new();
        manager.create_context("t1", None).await;
        assert!(manager.is_within_deadline("t1").await);

        manager
            .set_deadline("t1", chrono::Utc::now() - chrono::Duration::seconds(1))
            .await;
        assert!(!manager.is_within_deadline("t1").await);
        assert!(!manager.is_within_deadline("t1").await);
    }

    #[tokio::test]
    async fn cleanup_removes_state() {
        let manager = ContextManager::new();
        manager.create_context("t1", None).await;
        manager.cleanup_context("t1").await;
        assert!(manager.snapshot("t1").await.is_none());
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn missing_context_errors_are_deterministic() {
        let manager = ContextManager::new();
        let err = manager
            .record_step("ghost", "a", "x", json!(null), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
