//! Workflow front door: agent registration, workflow lifecycle, aggregate
//! metrics, and event fan-out to in-process listeners.

use crate::agents::AgentRegistry;
use crate::cancellation::CancellationRegistry;
use crate::events::EventBus;
use crate::executor::{ExecuteOptions, TaskExecutor, TaskOutcome};
use crate::models::{GenerationConfig, TaskEvent, TaskSpec, Workflow};
use crate::{MaestroError, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// In-process event listener; failures are isolated from the run.
pub type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Default)]
pub struct OrchestratorMetrics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub active: u64,
    pub avg_duration_ms: f64,
}

#[derive(Default)]
struct MetricsState {
    total: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    active: u64,
    avg_duration_ms: f64,
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: AgentRegistry,
    executor: TaskExecutor,
    cancellations: CancellationRegistry,
    events: EventBus,
    workflows: Arc<RwLock<HashMap<String, Workflow>>>,
    metrics: Arc<Mutex<MetricsState>>,
    listeners: Arc<Mutex<HashMap<usize, Listener>>>,
    next_listener_id: Arc<AtomicUsize>,
    max_concurrent: usize,
}

impl Orchestrator {
    pub fn new(
        registry: AgentRegistry,
        executor: TaskExecutor,
        cancellations: CancellationRegistry,
        events: EventBus,
        max_concurrent: usize,
    ) -> Self {
        Self {
            registry,
            executor,
            cancellations,
            events,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(Mutex::new(MetricsState::default())),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: Arc::new(AtomicUsize::new(1)),
            max_concurrent,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub async fn register_agent(&self, agent: Arc<dyn crate::agents::Agent>) -> bool {
        self.registry.register(agent).await
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        self.registry.unregister(agent_id).await
    }

    pub async fn create_workflow(
        &self,
        id: &str,
        name: &str,
        root: TaskSpec,
        variables: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Workflow> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(id) {
            return Err(MaestroError::Validation(format!(
                "workflow {id} already exists"
            )));
        }
        let mut workflow = Workflow::new(id, name, root);
        if let Some(variables) = variables {
            workflow.variables = variables;
        }
        workflows.insert(id.to_string(), workflow.clone());
        info!("Created workflow {} ({})", id, name);
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: &str) -> Option<Workflow> {
        let workflows = self.workflows.read().await;
        workflows.get(id).cloned()
    }

    /// Number of executions currently holding a slot.
    pub fn active_count(&self) -> u64 {
        self.metrics.lock().expect("metrics lock poisoned").active
    }

    pub fn has_capacity(&self) -> bool {
        (self.active_count() as usize) < self.max_concurrent
    }

    /// Runs a workflow to completion. The active count is decremented on
    /// every exit path; metrics and workflow events always fire.
    pub async fn execute_workflow(
        &self,
        id: &str,
        generation: GenerationConfig,
        token: Option<crate::cancellation::CancelToken>,
    ) -> Result<TaskOutcome> {
        let workflow = self
            .get_workflow(id)
            .await
            .ok_or_else(|| MaestroError::NotFound(format!("workflow {id}")))?;

        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            if metrics.active as usize >= self.max_concurrent {
                return Err(MaestroError::execution(format!(
                    "concurrency limit reached ({})",
                    self.max_concurrent
                )));
            }
            metrics.active += 1;
            metrics.total += 1;
        }

        // The token is keyed on the root task id; cancel_execution aborts
        // it and the executor propagates the abort down the tree. A caller
        // that already holds the task's token passes it in, keeping aborts
        // armed before this point effective.
        let token = match token {
            Some(token) => token,
            None => self.cancellations.get_or_create(&workflow.root.id).await,
        };

        self.emit(TaskEvent::new(
            "workflow.started",
            workflow.root.id.clone(),
            json!({ "workflow": workflow.id, "name": workflow.name }),
        ));

        // Seed initial variables in a parent scope the root inherits from.
        let scope_id = format!("wf-scope:{}", workflow.id);
        self.executor
            .contexts()
            .create_context(&scope_id, None)
            .await;
        for (key, value) in &workflow.variables {
            let _ = self
                .executor
                .contexts()
                .set_variable(&scope_id, key, value.clone())
                .await;
        }

        let outcome = self
            .executor
            .execute_task(
                &workflow.root,
                Some(&scope_id),
                &self.registry,
                ExecuteOptions {
                    token: token.clone(),
                    generation,
                },
            )
            .await;

        self.executor.contexts().cleanup_context(&scope_id).await;
        self.cancellations.cleanup(&workflow.root.id).await;

        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            metrics.active = metrics.active.saturating_sub(1);
            if outcome.success {
                metrics.completed += 1;
            } else if outcome.error_code.as_deref() == Some("ABORTED") {
                metrics.cancelled += 1;
            } else {
                metrics.failed += 1;
            }
            let settled = metrics.completed + metrics.failed + metrics.cancelled;
            if settled > 0 {
                metrics.avg_duration_ms +=
                    (outcome.duration_ms as f64 - metrics.avg_duration_ms) / settled as f64;
            }
        }

        self.emit(TaskEvent::new(
            "workflow.completed",
            workflow.root.id.clone(),
            json!({
                "workflow": workflow.id,
                "success": outcome.success,
                "duration_ms": outcome.duration_ms,
                "error": outcome.error,
            }),
        ));

        Ok(outcome)
    }

    /// Aborts the execution bound to the root task id. Idempotent; returns
    /// whether a live token existed.
    pub async fn cancel_execution(&self, root_task_id: &str) -> bool {
        let existed = self
            .cancellations
            .abort(root_task_id, "Task was cancelled by user")
            .await;
        if existed {
            info!("Cancelled execution {}", root_task_id);
        } else {
            warn!("Cancel requested for unknown execution {}", root_task_id);
        }
        existed
    }

    pub fn subscribe(&self, listener: Listener) -> usize {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .insert(id, listener);
        id
    }

    pub fn unsubscribe(&self, listener_id: usize) -> bool {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .remove(&listener_id)
            .is_some()
    }

    /// Publishes to the bus and fans out to listeners; a panicking listener
    /// is logged and dropped from the rest of the run, never propagated.
    fn emit(&self, event: TaskEvent) {
        self.events.publish(event.clone());
        let listeners: Vec<(usize, Listener)> = {
            let guard = self.listeners.lock().expect("listener lock poisoned");
            guard.iter().map(|(id, l)| (*id, l.clone())).collect()
        };
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!("Event listener {} panicked; removing it", id);
                self.unsubscribe(id);
            }
        }
    }

    pub fn get_metrics(&self) -> OrchestratorMetrics {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        OrchestratorMetrics {
            total: metrics.total,
            completed: metrics.completed,
            failed: metrics.failed,
            cancelled: metrics.cancelled,
            active: metrics.active,
            avg_duration_ms: metrics.avg_duration_ms,
        }
    }

    pub fn get_success_rate(&self) -> f64 {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        if metrics.total == 0 {
            return 0.0;
        }
        metrics.completed as f64 / metrics.total as f64
    }

    /// Test hook: clears metrics and workflows.
    pub async fn reset(&self) {
        *self.metrics.lock().expect("metrics lock poisoned") = MetricsState::default();
        self.workflows.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::builtin::{EchoAgent, SlowAgent};
    use crate::audit::AuditLog;
    use crate::config::ModelConfig;
    use crate::context::ContextManager;
    use crate::model::ModelChain;
    use crate::replay::ReplayStore;
    use crate::tools::ToolManager;
    use std::time::Duration;

    fn orchestrator(max_concurrent: usize) -> (Orchestrator, EventBus) {
        let events = EventBus::new();
        let replay = ReplayStore::new(100);
        let tools = ToolManager::new(AuditLog::new(100), replay.clone(), events.clone());
        let chain = Arc::new(ModelChain::new(&ModelConfig {
            mode: "auto".into(),
            gpt4all_base_url: None,
            ollama_base_url: None,
            openai_base_url: None,
        }));
        let executor = TaskExecutor::new(
            ContextManager::new(),
            events.clone(),
            tools,
            replay,
            chain,
        );
        (
            Orchestrator::new(
                AgentRegistry::new(),
                executor,
                CancellationRegistry::new(),
                events.clone(),
                max_concurrent,
            ),
            events,
        )
    }

    #[tokio::test]
    async fn workflow_lifecycle_updates_metrics() {
        let (orchestrator, events) = orchestrator(2);
        orchestrator.register_agent(Arc::new(EchoAgent)).await;
        let mut sub = events.subscribe(Some("root"), Some(&["workflow.started", "workflow.completed"]));

        orchestrator
            .create_workflow(
                "wf1",
                "echo flow",
                TaskSpec::atomic("root", "echo", Some(json!("hi"))),
                None,
            )
            .await
            .unwrap();

        let outcome = orchestrator
            .execute_workflow("wf1", GenerationConfig::default(), None)
            .await
            .unwrap();
        assert!(outcome.success);

        let metrics = orchestrator.get_metrics();
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.active, 0);
        assert!((orchestrator.get_success_rate() - 1.0).abs() < f64::EPSILON);

        assert_eq!(sub.recv().await.unwrap().event_type, "workflow.started");
        let done = sub.recv().await.unwrap();
        assert_eq!(done.event_type, "workflow.completed");
        assert_eq!(done.data["success"], json!(true));
    }

    #[tokio::test]
    async fn duplicate_workflow_ids_are_rejected() {
        let (orchestrator, _) = orchestrator(2);
        orchestrator
            .create_workflow("wf1", "a", TaskSpec::atomic("r1", "echo", None), None)
            .await
            .unwrap();
        assert!(orchestrator
            .create_workflow("wf1", "b", TaskSpec::atomic("r2", "echo", None), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn concurrency_limit_is_enforced_and_released() {
        let (orchestrator, _) = orchestrator(1);
        orchestrator
            .register_agent(Arc::new(SlowAgent::new(Duration::from_millis(150))))
            .await;
        orchestrator.register_agent(Arc::new(EchoAgent)).await;
        orchestrator
            .create_workflow("wf1", "slow", TaskSpec::atomic("slow-root", "slow", Some(json!("x"))), None)
            .await
            .unwrap();
        orchestrator
            .create_workflow("wf2", "fast", TaskSpec::atomic("fast-root", "echo", Some(json!("y"))), None)
            .await
            .unwrap();

        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .execute_workflow("wf1", GenerationConfig::default(), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let blocked = orchestrator
            .execute_workflow("wf2", GenerationConfig::default(), None)
            .await;
        assert!(blocked.is_err());

        first.await.unwrap().unwrap();
        // Slot released: the second workflow now runs.
        let outcome = orchestrator
            .execute_workflow("wf2", GenerationConfig::default(), None)
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn cancel_execution_aborts_running_workflow() {
        let (orchestrator, _) = orchestrator(2);
        orchestrator
            .register_agent(Arc::new(SlowAgent::new(Duration::from_secs(10))))
            .await;
        orchestrator
            .create_workflow("wf1", "slow", TaskSpec::atomic("slow-root", "slow", Some(json!("x"))), None)
            .await
            .unwrap();

        let run = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .execute_workflow("wf1", GenerationConfig::default(), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.cancel_execution("slow-root").await);

        let outcome = run.await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_code.as_deref(), Some("ABORTED"));
        assert_eq!(orchestrator.get_metrics().cancelled, 1);
        assert_eq!(orchestrator.get_metrics().active, 0);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_crash_run() {
        let (orchestrator, _) = orchestrator(2);
        orchestrator.register_agent(Arc::new(EchoAgent)).await;
        orchestrator.subscribe(Arc::new(|_| panic!("listener bug")));
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = seen.clone();
        orchestrator.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        orchestrator
            .create_workflow("wf1", "a", TaskSpec::atomic("root", "echo", Some(json!("hi"))), None)
            .await
            .unwrap();
        let outcome = orchestrator
            .execute_workflow("wf1", GenerationConfig::default(), None)
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(seen.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn initial_variables_reach_the_tree() {
        let (orchestrator, _) = orchestrator(2);
        orchestrator.register_agent(Arc::new(EchoAgent)).await;
        // Atomic task with no input payload falls back to the `input` var.
        orchestrator
            .create_workflow(
                "wf1",
                "seeded",
                TaskSpec::atomic("root", "echo", None),
                Some(HashMap::from([("input".to_string(), json!("from vars"))])),
            )
            .await
            .unwrap();

        let outcome = orchestrator
            .execute_workflow("wf1", GenerationConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome.output, Some(json!("from vars")));
    }
}
