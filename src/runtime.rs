//! Composition root: builds the collaborators, owns the submission
//! pipeline, and runs the scheduler loop that admits queued tasks into the
//! orchestrator.

use crate::agents::builtin::{AssistantAgent, EchoAgent, RoleAgent, SlowAgent};
use crate::agents::{AgentRegistry, PluginLoader};
use crate::audit::AuditLog;
use crate::behavior::{BehaviorEngine, BehaviorMachine, BehaviorState, Transition};
use crate::cancellation::CancellationRegistry;
use crate::config::Config;
use crate::constants::TASK_POLL_INTERVAL_MS;
use crate::context::ContextManager;
use crate::events::EventBus;
use crate::executor::TaskExecutor;
use crate::learning::LearningModule;
use crate::logs::LogBuffer;
use crate::model::ModelChain;
use crate::models::{
    GenerationConfig, Strategy, TaskEvent, TaskKind, TaskRecord, TaskSpec, TaskStatus,
};
use crate::orchestrator::Orchestrator;
use crate::replay::ReplayStore;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::tools::builtin::{EchoTool, SleepTool, TextStatsTool};
use crate::tools::ToolManager;
use crate::validation::SubmissionValidator;
use crate::{MaestroError, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One parsed submission, after HTTP-shape concerns are stripped away.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub input: String,
    pub agent: Option<String>,
    pub task_id: Option<String>,
    pub conversation_id: Option<String>,
    pub generation: GenerationConfig,
    pub multi_agent: bool,
}

/// Shared application state: every registry and store, plus the pipeline.
#[derive(Clone)]
pub struct Runtime {
    pub config: Config,
    pub events: EventBus,
    pub audit: AuditLog,
    pub replay: ReplayStore,
    pub logs: LogBuffer,
    pub store: TaskStore,
    pub tools: ToolManager,
    pub agents: AgentRegistry,
    pub plugins: PluginLoader,
    pub cancellations: CancellationRegistry,
    pub scheduler: Scheduler,
    pub orchestrator: Orchestrator,
    pub learning: LearningModule,
    pub behaviors: BehaviorEngine,
    pub chain: Arc<ModelChain>,
    pub validator: SubmissionValidator,
    started_at: chrono::DateTime<chrono::Utc>,
}

/// Lifecycle machine attached to every submission; transitions are
/// published as `task.state` events.
fn lifecycle_machine() -> BehaviorMachine {
    BehaviorMachine::new(
        vec![
            BehaviorState::named("submitted"),
            BehaviorState::named("running"),
            BehaviorState::named("settled"),
        ],
        vec![
            Transition {
                from: "submitted".into(),
                event: "start".into(),
                to: "running".into(),
                guard: None,
            },
            Transition {
                from: "running".into(),
                event: "settle".into(),
                to: "settled".into(),
                guard: None,
            },
            Transition {
                from: "submitted".into(),
                event: "settle".into(),
                to: "settled".into(),
                guard: None,
            },
        ],
        "submitted",
    )
    .expect("static lifecycle machine is valid")
}

impl Runtime {
    pub async fn new(config: Config) -> Result<Self> {
        let events = EventBus::new();
        let logs = LogBuffer::default();

        let (store, audit, replay) = match &config.runtime.persist_dir {
            Some(dir) => (
                TaskStore::with_persistence(events.clone(), dir).await?,
                AuditLog::with_persistence(crate::constants::AUDIT_LOG_CAPACITY, dir)?,
                ReplayStore::with_persistence(crate::constants::REPLAY_STORE_CAPACITY, dir)?,
            ),
            None => (
                TaskStore::new(events.clone()),
                AuditLog::default(),
                ReplayStore::default(),
            ),
        };

        let tools = ToolManager::new(audit.clone(), replay.clone(), events.clone());
        let agents = AgentRegistry::new();
        let plugins = PluginLoader::new(agents.clone(), tools.clone());
        let cancellations = CancellationRegistry::new();
        let learning = LearningModule::default();
        let scheduler = Scheduler::new(learning.clone(), events.clone());
        let chain = Arc::new(ModelChain::new(&config.model));

        let executor = TaskExecutor::new(
            ContextManager::new(),
            events.clone(),
            tools.clone(),
            replay.clone(),
            chain.clone(),
        );
        let orchestrator = Orchestrator::new(
            agents.clone(),
            executor,
            cancellations.clone(),
            events.clone(),
            config.runtime.max_concurrent_tasks,
        );

        let events_for_behaviors = events.clone();
        let runtime = Self {
            config,
            events,
            audit,
            replay,
            logs,
            store,
            tools,
            agents,
            plugins,
            cancellations,
            scheduler,
            orchestrator,
            learning,
            behaviors: BehaviorEngine::new(events_for_behaviors),
            chain,
            validator: SubmissionValidator::default(),
            started_at: chrono::Utc::now(),
        };
        runtime.register_builtins().await;
        Ok(runtime)
    }

    async fn register_builtins(&self) {
        self.agents.register(Arc::new(EchoAgent)).await;
        self.agents.register(Arc::new(AssistantAgent)).await;
        self.agents.register(Arc::new(SlowAgent::default())).await;
        for role in RoleAgent::planner_set() {
            self.agents.register(Arc::new(role)).await;
        }

        self.tools.register_tool(Arc::new(EchoTool)).await;
        self.tools.register_tool(Arc::new(TextStatsTool)).await;
        self.tools.register_tool(Arc::new(SleepTool)).await;
        // Built-in agents may use every built-in tool.
        for agent_id in self.agents.ids().await {
            for tool in ["echo", "text-stats", "sleep"] {
                self.tools.grant_permission(&agent_id, tool).await;
            }
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (chrono::Utc::now() - self.started_at).num_seconds()
    }

    /// Validates and registers a submission, queues it, and returns the
    /// task id. Execution happens asynchronously via the scheduler loop.
    pub async fn submit(&self, submission: Submission) -> Result<String> {
        let input = self.validator.validate_input(&submission.input)?;
        let mut generation = submission.generation.clone().normalized();
        // Creative runs draw a seed up front so the replay log can
        // reproduce them; deterministic runs keep the caller's seed.
        if generation.mode == crate::models::GenerationMode::Creative && generation.seed.is_none() {
            generation.seed = Some(rand::random());
        }

        // Resolve the canonical conversation id from the store; a stale or
        // unknown client-side id is an error, not a new thread.
        let conversation_id = match &submission.conversation_id {
            Some(claimed) => Some(
                self.store
                    .canonical_conversation_id(claimed)
                    .await
                    .ok_or_else(|| {
                        MaestroError::NotFound(format!("conversation {claimed}"))
                    })?,
            ),
            None => None,
        };

        let task_id = match &submission.task_id {
            Some(id) => {
                self.validator.validate_task_id(id)?;
                if self.store.get(id).await.is_some() {
                    // Slot reuse: only terminal runs may be retried.
                    let record = self.store.begin_retry(id, Some(input.clone())).await?;
                    self.store
                        .update(&record.id, |r| {
                            r.generation = generation.clone();
                            r.multi_agent_enabled = submission.multi_agent;
                            r.agent_id = submission.agent.clone();
                            r.manually_selected = submission.agent.is_some();
                        })
                        .await?;
                    record.id
                } else {
                    self.create_fresh(
                        id.clone(),
                        input.clone(),
                        &submission,
                        generation.clone(),
                        conversation_id.clone(),
                    )
                    .await?
                }
            }
            None => {
                self.create_fresh(
                    Uuid::new_v4().to_string(),
                    input.clone(),
                    &submission,
                    generation.clone(),
                    conversation_id.clone(),
                )
                .await?
            }
        };

        self.behaviors.attach(&task_id, lifecycle_machine());
        self.scheduler.enqueue(&task_id)?;
        info!("Task {} submitted (queue depth {})", task_id, self.scheduler.depth());
        Ok(task_id)
    }

    async fn create_fresh(
        &self,
        id: String,
        input: String,
        submission: &Submission,
        generation: GenerationConfig,
        conversation_id: Option<String>,
    ) -> Result<String> {
        let mut record = TaskRecord::new(&id, input);
        record.generation = generation;
        record.conversation_id = conversation_id;
        record.agent_id = submission.agent.clone();
        record.manually_selected = submission.agent.is_some();
        record.multi_agent_enabled = submission.multi_agent;
        record.available_agents = self.agents.ids().await;
        self.store.create(record).await?;
        Ok(id)
    }

    /// Drains the scheduler queue forever, admitting tasks as capacity
    /// frees up. Runs as a background task next to the HTTP server.
    pub async fn run_scheduler_loop(&self) {
        info!("Scheduler loop started");
        loop {
            let Some(queued) = self.scheduler.dequeue() else {
                tokio::time::sleep(Duration::from_millis(TASK_POLL_INTERVAL_MS)).await;
                continue;
            };
            // Admitted but not yet executing.
            let _ = self
                .store
                .update(&queued.task_id, |r| {
                    if r.status == TaskStatus::Queued {
                        r.status = TaskStatus::Pending;
                    }
                })
                .await;
            while !self.orchestrator.has_capacity() {
                tokio::time::sleep(Duration::from_millis(TASK_POLL_INTERVAL_MS)).await;
            }
            self.events.publish(TaskEvent::new(
                "scheduler.admitted",
                &queued.task_id,
                json!({ "waited_ms": (chrono::Utc::now() - queued.enqueued_at).num_milliseconds() }),
            ));
            let runtime = self.clone();
            tokio::spawn(async move {
                runtime.execute_submission(&queued.task_id).await;
            });
        }
    }

    /// Runs one admitted task end to end, updating the store at every
    /// transition.
    pub async fn execute_submission(&self, task_id: &str) {
        let Some(record) = self.store.get(task_id).await else {
            warn!("Task {} vanished before execution", task_id);
            return;
        };
        // Cancelled (or otherwise settled) while still queued.
        if record.status.is_terminal() {
            return;
        }

        let agents = self.agents.list().await;
        let classification = Scheduler::classify(&record.input);
        let label = classification.label.to_string();

        let plan = if record.multi_agent_enabled {
            match self
                .scheduler
                .plan_multi_agent(task_id, &record.input, &agents)
            {
                Ok(root) => {
                    let involved: Vec<String> = match &root.kind {
                        TaskKind::Graph { nodes } => nodes
                            .iter()
                            .filter_map(|n| match &n.task.kind {
                                TaskKind::Atomic { agent_id, .. } => Some(agent_id.clone()),
                                _ => None,
                            })
                            .collect(),
                        _ => Vec::new(),
                    };
                    Some((root, involved, Strategy::Adaptive, None))
                }
                Err(e) => {
                    self.fail_before_start(task_id, e).await;
                    return;
                }
            }
        } else {
            match self
                .scheduler
                .select_agent(&record.input, &agents, record.agent_id.as_deref())
            {
                Ok(selection) => {
                    let input_payload = self.build_input_payload(&record).await;
                    let root =
                        TaskSpec::atomic(task_id, &selection.agent_id, Some(input_payload));
                    Some((
                        root,
                        vec![selection.agent_id.clone()],
                        Strategy::Sequential,
                        Some(selection),
                    ))
                }
                Err(e) => {
                    self.fail_before_start(task_id, e).await;
                    return;
                }
            }
        };
        let Some((root, involved, strategy, selection)) = plan else {
            return;
        };

        // Arm the token before the record turns in_progress so a cancel
        // arriving from here on always lands on the token the run observes.
        let token = self.cancellations.get_or_create(task_id).await;

        let update = self
            .store
            .update(task_id, |r| {
                r.status = TaskStatus::InProgress;
                r.started_at = chrono::Utc::now();
                r.task_type_label = Some(label.clone());
                r.involved_agents = involved.clone();
                r.available_agents = agents.iter().map(|a| a.id.clone()).collect();
                if let Some(selection) = &selection {
                    r.agent_id = Some(selection.agent_id.clone());
                    r.agent_selection_reason = Some(selection.reason.clone());
                    r.manually_selected = selection.manually_selected;
                }
                r.messages.push(format!("execution started ({label})"));
            })
            .await;
        if update.is_err() {
            // Raced with a cancel; the record is already terminal.
            return;
        }
        self.events.publish(TaskEvent::new(
            "task.started",
            task_id,
            json!({ "agents": involved, "label": label }),
        ));
        let _ = self
            .behaviors
            .fire(task_id, "start", &std::collections::HashMap::new());
        if let Some(selection) = &selection {
            self.events.publish(
                TaskEvent::new("agent.selected", task_id, json!({ "reason": selection.reason }))
                    .with_agent(selection.agent_id.clone()),
            );
        }

        // Unique per run so a retried task id never collides with the
        // workflow registered for its previous run.
        let workflow_id = format!("wf:{task_id}:{}", Uuid::new_v4());
        if let Err(e) = self
            .orchestrator
            .create_workflow(&workflow_id, &label, root, None)
            .await
        {
            self.fail_before_start(task_id, e).await;
            return;
        }

        for agent_id in &involved {
            self.scheduler.record_start(agent_id);
        }
        let generation = self.store.get(task_id).await.map(|r| r.generation).unwrap_or_default();
        let outcome = self
            .orchestrator
            .execute_workflow(&workflow_id, generation, Some(token))
            .await;
        for agent_id in &involved {
            self.scheduler.record_finish(agent_id);
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_before_start(task_id, e).await;
                return;
            }
        };

        let quality = if outcome.success { 80.0 } else { 10.0 };
        self.learning.observe(
            &involved,
            strategy,
            outcome.duration_ms,
            quality,
            outcome.success,
            outcome.error.clone(),
        );

        let result = self
            .store
            .update(task_id, |r| {
                r.duration_ms = Some(outcome.duration_ms);
                if outcome.success {
                    r.status = TaskStatus::Completed;
                    r.progress = 100;
                    r.output = outcome.output.as_ref().map(render_output);
                    r.messages.push("completed".to_string());
                } else if outcome.error_code.as_deref() == Some("ABORTED") {
                    r.status = TaskStatus::Cancelled;
                    r.error = Some("Task was cancelled by user".to_string());
                    r.error_code = outcome.error_code.clone();
                    r.failed_layer = outcome.failed_layer.clone();
                    r.messages.push("cancelled".to_string());
                } else {
                    r.status = TaskStatus::Failed;
                    r.error = outcome.error.clone();
                    r.error_code = outcome.error_code.clone();
                    r.failed_layer = outcome.failed_layer.clone();
                    r.messages.push("failed".to_string());
                }
            })
            .await;
        if let Err(e) = result {
            error!("Failed to settle task {}: {}", task_id, e);
        }
        let _ = self
            .behaviors
            .fire(task_id, "settle", &std::collections::HashMap::new());
        self.behaviors.detach(task_id);
    }

    async fn fail_before_start(&self, task_id: &str, err: MaestroError) {
        error!("Task {} failed before execution: {}", task_id, err);
        let _ = self
            .store
            .update(task_id, |r| {
                r.status = TaskStatus::Failed;
                r.error = Some(err.to_string());
                r.error_code = Some(err.code().to_string());
                r.failed_layer = Some("Scheduler".to_string());
            })
            .await;
    }

    /// Plain submissions pass the sanitized text straight through; a
    /// conversation turn wraps it with the prior turns, oldest first.
    async fn build_input_payload(&self, record: &TaskRecord) -> serde_json::Value {
        match &record.conversation_id {
            Some(conversation_id) => {
                let turns: Vec<serde_json::Value> = self
                    .store
                    .conversation_turns(conversation_id, Some(&record.id))
                    .await
                    .into_iter()
                    .map(|(input, output)| json!({ "input": input, "output": output }))
                    .collect();
                if turns.is_empty() {
                    json!(record.input)
                } else {
                    json!({ "input": record.input, "history": turns })
                }
            }
            None => json!(record.input),
        }
    }

    /// Cancels a task wherever it is in its lifecycle. Idempotent.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let record = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| MaestroError::NotFound(format!("task {task_id}")))?;
        if record.status.is_terminal() {
            return Ok(());
        }

        // Arm the token so an in-flight (or about-to-start) run aborts.
        let token = self.cancellations.get_or_create(task_id).await;
        token.abort("Task was cancelled by user");

        // A task that never reached the executor settles here.
        if matches!(record.status, TaskStatus::Queued | TaskStatus::Pending) {
            let _ = self
                .store
                .update(task_id, |r| {
                    r.status = TaskStatus::Cancelled;
                    r.error = Some("Task was cancelled by user".to_string());
                    r.error_code = Some("ABORTED".to_string());
                })
                .await;
            let _ = self
                .behaviors
                .fire(task_id, "settle", &std::collections::HashMap::new());
            self.behaviors.detach(task_id);
        }
        Ok(())
    }

    /// Creates and enqueues a linked retry for `/api/history/:id/retry`.
    pub async fn retry_from_history(&self, original_id: &str) -> Result<(String, String)> {
        let retry = self.store.create_linked_retry(original_id).await?;
        self.scheduler.enqueue(&retry.id)?;
        Ok((retry.id, original_id.to_string()))
    }
}

/// Task outputs are JSON values internally; the record stores the
/// normalized text form.
fn render_output(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn runtime() -> Runtime {
        Runtime::new(Config::default()).await.unwrap()
    }

    fn submission(input: &str) -> Submission {
        Submission {
            input: input.to_string(),
            agent: Some("echo".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_then_execute_completes() {
        let rt = runtime().await;
        let task_id = rt.submit(submission("hello")).await.unwrap();
        rt.scheduler.dequeue().unwrap();
        rt.execute_submission(&task_id).await;

        let record = rt.store.get(&task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.output.as_deref(), Some("hello"));
        assert!(record.duration_ms.is_some());
        assert_eq!(record.agent_id.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn auto_selection_records_reason() {
        let rt = runtime().await;
        let task_id = rt
            .submit(Submission {
                input: "research the best rust runtime".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        rt.scheduler.dequeue().unwrap();
        rt.execute_submission(&task_id).await;

        let record = rt.store.get(&task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(!record.manually_selected);
        assert!(record.agent_selection_reason.is_some());
        assert_eq!(record.task_type_label.as_deref(), Some("research"));
    }

    #[tokio::test]
    async fn multi_agent_runs_planner_graph() {
        let rt = runtime().await;
        let task_id = rt
            .submit(Submission {
                input: "build a summary of the design".to_string(),
                multi_agent: true,
                ..Default::default()
            })
            .await
            .unwrap();
        rt.scheduler.dequeue().unwrap();
        rt.execute_submission(&task_id).await;

        let record = rt.store.get(&task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.involved_agents.len(), 4);
        assert!(record.multi_agent_enabled);
    }

    #[tokio::test]
    async fn cancel_of_queued_task_settles_without_execution() {
        let rt = runtime().await;
        let task_id = rt.submit(submission("will be cancelled")).await.unwrap();
        rt.cancel(&task_id).await.unwrap();
        // Idempotent.
        rt.cancel(&task_id).await.unwrap();

        let record = rt.store.get(&task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);

        // The scheduler loop later skips the settled task.
        rt.scheduler.dequeue().unwrap();
        rt.execute_submission(&task_id).await;
        assert_eq!(
            rt.store.get(&task_id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn retry_reuses_terminal_slot_and_collides_with_active() {
        let rt = runtime().await;
        let task_id = rt.submit(submission("first run")).await.unwrap();
        rt.cancel(&task_id).await.unwrap();

        // Terminal slot: resubmission under the same id is accepted.
        let reused = rt
            .submit(Submission {
                input: "second run".to_string(),
                agent: Some("echo".to_string()),
                task_id: Some(task_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(reused, task_id);
        let record = rt.store.get(&task_id).await.unwrap();
        assert_eq!(record.retry_count, 1);
        assert!(record.is_retry);

        // Active run: same id collides.
        let err = rt
            .submit(Submission {
                input: "third run".to_string(),
                task_id: Some(task_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TASK_RUNNING");
    }

    #[tokio::test]
    async fn conversation_turns_flow_into_payload() {
        let rt = runtime().await;
        let first = rt.submit(submission("what is rust")).await.unwrap();
        rt.scheduler.dequeue().unwrap();
        rt.execute_submission(&first).await;
        rt.store.link_conversation(&first, &first).await.unwrap();

        let follow_up = rt
            .submit(Submission {
                input: "and why".to_string(),
                agent: Some("echo".to_string()),
                conversation_id: Some(first.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        rt.scheduler.dequeue().unwrap();
        rt.execute_submission(&follow_up).await;

        let record = rt.store.get(&follow_up).await.unwrap();
        assert_eq!(record.conversation_id.as_deref(), Some(first.as_str()));
        // Echo returned the structured payload containing the prior turn.
        let output = record.output.unwrap();
        assert!(output.contains("history"));
        assert!(output.contains("what is rust"));
    }

    #[tokio::test]
    async fn unknown_conversation_is_rejected() {
        let rt = runtime().await;
        let err = rt
            .submit(Submission {
                input: "continue".to_string(),
                conversation_id: Some("ghost".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn lifecycle_machine_publishes_state_events() {
        let rt = runtime().await;
        let task_id = rt.submit(submission("state tracked")).await.unwrap();
        let mut sub = rt.events.subscribe(Some(&task_id), Some(&["task.state"]));
        assert_eq!(rt.behaviors.state_of(&task_id).as_deref(), Some("submitted"));

        rt.scheduler.dequeue().unwrap();
        rt.execute_submission(&task_id).await;

        assert_eq!(sub.recv().await.unwrap().data["state"], "running");
        assert_eq!(sub.recv().await.unwrap().data["state"], "settled");
        // Detached after settling.
        assert!(rt.behaviors.state_of(&task_id).is_none());
    }

    #[tokio::test]
    async fn deterministic_generation_is_normalized() {
        let rt = runtime().await;
        let task_id = rt
            .submit(Submission {
                input: "echo me".to_string(),
                agent: Some("echo".to_string()),
                generation: GenerationConfig {
                    mode: crate::models::GenerationMode::Deterministic,
                    temperature: Some(0.9),
                    seed: Some(11),
                    max_tokens: None,
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let record = rt.store.get(&task_id).await.unwrap();
        assert_eq!(record.generation.temperature, Some(0.0));
        assert_eq!(record.generation.seed, Some(11));
    }
}
