//! Task-tree evaluation.
//!
//! The executor walks a [`TaskSpec`] tree, dispatching on the task kind:
//! atomic tasks run an agent, composites (sequential, parallel, graph,
//! conditional, loop) recurse. Every suspension point observes the
//! cancellation token; `task.timeout` links a child token that fires with
//! reason "Task timeout exceeded" and surfaces as `TIMEOUT`.

use crate::agents::{AgentContext, AgentRegistry};
use crate::cancellation::{race_with_abort, throw_if_aborted, CancelToken};
use crate::constants::{MAX_LOOP_ITERATIONS, RETRY_DELAYS_MS};
use crate::context::{ContextManager, TaskContext};
use crate::events::EventBus;
use crate::model::ModelChain;
use crate::models::{
    GenerationConfig, GraphNode, Predicate, TaskEvent, TaskKind, TaskSpec,
};
use crate::replay::ReplayStore;
use crate::tools::ToolManager;
use crate::{MaestroError, Result};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Options threaded through one execution.
#[derive(Clone)]
pub struct ExecuteOptions {
    pub token: CancelToken,
    pub generation: GenerationConfig,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            token: CancelToken::new(),
            generation: GenerationConfig::default(),
        }
    }
}

/// Result of evaluating one task tree.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub failed_layer: Option<String>,
    pub duration_ms: u64,
    pub context: Option<TaskContext>,
}

#[derive(Clone)]
pub struct TaskExecutor {
    contexts: ContextManager,
    events: EventBus,
    tools: ToolManager,
    replay: ReplayStore,
    chain: Arc<ModelChain>,
}

impl TaskExecutor {
    pub fn new(
        contexts: ContextManager,
        events: EventBus,
        tools: ToolManager,
        replay: ReplayStore,
        chain: Arc<ModelChain>,
    ) -> Self {
        Self {
            contexts,
            events,
            tools,
            replay,
            chain,
        }
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    /// Evaluates `task` and returns a settled outcome; failures are encoded
    /// in the outcome rather than thrown.
    pub async fn execute_task(
        &self,
        task: &TaskSpec,
        parent: Option<&str>,
        registry: &AgentRegistry,
        options: ExecuteOptions,
    ) -> TaskOutcome {
        let started = Instant::now();
        let (result, context) = self
            .run_node(
                task.clone(),
                parent.map(str::to_string),
                task.id.clone(),
                registry.clone(),
                options.token,
                options.generation,
            )
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(output) => TaskOutcome {
                task_id: task.id.clone(),
                success: true,
                output: Some(output),
                error: None,
                error_code: None,
                failed_layer: None,
                duration_ms,
                context,
            },
            Err(err) => TaskOutcome {
                task_id: task.id.clone(),
                success: false,
                output: None,
                error: Some(err.to_string()),
                error_code: Some(err.code().to_string()),
                failed_layer: Some(err.failed_layer().to_string()),
                duration_ms,
                context,
            },
        }
    }

    /// Runs one tree node: context lifecycle, timeout linking, dispatch,
    /// hook invocation. The context is cleaned up on every exit path.
    fn run_node(
        &self,
        task: TaskSpec,
        parent: Option<String>,
        root_id: String,
        registry: AgentRegistry,
        token: CancelToken,
        generation: GenerationConfig,
    ) -> BoxFuture<'_, (Result<Value>, Option<TaskContext>)> {
        async move {
            self.contexts.create_context(&task.id, parent.as_deref()).await;

            // A task timeout links a local token to the parent one; the
            // composite governs every sub-operation.
            let token = match task.timeout {
                Some(timeout) => {
                    let deadline = chrono::Utc::now()
                        + chrono::Duration::from_std(timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(0));
                    self.contexts.set_deadline(&task.id, deadline).await;
                    token.child_with_timeout(timeout, "Task timeout exceeded")
                }
                None => token,
            };

            let result = async {
                throw_if_aborted(&token)?;
                if !self.contexts.is_within_deadline(&task.id).await {
                    return Err(MaestroError::timeout("Task deadline exceeded"));
                }
                self.dispatch(&task, &root_id, &registry, &token, &generation)
                    .await
            }
            .await
            .map_err(normalize_error);

            // Atomic attempts record their own steps; composites get one
            // summary step here.
            if !matches!(task.kind, TaskKind::Atomic { .. }) {
                let _ = self
                    .contexts
                    .record_step(
                        &task.id,
                        "executor",
                        task.kind.label(),
                        json!({ "task": task.id }),
                        result.as_ref().ok().cloned(),
                        result.as_ref().err().map(|e| e.to_string()),
                    )
                    .await;
            }

            match &result {
                Ok(output) => {
                    if let Some(hook) = &task.on_success {
                        hook.call(true, Some(output));
                    }
                }
                Err(_) => {
                    if let Some(hook) = &task.on_failure {
                        hook.call(false, None);
                    }
                }
            }

            let snapshot = self.contexts.snapshot(&task.id).await;
            self.contexts.cleanup_context(&task.id).await;
            (result, snapshot)
        }
        .boxed()
    }

    async fn dispatch(
        &self,
        task: &TaskSpec,
        root_id: &str,
        registry: &AgentRegistry,
        token: &CancelToken,
        generation: &GenerationConfig,
    ) -> Result<Value> {
        match &task.kind {
            TaskKind::Atomic { agent_id, input } => {
                self.run_atomic(task, agent_id, input.clone(), registry, token, generation)
                    .await
            }
            TaskKind::Sequential { subtasks } => {
                self.run_sequential(task, subtasks, root_id, registry, token, generation)
                    .await
            }
            TaskKind::Parallel { subtasks } => {
                self.run_parallel(task, subtasks, root_id, registry, token, generation)
                    .await
            }
            TaskKind::Graph { nodes } => {
                self.run_graph(task, nodes, root_id, registry, token, generation)
                    .await
            }
            TaskKind::Conditional {
                predicate,
                when_true,
                when_false,
            } => {
                let branch = if self.eval_predicate(&task.id, predicate).await {
                    (**when_true).clone()
                } else {
                    (**when_false).clone()
                };
                let (result, _) = self
                    .run_node(
                        branch,
                        Some(task.id.clone()),
                        root_id.to_string(),
                        registry.clone(),
                        token.clone(),
                        generation.clone(),
                    )
                    .await;
                result
            }
            TaskKind::Loop { predicate, body } => {
                self.run_loop(task, predicate, body, root_id, registry, token, generation)
                    .await
            }
        }
    }

    async fn run_atomic(
        &self,
        task: &TaskSpec,
        agent_id: &str,
        input: Option<Value>,
        registry: &AgentRegistry,
        token: &CancelToken,
        generation: &GenerationConfig,
    ) -> Result<Value> {
        // Missing agent is a deterministic validation error, never retried.
        let agent = registry
            .get(agent_id)
            .await
            .ok_or_else(|| MaestroError::NotFound(format!("agent {agent_id}")))?;

        let input_str = match input {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => match self.contexts.get_variable(&task.id, "input").await {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => String::new(),
            },
        };

        let attempts = task.retries + 1;
        let mut last_err: Option<MaestroError> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let index = ((attempt - 1) as usize).min(RETRY_DELAYS_MS.len() - 1);
                let delay = Duration::from_millis(RETRY_DELAYS_MS[index]);
                race_with_abort(token, async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
            throw_if_aborted(token)?;

            let agent_ctx = AgentContext::new(
                &task.id,
                agent_id,
                token.clone(),
                generation.clone(),
                self.tools.clone(),
                self.chain.resolve(generation),
                self.replay.clone(),
            );
            let result =
                race_with_abort(token, agent.handle(input_str.clone(), agent_ctx)).await;

            let _ = self
                .contexts
                .record_step(
                    &task.id,
                    agent_id,
                    &format!("attempt {}", attempt + 1),
                    json!(input_str),
                    result.as_ref().ok().map(|s| json!(s)),
                    result.as_ref().err().map(|e| e.to_string()),
                )
                .await;

            match result {
                Ok(output) => return Ok(json!(output)),
                Err(err) if err.is_aborted() => return Err(err),
                Err(err) => {
                    debug!(
                        task = %task.id,
                        agent = %agent_id,
                        attempt = attempt + 1,
                        "atomic attempt failed: {err}"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MaestroError::execution("atomic task produced no result")))
    }

    async fn run_sequential(
        &self,
        task: &TaskSpec,
        subtasks: &[TaskSpec],
        root_id: &str,
        registry: &AgentRegistry,
        token: &CancelToken,
        generation: &GenerationConfig,
    ) -> Result<Value> {
        let mut outputs = Map::new();
        let mut failures = Vec::new();
        for child in subtasks {
            throw_if_aborted(token)?;
            if !self.contexts.is_within_deadline(&task.id).await {
                return Err(MaestroError::timeout("Task deadline exceeded"));
            }
            let (result, _) = self
                .run_node(
                    child.clone(),
                    Some(task.id.clone()),
                    root_id.to_string(),
                    registry.clone(),
                    token.clone(),
                    generation.clone(),
                )
                .await;
            match result {
                Ok(output) => {
                    // Expose the child's output to later siblings.
                    self.contexts
                        .set_variable(&task.id, &format!("{}_output", child.id), output.clone())
                        .await?;
                    outputs.insert(child.id.clone(), output);
                }
                Err(err) if child.allow_failure => {
                    warn!(task = %child.id, "allowed failure in sequential: {err}");
                    failures.push(json!({ "task_id": child.id, "error": err.to_string() }));
                    outputs.insert(child.id.clone(), json!({ "success": false }));
                }
                Err(err) => return Err(err),
            }
        }
        if !failures.is_empty() {
            outputs.insert("failures".to_string(), Value::Array(failures));
        }
        Ok(Value::Object(outputs))
    }

    async fn run_parallel(
        &self,
        task: &TaskSpec,
        subtasks: &[TaskSpec],
        root_id: &str,
        registry: &AgentRegistry,
        token: &CancelToken,
        generation: &GenerationConfig,
    ) -> Result<Value> {
        // All children launch together; siblings of a failing child run to
        // completion (or observe the shared token) before the parent settles.
        let runs = subtasks.iter().map(|child| {
            let child = child.clone();
            let parent = task.id.clone();
            let root = root_id.to_string();
            let registry = registry.clone();
            let token = token.clone();
            let generation = generation.clone();
            async move {
                let id = child.id.clone();
                let allow = child.allow_failure;
                let (result, _) = self
                    .run_node(child, Some(parent), root, registry, token, generation)
                    .await;
                (id, allow, result)
            }
        });
        let settled = join_all(runs).await;

        let mut outputs = Map::new();
        let mut failures = Vec::new();
        let mut hard_failure: Option<MaestroError> = None;
        for (id, allow, result) in settled {
            match result {
                Ok(output) => {
                    self.contexts
                        .set_variable(&task.id, &format!("{id}_output"), output.clone())
                        .await?;
                    outputs.insert(id, output);
                }
                Err(err) if allow => {
                    failures.push(json!({ "task_id": id, "error": err.to_string() }));
                    outputs.insert(id, json!({ "success": false }));
                }
                Err(err) => {
                    if hard_failure.is_none() {
                        hard_failure = Some(err);
                    }
                }
            }
        }
        if let Some(err) = hard_failure {
            return Err(err);
        }
        if !failures.is_empty() {
            outputs.insert("failures".to_string(), Value::Array(failures));
        }
        Ok(Value::Object(outputs))
    }

    async fn run_graph(
        &self,
        task: &TaskSpec,
        nodes: &[GraphNode],
        root_id: &str,
        registry: &AgentRegistry,
        token: &CancelToken,
        generation: &GenerationConfig,
    ) -> Result<Value> {
        // Structural validation happens before any node executes.
        let mut ids = HashSet::new();
        for node in nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(MaestroError::Validation(format!(
                    "duplicate graph node id: {}",
                    node.id
                )));
            }
        }
        for node in nodes {
            for dep in &node.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(MaestroError::Validation(format!(
                        "graph node {} depends on missing node {}",
                        node.id, dep
                    )));
                }
            }
        }

        // Wave scheduling: repeatedly run every node whose dependencies are
        // settled, in parallel, until all nodes are settled.
        let mut settled: HashMap<String, bool> = HashMap::new();
        let mut outputs = Map::new();
        while settled.len() < nodes.len() {
            throw_if_aborted(token)?;
            if !self.contexts.is_within_deadline(&task.id).await {
                return Err(MaestroError::timeout("Task deadline exceeded"));
            }
            let ready: Vec<&GraphNode> = nodes
                .iter()
                .filter(|n| {
                    !settled.contains_key(&n.id)
                        && n.depends_on.iter().all(|d| settled.contains_key(d))
                })
                .collect();
            if ready.is_empty() {
                return Err(MaestroError::execution("unresolved dependencies or cycle"));
            }

            let wave = ready.iter().map(|node| {
                let inner = node.task.clone();
                let parent = task.id.clone();
                let root = root_id.to_string();
                let registry = registry.clone();
                let token = token.clone();
                let generation = generation.clone();
                async move {
                    self.emit_graph_node(&root, node, "running");
                    let (result, _) = self
                        .run_node(inner, Some(parent), root.clone(), registry, token, generation)
                        .await;
                    (*node, result)
                }
            });
            let results = join_all(wave).await;

            for (node, result) in results {
                match result {
                    Ok(output) => {
                        self.emit_graph_node(root_id, node, "succeeded");
                        self.contexts
                            .set_variable(
                                &task.id,
                                &format!("{}_output", node.id),
                                output.clone(),
                            )
                            .await?;
                        outputs.insert(node.id.clone(), output);
                        settled.insert(node.id.clone(), true);
                    }
                    Err(err) if node.allow_failure => {
                        self.emit_graph_node(root_id, node, "failed");
                        warn!(node = %node.id, "allowed graph node failure: {err}");
                        outputs.insert(
                            node.id.clone(),
                            json!({ "success": false, "error": err.to_string() }),
                        );
                        settled.insert(node.id.clone(), false);
                    }
                    Err(err) => {
                        self.emit_graph_node(root_id, node, "failed");
                        return Err(err);
                    }
                }
            }
        }
        Ok(Value::Object(outputs))
    }

    fn emit_graph_node(&self, root_id: &str, node: &GraphNode, status: &str) {
        let agent_id = match &node.task.kind {
            TaskKind::Atomic { agent_id, .. } => Some(agent_id.clone()),
            _ => None,
        };
        let mut data = json!({
            "node": node.id,
            "status": status,
            "depends_on": node.depends_on,
        });
        if let Some(role) = &node.role {
            data["role"] = json!(role);
        }
        if let Some(agent_id) = agent_id {
            data["agent_id"] = json!(agent_id);
        }
        self.events
            .publish(TaskEvent::new("graph.node", root_id, data));
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        task: &TaskSpec,
        predicate: &Predicate,
        body: &TaskSpec,
        root_id: &str,
        registry: &AgentRegistry,
        token: &CancelToken,
        generation: &GenerationConfig,
    ) -> Result<Value> {
        let counter_key = format!("{}_iterations", task.id);
        let mut outputs = Vec::new();
        let mut iterations: usize = 0;
        loop {
            throw_if_aborted(token)?;
            self.contexts
                .set_variable(&task.id, &counter_key, json!(iterations))
                .await?;
            if !self.eval_predicate(&task.id, predicate).await {
                break;
            }
            if iterations >= MAX_LOOP_ITERATIONS {
                return Err(MaestroError::execution(format!(
                    "loop {} reached max iterations ({MAX_LOOP_ITERATIONS})",
                    task.id
                )));
            }
            if !self.contexts.is_within_deadline(&task.id).await {
                return Err(MaestroError::timeout("Task deadline exceeded"));
            }
            let (result, _) = self
                .run_node(
                    body.clone(),
                    Some(task.id.clone()),
                    root_id.to_string(),
                    registry.clone(),
                    token.clone(),
                    generation.clone(),
                )
                .await;
            let output = result?;
            self.contexts
                .set_variable(&task.id, &format!("{}_output", body.id), output.clone())
                .await?;
            outputs.push(output);
            iterations += 1;
        }
        Ok(Value::Array(outputs))
    }

    async fn eval_predicate(&self, task_id: &str, predicate: &Predicate) -> bool {
        let vars = self
            .contexts
            .snapshot(task_id)
            .await
            .map(|c| c.variables)
            .unwrap_or_default();
        eval_predicate(predicate, &vars)
    }
}

/// Pure predicate evaluation against a variable map.
pub fn eval_predicate(predicate: &Predicate, vars: &HashMap<String, Value>) -> bool {
    match predicate {
        Predicate::Always => true,
        Predicate::Never => false,
        Predicate::VarMissing { key } => !vars.contains_key(key),
        Predicate::VarEquals { key, value } => vars.get(key) == Some(value),
        Predicate::CounterBelow { key, limit } => vars
            .get(key)
            .and_then(Value::as_i64)
            .map(|v| v < *limit)
            .unwrap_or(true),
    }
}

/// A token abort caused by a timeout surfaces as `TIMEOUT`; every other
/// abort stays `ABORTED` regardless of the underlying cause.
fn normalize_error(err: MaestroError) -> MaestroError {
    if let MaestroError::Aborted { reason } = &err {
        if reason.to_lowercase().contains("timeout") {
            return MaestroError::timeout(reason.clone());
        }
    }
    err
}
