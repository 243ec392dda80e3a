use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Current status of a task in the processing pipeline.
///
/// Transitions are monotonic: once a terminal status (`Completed`, `Failed`,
/// `Cancelled`) is reached the record never reverts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Pending => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => 3,
        }
    }

    /// Whether moving to `next` preserves monotonicity.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    Creative,
    Deterministic,
}

/// Generation settings attached to a submission.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationConfig {
    #[serde(default)]
    pub mode: GenerationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationConfig {
    /// Deterministic mode forces temperature to zero regardless of input.
    pub fn normalized(mut self) -> Self {
        if self.mode == GenerationMode::Deterministic {
            self.temperature = Some(0.0);
        }
        self
    }
}

/// Canonical record of a submitted task, owned by the task store.
/// Serializes with the camelCase field names the HTTP contract exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub input: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub generation: GenerationConfig,
    /// 0..100
    pub progress: u8,
    pub messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_task_id: Option<String>,
    pub retry_count: u32,
    pub is_retry: bool,
    pub involved_agents: Vec<String>,
    pub manually_selected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_selection_reason: Option<String>,
    pub available_agents: Vec<String>,
    pub multi_agent_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type_label: Option<String>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            status: TaskStatus::Queued,
            agent_id: None,
            generation: GenerationConfig::default(),
            progress: 0,
            messages: Vec::new(),
            output: None,
            error: None,
            error_code: None,
            failed_layer: None,
            stack_trace: None,
            started_at: chrono::Utc::now(),
            duration_ms: None,
            conversation_id: None,
            original_task_id: None,
            retry_count: 0,
            is_retry: false,
            involved_agents: Vec::new(),
            manually_selected: false,
            agent_selection_reason: None,
            available_agents: Vec::new(),
            multi_agent_enabled: false,
            task_type_label: None,
        }
    }
}

/// Data-driven predicate evaluated against an execution context.
///
/// Predicates are pure data so task trees stay cloneable and their
/// evaluation is reproducible during replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Always,
    Never,
    /// True while the named variable is absent from the context.
    VarMissing { key: String },
    /// True when the named variable equals the given value.
    VarEquals { key: String, value: Value },
    /// True while the iteration counter variable is below `limit`.
    CounterBelow { key: String, limit: i64 },
}

/// Node of a `graph` task.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub task: TaskSpec,
    pub depends_on: Vec<String>,
    pub allow_failure: bool,
    /// Planner role label (`research`, `build`, `review`, `final`).
    pub role: Option<String>,
}

/// The six composition kinds; each variant carries exactly what it needs.
#[derive(Debug, Clone)]
pub enum TaskKind {
    Atomic {
        agent_id: String,
        input: Option<Value>,
    },
    Sequential {
        subtasks: Vec<TaskSpec>,
    },
    Parallel {
        subtasks: Vec<TaskSpec>,
    },
    Graph {
        nodes: Vec<GraphNode>,
    },
    Conditional {
        predicate: Predicate,
        when_true: Box<TaskSpec>,
        when_false: Box<TaskSpec>,
    },
    Loop {
        predicate: Predicate,
        body: Box<TaskSpec>,
    },
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Atomic { .. } => "atomic",
            TaskKind::Sequential { .. } => "sequential",
            TaskKind::Parallel { .. } => "parallel",
            TaskKind::Graph { .. } => "graph",
            TaskKind::Conditional { .. } => "conditional",
            TaskKind::Loop { .. } => "loop",
        }
    }
}

/// Callback invoked when a task settles; receives the success flag and the
/// output, if any.
#[derive(Clone)]
pub struct TaskHook(pub std::sync::Arc<dyn Fn(bool, Option<&Value>) + Send + Sync>);

impl TaskHook {
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(bool, Option<&Value>) + Send + Sync + 'static,
    {
        Self(std::sync::Arc::new(hook))
    }

    pub fn call(&self, success: bool, output: Option<&Value>) {
        (self.0)(success, output)
    }
}

impl std::fmt::Debug for TaskHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskHook")
    }
}

/// A node in the composition tree evaluated by the executor.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub kind: TaskKind,
    /// Linked deadline; on fire the subtree aborts with "Task timeout exceeded".
    pub timeout: Option<std::time::Duration>,
    /// Retries apply to `atomic` only.
    pub retries: u32,
    pub allow_failure: bool,
    pub on_success: Option<TaskHook>,
    pub on_failure: Option<TaskHook>,
}

impl TaskSpec {
    pub fn atomic(id: impl Into<String>, agent_id: impl Into<String>, input: Option<Value>) -> Self {
        Self {
            id: id.into(),
            kind: TaskKind::Atomic {
                agent_id: agent_id.into(),
                input,
            },
            timeout: None,
            retries: 0,
            allow_failure: false,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn sequential(id: impl Into<String>, subtasks: Vec<TaskSpec>) -> Self {
        Self {
            id: id.into(),
            kind: TaskKind::Sequential { subtasks },
            timeout: None,
            retries: 0,
            allow_failure: false,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn parallel(id: impl Into<String>, subtasks: Vec<TaskSpec>) -> Self {
        Self {
            id: id.into(),
            kind: TaskKind::Parallel { subtasks },
            timeout: None,
            retries: 0,
            allow_failure: false,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn graph(id: impl Into<String>, nodes: Vec<GraphNode>) -> Self {
        Self {
            id: id.into(),
            kind: TaskKind::Graph { nodes },
            timeout: None,
            retries: 0,
            allow_failure: false,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn with_on_success(mut self, hook: TaskHook) -> Self {
        self.on_success = Some(hook);
        self
    }

    pub fn with_on_failure(mut self, hook: TaskHook) -> Self {
        self.on_failure = Some(hook);
        self
    }
}

/// A root task plus initial variables; the unit of work behind `/task`.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub root: TaskSpec,
    pub variables: HashMap<String, Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, root: TaskSpec) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            root,
            variables: HashMap::new(),
            created_at: chrono::Utc::now(),
        }
    }
}

/// Typed event published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Dotted label, e.g. `task.started`, `graph.node`, `tool.completed`.
    pub event_type: String,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: Value,
}

impl TaskEvent {
    pub fn new(event_type: impl Into<String>, task_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            task_id: task_id.into(),
            agent_id: None,
            timestamp: chrono::Utc::now(),
            data,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// Security-relevant event categories recorded by the audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuditKind {
    ToolCall,
    ToolTimeout,
    PermissionDenied,
    RateLimitExceeded,
    ExecutionError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: AuditKind,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub details: HashMap<String, Value>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            kind,
            agent_id: agent_id.into(),
            task_id: None,
            tool_name: None,
            details: HashMap::new(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplayKind {
    Model,
    Tool,
}

/// One recorded model or tool invocation, sufficient to reproduce it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEvent {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub kind: ReplayKind,
    pub step: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    pub metadata: HashMap<String, Value>,
}

/// One entry in the tool manager's call log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallLogEntry {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub tool_name: String,
    pub args: Value,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Multi-agent composition label consumed by the learning module.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Sequential,
    Parallel,
    Adaptive,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Strategy::Sequential),
            "parallel" => Ok(Strategy::Parallel),
            "adaptive" => Ok(Strategy::Adaptive),
            _ => Err(format!("Unknown strategy: {s}")),
        }
    }
}

/// Outcome record observed by the learning module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub agent_ids: Vec<String>,
    pub strategy: Strategy,
    pub execution_time_ms: u64,
    pub quality: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
