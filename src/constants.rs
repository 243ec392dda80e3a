//! System-wide constants shared across the runtime.

// Task processing
/// Scheduler poll interval when the queue is empty.
pub const TASK_POLL_INTERVAL_MS: u64 = 100;

/// Maximum number of tasks waiting for admission.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Default concurrency limit for simultaneously executing workflows.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

/// Backoff schedule for atomic retries; the last entry repeats.
pub const RETRY_DELAYS_MS: &[u64] = &[100, 200, 500, 1000, 2000];

/// Hard ceiling on loop-task iterations.
pub const MAX_LOOP_ITERATIONS: usize = 1000;

// Event bus
/// Per-task replay window delivered to late subscribers.
pub const EVENT_REPLAY_WINDOW: usize = 64;

/// Broadcast channel capacity per topic.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// Ring buffers
/// Audit log capacity; oldest entries drop first.
pub const AUDIT_LOG_CAPACITY: usize = 5000;

/// Replay store capacity across all tasks.
pub const REPLAY_STORE_CAPACITY: usize = 10000;

/// Execution records kept by the learning module.
pub const LEARNING_HISTORY_CAPACITY: usize = 2000;

/// Formatted log lines kept for `/api/logs`.
pub const LOG_BUFFER_CAPACITY: usize = 500;

// Tool manager
/// Fixed rate-limit window applied per tool.
pub const TOOL_RATE_WINDOW_SECS: u64 = 60;

/// Fallback execution timeout for tools that do not configure one.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

// Scheduler
/// Smoothing factor for the per-agent load EWMA.
pub const LOAD_EWMA_ALPHA: f64 = 0.3;

/// Metrics window for per-agent history queries.
pub const AGENT_STATS_WINDOW_HOURS: i64 = 24;

// Plugins
/// Per-plugin handler timeout enforced by the loader wrapper.
pub const PLUGIN_RUN_TIMEOUT_SECS: u64 = 300;

// Store
/// Stored task records retained before FIFO trimming.
pub const MAX_STORED_TASKS: usize = 10000;

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
