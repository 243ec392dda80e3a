//! Tool registration and mediated invocation.
//!
//! Agents never call tools directly: every invocation goes through
//! [`ToolManager::call_tool`], which enforces permissions, per-tool rate
//! limits and timeouts, and records the call to the audit log, the replay
//! store, and the event bus.

pub mod builtin;

use crate::audit::AuditLog;
use crate::cancellation::{race_with_abort, CancelToken};
use crate::constants::{DEFAULT_TOOL_TIMEOUT_MS, TOOL_RATE_WINDOW_SECS};
use crate::events::EventBus;
use crate::models::{AuditEvent, AuditKind, ReplayKind, TaskEvent, ToolCallLogEntry};
use crate::replay::{ReplayEntry, ReplayStore};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A named capability invoked by agents through the tool manager.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Coarse category (`utility`, `filesystem`, `web`, `code`).
    fn kind(&self) -> &str;
    /// Permission strings an agent must hold; defaults to the tool name.
    fn required_permissions(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }
    fn timeout(&self) -> Duration {
        Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS)
    }
    /// Calls allowed per fixed 60 s window; `None` means unlimited.
    fn rate_limit_per_minute(&self) -> Option<u32> {
        None
    }
    async fn health_check(&self) -> bool {
        true
    }
    fn validate(&self, args: &Value) -> Result<()>;
    async fn execute(&self, args: Value, token: &CancelToken) -> Result<Value>;
}

/// Request shape for one call.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub tool_name: String,
    pub args: Value,
}

/// Options threaded from the executing task.
#[derive(Debug, Clone, Default)]
pub struct ToolCallOptions {
    pub task_id: Option<String>,
    pub token: Option<CancelToken>,
}

/// Error taxonomy surfaced to callers.
pub mod error_kind {
    pub const PERMISSION: &str = "permission";
    pub const RATE_LIMIT: &str = "rate-limit";
    pub const TIMEOUT: &str = "timeout";
    pub const EXECUTION: &str = "execution-error";
    pub const VALIDATION: &str = "validation";
}

/// Outcome of a mediated call. Denials and failures are values, not panics;
/// the caller decides whether a failed call fails the task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    pub duration_ms: u64,
}

impl ToolCallResult {
    fn failure(tool_name: &str, kind: &'static str, error: String) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: false,
            output: None,
            error: Some(error),
            error_kind: Some(kind),
            duration_ms: 0,
        }
    }
}

struct RateWindow {
    started: Instant,
    count: u32,
}

#[derive(Clone)]
pub struct ToolManager {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
    permissions: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    windows: Arc<Mutex<HashMap<String, RateWindow>>>,
    call_log: Arc<Mutex<VecDeque<ToolCallLogEntry>>>,
    audit: AuditLog,
    replay: ReplayStore,
    events: EventBus,
}

const CALL_LOG_CAPACITY: usize = 2000;

impl ToolManager {
    pub fn new(audit: AuditLog, replay: ReplayStore, events: EventBus) -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
            permissions: Arc::new(RwLock::new(HashMap::new())),
            windows: Arc::new(Mutex::new(HashMap::new())),
            call_log: Arc::new(Mutex::new(VecDeque::new())),
            audit,
            replay,
            events,
        }
    }

    /// Registers a tool under its unique name; re-registration replaces.
    pub async fn register_tool(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        if tools.insert(name.clone(), tool).is_some() {
            warn!("Tool {} re-registered, previous definition replaced", name);
        } else {
            info!("Registered tool {}", name);
        }
    }

    pub async fn tool_names(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn grant_permission(&self, agent_id: &str, tool_name: &str) {
        let mut permissions = self.permissions.write().await;
        permissions
            .entry(agent_id.to_string())
            .or_default()
            .insert(tool_name.to_string());
    }

    pub async fn revoke_permission(&self, agent_id: &str, tool_name: &str) {
        let mut permissions = self.permissions.write().await;
        if let Some(set) = permissions.get_mut(agent_id) {
            set.remove(tool_name);
        }
    }

    /// Replaces the agent's whole permission set.
    pub async fn set_permissions(&self, agent_id: &str, tool_names: &[&str]) {
        let mut permissions = self.permissions.write().await;
        permissions.insert(
            agent_id.to_string(),
            tool_names.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub async fn can_use_tool(&self, agent_id: &str, tool_name: &str) -> bool {
        let required = {
            let tools = self.tools.read().await;
            match tools.get(tool_name) {
                Some(tool) => tool.required_permissions(),
                None => return false,
            }
        };
        let permissions = self.permissions.read().await;
        match permissions.get(agent_id) {
            Some(granted) => required.iter().all(|p| granted.contains(p)),
            None => false,
        }
    }

    /// Checks and advances the tool's fixed 60 s window. A rejected call is
    /// not counted against the window.
    fn check_rate_limit(&self, tool_name: &str, per_minute: u32) -> bool {
        let mut windows = self.windows.lock().expect("rate window lock poisoned");
        let now = Instant::now();
        let window = windows.entry(tool_name.to_string()).or_insert(RateWindow {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= Duration::from_secs(TOOL_RATE_WINDOW_SECS) {
            window.started = now;
            window.count = 0;
        }
        if window.count >= per_minute {
            return false;
        }
        window.count += 1;
        true
    }

    /// Mediated tool invocation: permission gate, rate-limit gate,
    /// validation, timed execution, then call log + replay + audit + events.
    pub async fn call_tool(
        &self,
        agent_id: &str,
        request: ToolCallRequest,
        options: ToolCallOptions,
    ) -> ToolCallResult {
        let tool_name = request.tool_name.clone();
        let task_id = options.task_id.clone();

        let tool = {
            let tools = self.tools.read().await;
            tools.get(&tool_name).cloned()
        };
        let Some(tool) = tool else {
            let mut event = AuditEvent::new(AuditKind::ExecutionError, agent_id)
                .with_tool(&tool_name)
                .with_detail("kind", json!(error_kind::VALIDATION))
                .with_detail("error", json!("unknown tool"));
            if let Some(id) = &task_id {
                event = event.with_task(id.clone());
            }
            self.audit.record(event);
            let result = ToolCallResult::failure(
                &tool_name,
                error_kind::VALIDATION,
                format!("unknown tool: {tool_name}"),
            );
            self.log_call(agent_id, &task_id, &request, &result);
            return result;
        };

        // 1. Permission gate.
        if !self.can_use_tool(agent_id, &tool_name).await {
            warn!("Agent {} denied access to tool {}", agent_id, tool_name);
            let mut event = AuditEvent::new(AuditKind::PermissionDenied, agent_id)
                .with_tool(&tool_name)
                .with_detail("required", json!(tool.required_permissions()));
            if let Some(id) = &task_id {
                event = event.with_task(id.clone());
            }
            self.audit.record(event);
            let result = ToolCallResult::failure(
                &tool_name,
                error_kind::PERMISSION,
                format!("agent {agent_id} lacks permission for {tool_name}"),
            );
            self.log_call(agent_id, &task_id, &request, &result);
            return result;
        }

        // 2. Rate-limit gate, enforced before execution.
        if let Some(per_minute) = tool.rate_limit_per_minute() {
            if !self.check_rate_limit(&tool_name, per_minute) {
                let mut event = AuditEvent::new(AuditKind::RateLimitExceeded, agent_id)
                    .with_tool(&tool_name)
                    .with_detail("limit_per_minute", json!(per_minute));
                if let Some(id) = &task_id {
                    event = event.with_task(id.clone());
                }
                self.audit.record(event);
                let result = ToolCallResult::failure(
                    &tool_name,
                    error_kind::RATE_LIMIT,
                    format!("rate limit of {per_minute}/min exceeded for {tool_name}"),
                );
                self.log_call(agent_id, &task_id, &request, &result);
                return result;
            }
        }

        // 3. Argument validation.
        if let Err(e) = tool.validate(&request.args) {
            let mut event = AuditEvent::new(AuditKind::ExecutionError, agent_id)
                .with_tool(&tool_name)
                .with_detail("kind", json!(error_kind::VALIDATION))
                .with_detail("error", json!(e.to_string()));
            if let Some(id) = &task_id {
                event = event.with_task(id.clone());
            }
            self.audit.record(event);
            let result =
                ToolCallResult::failure(&tool_name, error_kind::VALIDATION, e.to_string());
            self.log_call(agent_id, &task_id, &request, &result);
            return result;
        }

        // 4. Announce, then execute under the shorter of the tool timeout
        //    and the caller's cancellation token.
        if let Some(id) = &task_id {
            self.events.publish(
                TaskEvent::new("tool.called", id.clone(), json!({ "tool": tool_name }))
                    .with_agent(agent_id),
            );
        }

        let token = options.token.clone().unwrap_or_default();
        let started_at = chrono::Utc::now();
        let started = Instant::now();
        let timeout = tool.timeout();
        let args = request.args.clone();

        let executed = race_with_abort(&token, async {
            match tokio::time::timeout(timeout, tool.execute(args, &token)).await {
                Ok(inner) => inner,
                Err(_) => Err(crate::MaestroError::timeout(format!(
                    "tool {tool_name} exceeded {}ms",
                    timeout.as_millis()
                ))),
            }
        })
        .await;

        let completed_at = chrono::Utc::now();
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match executed {
            Ok(output) => {
                let mut event = AuditEvent::new(AuditKind::ToolCall, agent_id)
                    .with_tool(&tool_name)
                    .with_detail("success", json!(true))
                    .with_detail("duration_ms", json!(duration_ms));
                if let Some(id) = &task_id {
                    event = event.with_task(id.clone());
                }
                self.audit.record(event);
                ToolCallResult {
                    tool_name: tool_name.clone(),
                    success: true,
                    output: Some(output),
                    error: None,
                    error_kind: None,
                    duration_ms,
                }
            }
            Err(err) => {
                let kind = match &err {
                    crate::MaestroError::Timeout { .. } => error_kind::TIMEOUT,
                    crate::MaestroError::Aborted { .. } => error_kind::EXECUTION,
                    _ => error_kind::EXECUTION,
                };
                let audit_kind = if kind == error_kind::TIMEOUT {
                    AuditKind::ToolTimeout
                } else {
                    AuditKind::ExecutionError
                };
                let mut event = AuditEvent::new(audit_kind, agent_id)
                    .with_tool(&tool_name)
                    .with_detail("error", json!(err.to_string()))
                    .with_detail("duration_ms", json!(duration_ms));
                if let Some(id) = &task_id {
                    event = event.with_task(id.clone());
                }
                self.audit.record(event);
                ToolCallResult {
                    tool_name: tool_name.clone(),
                    success: false,
                    output: None,
                    error: Some(err.to_string()),
                    error_kind: Some(kind),
                    duration_ms,
                }
            }
        };

        // 5. Record and announce completion.
        self.log_call(agent_id, &task_id, &request, &result);
        if let Some(id) = &task_id {
            self.replay.append(ReplayEntry {
                task_id: id.clone(),
                agent_id: agent_id.to_string(),
                kind: ReplayKind::Tool,
                step: format!("tool:{tool_name}"),
                input: request.args.clone(),
                output: result.output.clone(),
                error: result.error.clone(),
                started_at,
                completed_at,
                metadata: HashMap::new(),
            });
            self.events.publish(
                TaskEvent::new(
                    "tool.completed",
                    id.clone(),
                    json!({ "tool": tool_name, "success": result.success }),
                )
                .with_agent(agent_id),
            );
        }

        debug!(
            tool = %tool_name,
            agent = %agent_id,
            success = result.success,
            duration_ms,
            "tool call finished"
        );
        result
    }

    fn log_call(
        &self,
        agent_id: &str,
        task_id: &Option<String>,
        request: &ToolCallRequest,
        result: &ToolCallResult,
    ) {
        let mut log = self.call_log.lock().expect("call log lock poisoned");
        if log.len() >= CALL_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(ToolCallLogEntry {
            agent_id: agent_id.to_string(),
            task_id: task_id.clone(),
            tool_name: request.tool_name.clone(),
            args: request.args.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
            error: result.error.clone(),
        });
    }

    pub fn call_log(&self, limit: usize) -> Vec<ToolCallLogEntry> {
        let log = self.call_log.lock().expect("call log lock poisoned");
        let start = log.len().saturating_sub(limit);
        log.iter().skip(start).cloned().collect()
    }

    pub async fn health_report(&self) -> HashMap<String, bool> {
        let tools: Vec<Arc<dyn Tool>> = {
            let map = self.tools.read().await;
            map.values().cloned().collect()
        };
        let mut report = HashMap::new();
        for tool in tools {
            report.insert(tool.name().to_string(), tool.health_check().await);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MaestroError;

    struct FastTool {
        limit: Option<u32>,
    }

    #[async_trait]
    impl Tool for FastTool {
        fn name(&self) -> &str {
            "fast-tool"
        }
        fn kind(&self) -> &str {
            "utility"
        }
        fn rate_limit_per_minute(&self) -> Option<u32> {
            self.limit
        }
        fn validate(&self, args: &Value) -> Result<()> {
            if args.get("text").is_none() {
                return Err(MaestroError::Validation("text is required".into()));
            }
            Ok(())
        }
        async fn execute(&self, args: Value, _token: &CancelToken) -> Result<Value> {
            Ok(json!({ "echo": args["text"] }))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow-tool"
        }
        fn kind(&self) -> &str {
            "utility"
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(30)
        }
        fn validate(&self, _args: &Value) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, _args: Value, _token: &CancelToken) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("done"))
        }
    }

    fn manager() -> ToolManager {
        ToolManager::new(AuditLog::new(100), ReplayStore::new(100), EventBus::new())
    }

    #[tokio::test]
    async fn denies_without_permission_and_audits_once() {
        let mgr = manager();
        mgr.register_tool(Arc::new(FastTool { limit: None })).await;

        let result = mgr
            .call_tool(
                "agent-1",
                ToolCallRequest {
                    tool_name: "fast-tool".into(),
                    args: json!({"text": "hi"}),
                },
                ToolCallOptions::default(),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(error_kind::PERMISSION));
        assert_eq!(mgr.audit.count_by_kind(AuditKind::PermissionDenied), 1);
        assert_eq!(mgr.audit.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_boundary_rejects_next_call() {
        let mgr = manager();
        mgr.register_tool(Arc::new(FastTool { limit: Some(1) })).await;
        mgr.grant_permission("agent-3", "fast-tool").await;

        let first = mgr
            .call_tool(
                "agent-3",
                ToolCallRequest {
                    tool_name: "fast-tool".into(),
                    args: json!({"text": "one"}),
                },
                ToolCallOptions::default(),
            )
            .await;
        assert!(first.success);

        let second = mgr
            .call_tool(
                "agent-3",
                ToolCallRequest {
                    tool_name: "fast-tool".into(),
                    args: json!({"text": "two"}),
                },
                ToolCallOptions::default(),
            )
            .await;
        assert!(!second.success);
        assert_eq!(second.error_kind, Some(error_kind::RATE_LIMIT));
        assert!(second.error.unwrap().to_lowercase().contains("rate"));
        assert_eq!(mgr.audit.count_by_kind(AuditKind::RateLimitExceeded), 1);
    }

    #[tokio::test]
    async fn timeout_produces_tool_timeout_audit() {
        let mgr = manager();
        mgr.register_tool(Arc::new(SlowTool)).await;
        mgr.grant_permission("agent-1", "slow-tool").await;

        let result = mgr
            .call_tool(
                "agent-1",
                ToolCallRequest {
                    tool_name: "slow-tool".into(),
                    args: json!({}),
                },
                ToolCallOptions {
                    task_id: Some("t1".into()),
                    token: None,
                },
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(error_kind::TIMEOUT));
        assert_eq!(mgr.audit.count_by_kind(AuditKind::ToolTimeout), 1);
    }

    #[tokio::test]
    async fn successful_call_records_everywhere() {
        let mgr = manager();
        mgr.register_tool(Arc::new(FastTool { limit: None })).await;
        mgr.grant_permission("agent-1", "fast-tool").await;
        let mut sub = mgr.events.subscribe(Some("t9"), None);

        let result = mgr
            .call_tool(
                "agent-1",
                ToolCallRequest {
                    tool_name: "fast-tool".into(),
                    args: json!({"text": "payload"}),
                },
                ToolCallOptions {
                    task_id: Some("t9".into()),
                    token: None,
                },
            )
            .await;

        assert!(result.success);
        assert_eq!(result.output.unwrap()["echo"], "payload");
        assert_eq!(mgr.audit.count_by_kind(AuditKind::ToolCall), 1);
        assert_eq!(mgr.replay.for_task("t9", 10).len(), 1);
        assert_eq!(mgr.call_log(10).len(), 1);
        assert_eq!(sub.recv().await.unwrap().event_type, "tool.called");
        assert_eq!(sub.recv().await.unwrap().event_type, "tool.completed");
    }

    #[tokio::test]
    async fn validation_failure_is_the_single_terminal_audit() {
        let mgr = manager();
        mgr.register_tool(Arc::new(FastTool { limit: None })).await;
        mgr.grant_permission("agent-1", "fast-tool").await;

        let result = mgr
            .call_tool(
                "agent-1",
                ToolCallRequest {
                    tool_name: "fast-tool".into(),
                    args: json!({}),
                },
                ToolCallOptions::default(),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(error_kind::VALIDATION));
        assert_eq!(mgr.audit.len(), 1);
        assert_eq!(mgr.audit.count_by_kind(AuditKind::ExecutionError), 1);
    }

    #[tokio::test]
    async fn revoked_permission_denies_again() {
        let mgr = manager();
        mgr.register_tool(Arc::new(FastTool { limit: None })).await;
        mgr.set_permissions("agent-1", &["fast-tool"]).await;
        assert!(mgr.can_use_tool("agent-1", "fast-tool").await);

        mgr.revoke_permission("agent-1", "fast-tool").await;
        assert!(!mgr.can_use_tool("agent-1", "fast-tool").await);
    }
}
