//! Built-in agents compiled into the runtime.

use super::{Agent, AgentContext};
use crate::cancellation::race_with_abort;
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Returns its input unchanged. The smallest possible agent; also the
/// reference agent for end-to-end tests.
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> &str {
        "echo"
    }

    fn name(&self) -> &str {
        "Echo"
    }

    fn description(&self) -> &str {
        "Returns the task input unchanged"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["general".into(), "text".into()]
    }

    async fn handle(&self, input: String, ctx: AgentContext) -> Result<String> {
        crate::cancellation::throw_if_aborted(&ctx.token)?;
        Ok(input)
    }
}

/// Sleeps for a configured duration before answering; exists to exercise
/// cancellation and timeout paths.
pub struct SlowAgent {
    delay: Duration,
}

impl SlowAgent {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SlowAgent {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Agent for SlowAgent {
    fn id(&self) -> &str {
        "slow"
    }

    fn name(&self) -> &str {
        "Slow"
    }

    fn description(&self) -> &str {
        "Sleeps before answering; useful for cancellation testing"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["general".into()]
    }

    async fn handle(&self, input: String, ctx: AgentContext) -> Result<String> {
        let delay = self.delay;
        race_with_abort(&ctx.token, async move {
            tokio::time::sleep(delay).await;
            Ok(input)
        })
        .await
    }
}

/// General-purpose model-backed agent: sends the input to the active model
/// adapter and returns its output.
pub struct AssistantAgent;

#[async_trait]
impl Agent for AssistantAgent {
    fn id(&self) -> &str {
        "assistant"
    }

    fn name(&self) -> &str {
        "Assistant"
    }

    fn description(&self) -> &str {
        "Answers free-form requests through the model adapter"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["general".into(), "text".into(), "analysis".into()]
    }

    async fn handle(&self, input: String, ctx: AgentContext) -> Result<String> {
        ctx.generate("answer", &input).await
    }
}

/// Role-labelled worker used by the multi-agent planner. Each role prefixes
/// the prompt differently; the heavy lifting stays in the model adapter.
pub struct RoleAgent {
    id: String,
    name: String,
    role: String,
    prompt_prefix: String,
}

impl RoleAgent {
    pub fn new(role: &str, prompt_prefix: &str) -> Self {
        Self {
            id: role.to_string(),
            name: {
                let mut chars = role.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            },
            role: role.to_string(),
            prompt_prefix: prompt_prefix.to_string(),
        }
    }

    /// The planner's standard four roles.
    pub fn planner_set() -> Vec<RoleAgent> {
        vec![
            RoleAgent::new("researcher", "Collect the relevant facts for"),
            RoleAgent::new("builder", "Produce the requested artifact for"),
            RoleAgent::new("reviewer", "Review critically and list issues in"),
            RoleAgent::new("summarizer", "Write the final consolidated answer for"),
        ]
    }
}

#[async_trait]
impl Agent for RoleAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Multi-agent planner role worker"
    }

    fn capabilities(&self) -> Vec<String> {
        vec![self.role.clone(), "text".into()]
    }

    fn metadata(&self) -> HashMap<String, Value> {
        HashMap::from([("role".to_string(), json!(self.role))])
    }

    async fn handle(&self, input: String, ctx: AgentContext) -> Result<String> {
        let prompt = format!("{}: {}", self.prompt_prefix, input);
        ctx.generate(&self.role, &prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::cancellation::CancelToken;
    use crate::events::EventBus;
    use crate::model::EchoAdapter;
    use crate::models::GenerationConfig;
    use crate::replay::ReplayStore;
    use crate::tools::ToolManager;
    use std::sync::Arc;

    fn ctx(agent_id: &str, token: CancelToken) -> AgentContext {
        let replay = ReplayStore::new(100);
        AgentContext::new(
            "task-1",
            agent_id,
            token,
            GenerationConfig::default(),
            ToolManager::new(AuditLog::new(10), replay.clone(), EventBus::new()),
            Arc::new(EchoAdapter),
            replay,
        )
    }

    #[tokio::test]
    async fn echo_returns_input() {
        let out = EchoAgent
            .handle("hello".into(), ctx("echo", CancelToken::new()))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn slow_agent_honors_cancellation() {
        let token = CancelToken::new();
        let aborter = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            aborter.abort("cancelled by user");
        });
        let err = SlowAgent::new(Duration::from_secs(10))
            .handle("hi".into(), ctx("slow", token))
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn assistant_records_model_replay() {
        let replay = ReplayStore::new(100);
        let context = AgentContext::new(
            "task-1",
            "assistant",
            CancelToken::new(),
            GenerationConfig::default(),
            ToolManager::new(AuditLog::new(10), replay.clone(), EventBus::new()),
            Arc::new(EchoAdapter),
            replay.clone(),
        );
        let out = AssistantAgent
            .handle("question".into(), context)
            .await
            .unwrap();
        assert_eq!(out, "question");
        assert_eq!(replay.for_task("task-1", 10).len(), 1);
    }

    #[tokio::test]
    async fn role_agents_cover_planner_roles() {
        let roles: Vec<String> = RoleAgent::planner_set()
            .into_iter()
            .map(|a| a.id().to_string())
            .collect();
        assert_eq!(roles, ["researcher", "builder", "reviewer", "summarizer"]);
    }
}
