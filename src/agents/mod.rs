//! Agents: model-backed workers executing atomic tasks.

pub mod builtin;
pub mod plugins;

pub use plugins::{define_agent, PluginLoader, PluginSpec};

use crate::cancellation::CancelToken;
use crate::model::ModelAdapter;
use crate::models::{GenerationConfig, ReplayKind};
use crate::replay::{ReplayEntry, ReplayStore};
use crate::tools::{ToolCallOptions, ToolCallRequest, ToolCallResult, ToolManager};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Everything an agent needs while handling one atomic task.
#[derive(Clone)]
pub struct AgentContext {
    pub task_id: String,
    pub agent_id: String,
    pub token: CancelToken,
    pub generation: GenerationConfig,
    tools: ToolManager,
    model: Arc<dyn ModelAdapter>,
    replay: ReplayStore,
}

impl AgentContext {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        token: CancelToken,
        generation: GenerationConfig,
        tools: ToolManager,
        model: Arc<dyn ModelAdapter>,
        replay: ReplayStore,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            token,
            generation,
            tools,
            model,
            replay,
        }
    }

    /// Generates text through the active model adapter and records the
    /// invocation to the replay store.
    pub async fn generate(&self, step: &str, prompt: &str) -> Result<String> {
        let started_at = chrono::Utc::now();
        let result = self
            .model
            .generate(prompt, &self.generation, &self.token)
            .await;
        let completed_at = chrono::Utc::now();
        self.replay.append(ReplayEntry {
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone(),
            kind: ReplayKind::Model,
            step: format!("model:{step}"),
            input: json!({ "prompt": prompt, "seed": self.generation.seed }),
            output: result.as_ref().ok().map(|s| json!(s)),
            error: result.as_ref().err().map(|e| e.to_string()),
            started_at,
            completed_at,
            metadata: HashMap::new(),
        });
        result
    }

    /// Invokes a tool through the manager with this task's identity.
    pub async fn call_tool(&self, tool_name: &str, args: Value) -> ToolCallResult {
        self.tools
            .call_tool(
                &self.agent_id,
                ToolCallRequest {
                    tool_name: tool_name.to_string(),
                    args,
                },
                ToolCallOptions {
                    task_id: Some(self.task_id.clone()),
                    token: Some(self.token.clone()),
                },
            )
            .await
    }
}

/// A worker mapping a serialized input string to an output string.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    /// Origin label (`builtin`, `plugin`).
    fn kind(&self) -> &str {
        "builtin"
    }
    /// Suitability tags consumed by the scheduler's classifier.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }
    fn metadata(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    async fn handle(&self, input: String, ctx: AgentContext) -> Result<String>;
}

/// Registry entry projected to `/api/agents`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

/// Process-wide agent registry. Registration is hot-reload safe: an id is
/// bound to at most one agent and re-registration replaces the previous one.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<dyn Agent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns true when the agent was new, false when it replaced an
    /// existing registration.
    pub async fn register(&self, agent: Arc<dyn Agent>) -> bool {
        let id = agent.id().to_string();
        let mut agents = self.agents.write().await;
        let fresh = agents.insert(id.clone(), agent).is_none();
        if fresh {
            info!("Registered agent {}", id);
        } else {
            warn!("Agent {} replaced by re-registration", id);
        }
        fresh
    }

    pub async fn unregister(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        agents.remove(agent_id).is_some()
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        let agents = self.agents.read().await;
        agents.get(agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        let agents = self.agents.read().await;
        agents.contains_key(agent_id)
    }

    pub async fn ids(&self) -> Vec<String> {
        let agents = self.agents.read().await;
        let mut ids: Vec<String> = agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn list(&self) -> Vec<AgentInfo> {
        let agents = self.agents.read().await;
        let mut infos: Vec<AgentInfo> = agents
            .values()
            .map(|agent| AgentInfo {
                id: agent.id().to_string(),
                name: agent.name().to_string(),
                kind: agent.kind().to_string(),
                description: agent.description().to_string(),
                capabilities: agent.capabilities(),
                metadata: agent.metadata(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
