//! Task admission and agent selection.
//!
//! The scheduler keeps a FIFO queue of submissions waiting for an execution
//! slot, tracks a per-agent load score (EWMA over concurrent executions,
//! normalized 0..100), classifies submissions into a `task_type_label`, and
//! ranks agents by suitability. Multi-agent submissions go through the
//! rule-based planner, which emits a role-labelled graph task.

use crate::agents::AgentInfo;
use crate::constants::{LOAD_EWMA_ALPHA, MAX_QUEUE_SIZE};
use crate::events::EventBus;
use crate::learning::LearningModule;
use crate::models::{GraphNode, TaskEvent, TaskSpec};
use crate::{MaestroError, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One entry waiting for admission.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: String,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Classifier output exposed to the UI as `task_type_label`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub label: &'static str,
    pub tags: Vec<&'static str>,
}

/// Chosen agent plus the recorded reason.
#[derive(Debug, Clone)]
pub struct AgentSelection {
    pub agent_id: String,
    pub reason: String,
    pub manually_selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentLoad {
    pub agent_id: String,
    pub load_score: f64,
}

#[derive(Debug, Default)]
struct LoadState {
    active: u32,
    score: f64,
}

#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<Mutex<VecDeque<QueuedTask>>>,
    loads: Arc<Mutex<HashMap<String, LoadState>>>,
    learning: LearningModule,
    events: EventBus,
}

impl Scheduler {
    pub fn new(learning: LearningModule, events: EventBus) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            loads: Arc::new(Mutex::new(HashMap::new())),
            learning,
            events,
        }
    }

    pub fn enqueue(&self, task_id: &str) -> Result<()> {
        let mut queue = self.queue.lock().expect("scheduler queue lock poisoned");
        if queue.len() >= MAX_QUEUE_SIZE {
            return Err(MaestroError::Validation(
                "scheduler queue is full".to_string(),
            ));
        }
        queue.push_back(QueuedTask {
            task_id: task_id.to_string(),
            enqueued_at: chrono::Utc::now(),
        });
        self.events.publish(TaskEvent::new(
            "scheduler.queued",
            task_id,
            json!({ "depth": queue.len() }),
        ));
        Ok(())
    }

    pub fn dequeue(&self) -> Option<QueuedTask> {
        let mut queue = self.queue.lock().expect("scheduler queue lock poisoned");
        queue.pop_front()
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().expect("scheduler queue lock poisoned").len()
    }

    /// Marks one execution started on the agent and refreshes its EWMA.
    pub fn record_start(&self, agent_id: &str) {
        let mut loads = self.loads.lock().expect("scheduler load lock poisoned");
        let state = loads.entry(agent_id.to_string()).or_default();
        state.active += 1;
        let sample = (state.active as f64 * 25.0).min(100.0);
        state.score += LOAD_EWMA_ALPHA * (sample - state.score);
    }

    pub fn record_finish(&self, agent_id: &str) {
        let mut loads = self.loads.lock().expect("scheduler load lock poisoned");
        let state = loads.entry(agent_id.to_string()).or_default();
        state.active = state.active.saturating_sub(1);
        let sample = (state.active as f64 * 25.0).min(100.0);
        state.score += LOAD_EWMA_ALPHA * (sample - state.score);
    }

    pub fn load_score(&self, agent_id: &str) -> f64 {
        let loads = self.loads.lock().expect("scheduler load lock poisoned");
        loads.get(agent_id).map(|s| s.score).unwrap_or(0.0)
    }

    pub fn loads(&self) -> Vec<AgentLoad> {
        let loads = self.loads.lock().expect("scheduler load lock poisoned");
        let mut result: Vec<AgentLoad> = loads
            .iter()
            .map(|(agent_id, state)| AgentLoad {
                agent_id: agent_id.clone(),
                load_score: state.score,
            })
            .collect();
        result.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        result
    }

    pub fn average_load(&self) -> f64 {
        let loads = self.loads.lock().expect("scheduler load lock poisoned");
        if loads.is_empty() {
            return 0.0;
        }
        loads.values().map(|s| s.score).sum::<f64>() / loads.len() as f64
    }

    /// Keyword classifier deriving the `task_type_label` and suitability
    /// tags used for ranking.
    pub fn classify(input: &str) -> Classification {
        let lower = input.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if has(&["review", "critique", "check", "audit"]) {
            Classification {
                label: "review",
                tags: vec!["reviewer", "review", "analysis"],
            }
        } else if has(&["research", "find", "look up", "investigate", "search"]) {
            Classification {
                label: "research",
                tags: vec!["researcher", "research", "analysis"],
            }
        } else if has(&["build", "write", "implement", "create", "generate", "code"]) {
            Classification {
                label: "build",
                tags: vec!["builder", "build", "code", "text"],
            }
        } else if has(&["summarize", "summary", "condense"]) {
            Classification {
                label: "summarize",
                tags: vec!["summarizer", "final", "text"],
            }
        } else {
            Classification {
                label: "general",
                tags: vec!["general", "text"],
            }
        }
    }

    /// Picks an agent for the submission. An explicit agent id wins; the
    /// classifier ranks the rest by tag overlap, breaking ties by success
    /// rate and then by inverse load score.
    pub fn select_agent(
        &self,
        input: &str,
        agents: &[AgentInfo],
        requested: Option<&str>,
    ) -> Result<AgentSelection> {
        if let Some(agent_id) = requested {
            if !agents.iter().any(|a| a.id == agent_id) {
                return Err(MaestroError::NotFound(format!("agent {agent_id}")));
            }
            return Ok(AgentSelection {
                agent_id: agent_id.to_string(),
                reason: "manually selected by submission".to_string(),
                manually_selected: true,
            });
        }

        if agents.is_empty() {
            return Err(MaestroError::NotFound("no agents registered".to_string()));
        }

        let classification = Self::classify(input);
        let mut best: Option<(&AgentInfo, usize, f64, f64)> = None;
        for agent in agents {
            let overlap = agent
                .capabilities
                .iter()
                .filter(|c| classification.tags.contains(&c.as_str()))
                .count();
            let success_rate = self
                .learning
                .agent_metrics(&agent.id)
                .map(|m| m.success_rate())
                .unwrap_or(0.0);
            let load = self.load_score(&agent.id);
            let candidate = (agent, overlap, success_rate, load);
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    let (c_agent, c_overlap, c_rate, c_load) = current;
                    let better = overlap > c_overlap
                        || (overlap == c_overlap && success_rate > c_rate)
                        || (overlap == c_overlap
                            && (success_rate - c_rate).abs() < f64::EPSILON
                            && load < c_load);
                    if better {
                        candidate
                    } else {
                        (c_agent, c_overlap, c_rate, c_load)
                    }
                }
            });
        }

        let (agent, overlap, _, _) = best.expect("agents is non-empty");
        debug!(
            agent = %agent.id,
            label = classification.label,
            overlap,
            "agent selected"
        );
        Ok(AgentSelection {
            agent_id: agent.id.clone(),
            reason: format!(
                "classifier matched {} capability tag(s) for task type `{}`",
                overlap, classification.label
            ),
            manually_selected: false,
        })
    }

    /// Rule-based multi-agent planner: a four-node graph with labelled
    /// roles. Role workers are picked by capability; a role with no
    /// matching agent falls back to the generally best ranked agent.
    pub fn plan_multi_agent(
        &self,
        task_id: &str,
        input: &str,
        agents: &[AgentInfo],
    ) -> Result<TaskSpec> {
        if agents.is_empty() {
            return Err(MaestroError::NotFound("no agents registered".to_string()));
        }
        let pick = |role_tag: &str| -> String {
            agents
                .iter()
                .find(|a| a.capabilities.iter().any(|c| c == role_tag))
                .map(|a| a.id.clone())
                .unwrap_or_else(|| agents[0].id.clone())
        };

        let research_agent = pick("researcher");
        let build_agent = pick("builder");
        let review_agent = pick("reviewer");
        let final_agent = pick("summarizer");

        let node = |role: &str, agent: &str, deps: Vec<String>, allow_failure: bool| GraphNode {
            id: role.to_string(),
            task: TaskSpec::atomic(format!("{task_id}:{role}"), agent, Some(json!(input))),
            depends_on: deps,
            allow_failure,
            role: Some(role.to_string()),
        };

        Ok(TaskSpec::graph(
            task_id,
            vec![
                node("research", &research_agent, vec![], false),
                node("build", &build_agent, vec!["research".into()], false),
                // A failed review must not sink the workflow.
                node("review", &review_agent, vec!["build".into()], true),
                node(
                    "final",
                    &final_agent,
                    vec!["build".into(), "review".into()],
                    false,
                ),
            ],
        ))
    }
}
