//! Passive learning module.
//!
//! Observes execution outcomes and maintains rolling per-agent and
//! per-(strategy, agent-set) metrics. Purely observational: nothing at
//! dispatch time consults the recommendation.

use crate::constants::LEARNING_HISTORY_CAPACITY;
use crate::models::{ExecutionRecord, Strategy};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentMetrics {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub avg_quality: f64,
}

impl AgentMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total as f64
    }

    fn observe(&mut self, latency_ms: u64, quality: f64, success: bool) {
        self.total += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        // Standard online mean.
        let n = self.total as f64;
        self.avg_latency_ms += (latency_ms as f64 - self.avg_latency_ms) / n;
        self.avg_quality += (quality - self.avg_quality) / n;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyMetrics {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub avg_quality: f64,
    /// 0..100; higher means this (strategy, agent-set) has worked better.
    pub recommendation_score: f64,
}

impl StrategyMetrics {
    fn observe(&mut self, latency_ms: u64, quality: f64, success: bool) {
        self.total += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let n = self.total as f64;
        self.avg_latency_ms += (latency_ms as f64 - self.avg_latency_ms) / n;
        self.avg_quality += (quality - self.avg_quality) / n;
        // Success rate dominates; quality nudges within it.
        let success_rate = self.successes as f64 / n;
        self.recommendation_score = (success_rate * 70.0 + self.avg_quality * 30.0).clamp(0.0, 100.0);
    }
}

/// Key for strategy metrics: the strategy plus the sorted agent set.
fn combo_key(strategy: Strategy, agent_ids: &[String]) -> (Strategy, String) {
    let mut sorted: Vec<&str> = agent_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    (strategy, sorted.join("+"))
}

struct Inner {
    records: VecDeque<ExecutionRecord>,
    agents: HashMap<String, AgentMetrics>,
    strategies: HashMap<(Strategy, String), StrategyMetrics>,
}

#[derive(Clone)]
pub struct LearningModule {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

impl LearningModule {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                records: VecDeque::new(),
                agents: HashMap::new(),
                strategies: HashMap::new(),
            })),
            capacity,
        }
    }

    /// Records one observed outcome. `quality` is 0..100.
    pub fn observe(
        &self,
        agent_ids: &[String],
        strategy: Strategy,
        execution_time_ms: u64,
        quality: f64,
        success: bool,
        error: Option<String>,
    ) {
        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            agent_ids: agent_ids.to_vec(),
            strategy,
            execution_time_ms,
            quality,
            success,
            error,
            timestamp: chrono::Utc::now(),
        };
        let mut inner = self.inner.lock().expect("learning lock poisoned");
        if inner.records.len() >= self.capacity {
            inner.records.pop_front();
        }
        inner.records.push_back(record);

        for agent_id in agent_ids {
            inner
                .agents
                .entry(agent_id.clone())
                .or_default()
                .observe(execution_time_ms, quality, success);
        }
        inner
            .strategies
            .entry(combo_key(strategy, agent_ids))
            .or_default()
            .observe(execution_time_ms, quality, success);
    }

    pub fn agent_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        let inner = self.inner.lock().expect("learning lock poisoned");
        inner.agents.get(agent_id).cloned()
    }

    pub fn all_agent_metrics(&self) -> HashMap<String, AgentMetrics> {
        let inner = self.inner.lock().expect("learning lock poisoned");
        inner.agents.clone()
    }

    pub fn strategy_metrics(
        &self,
        strategy: Strategy,
        agent_ids: &[String],
    ) -> Option<StrategyMetrics> {
        let inner = self.inner.lock().expect("learning lock poisoned");
        inner.strategies.get(&combo_key(strategy, agent_ids)).cloned()
    }

    /// Best-scoring strategy for the agent set, if any has been observed.
    /// Consulted by nothing at dispatch time.
    pub fn recommend_strategy(&self, agent_ids: &[String]) -> Option<(Strategy, f64)> {
        let inner = self.inner.lock().expect("learning lock poisoned");
        [Strategy::Sequential, Strategy::Parallel, Strategy::Adaptive]
            .iter()
            .filter_map(|s| {
                inner
                    .strategies
                    .get(&combo_key(*s, agent_ids))
                    .map(|m| (*s, m.recommendation_score))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn recent_records(&self, limit: usize) -> Vec<ExecutionRecord> {
        let inner = self.inner.lock().expect("learning lock poisoned");
        let start = inner.records.len().saturating_sub(limit);
        inner.records.iter().skip(start).cloned().collect()
    }
}

impl Default for LearningModule {
    fn default() -> Self {
        Self::new(LEARNING_HISTORY_CAPACITY)
    }
}
