//! Pluggable model back-ends.
//!
//! The core never talks to a provider directly; agents receive a
//! [`ModelAdapter`] and the runtime decides which implementation backs it.
//! Two built-ins ship with the runtime: a seeded deterministic adapter (also
//! used for replay) and an echo adapter as the chain tail so the system runs
//! with no external provider at all.

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};

use crate::cancellation::CancelToken;
use crate::config::ModelConfig;
use crate::models::{GenerationConfig, GenerationMode};
use crate::{MaestroError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        generation: &GenerationConfig,
        token: &CancelToken,
    ) -> Result<String>;

    async fn health(&self) -> bool {
        true
    }
}

/// Returns the prompt unchanged. Chain tail; never fails.
pub struct EchoAdapter;

#[async_trait]
impl ModelAdapter for EchoAdapter {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(
        &self,
        prompt: &str,
        _generation: &GenerationConfig,
        token: &CancelToken,
    ) -> Result<String> {
        crate::cancellation::throw_if_aborted(token)?;
        Ok(prompt.to_string())
    }
}

/// Pure function of `(prompt, seed)`; identical inputs always produce
/// identical output, which is what deterministic mode and replay require.
pub struct DeterministicAdapter;

impl DeterministicAdapter {
    fn fingerprint(prompt: &str, seed: u64) -> u64 {
        // FNV-1a over the seed and prompt bytes.
        let mut hash: u64 = 0xcbf29ce484222325 ^ seed;
        for byte in prompt.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }
}

#[async_trait]
impl ModelAdapter for DeterministicAdapter {
    fn name(&self) -> &str {
        "deterministic"
    }

    async fn generate(
        &self,
        prompt: &str,
        generation: &GenerationConfig,
        token: &CancelToken,
    ) -> Result<String> {
        crate::cancellation::throw_if_aborted(token)?;
        let seed = generation.seed.unwrap_or(0);
        let fingerprint = Self::fingerprint(prompt, seed);
        Ok(format!("{prompt} [#{fingerprint:016x}]"))
    }
}

/// Adapter wrapper that routes every call through a circuit breaker.
pub struct GuardedModel {
    adapter: Arc<dyn ModelAdapter>,
    breaker: CircuitBreaker,
}

impl GuardedModel {
    pub fn new(adapter: Arc<dyn ModelAdapter>, breaker: CircuitBreaker) -> Self {
        Self { adapter, breaker }
    }

    pub fn breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.breaker.metrics()
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }
}

#[async_trait]
impl ModelAdapter for GuardedModel {
    fn name(&self) -> &str {
        self.adapter.name()
    }

    async fn generate(
        &self,
        prompt: &str,
        generation: &GenerationConfig,
        token: &CancelToken,
    ) -> Result<String> {
        if !self.breaker.allow_request() {
            return Err(MaestroError::Model {
                message: format!("circuit open for adapter {}", self.adapter.name()),
            });
        }
        match self.adapter.generate(prompt, generation, token).await {
            Ok(output) => {
                self.breaker.record_success();
                Ok(output)
            }
            Err(err) => {
                // Cancellation is not an upstream fault.
                if !err.is_aborted() {
                    self.breaker.record_failure();
                }
                Err(err)
            }
        }
    }

    async fn health(&self) -> bool {
        self.adapter.health().await
    }
}

/// Picks the adapter for a submission. Deterministic mode always resolves to
/// the deterministic adapter; creative mode takes the head of the chain.
pub struct ModelChain {
    mode: String,
    guarded: Arc<GuardedModel>,
    deterministic: Arc<DeterministicAdapter>,
}

impl ModelChain {
    pub fn new(config: &ModelConfig) -> Self {
        let head: Arc<dyn ModelAdapter> = match config.mode.as_str() {
            "deterministic" => Arc::new(DeterministicAdapter),
            _ => Arc::new(EchoAdapter),
        };
        Self {
            mode: config.mode.clone(),
            guarded: Arc::new(GuardedModel::new(head, CircuitBreaker::default())),
            deterministic: Arc::new(DeterministicAdapter),
        }
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn chain(&self) -> Vec<String> {
        vec![
            self.guarded.adapter_name().to_string(),
            self.deterministic.name().to_string(),
        ]
    }

    pub fn resolve(&self, generation: &GenerationConfig) -> Arc<dyn ModelAdapter> {
        match generation.mode {
            GenerationMode::Deterministic => self.deterministic.clone(),
            GenerationMode::Creative => self.guarded.clone(),
        }
    }

    pub fn breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.guarded.breaker_metrics()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub configured: bool,
    pub reachable: bool,
}

/// Probes configured provider endpoints for `/api/models`. An unconfigured
/// provider is reported absent rather than unreachable.
pub async fn probe_providers(config: &ModelConfig) -> HashMap<String, ProviderStatus> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_default();

    let mut statuses = HashMap::new();
    let targets = [
        ("gpt4all", config.gpt4all_base_url.as_deref()),
        ("ollama", config.ollama_base_url.as_deref()),
        ("openai", config.openai_base_url.as_deref()),
    ];
    for (name, base_url) in targets {
        let Some(base_url) = base_url else { continue };
        let reachable = match client.get(base_url).send().await {
            Ok(response) => {
                debug!(provider = name, status = %response.status(), "provider probe");
                true
            }
            Err(_) => false,
        };
        statuses.insert(
            name.to_string(),
            ProviderStatus {
                configured: true,
                reachable,
            },
        );
    }
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creative() -> GenerationConfig {
        GenerationConfig::default()
    }

    fn deterministic(seed: u64) -> GenerationConfig {
        GenerationConfig {
            mode: GenerationMode::Deterministic,
            temperature: Some(0.0),
            seed: Some(seed),
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn deterministic_adapter_is_pure() {
        let adapter = DeterministicAdapter;
        let token = CancelToken::new();
        let a = adapter
            .generate("plan the build", &deterministic(7), &token)
            .await
            .unwrap();
        let b = adapter
            .generate("plan the build", &deterministic(7), &token)
            .await
            .unwrap();
        let c = adapter
            .generate("plan the build", &deterministic(8), &token)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn guarded_model_rejects_when_open() {
        struct FailingAdapter;
        #[async_trait]
        impl ModelAdapter for FailingAdapter {
            fn name(&self) -> &str {
                "failing"
            }
            async fn generate(
                &self,
                _prompt: &str,
                _generation: &GenerationConfig,
                _token: &CancelToken,
            ) -> Result<String> {
                Err(MaestroError::Model {
                    message: "upstream down".into(),
                })
            }
        }

        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
            failure_window: Duration::from_secs(10),
        });
        let guarded = GuardedModel::new(Arc::new(FailingAdapter), breaker);
        let token = CancelToken::new();

        for _ in 0..2 {
            let _ = guarded.generate("x", &creative(), &token).await;
        }
        let err = guarded.generate("x", &creative(), &token).await.unwrap_err();
        assert!(err.to_string().contains("circuit open"));
    }

    #[tokio::test]
    async fn chain_resolves_deterministic_mode() {
        let chain = ModelChain::new(&ModelConfig {
            mode: "auto".into(),
            gpt4all_base_url: None,
            ollama_base_url: None,
            openai_base_url: None,
        });
        assert_eq!(chain.resolve(&deterministic(1)).name(), "deterministic");
        assert_eq!(chain.resolve(&creative()).name(), "echo");
    }

    #[tokio::test]
    async fn unconfigured_providers_are_absent() {
        let statuses = probe_providers(&ModelConfig {
            mode: "auto".into(),
            gpt4all_base_url: None,
            ollama_base_url: None,
            openai_base_url: None,
        })
        .await;
        assert!(statuses.is_empty());
    }
}
