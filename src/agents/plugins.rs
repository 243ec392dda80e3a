//! Plugin loading: wraps externally defined `run` functions into agents.
//!
//! Plugins are compiled-in descriptors built with [`define_agent`]. Loading
//! is idempotent: rescanning never duplicates a registration, and a version
//! bump replaces the previous agent under the same `plugin:<name>` id.
//! Directory discovery (JSON manifests resolved against compiled-in
//! runners) is gated behind the `plugin-discovery` feature.

use super::{Agent, AgentContext, AgentRegistry};
use crate::cancellation::race_with_abort;
use crate::constants::PLUGIN_RUN_TIMEOUT_SECS;
use crate::tools::ToolManager;
use crate::{MaestroError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Plugin entry point: serialized input + context to output.
pub type PluginRun =
    Arc<dyn Fn(String, AgentContext) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Descriptor produced by `define_agent`.
#[derive(Clone)]
pub struct PluginSpec {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub permissions: Vec<String>,
    pub run: PluginRun,
}

/// The one way to declare a plugin agent.
pub fn define_agent<F>(
    name: &str,
    version: &str,
    capabilities: &[&str],
    permissions: &[&str],
    run: F,
) -> PluginSpec
where
    F: Fn(String, AgentContext) -> BoxFuture<'static, Result<String>> + Send + Sync + 'static,
{
    PluginSpec {
        name: name.to_string(),
        version: version.to_string(),
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        permissions: permissions.iter().map(|s| s.to_string()).collect(),
        run: Arc::new(run),
    }
}

/// Agent wrapper enforcing the per-plugin timeout and cancellation.
struct PluginAgent {
    id: String,
    name: String,
    version: String,
    capabilities: Vec<String>,
    run: PluginRun,
    timeout: Duration,
}

#[async_trait]
impl Agent for PluginAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "plugin"
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn metadata(&self) -> HashMap<String, Value> {
        HashMap::from([("version".to_string(), json!(self.version))])
    }

    async fn handle(&self, input: String, ctx: AgentContext) -> Result<String> {
        // The run future observes a token that also fires on the plugin
        // timeout; the registry token stays untouched for siblings.
        let token = ctx
            .token
            .child_with_timeout(self.timeout, "Plugin timeout exceeded");
        let mut scoped = ctx.clone();
        scoped.token = token.clone();
        let fut = (self.run)(input, scoped);
        race_with_abort(&token, fut).await.map_err(|e| {
            if e.is_aborted() && token.reason().as_deref() == Some("Plugin timeout exceeded") {
                MaestroError::timeout(format!("plugin {} exceeded its timeout", self.id))
            } else {
                e
            }
        })
    }
}

/// Loads plugin descriptors into the agent registry.
#[derive(Clone)]
pub struct PluginLoader {
    registry: AgentRegistry,
    tools: ToolManager,
    /// name -> version of what is currently loaded.
    loaded: Arc<Mutex<HashMap<String, String>>>,
}

impl PluginLoader {
    pub fn new(registry: AgentRegistry, tools: ToolManager) -> Self {
        Self {
            registry,
            tools,
            loaded: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers the given plugins. Returns the ids that were added or
    /// replaced; unchanged versions are skipped entirely.
    pub async fn load(&self, specs: Vec<PluginSpec>) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        let mut loaded = self.loaded.lock().await;
        for spec in specs {
            let id = format!("plugin:{}", spec.name);
            match loaded.get(&spec.name) {
                Some(version) if *version == spec.version => {
                    debug!("Plugin {} v{} already loaded, skipping", spec.name, version);
                    continue;
                }
                Some(version) => {
                    info!(
                        "Plugin {} upgrading v{} -> v{}",
                        spec.name, version, spec.version
                    );
                }
                None => info!("Loading plugin {} v{}", spec.name, spec.version),
            }

            for permission in &spec.permissions {
                self.tools.grant_permission(&id, permission).await;
            }

            let agent = PluginAgent {
                id: id.clone(),
                name: spec.name.clone(),
                version: spec.version.clone(),
                capabilities: spec.capabilities.clone(),
                run: spec.run.clone(),
                timeout: Duration::from_secs(PLUGIN_RUN_TIMEOUT_SECS),
            };
            self.registry.register(Arc::new(agent)).await;
            loaded.insert(spec.name.clone(), spec.version.clone());
            changed.push(id);
        }
        Ok(changed)
    }

    pub async fn loaded_versions(&self) -> HashMap<String, String> {
        self.loaded.lock().await.clone()
    }

    /// Reads `*.json` manifests from the plugin directory and resolves each
    /// `runner` name against the compiled-in runner table.
    #[cfg(feature = "plugin-discovery")]
    pub async fn scan_dir(
        &self,
        dir: &std::path::Path,
        runners: &HashMap<String, PluginRun>,
    ) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Manifest {
            name: String,
            version: String,
            #[serde(default)]
            capabilities: Vec<String>,
            #[serde(default)]
            permissions: Vec<String>,
            runner: String,
        }

        let mut specs = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            let manifest: Manifest = serde_json::from_str(&raw)?;
            let run = runners.get(&manifest.runner).cloned().ok_or_else(|| {
                MaestroError::Validation(format!(
                    "manifest {} names unknown runner {}",
                    path.display(),
                    manifest.runner
                ))
            })?;
            specs.push(PluginSpec {
                name: manifest.name,
                version: manifest.version,
                capabilities: manifest.capabilities,
                permissions: manifest.permissions,
                run,
            });
        }
        self.load(specs).await
    }
}
