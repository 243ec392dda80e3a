use crate::{constants, MaestroError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub runtime: RuntimeConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub max_concurrent_tasks: usize,
    /// Directory scanned for plugin manifests when discovery is enabled.
    pub plugin_dir: PathBuf,
    /// When set, tasks/audit/replay streams are persisted as JSON lines here.
    pub persist_dir: Option<PathBuf>,
    /// Default deadline applied to workflows that do not set one, in seconds.
    pub default_task_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Adapter chain mode reported by `/api/models` (`auto`, `deterministic`, `echo`).
    pub mode: String,
    pub gpt4all_base_url: Option<String>,
    pub ollama_base_url: Option<String>,
    pub openai_base_url: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let host = env::var("MAESTRO_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("MAESTRO_PORT")
            .unwrap_or_else(|_| "3700".to_string())
            .parse()
            .map_err(|_| MaestroError::Configuration("MAESTRO_PORT must be a port number".into()))?;

        let allowed_origins = env::var("MAESTRO_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let max_concurrent_tasks: usize = env::var("MAESTRO_MAX_CONCURRENT_TASKS")
            .unwrap_or_else(|_| constants::DEFAULT_MAX_CONCURRENT_TASKS.to_string())
            .parse()
            .unwrap_or(constants::DEFAULT_MAX_CONCURRENT_TASKS);

        if max_concurrent_tasks == 0 {
            return Err(MaestroError::Configuration(
                "MAESTRO_MAX_CONCURRENT_TASKS must be at least 1".into(),
            ));
        }

        let plugin_dir = env::var("MAESTRO_PLUGIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("plugins"));

        let persist_dir = env::var("MAESTRO_PERSIST_DIR").ok().map(PathBuf::from);

        let default_task_timeout_secs: u64 = env::var("MAESTRO_DEFAULT_TASK_TIMEOUT_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .unwrap_or(600);

        let model = ModelConfig {
            mode: env::var("MAESTRO_MODEL_MODE").unwrap_or_else(|_| "auto".to_string()),
            gpt4all_base_url: validated_base_url("MAESTRO_GPT4ALL_URL")?,
            ollama_base_url: validated_base_url("MAESTRO_OLLAMA_URL")?,
            openai_base_url: validated_base_url("MAESTRO_OPENAI_URL")?,
        };

        Ok(Config {
            api: ApiConfig {
                host,
                port,
                allowed_origins,
            },
            runtime: RuntimeConfig {
                max_concurrent_tasks,
                plugin_dir,
                persist_dir,
                default_task_timeout_secs,
            },
            model,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 3700,
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            runtime: RuntimeConfig {
                max_concurrent_tasks: constants::DEFAULT_MAX_CONCURRENT_TASKS,
                plugin_dir: PathBuf::from("plugins"),
                persist_dir: None,
                default_task_timeout_secs: 600,
            },
            model: ModelConfig {
                mode: "auto".to_string(),
                gpt4all_base_url: None,
                ollama_base_url: None,
                openai_base_url: None,
            },
        }
    }
}

/// Reads an optional provider base URL and rejects unparseable values early.
fn validated_base_url(var: &str) -> Result<Option<String>> {
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => {
            url::Url::parse(raw.trim()).map_err(|e| {
                MaestroError::Configuration(format!("{var} is not a valid URL: {e}"))
            })?;
            Ok(Some(raw.trim().to_string()))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn default_config_is_usable() {
        let config = Config::default();
        assert_eq!(config.api.port, 3700);
        assert!(config.runtime.max_concurrent_tasks >= 1);
        assert!(config.runtime.persist_dir.is_none());
    }

    #[test]
    #[serial]
    fn rejects_invalid_provider_url() {
        env::set_var("MAESTRO_OLLAMA_URL", "not a url");
        let result = Config::load();
        env::remove_var("MAESTRO_OLLAMA_URL");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn loads_overrides_from_environment() {
        env::set_var("MAESTRO_PORT", "4100");
        env::set_var("MAESTRO_MAX_CONCURRENT_TASKS", "8");
        let config = Config::load().unwrap();
        env::remove_var("MAESTRO_PORT");
        env::remove_var("MAESTRO_MAX_CONCURRENT_TASKS");
        assert_eq!(config.api.port, 4100);
        assert_eq!(config.runtime.max_concurrent_tasks, 8);
    }
}
