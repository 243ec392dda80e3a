use anyhow::Result;
use clap::Parser;
use maestro_core::{api, config::Config, logs::LogBuffer, runtime::Runtime};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "maestro-core", about = "Multi-agent task orchestration runtime")]
struct Cli {
    /// Bind host (overrides MAESTRO_HOST)
    #[arg(long)]
    host: Option<String>,
    /// Bind port (overrides MAESTRO_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Plugin manifest directory (overrides MAESTRO_PLUGIN_DIR)
    #[arg(long)]
    plugin_dir: Option<std::path::PathBuf>,
    /// Persistence directory (overrides MAESTRO_PERSIST_DIR)
    #[arg(long)]
    persist_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logs = LogBuffer::default();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(logs.layer())
        .init();

    info!("Starting Maestro Core");

    let mut config = Config::load()?;
    if let Some(host) = cli.host {
        config.api.host = host;
    }
    if let Some(port) = cli.port {
        config.api.port = port;
    }
    if let Some(plugin_dir) = cli.plugin_dir {
        config.runtime.plugin_dir = plugin_dir;
    }
    if let Some(persist_dir) = cli.persist_dir {
        config.runtime.persist_dir = Some(persist_dir);
    }

    let mut runtime = Runtime::new(config).await?;
    runtime.logs = logs;

    #[cfg(feature = "plugin-discovery")]
    {
        use futures::FutureExt;
        use maestro_core::agents::plugins::PluginRun;
        use std::sync::Arc;

        let dir = runtime.config.runtime.plugin_dir.clone();
        if dir.is_dir() {
            // Manifests resolve against this compiled-in runner table.
            let mut runners: std::collections::HashMap<String, PluginRun> =
                std::collections::HashMap::new();
            runners.insert(
                "uppercase".to_string(),
                Arc::new(|input: String, _ctx| async move { Ok(input.to_uppercase()) }.boxed()),
            );
            runners.insert(
                "reverse".to_string(),
                Arc::new(|input: String, _ctx| {
                    async move { Ok(input.chars().rev().collect::<String>()) }.boxed()
                }),
            );
            match runtime.plugins.scan_dir(&dir, &runners).await {
                Ok(loaded) => info!("Discovered {} plugin(s)", loaded.len()),
                Err(e) => tracing::warn!("Plugin discovery failed: {}", e),
            }
        }
    }

    let scheduler_runtime = runtime.clone();
    let scheduler_loop = tokio::spawn(async move {
        scheduler_runtime.run_scheduler_loop().await;
    });

    tokio::select! {
        result = api::serve(runtime.clone()) => {
            if let Err(e) = result {
                tracing::error!("API server failed: {}", e);
                std::process::exit(1);
            }
        }
        _ = scheduler_loop => {
            tracing::error!("Scheduler loop exited unexpectedly");
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    runtime.cancellations.abort_all("shutdown").await;
    info!("Maestro Core stopped");
    Ok(())
}
