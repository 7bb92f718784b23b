use std::sync::Arc;

use color_eyre::eyre;
use devbox_common::{DevboxConfig, RuntimeKind};
use devbox_lib::WorkspaceService;
use devbox_runtime::{ContainerRuntime, DockerOptions, DockerRuntime, InMemoryRuntime};
use devbox_store::{InMemoryProjects, InMemoryStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,devbox=debug";

/// JSON file named by `DEVBOX_CONFIG`, or defaults, with `DEVBOX_*` variables on top.
async fn load_config() -> eyre::Result<DevboxConfig> {
    let base = match std::env::var("DEVBOX_CONFIG") {
        Ok(path) => {
            info!(%path, "Loading config file");
            DevboxConfig::load(&path).await?
        }
        Err(_) => DevboxConfig::default(),
    };
    Ok(base.overlay(|key| std::env::var(key).ok())?)
}

fn build_runtime(config: &DevboxConfig) -> eyre::Result<Arc<dyn ContainerRuntime>> {
    match config.runtime {
        RuntimeKind::Docker => {
            let options = DockerOptions {
                timeout: config.runtime_timeout,
                enforce_disk_limit: config.enforce_disk_limit,
                ..DockerOptions::default()
            };
            Ok(Arc::new(DockerRuntime::connect_local(options)?))
        }
        RuntimeKind::Memory => {
            warn!("Using the in-memory runtime; no real containers will be created");
            Ok(Arc::new(InMemoryRuntime::new()))
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();

    info!("Starting devbox daemon...");
    let config = load_config().await?;
    info!(
        runtime = ?config.runtime,
        image = %config.image,
        workspace_root = %config.workspace_root,
        "Configuration loaded"
    );

    let runtime = build_runtime(&config)?;
    let store = InMemoryStore::new();
    let service = WorkspaceService::builder(config)
        .runtime(runtime)
        .container_store(Arc::new(store.clone()))
        .file_store(Arc::new(store))
        .projects(Arc::new(InMemoryProjects::new()))
        .build()?;

    service.start_background().await;
    info!("devbox daemon running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    service.shutdown().await;
    info!("devbox daemon exited cleanly");
    Ok(())
}
