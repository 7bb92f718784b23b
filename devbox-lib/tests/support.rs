#![allow(dead_code)]

use std::sync::Arc;

use devbox_common::{
    Container, ContainerRequest, DevboxConfig, Project, ResourceLimits, RuntimeKind,
};
use devbox_lib::WorkspaceService;
use devbox_runtime::InMemoryRuntime;
use devbox_store::{InMemoryProjects, InMemoryStore};
use tracing_subscriber::EnvFilter;

pub struct Harness {
    pub service: WorkspaceService,
    pub runtime: Arc<InMemoryRuntime>,
    pub store: InMemoryStore,
    pub projects: InMemoryProjects,
}

pub fn test_config() -> DevboxConfig {
    DevboxConfig {
        runtime: RuntimeKind::Memory,
        ..DevboxConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: DevboxConfig) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let runtime = Arc::new(InMemoryRuntime::new());
    let store = InMemoryStore::new();
    let projects = InMemoryProjects::new();
    let service = WorkspaceService::builder(config)
        .runtime(runtime.clone())
        .container_store(Arc::new(store.clone()))
        .file_store(Arc::new(store.clone()))
        .projects(Arc::new(projects.clone()))
        .build()
        .expect("valid test service");
    Harness {
        service,
        runtime,
        store,
        projects,
    }
}

impl Harness {
    pub async fn project(&self, owner: &str) -> Project {
        self.projects.create(owner, "demo").await
    }

    /// Project plus a RUNNING container.
    pub async fn running(&self, owner: &str) -> (Project, Container) {
        let project = self.project(owner).await;
        let container = self
            .service
            .ensure_running(project.id, owner, &ContainerRequest::default())
            .await
            .expect("container starts");
        (project, container)
    }

    pub fn external_id(container: &Container) -> String {
        container
            .external_id
            .clone()
            .expect("running container has a runtime id")
    }
}

pub fn limits(cpu: f64, memory_mb: u64) -> ContainerRequest {
    ContainerRequest {
        limits: Some(ResourceLimits {
            cpu,
            memory_mb,
            disk_mb: 5120,
        }),
        ..Default::default()
    }
}

pub fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
