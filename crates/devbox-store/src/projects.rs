use async_trait::async_trait;
use devbox_common::{DevboxError, Project, ProjectDirectory};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Project directory backed by a map; the host application normally owns projects.
#[derive(Clone, Default)]
pub struct InMemoryProjects {
    projects: Arc<RwLock<HashMap<Uuid, Project>>>,
}

impl InMemoryProjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, owner_id: impl Into<String>, name: impl Into<String>) -> Project {
        let project = Project {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            name: name.into(),
        };
        self.projects
            .write()
            .await
            .insert(project.id, project.clone());
        project
    }
}

#[async_trait]
impl ProjectDirectory for InMemoryProjects {
    async fn get_project(&self, project_id: Uuid) -> devbox_common::Result<Project> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .cloned()
            .ok_or_else(|| DevboxError::NotFound(format!("project {project_id}")))
    }
}
