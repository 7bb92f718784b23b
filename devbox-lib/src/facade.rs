//! The orchestration facade: the only entry point callers use.
//!
//! Every call names a project and the acting user. The project must exist
//! (`NotFound`) and belong to that user (`Forbidden`) before anything else
//! happens. The service owns the lifecycle manager, the synchronizer and the
//! background loop handle; nothing here is global.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use devbox_common::{
    paths, Container, ContainerMetrics, ContainerRequest, ContentScanner, DevboxConfig,
    DevboxError, ExecOutput, FileMetadata, FileNode, FileRecord, NoopScanner, Project,
    ProjectDirectory, Result,
};
use devbox_runtime::ContainerRuntime;
use devbox_store::{ContainerStore, FileStore};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::lifecycle::ContainerManager;
use crate::reconcile::Reconciler;
use crate::sync::{PullOptions, PullReport, PushReport, WorkspaceSync};

pub struct WorkspaceServiceBuilder {
    config: DevboxConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    containers: Option<Arc<dyn ContainerStore>>,
    files: Option<Arc<dyn FileStore>>,
    projects: Option<Arc<dyn ProjectDirectory>>,
    scanner: Arc<dyn ContentScanner>,
}

impl WorkspaceServiceBuilder {
    pub fn new(config: DevboxConfig) -> Self {
        Self {
            config,
            runtime: None,
            containers: None,
            files: None,
            projects: None,
            scanner: Arc::new(NoopScanner),
        }
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn container_store(mut self, containers: Arc<dyn ContainerStore>) -> Self {
        self.containers = Some(containers);
        self
    }

    pub fn file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn projects(mut self, projects: Arc<dyn ProjectDirectory>) -> Self {
        self.projects = Some(projects);
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn ContentScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn build(self) -> Result<WorkspaceService> {
        self.config.validate()?;
        let missing = |what: &str| DevboxError::Validation(format!("workspace service needs a {what}"));
        let runtime = self.runtime.ok_or_else(|| missing("container runtime"))?;
        let containers = self.containers.ok_or_else(|| missing("container store"))?;
        let files = self.files.ok_or_else(|| missing("file store"))?;
        let projects = self.projects.ok_or_else(|| missing("project directory"))?;

        let config = Arc::new(self.config);
        let manager = Arc::new(ContainerManager::new(
            runtime.clone(),
            containers,
            config.clone(),
        ));
        let sync = WorkspaceSync::new(runtime, files.clone(), self.scanner.clone(), config);
        Ok(WorkspaceService {
            projects,
            files,
            scanner: self.scanner,
            manager,
            sync,
            reconciler: Mutex::new(None),
        })
    }
}

pub struct WorkspaceService {
    projects: Arc<dyn ProjectDirectory>,
    files: Arc<dyn FileStore>,
    scanner: Arc<dyn ContentScanner>,
    manager: Arc<ContainerManager>,
    sync: WorkspaceSync,
    reconciler: Mutex<Option<Reconciler>>,
}

impl WorkspaceService {
    pub fn builder(config: DevboxConfig) -> WorkspaceServiceBuilder {
        WorkspaceServiceBuilder::new(config)
    }

    pub fn manager(&self) -> &Arc<ContainerManager> {
        &self.manager
    }

    /// Starts the cleanup and health loops. Calling it again is a no-op.
    pub async fn start_background(&self) {
        let mut reconciler = self.reconciler.lock().await;
        if reconciler.is_none() {
            *reconciler = Some(Reconciler::spawn(self.manager.clone()));
        }
    }

    /// Stops the background loops and waits for them.
    pub async fn shutdown(&self) {
        let reconciler = self.reconciler.lock().await.take();
        if let Some(reconciler) = reconciler {
            reconciler.shutdown().await;
        }
    }

    async fn authorize(&self, project_id: Uuid, user_id: &str) -> Result<Project> {
        let project = self.projects.get_project(project_id).await?;
        if project.owner_id != user_id {
            return Err(DevboxError::Forbidden(format!(
                "user {user_id} does not own project {project_id}"
            )));
        }
        Ok(project)
    }

    async fn active_container(&self, project_id: Uuid) -> Result<Container> {
        self.manager
            .find_active(project_id)
            .await?
            .ok_or_else(|| DevboxError::NotFound(format!("project {project_id} has no container")))
    }

    /// Ensures RUNNING and pushes the workspace when the container is fresh.
    async fn ensure(
        &self,
        project: &Project,
        request: &ContainerRequest,
    ) -> Result<(Container, Option<PushReport>)> {
        let ensured = self.manager.ensure_running(project, request).await?;
        if !ensured.provisioned {
            return Ok((ensured.container, None));
        }
        let report = self.sync.push_all(project.id, &ensured.container).await?;
        if report.failed > 0 {
            warn!(
                project_id = %project.id,
                failed = report.failed,
                "Some files could not be pushed into the new container"
            );
        }
        Ok((ensured.container, Some(report)))
    }

    /// The project's container, woken or started if it exists but is not running.
    async fn running_container(&self, project: &Project) -> Result<Container> {
        self.active_container(project.id).await?;
        let (container, _) = self.ensure(project, &ContainerRequest::default()).await?;
        Ok(container)
    }

    pub async fn container(&self, project_id: Uuid, user_id: &str) -> Result<Container> {
        self.authorize(project_id, user_id).await?;
        self.active_container(project_id).await
    }

    #[instrument(skip(self, request))]
    pub async fn ensure_running(
        &self,
        project_id: Uuid,
        user_id: &str,
        request: &ContainerRequest,
    ) -> Result<Container> {
        let project = self.authorize(project_id, user_id).await?;
        let (container, _) = self.ensure(&project, request).await?;
        Ok(container)
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, project_id: Uuid, user_id: &str) -> Result<Container> {
        self.authorize(project_id, user_id).await?;
        let container = self.active_container(project_id).await?;
        self.manager.stop(container.id).await
    }

    #[instrument(skip(self))]
    pub async fn restart(&self, project_id: Uuid, user_id: &str) -> Result<Container> {
        self.authorize(project_id, user_id).await?;
        let container = self.active_container(project_id).await?;
        self.manager.restart(container.id).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, project_id: Uuid, user_id: &str, force: bool) -> Result<Container> {
        self.authorize(project_id, user_id).await?;
        // ERROR containers still hold a runtime object, so they are targeted too
        let container = self
            .manager
            .find_latest(project_id)
            .await?
            .ok_or_else(|| DevboxError::NotFound(format!("project {project_id} has no container")))?;
        self.manager.delete(container.id, force).await
    }

    /// Runs a command, creating or waking the container first.
    #[instrument(skip(self, command))]
    pub async fn execute_command(
        &self,
        project_id: Uuid,
        user_id: &str,
        command: &[String],
        workdir: Option<&str>,
    ) -> Result<ExecOutput> {
        let project = self.authorize(project_id, user_id).await?;
        let (container, _) = self.ensure(&project, &ContainerRequest::default()).await?;
        self.manager
            .execute_command(container.id, command, workdir)
            .await
    }

    pub async fn get_stats(&self, project_id: Uuid, user_id: &str) -> Result<ContainerMetrics> {
        self.authorize(project_id, user_id).await?;
        let container = self.active_container(project_id).await?;
        self.manager.get_stats(container.id).await
    }

    pub async fn get_logs(
        &self,
        project_id: Uuid,
        user_id: &str,
        tail: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<String> {
        self.authorize(project_id, user_id).await?;
        let container = self.active_container(project_id).await?;
        self.manager.get_logs(container.id, tail, since).await
    }

    /// Makes the container workspace match the stored files.
    #[instrument(skip(self))]
    pub async fn push_all(&self, project_id: Uuid, user_id: &str) -> Result<PushReport> {
        let project = self.authorize(project_id, user_id).await?;
        self.active_container(project_id).await?;
        match self.ensure(&project, &ContainerRequest::default()).await? {
            (_, Some(report)) => Ok(report),
            (container, None) => self.sync.push_all(project_id, &container).await,
        }
    }

    /// Imports container-side changes into the stored files.
    #[instrument(skip(self))]
    pub async fn pull_all(
        &self,
        project_id: Uuid,
        user_id: &str,
        options: PullOptions,
    ) -> Result<PullReport> {
        let project = self.authorize(project_id, user_id).await?;
        let container = self.running_container(&project).await?;
        self.sync.pull_all(project_id, &container, options).await
    }

    /// Creates or updates a file record and writes it into the container if
    /// the project has one.
    #[instrument(skip(self, content), fields(size = content.len()))]
    pub async fn write_file(
        &self,
        project_id: Uuid,
        user_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<FileRecord> {
        let project = self.authorize(project_id, user_id).await?;
        let path = paths::normalize(path)?;
        let now = Utc::now();

        let (mut record, is_new) = match self.files.find_by_path(project_id, &path).await? {
            Some(mut existing) => {
                if !existing.set_content(content, Some(user_id), now) {
                    return Ok(existing);
                }
                (existing, false)
            }
            None => (
                FileRecord::new(project_id, path.as_str(), content, Some(user_id)),
                true,
            ),
        };
        let scan = self.scanner.scan(content).await;
        record.metadata = FileMetadata {
            has_secrets: scan.has_secrets,
            risk_level: scan.risk_level,
            scanned_at: Some(now),
        };
        if is_new {
            self.files.insert_file(&record).await?;
        } else {
            self.files.update_file(&record).await?;
        }

        if self.manager.find_active(project_id).await?.is_some() {
            let (container, pushed) = self.ensure(&project, &ContainerRequest::default()).await?;
            // A freshly provisioned container already received every file
            if pushed.is_none() && !self.sync.push(&record, &container).await {
                warn!(%project_id, file_path = %path, "File saved but not written to the container");
            }
        }
        Ok(record)
    }

    pub async fn read_file(&self, project_id: Uuid, user_id: &str, path: &str) -> Result<FileRecord> {
        self.authorize(project_id, user_id).await?;
        let path = paths::normalize(path)?;
        self.files
            .find_by_path(project_id, &path)
            .await?
            .ok_or_else(|| DevboxError::NotFound(format!("file {path}")))
    }

    pub async fn list_files(&self, project_id: Uuid, user_id: &str) -> Result<Vec<FileRecord>> {
        self.authorize(project_id, user_id).await?;
        Ok(self.files.list_for_project(project_id).await?)
    }

    pub async fn file_tree(&self, project_id: Uuid, user_id: &str) -> Result<FileNode> {
        let records = self.list_files(project_id, user_id).await?;
        Ok(FileNode::from_records(&records))
    }

    /// Renames a file record and the matching container file.
    #[instrument(skip(self))]
    pub async fn move_file(
        &self,
        project_id: Uuid,
        user_id: &str,
        from: &str,
        to: &str,
    ) -> Result<FileRecord> {
        let project = self.authorize(project_id, user_id).await?;
        let from = paths::normalize(from)?;
        let to = paths::normalize(to)?;
        let mut record = self
            .files
            .find_by_path(project_id, &from)
            .await?
            .ok_or_else(|| DevboxError::NotFound(format!("file {from}")))?;
        if from == to {
            return Ok(record);
        }
        if self.files.find_by_path(project_id, &to).await?.is_some() {
            return Err(DevboxError::Conflict(format!("file {to} already exists")));
        }

        record.file_path = to.clone();
        record.updated_by = Some(user_id.to_string());
        record.updated_at = Utc::now();
        self.files.update_file(&record).await?;

        if self.manager.find_active(project_id).await?.is_some() {
            let container = self.running_container(&project).await?;
            if let Err(e) = self.sync.move_path(&container, &from, &to).await {
                // The old path may never have reached the container
                warn!(%project_id, %from, %to, error = %e, "Remote rename failed, pushing instead");
                self.sync.push(&record, &container).await;
                if let Err(e) = self.sync.remove_path(&container, &from).await {
                    warn!(%project_id, %from, error = %e, "Failed to remove old path");
                }
            }
        }
        info!(%project_id, %from, %to, "File moved.");
        Ok(record)
    }

    /// Soft-deletes a file record and removes it from the container.
    #[instrument(skip(self))]
    pub async fn remove_file(&self, project_id: Uuid, user_id: &str, path: &str) -> Result<FileRecord> {
        let project = self.authorize(project_id, user_id).await?;
        let path = paths::normalize(path)?;
        let record = self
            .files
            .find_by_path(project_id, &path)
            .await?
            .ok_or_else(|| DevboxError::NotFound(format!("file {path}")))?;
        let removed = self
            .files
            .soft_delete(record.id, Some(user_id), Utc::now())
            .await?;

        if self.manager.find_active(project_id).await?.is_some() {
            let container = self.running_container(&project).await?;
            if let Err(e) = self.sync.remove_path(&container, &path).await {
                warn!(%project_id, file_path = %path, error = %e, "Failed to remove file from container");
            }
        }
        Ok(removed)
    }
}
