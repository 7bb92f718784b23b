//! Container lifecycle: the state machine, quota checks and the per-container
//! passes driven by the reconciliation loops.
//!
//! Every operation that changes a container's runtime state runs under that
//! container's lock and re-reads the record after acquiring it, so a user
//! `stop` and the cleanup pass deciding to stop the same container never
//! interleave. Creation is additionally serialised per project and guarded by
//! the store's one-active-container-per-project constraint.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devbox_common::{
    Container, ContainerMetrics, ContainerRequest, ContainerStatus, DevboxConfig, DevboxError,
    ExecOutput, Project, Result,
};
use devbox_runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use devbox_store::ContainerStore;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::locks::KeyedMutex;

const HEALTH_PROBE: [&str; 2] = ["echo", "health"];

/// Result of [`ContainerManager::ensure_running`].
#[derive(Debug, Clone)]
pub struct Ensured {
    pub container: Container,
    /// True when the container was just created or started from STOPPED, so
    /// its workspace may not reflect the stored files.
    pub provisioned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    Sleep,
    Stop,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassError {
    pub container_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub slept: usize,
    pub stopped: usize,
    pub deleted: usize,
    pub errors: Vec<PassError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    /// Probe failed but the threshold has not been reached yet.
    pub failed: usize,
    /// Moved to ERROR and left there.
    pub errored: usize,
    /// Moved to ERROR, restarted, and healthy again.
    pub recovered: usize,
    pub errors: Vec<PassError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthOutcome {
    Skipped,
    Healthy,
    Failed,
    Errored,
    Recovered,
}

/// Which policy step, if any, applies to `container` at `now`.
pub fn cleanup_action(
    container: &Container,
    now: DateTime<Utc>,
    config: &DevboxConfig,
) -> Option<CleanupAction> {
    let elapsed = |since: DateTime<Utc>| (now - since).to_std().unwrap_or(Duration::ZERO);
    let idle = elapsed(container.last_activity_at);
    match container.status {
        ContainerStatus::Running if idle >= config.stop_after => Some(CleanupAction::Stop),
        ContainerStatus::Running if idle >= config.sleep_after => Some(CleanupAction::Sleep),
        ContainerStatus::Sleeping if idle >= config.stop_after => Some(CleanupAction::Stop),
        ContainerStatus::Stopped => {
            let stopped_at = container.stopped_at.unwrap_or(container.last_activity_at);
            (elapsed(stopped_at) >= config.delete_after).then_some(CleanupAction::Delete)
        }
        ContainerStatus::Error => {
            let errored_at = container.errored_at.unwrap_or(container.last_activity_at);
            (elapsed(errored_at) >= config.delete_after).then_some(CleanupAction::Delete)
        }
        _ => None,
    }
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    containers: Arc<dyn ContainerStore>,
    config: Arc<DevboxConfig>,
    container_locks: KeyedMutex,
    project_locks: KeyedMutex,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        containers: Arc<dyn ContainerStore>,
        config: Arc<DevboxConfig>,
    ) -> Self {
        Self {
            runtime,
            containers,
            config,
            container_locks: KeyedMutex::new(),
            project_locks: KeyedMutex::new(),
        }
    }

    pub fn config(&self) -> &DevboxConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub async fn get(&self, container_id: Uuid) -> Result<Container> {
        Ok(self.containers.get_container(container_id).await?)
    }

    pub async fn find_active(&self, project_id: Uuid) -> Result<Option<Container>> {
        Ok(self.containers.find_active_for_project(project_id).await?)
    }

    pub async fn find_latest(&self, project_id: Uuid) -> Result<Option<Container>> {
        Ok(self.containers.find_latest_for_project(project_id).await?)
    }

    /// Returns the project's container in RUNNING, creating, starting or
    /// waking it as needed. A RUNNING container is returned without any
    /// runtime call.
    #[instrument(skip(self, project, request), fields(project_id = %project.id))]
    pub async fn ensure_running(
        &self,
        project: &Project,
        request: &ContainerRequest,
    ) -> Result<Ensured> {
        let project_guard = self.project_locks.lock(project.id).await;
        let ensured = self.ensure_running_locked(project, request).await;
        drop(project_guard);
        self.project_locks.forget(project.id);
        ensured
    }

    async fn ensure_running_locked(
        &self,
        project: &Project,
        request: &ContainerRequest,
    ) -> Result<Ensured> {
        if let Some(existing) = self.containers.find_active_for_project(project.id).await? {
            match existing.status {
                ContainerStatus::Running => {
                    return Ok(Ensured {
                        container: existing,
                        provisioned: false,
                    })
                }
                ContainerStatus::Sleeping => {
                    return Ok(Ensured {
                        container: self.wake(existing.id).await?,
                        provisioned: false,
                    })
                }
                ContainerStatus::Stopped => {
                    return Ok(Ensured {
                        container: self.start(existing.id).await?,
                        provisioned: true,
                    })
                }
                ContainerStatus::Creating => self.abandon_stale(existing).await?,
                ContainerStatus::Error | ContainerStatus::Deleted => {}
            }
        }

        let container = self.create_and_start(project, request).await?;
        Ok(Ensured {
            container,
            provisioned: true,
        })
    }

    /// A CREATING record seen under the project lock belongs to a creation that never finished.
    async fn abandon_stale(&self, mut stale: Container) -> Result<()> {
        let _guard = self.container_locks.lock(stale.id).await;
        warn!(container_id = %stale.id, "Abandoning container stuck in CREATING");
        if let Some(external_id) = stale.external_id.as_deref() {
            if let Err(e) = self.runtime.remove(external_id, true).await {
                warn!(container_id = %stale.id, error = %e, "Failed to remove stale runtime container");
            }
        }
        stale.mark_error("creation did not complete", Utc::now());
        self.containers.update_container(&stale).await?;
        Ok(())
    }

    async fn create_and_start(
        &self,
        project: &Project,
        request: &ContainerRequest,
    ) -> Result<Container> {
        let limits = request.limits.unwrap_or(self.config.default_limits);
        self.config.limit_bounds.check(&limits)?;

        let active = self
            .containers
            .count_active_for_owner(&project.owner_id)
            .await?;
        if active >= self.config.max_active_containers_per_user {
            return Err(DevboxError::Validation(format!(
                "user {} already has {active} active containers (limit {})",
                project.owner_id, self.config.max_active_containers_per_user
            )));
        }

        let mut container = Container::new(
            project.id,
            &project.owner_id,
            limits,
            request.env_vars.clone(),
            self.config.internal_port,
        );
        self.containers.insert_active(&container).await?;
        let _guard = self.container_locks.lock(container.id).await;
        info!(container_id = %container.id, name = %container.name, "Creating container...");

        match self.provision(&mut container).await {
            Ok(()) => {
                container.transition(ContainerStatus::Running, Utc::now())?;
                self.containers.update_container(&container).await?;
                info!(
                    container_id = %container.id,
                    external_port = ?container.external_port,
                    "Container running."
                );
                Ok(container)
            }
            Err(e) => {
                error!(container_id = %container.id, error = %e, "Container creation failed");
                if let Some(external_id) = container.external_id.as_deref() {
                    if let Err(cleanup) = self.runtime.remove(external_id, true).await {
                        warn!(container_id = %container.id, error = %cleanup, "Failed to remove half-created container");
                    }
                }
                container.mark_error(e.to_string(), Utc::now());
                if let Err(store_err) = self.containers.update_container(&container).await {
                    error!(container_id = %container.id, error = %store_err, "Failed to record creation failure");
                }
                Err(e)
            }
        }
    }

    async fn provision(&self, container: &mut Container) -> Result<()> {
        let spec = ContainerSpec {
            name: container.name.clone(),
            image: self.config.image.clone(),
            cpu: container.limits.cpu,
            memory_mb: container.limits.memory_mb,
            disk_mb: container.limits.disk_mb,
            env_vars: container.env_vars.clone(),
            workspace_root: self.config.workspace_root.clone(),
            volume: None,
            network: self.config.network.clone(),
            internal_port: container.internal_port,
            labels: HashMap::from([
                ("devbox.project".to_string(), container.project_id.to_string()),
                ("devbox.container".to_string(), container.id.to_string()),
            ]),
        };
        let created = self.runtime.create(&spec).await?;
        container.external_id = Some(created.external_id);
        // Persist the runtime id before starting so a crash leaves something to clean up
        self.containers.update_container(container).await?;

        container.external_port = self.runtime.start(container.runtime_id()?).await?;
        Ok(())
    }

    /// Starts a STOPPED (or ERROR) container.
    #[instrument(skip(self))]
    pub async fn start(&self, container_id: Uuid) -> Result<Container> {
        let _guard = self.container_locks.lock(container_id).await;
        let mut container = self.containers.get_container(container_id).await?;
        match container.status {
            ContainerStatus::Running => return Ok(container),
            ContainerStatus::Sleeping => return self.wake_locked(container).await,
            ContainerStatus::Stopped | ContainerStatus::Error => {}
            other => {
                return Err(DevboxError::Validation(format!(
                    "container {container_id} cannot be started while {other}"
                )))
            }
        }

        let port = self.runtime.start(container.runtime_id()?).await?;
        container.transition(ContainerStatus::Running, Utc::now())?;
        container.external_port = port;
        container.health_failures = 0;
        container.restart_attempted = false;
        self.containers.update_container(&container).await?;
        info!(%container_id, "Container started.");
        Ok(container)
    }

    async fn wake(&self, container_id: Uuid) -> Result<Container> {
        let _guard = self.container_locks.lock(container_id).await;
        let container = self.containers.get_container(container_id).await?;
        match container.status {
            ContainerStatus::Sleeping => self.wake_locked(container).await,
            ContainerStatus::Running => Ok(container),
            other => Err(DevboxError::Validation(format!(
                "container {container_id} cannot be woken while {other}"
            ))),
        }
    }

    async fn wake_locked(&self, mut container: Container) -> Result<Container> {
        self.runtime.unpause(container.runtime_id()?).await?;
        container.transition(ContainerStatus::Running, Utc::now())?;
        self.containers.update_container(&container).await?;
        info!(container_id = %container.id, "Container woke from sleep.");
        Ok(container)
    }

    /// RUNNING or SLEEPING → STOPPED. No-op when already STOPPED.
    #[instrument(skip(self))]
    pub async fn stop(&self, container_id: Uuid) -> Result<Container> {
        let _guard = self.container_locks.lock(container_id).await;
        let container = self.containers.get_container(container_id).await?;
        match container.status {
            ContainerStatus::Stopped => Ok(container),
            ContainerStatus::Running | ContainerStatus::Sleeping => {
                self.stop_locked(container).await
            }
            other => Err(DevboxError::Validation(format!(
                "container {container_id} must be running or sleeping to stop, it is {other}"
            ))),
        }
    }

    async fn stop_locked(&self, mut container: Container) -> Result<Container> {
        let external_id = container.runtime_id()?.to_string();
        if container.status == ContainerStatus::Sleeping {
            if let Err(e) = self.runtime.unpause(&external_id).await {
                warn!(container_id = %container.id, error = %e, "Unpause before stop failed");
            }
        }
        self.runtime
            .stop(&external_id, self.config.stop_timeout)
            .await?;
        container.transition(ContainerStatus::Stopped, Utc::now())?;
        self.containers.update_container(&container).await?;
        info!(container_id = %container.id, "Container stopped.");
        Ok(container)
    }

    /// Restarts the runtime container and leaves it RUNNING.
    #[instrument(skip(self))]
    pub async fn restart(&self, container_id: Uuid) -> Result<Container> {
        let _guard = self.container_locks.lock(container_id).await;
        let mut container = self.containers.get_container(container_id).await?;
        match container.status {
            ContainerStatus::Running | ContainerStatus::Error => {}
            ContainerStatus::Sleeping => {
                self.runtime.unpause(container.runtime_id()?).await?;
            }
            other => {
                return Err(DevboxError::Validation(format!(
                    "container {container_id} cannot be restarted while {other}"
                )))
            }
        }

        self.runtime
            .restart(container.runtime_id()?, self.config.stop_timeout)
            .await?;
        container.transition(ContainerStatus::Running, Utc::now())?;
        container.health_failures = 0;
        container.restart_attempted = false;
        self.containers.update_container(&container).await?;
        info!(%container_id, "Container restarted.");
        Ok(container)
    }

    /// Without `force`, RUNNING and SLEEPING containers are refused with `Conflict`.
    #[instrument(skip(self))]
    pub async fn delete(&self, container_id: Uuid, force: bool) -> Result<Container> {
        let guard = self.container_locks.lock(container_id).await;
        let mut container = self.containers.get_container(container_id).await?;
        let live = matches!(
            container.status,
            ContainerStatus::Running | ContainerStatus::Sleeping
        );
        if container.status == ContainerStatus::Deleted {
            return Ok(container);
        }
        if live && !force {
            return Err(DevboxError::Conflict(format!(
                "container {container_id} is {}; stop it before deleting",
                container.status
            )));
        }

        if let Some(external_id) = container.external_id.clone() {
            if live {
                if let Err(e) = self.runtime.stop(&external_id, self.config.stop_timeout).await {
                    warn!(%container_id, error = %e, "Stop before forced delete failed");
                }
            }
            // A container that failed its health checks may still be running
            let force_remove = force || container.status == ContainerStatus::Error;
            match self.runtime.remove(&external_id, force_remove).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        container.mark_deleted(Utc::now());
        self.containers.update_container(&container).await?;
        drop(guard);
        self.container_locks.forget(container_id);
        info!(%container_id, force, "Container deleted.");
        Ok(container)
    }

    /// Runs `command` in a RUNNING container. The container's env vars are
    /// passed to the exec; `workdir` defaults to the workspace root.
    #[instrument(skip(self, command), fields(program = command.first().map(String::as_str).unwrap_or("")))]
    pub async fn execute_command(
        &self,
        container_id: Uuid,
        command: &[String],
        workdir: Option<&str>,
    ) -> Result<ExecOutput> {
        if command.is_empty() {
            return Err(DevboxError::Validation("command must not be empty".to_string()));
        }
        // Held until the exec returns so the cleanup pass cannot pause the container mid-command
        let _guard = self.container_locks.lock(container_id).await;
        let container = self.record_activity_locked(container_id).await?;
        let workdir = workdir.unwrap_or(&self.config.workspace_root);
        let env = (!container.env_vars.is_empty()).then_some(&container.env_vars);
        let output = self
            .runtime
            .exec(container.runtime_id()?, command, Some(workdir), env)
            .await?;
        debug!(%container_id, exit_code = output.exit_code, "Command finished");
        Ok(output)
    }

    /// Stamps `last_activity_at` on a RUNNING container.
    pub async fn record_activity(&self, container_id: Uuid) -> Result<Container> {
        let _guard = self.container_locks.lock(container_id).await;
        self.record_activity_locked(container_id).await
    }

    async fn record_activity_locked(&self, container_id: Uuid) -> Result<Container> {
        let mut container = self.containers.get_container(container_id).await?;
        if container.status != ContainerStatus::Running {
            return Err(DevboxError::Validation(format!(
                "container {container_id} is {}, not running",
                container.status
            )));
        }
        container.touch(Utc::now());
        self.containers.update_container(&container).await?;
        Ok(container)
    }

    /// Zeroed metrics for anything not RUNNING, without a runtime call.
    pub async fn get_stats(&self, container_id: Uuid) -> Result<ContainerMetrics> {
        let container = self.containers.get_container(container_id).await?;
        if container.status != ContainerStatus::Running {
            return Ok(ContainerMetrics::default());
        }
        let external_id = container.runtime_id()?;
        let stats = retry_read("stats", || self.runtime.stats(external_id)).await?;
        let disk_mb = self
            .measure_disk(external_id)
            .await
            .unwrap_or(container.metrics.disk_mb);
        let metrics = ContainerMetrics {
            cpu_percent: stats.cpu_percent,
            memory_mb: stats.memory_used_mb,
            memory_limit_mb: stats.memory_limit_mb,
            disk_mb,
            net_in_mb: stats.net_in_mb,
            net_out_mb: stats.net_out_mb,
        };

        let _guard = self.container_locks.lock(container_id).await;
        let mut latest = self.containers.get_container(container_id).await?;
        if latest.status == ContainerStatus::Running {
            latest.metrics = metrics;
            self.containers.update_container(&latest).await?;
        }
        Ok(metrics)
    }

    async fn measure_disk(&self, external_id: &str) -> Option<f64> {
        let command = ["du", "-sm", self.config.workspace_root.as_str()].map(str::to_string);
        match self.runtime.exec(external_id, &command, None, None).await {
            Ok(output) if output.success() => output
                .output
                .split_whitespace()
                .next()
                .and_then(|mb| mb.parse().ok()),
            Ok(output) => {
                debug!(%external_id, output = %output.output, "du failed");
                None
            }
            Err(e) => {
                debug!(%external_id, error = %e, "du failed");
                None
            }
        }
    }

    pub async fn get_logs(
        &self,
        container_id: Uuid,
        tail: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let container = self.containers.get_container(container_id).await?;
        let external_id = container.runtime_id()?;
        retry_read("logs", || self.runtime.logs(external_id, tail, since)).await
    }

    /// One cleanup pass at the current time.
    pub async fn cleanup_pass(&self, cancel: &CancellationToken) -> CleanupReport {
        self.cleanup_pass_at(Utc::now(), cancel).await
    }

    /// Applies the sleep/stop/delete policy to every candidate as of `now`.
    /// A failure on one container is recorded and the pass moves on.
    pub async fn cleanup_pass_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        let candidates = match self
            .containers
            .list_by_status(&[
                ContainerStatus::Running,
                ContainerStatus::Sleeping,
                ContainerStatus::Stopped,
                ContainerStatus::Error,
            ])
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Cleanup pass could not list containers");
                return report;
            }
        };

        for candidate in candidates {
            if cancel.is_cancelled() {
                info!("Cleanup pass interrupted by shutdown");
                break;
            }
            match self.cleanup_one(candidate.id, now).await {
                Ok(Some(CleanupAction::Sleep)) => report.slept += 1,
                Ok(Some(CleanupAction::Stop)) => report.stopped += 1,
                Ok(Some(CleanupAction::Delete)) => report.deleted += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(container_id = %candidate.id, error = %e, "Cleanup failed for container");
                    report.errors.push(PassError {
                        container_id: candidate.id,
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn cleanup_one(
        &self,
        container_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<CleanupAction>> {
        let guard = self.container_locks.lock(container_id).await;
        // Re-read under the lock: a user call may have changed the record since listing
        let mut container = self.containers.get_container(container_id).await?;
        let Some(action) = cleanup_action(&container, now, &self.config) else {
            return Ok(None);
        };

        match action {
            CleanupAction::Sleep => {
                self.runtime.pause(container.runtime_id()?).await?;
                container.transition(ContainerStatus::Sleeping, Utc::now())?;
                self.containers.update_container(&container).await?;
                info!(%container_id, "Idle container put to sleep.");
            }
            CleanupAction::Stop => {
                self.stop_locked(container).await?;
            }
            CleanupAction::Delete => {
                if let Some(external_id) = container.external_id.as_deref() {
                    match self.runtime.remove(external_id, true).await {
                        Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                container.transition(ContainerStatus::Deleted, Utc::now())?;
                self.containers.update_container(&container).await?;
                drop(guard);
                self.container_locks.forget(container_id);
                info!(%container_id, "Expired container deleted.");
            }
        }
        Ok(Some(action))
    }

    /// Probes every RUNNING container once.
    pub async fn health_pass(&self, cancel: &CancellationToken) -> HealthReport {
        let mut report = HealthReport::default();
        let running = match self
            .containers
            .list_by_status(&[ContainerStatus::Running])
            .await
        {
            Ok(running) => running,
            Err(e) => {
                error!(error = %e, "Health pass could not list containers");
                return report;
            }
        };

        for candidate in running {
            if cancel.is_cancelled() {
                info!("Health pass interrupted by shutdown");
                break;
            }
            match self.check_health(candidate.id).await {
                Ok(HealthOutcome::Skipped) => continue,
                Ok(HealthOutcome::Healthy) => report.healthy += 1,
                Ok(HealthOutcome::Failed) => report.failed += 1,
                Ok(HealthOutcome::Errored) => report.errored += 1,
                Ok(HealthOutcome::Recovered) => report.recovered += 1,
                Err(e) => {
                    warn!(container_id = %candidate.id, error = %e, "Health check errored");
                    report.errors.push(PassError {
                        container_id: candidate.id,
                        message: e.to_string(),
                    });
                }
            }
            report.checked += 1;
        }
        report
    }

    async fn check_health(&self, container_id: Uuid) -> Result<HealthOutcome> {
        let _guard = self.container_locks.lock(container_id).await;
        let mut container = self.containers.get_container(container_id).await?;
        if container.status != ContainerStatus::Running {
            return Ok(HealthOutcome::Skipped);
        }
        let external_id = container.runtime_id()?.to_string();

        let reason = match self.probe(&external_id).await {
            Ok(()) => {
                if container.health_failures > 0 {
                    container.health_failures = 0;
                    self.containers.update_container(&container).await?;
                }
                return Ok(HealthOutcome::Healthy);
            }
            Err(reason) => reason,
        };

        container.health_failures += 1;
        let threshold = self.config.health_failure_threshold;
        if container.health_failures < threshold {
            warn!(
                %container_id,
                failures = container.health_failures,
                threshold,
                %reason,
                "Health probe failed"
            );
            self.containers.update_container(&container).await?;
            return Ok(HealthOutcome::Failed);
        }

        error!(%container_id, failures = container.health_failures, %reason, "Container unhealthy, restarting once");
        container.mark_error(
            format!("health probe failed {} times: {reason}", container.health_failures),
            Utc::now(),
        );
        container.restart_attempted = true;
        self.containers.update_container(&container).await?;

        let restarted = match self
            .runtime
            .restart(&external_id, self.config.stop_timeout)
            .await
        {
            Ok(()) => self.probe(&external_id).await,
            Err(e) => Err(format!("restart failed: {e}")),
        };
        match restarted {
            Ok(()) => {
                container.transition(ContainerStatus::Running, Utc::now())?;
                container.health_failures = 0;
                container.restart_attempted = false;
                self.containers.update_container(&container).await?;
                info!(%container_id, "Container recovered after restart.");
                Ok(HealthOutcome::Recovered)
            }
            Err(reason) => {
                error!(%container_id, %reason, "Container left in ERROR");
                container.error_message = Some(reason);
                self.containers.update_container(&container).await?;
                Ok(HealthOutcome::Errored)
            }
        }
    }

    async fn probe(&self, external_id: &str) -> std::result::Result<(), String> {
        let command = HEALTH_PROBE.map(str::to_string);
        match self.runtime.exec(external_id, &command, None, None).await {
            Ok(output) if output.success() && output.output.contains(HEALTH_PROBE[1]) => Ok(()),
            Ok(output) => Err(format!(
                "probe exited {}: {}",
                output.exit_code,
                output.output.trim()
            )),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Reads are retried once on a retryable failure; writes never are.
async fn retry_read<T, F, Fut>(operation: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = devbox_runtime::Result<T>>,
{
    match call().await {
        Err(e) if e.is_retryable() => {
            warn!(operation, error = %e, "Runtime read failed, retrying once");
            Ok(call().await?)
        }
        other => Ok(other?),
    }
}
