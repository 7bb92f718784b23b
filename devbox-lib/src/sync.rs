//! Workspace file synchronisation between stored records and a container.
//!
//! Push makes the store authoritative, pull makes the container
//! authoritative. There is no merge: whichever runs last wins.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use devbox_common::model::hash_bytes;
use devbox_common::{
    paths, Container, ContentScanner, DevboxConfig, DevboxError, FileMetadata, FileRecord, Result,
};
use devbox_runtime::ContainerRuntime;
use devbox_store::FileStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<SyncError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    /// Container files considered, excluding `sync_exclude` matches.
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    /// Records soft-deleted by an authoritative pull.
    pub deleted: usize,
    pub errors: Vec<SyncError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullOptions {
    /// Soft-delete records whose file no longer exists in the container.
    pub authoritative: bool,
}

enum PullChange {
    Created,
    Updated,
    Unchanged,
}

pub struct WorkspaceSync {
    runtime: Arc<dyn ContainerRuntime>,
    files: Arc<dyn FileStore>,
    scanner: Arc<dyn ContentScanner>,
    config: Arc<DevboxConfig>,
}

impl WorkspaceSync {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        files: Arc<dyn FileStore>,
        scanner: Arc<dyn ContentScanner>,
        config: Arc<DevboxConfig>,
    ) -> Self {
        Self {
            runtime,
            files,
            scanner,
            config,
        }
    }

    fn remote_path(&self, relative: &str) -> String {
        paths::container_path(&self.config.workspace_root, relative)
    }

    /// Writes one record into the container. Failures are logged, not raised.
    pub async fn push(&self, record: &FileRecord, container: &Container) -> bool {
        match self.write_record(record, container, true).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    container_id = %container.id,
                    file_path = %record.file_path,
                    error = %e,
                    "Failed to push file"
                );
                false
            }
        }
    }

    /// Pushes every live record of the project. Per-file failures are reported, not raised.
    #[instrument(skip(self, container), fields(container_id = %container.id))]
    pub async fn push_all(&self, project_id: Uuid, container: &Container) -> Result<PushReport> {
        let records = self.files.list_for_project(project_id).await?;
        let mut report = PushReport {
            total: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        // One mkdir for the whole tree instead of one per file
        let dirs: BTreeSet<String> = records
            .iter()
            .filter_map(|r| paths::parent_dir(&self.remote_path(&r.file_path)).map(str::to_string))
            .collect();
        if let Err(e) = self.make_dirs(container, dirs.into_iter().collect()).await {
            warn!(error = %e, "Creating workspace directories failed");
        }

        for record in &records {
            match self.write_record(record, container, false).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!(file_path = %record.file_path, error = %e, "Failed to push file");
                    report.failed += 1;
                    report.errors.push(SyncError {
                        path: record.file_path.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            "Workspace pushed."
        );
        Ok(report)
    }

    async fn write_record(
        &self,
        record: &FileRecord,
        container: &Container,
        ensure_parent: bool,
    ) -> Result<()> {
        let external_id = container.runtime_id()?;
        let path = self.remote_path(&record.file_path);
        if ensure_parent {
            if let Some(parent) = paths::parent_dir(&path) {
                self.make_dirs(container, vec![parent.to_string()]).await?;
            }
        }
        let bytes = record.decoded_bytes();
        self.scan_if_stale(record, &bytes).await;
        self.runtime.put_file(external_id, &path, &bytes).await?;
        debug!(file_path = %record.file_path, size = bytes.len(), "File pushed");
        Ok(())
    }

    async fn make_dirs(&self, container: &Container, dirs: Vec<String>) -> Result<()> {
        if dirs.is_empty() {
            return Ok(());
        }
        let mut command = vec!["mkdir".to_string(), "-p".to_string()];
        command.extend(dirs);
        let output = self
            .runtime
            .exec(container.runtime_id()?, &command, None, None)
            .await?;
        if !output.success() {
            return Err(DevboxError::service(format!(
                "mkdir exited {}: {}",
                output.exit_code,
                output.output.trim()
            )));
        }
        Ok(())
    }

    /// Scans content whose last scan predates its last update. Findings are
    /// stored on the record and never block the write.
    async fn scan_if_stale(&self, record: &FileRecord, bytes: &[u8]) {
        if matches!(record.metadata.scanned_at, Some(at) if at >= record.updated_at) {
            return;
        }
        let report = self.scanner.scan(bytes).await;
        if report.has_secrets {
            warn!(
                file_path = %record.file_path,
                risk = ?report.risk_level,
                "Content scanner flagged file"
            );
        }
        // Re-read so only the metadata of the content that was scanned changes
        let stored = match self.files.get_file(record.id).await {
            Ok(stored) if stored.content_hash == record.content_hash => stored,
            Ok(_) => return,
            Err(e) => {
                warn!(file_path = %record.file_path, error = %e, "Failed to record scan result");
                return;
            }
        };
        let mut scanned = stored;
        scanned.metadata = FileMetadata {
            has_secrets: report.has_secrets,
            risk_level: report.risk_level,
            scanned_at: Some(Utc::now()),
        };
        if let Err(e) = self.files.update_file(&scanned).await {
            warn!(file_path = %record.file_path, error = %e, "Failed to record scan result");
        }
    }

    /// Imports container files into records: new paths are created, changed
    /// content overwrites the record. Per-file failures are reported, not raised.
    #[instrument(skip(self, container), fields(container_id = %container.id))]
    pub async fn pull_all(
        &self,
        project_id: Uuid,
        container: &Container,
        options: PullOptions,
    ) -> Result<PullReport> {
        let external_id = container.runtime_id()?;
        let root = self.config.workspace_root.as_str();
        let entries = self.runtime.list_files(external_id, root, true).await?;
        let existing: HashMap<String, FileRecord> = self
            .files
            .list_for_project(project_id)
            .await?
            .into_iter()
            .map(|r| (r.file_path.clone(), r))
            .collect();

        let mut report = PullReport::default();
        let mut seen = HashSet::new();
        for entry in entries {
            let Some(relative) = paths::relative_to_root(root, &entry.path)
                .and_then(|rel| paths::normalize(&rel).ok())
            else {
                continue;
            };
            if self.config.is_excluded(&relative) {
                continue;
            }
            seen.insert(relative.clone());
            report.total += 1;

            if entry.size > self.config.max_pull_file_bytes {
                report.errors.push(SyncError {
                    path: relative,
                    message: format!(
                        "file is {} bytes, over the {} byte pull limit",
                        entry.size, self.config.max_pull_file_bytes
                    ),
                });
                continue;
            }

            match self
                .pull_one(project_id, external_id, &relative, &entry.path, existing.get(&relative))
                .await
            {
                Ok(PullChange::Created) => report.created += 1,
                Ok(PullChange::Updated) => report.updated += 1,
                Ok(PullChange::Unchanged) => {}
                Err(e) => {
                    warn!(file_path = %relative, error = %e, "Failed to pull file");
                    report.errors.push(SyncError {
                        path: relative,
                        message: e.to_string(),
                    });
                }
            }
        }

        if options.authoritative {
            for (path, record) in &existing {
                if seen.contains(path) || self.config.is_excluded(path) {
                    continue;
                }
                match self.files.soft_delete(record.id, None, Utc::now()).await {
                    Ok(_) => report.deleted += 1,
                    Err(e) => report.errors.push(SyncError {
                        path: path.clone(),
                        message: e.to_string(),
                    }),
                }
            }
        }

        info!(
            total = report.total,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            errors = report.errors.len(),
            "Workspace pulled."
        );
        Ok(report)
    }

    async fn pull_one(
        &self,
        project_id: Uuid,
        external_id: &str,
        relative: &str,
        remote: &str,
        existing: Option<&FileRecord>,
    ) -> Result<PullChange> {
        let bytes = self
            .runtime
            .get_file(external_id, remote)
            .await?
            .ok_or_else(|| DevboxError::NotFound(format!("{remote} disappeared during pull")))?;

        let mut record = match existing {
            Some(current) if current.content_hash == hash_bytes(&bytes) => {
                return Ok(PullChange::Unchanged)
            }
            Some(current) => {
                let mut updated = current.clone();
                updated.set_content(&bytes, None, Utc::now());
                updated
            }
            None => FileRecord::new(project_id, relative, &bytes, None),
        };

        let scan = self.scanner.scan(&bytes).await;
        record.metadata = FileMetadata {
            has_secrets: scan.has_secrets,
            risk_level: scan.risk_level,
            scanned_at: Some(Utc::now()),
        };

        if existing.is_some() {
            self.files.update_file(&record).await?;
            debug!(file_path = %relative, version = record.version, "Record updated from container");
            Ok(PullChange::Updated)
        } else {
            self.files.insert_file(&record).await?;
            debug!(file_path = %relative, "Record created from container");
            Ok(PullChange::Created)
        }
    }

    /// Renames a file or directory inside the container.
    pub async fn move_path(&self, container: &Container, from: &str, to: &str) -> Result<()> {
        let from = self.remote_path(&paths::normalize(from)?);
        let to = self.remote_path(&paths::normalize(to)?);
        if let Some(parent) = paths::parent_dir(&to) {
            self.make_dirs(container, vec![parent.to_string()]).await?;
        }
        self.run_checked(container, vec!["mv".to_string(), "-f".to_string(), from, to])
            .await
    }

    /// Deletes a file or directory inside the container. Missing paths are not an error.
    pub async fn remove_path(&self, container: &Container, path: &str) -> Result<()> {
        let target = self.remote_path(&paths::normalize(path)?);
        self.run_checked(container, vec!["rm".to_string(), "-rf".to_string(), target])
            .await
    }

    async fn run_checked(&self, container: &Container, command: Vec<String>) -> Result<()> {
        let output = self
            .runtime
            .exec(container.runtime_id()?, &command, None, None)
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(DevboxError::service(format!(
                "{} exited {}: {}",
                command[0],
                output.exit_code,
                output.output.trim()
            )))
        }
    }
}
