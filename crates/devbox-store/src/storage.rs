use crate::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devbox_common::{Container, ContainerStatus, FileRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Container records. At most one active (not DELETED/ERROR) container per
/// project; every write that could break this is rejected with `Conflict`.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Check-then-insert under a single write guard.
    async fn insert_active(&self, container: &Container) -> Result<()>;
    async fn get_container(&self, id: Uuid) -> Result<Container>;
    async fn find_active_for_project(&self, project_id: Uuid) -> Result<Option<Container>>;
    /// Most recently created container that is not DELETED, ERROR included.
    async fn find_latest_for_project(&self, project_id: Uuid) -> Result<Option<Container>>;
    async fn update_container(&self, container: &Container) -> Result<()>;
    async fn list_by_status(&self, statuses: &[ContainerStatus]) -> Result<Vec<Container>>;
    async fn count_active_for_owner(&self, owner_id: &str) -> Result<usize>;
}

/// File records. `(project_id, file_path)` is unique among live records.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn insert_file(&self, record: &FileRecord) -> Result<()>;
    async fn get_file(&self, id: Uuid) -> Result<FileRecord>;
    /// Live record at `path`, if any.
    async fn find_by_path(&self, project_id: Uuid, path: &str) -> Result<Option<FileRecord>>;
    /// Live records ordered by path.
    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<FileRecord>>;
    async fn update_file(&self, record: &FileRecord) -> Result<()>;
    async fn soft_delete(
        &self,
        id: Uuid,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FileRecord>;
}

fn is_live(record: &FileRecord) -> bool {
    record.is_latest && !record.is_deleted
}

// In-memory storage implementation for development/testing
#[derive(Clone, Default)]
pub struct InMemoryStore {
    containers: Arc<RwLock<HashMap<Uuid, Container>>>,
    files: Arc<RwLock<HashMap<Uuid, FileRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerStore for InMemoryStore {
    async fn insert_active(&self, container: &Container) -> Result<()> {
        let mut containers = self.containers.write().await;
        if containers.contains_key(&container.id) {
            return Err(StoreError::Conflict(format!(
                "container {} already exists",
                container.id
            )));
        }
        if let Some(existing) = containers
            .values()
            .find(|c| c.project_id == container.project_id && c.status.is_active())
        {
            return Err(StoreError::Conflict(format!(
                "project {} already has active container {} ({})",
                container.project_id, existing.id, existing.status
            )));
        }
        containers.insert(container.id, container.clone());
        Ok(())
    }

    async fn get_container(&self, id: Uuid) -> Result<Container> {
        self.containers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("container {id}")))
    }

    async fn find_active_for_project(&self, project_id: Uuid) -> Result<Option<Container>> {
        Ok(self
            .containers
            .read()
            .await
            .values()
            .find(|c| c.project_id == project_id && c.status.is_active())
            .cloned())
    }

    async fn find_latest_for_project(&self, project_id: Uuid) -> Result<Option<Container>> {
        Ok(self
            .containers
            .read()
            .await
            .values()
            .filter(|c| c.project_id == project_id && c.status != ContainerStatus::Deleted)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn update_container(&self, container: &Container) -> Result<()> {
        let mut containers = self.containers.write().await;
        if !containers.contains_key(&container.id) {
            return Err(StoreError::NotFound(format!("container {}", container.id)));
        }
        if container.status.is_active()
            && containers.values().any(|c| {
                c.id != container.id && c.project_id == container.project_id && c.status.is_active()
            })
        {
            return Err(StoreError::Conflict(format!(
                "project {} already has another active container",
                container.project_id
            )));
        }
        containers.insert(container.id, container.clone());
        Ok(())
    }

    async fn list_by_status(&self, statuses: &[ContainerStatus]) -> Result<Vec<Container>> {
        let mut found: Vec<Container> = self
            .containers
            .read()
            .await
            .values()
            .filter(|c| statuses.contains(&c.status))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn count_active_for_owner(&self, owner_id: &str) -> Result<usize> {
        Ok(self
            .containers
            .read()
            .await
            .values()
            .filter(|c| c.owner_id == owner_id && c.status.is_active())
            .count())
    }
}

#[async_trait]
impl FileStore for InMemoryStore {
    async fn insert_file(&self, record: &FileRecord) -> Result<()> {
        let mut files = self.files.write().await;
        if is_live(record)
            && files.values().any(|f| {
                is_live(f) && f.project_id == record.project_id && f.file_path == record.file_path
            })
        {
            return Err(StoreError::Conflict(format!(
                "file {} already exists in project {}",
                record.file_path, record.project_id
            )));
        }
        files.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_file(&self, id: Uuid) -> Result<FileRecord> {
        self.files
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("file {id}")))
    }

    async fn find_by_path(&self, project_id: Uuid, path: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .files
            .read()
            .await
            .values()
            .find(|f| is_live(f) && f.project_id == project_id && f.file_path == path)
            .cloned())
    }

    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<FileRecord>> {
        let mut records: Vec<FileRecord> = self
            .files
            .read()
            .await
            .values()
            .filter(|f| is_live(f) && f.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(records)
    }

    async fn update_file(&self, record: &FileRecord) -> Result<()> {
        let mut files = self.files.write().await;
        if !files.contains_key(&record.id) {
            return Err(StoreError::NotFound(format!("file {}", record.id)));
        }
        if is_live(record)
            && files.values().any(|f| {
                f.id != record.id
                    && is_live(f)
                    && f.project_id == record.project_id
                    && f.file_path == record.file_path
            })
        {
            return Err(StoreError::Conflict(format!(
                "file {} already exists in project {}",
                record.file_path, record.project_id
            )));
        }
        files.insert(record.id, record.clone());
        Ok(())
    }

    async fn soft_delete(
        &self,
        id: Uuid,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FileRecord> {
        let mut files = self.files.write().await;
        let record = files
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("file {id}")))?;
        record.is_deleted = true;
        record.updated_by = actor.map(str::to_string);
        record.updated_at = now;
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_common::ResourceLimits;
    use std::collections::BTreeMap;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu: 1.0,
            memory_mb: 1024,
            disk_mb: 5120,
        }
    }

    fn container(project_id: Uuid, owner: &str) -> Container {
        Container::new(project_id, owner, limits(), BTreeMap::new(), 8080)
    }

    #[tokio::test]
    async fn test_one_active_container_per_project() {
        let store = InMemoryStore::new();
        let project = Uuid::new_v4();
        let first = container(project, "alice");
        store.insert_active(&first).await.unwrap();

        let second = container(project, "alice");
        let err = store.insert_active(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Once the first is in ERROR the slot frees up
        let mut failed = first.clone();
        failed.mark_error("boom", Utc::now());
        store.update_container(&failed).await.unwrap();
        store.insert_active(&second).await.unwrap();

        // Reviving the failed one would break the invariant
        let mut revived = failed.clone();
        revived.transition(ContainerStatus::Running, Utc::now()).unwrap();
        assert!(matches!(
            store.update_container(&revived).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_latest_for_project_includes_errored() {
        let store = InMemoryStore::new();
        let project = Uuid::new_v4();
        assert!(store.find_latest_for_project(project).await.unwrap().is_none());

        let mut broken = container(project, "alice");
        broken.mark_error("unhealthy", Utc::now());
        store.insert_active(&broken).await.unwrap();
        assert!(store.find_active_for_project(project).await.unwrap().is_none());
        let latest = store.find_latest_for_project(project).await.unwrap().unwrap();
        assert_eq!(latest.id, broken.id);

        let mut replacement = container(project, "alice");
        replacement.created_at = broken.created_at + chrono::Duration::seconds(1);
        store.insert_active(&replacement).await.unwrap();
        let latest = store.find_latest_for_project(project).await.unwrap().unwrap();
        assert_eq!(latest.id, replacement.id);

        let mut gone = replacement.clone();
        gone.mark_deleted(Utc::now());
        store.update_container(&gone).await.unwrap();
        let latest = store.find_latest_for_project(project).await.unwrap().unwrap();
        assert_eq!(latest.id, broken.id);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_admit_one() {
        let store = InMemoryStore::new();
        let project = Uuid::new_v4();
        let attempts = (0..8).map(|_| {
            let store = store.clone();
            let candidate = container(project, "bob");
            async move { store.insert_active(&candidate).await }
        });
        let results = futures::future::join_all(attempts).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(store.count_active_for_owner("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_by_status_and_owner_count() {
        let store = InMemoryStore::new();
        let mut running = container(Uuid::new_v4(), "carol");
        running.transition(ContainerStatus::Running, Utc::now()).unwrap();
        let creating = container(Uuid::new_v4(), "carol");
        store.insert_active(&running).await.unwrap();
        store.insert_active(&creating).await.unwrap();

        let listed = store.list_by_status(&[ContainerStatus::Running]).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, running.id);
        assert_eq!(store.count_active_for_owner("carol").await.unwrap(), 2);
        assert_eq!(store.count_active_for_owner("dave").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_path_uniqueness_and_soft_delete() {
        let store = InMemoryStore::new();
        let project = Uuid::new_v4();
        let record = FileRecord::new(project, "src/app.py", b"print(1)", Some("alice"));
        store.insert_file(&record).await.unwrap();

        let duplicate = FileRecord::new(project, "src/app.py", b"print(2)", Some("alice"));
        assert!(matches!(
            store.insert_file(&duplicate).await,
            Err(StoreError::Conflict(_))
        ));

        let deleted = store.soft_delete(record.id, Some("alice"), Utc::now()).await.unwrap();
        assert!(deleted.is_deleted);
        assert!(store.find_by_path(project, "src/app.py").await.unwrap().is_none());
        assert!(store.list_for_project(project).await.unwrap().is_empty());
        // Soft-deleted rows stay readable by id
        assert!(store.get_file(record.id).await.unwrap().is_deleted);

        store.insert_file(&duplicate).await.unwrap();
        assert_eq!(store.list_for_project(project).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_onto_live_path_conflicts() {
        let store = InMemoryStore::new();
        let project = Uuid::new_v4();
        let a = FileRecord::new(project, "a.txt", b"a", None);
        let b = FileRecord::new(project, "b.txt", b"b", None);
        store.insert_file(&a).await.unwrap();
        store.insert_file(&b).await.unwrap();

        let mut renamed = a.clone();
        renamed.file_path = "b.txt".to_string();
        assert!(matches!(
            store.update_file(&renamed).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
