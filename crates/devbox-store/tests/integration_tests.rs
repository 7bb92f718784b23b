use chrono::Utc;
use devbox_common::{Container, ContainerStatus, FileRecord, ResourceLimits};
use devbox_store::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

fn container(project_id: Uuid, owner: &str) -> Container {
    Container::new(
        project_id,
        owner,
        ResourceLimits {
            cpu: 0.5,
            memory_mb: 512,
            disk_mb: 2048,
        },
        BTreeMap::new(),
        8080,
    )
}

#[tokio::test]
async fn test_deleted_container_frees_the_project_slot() {
    let store: Arc<dyn ContainerStore> = Arc::new(InMemoryStore::new());
    let project_id = Uuid::new_v4();

    let mut first = container(project_id, "alice");
    store.insert_active(&first).await.unwrap();
    first.mark_deleted(Utc::now());
    store.update_container(&first).await.unwrap();
    assert!(store.find_active_for_project(project_id).await.unwrap().is_none());

    let second = container(project_id, "alice");
    store.insert_active(&second).await.unwrap();
    let active = store.find_active_for_project(project_id).await.unwrap().unwrap();
    assert_eq!(active.id, second.id);

    // The deleted record is still readable
    let old = store.get_container(first.id).await.unwrap();
    assert_eq!(old.status, ContainerStatus::Deleted);
}

#[tokio::test]
async fn test_errored_container_cannot_be_revived_over_a_replacement() {
    let store: Arc<dyn ContainerStore> = Arc::new(InMemoryStore::new());
    let project_id = Uuid::new_v4();

    let mut broken = container(project_id, "alice");
    store.insert_active(&broken).await.unwrap();
    broken.mark_error("probe failed", Utc::now());
    store.update_container(&broken).await.unwrap();

    store.insert_active(&container(project_id, "alice")).await.unwrap();

    broken.status = ContainerStatus::Running;
    let err = store.update_container(&broken).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert_eq!(store.count_active_for_owner("alice").await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let store = Arc::new(InMemoryStore::new());
    let missing = Uuid::new_v4();

    assert!(matches!(
        store.get_container(missing).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(store.get_file(missing).await, Err(StoreError::NotFound(_))));
    assert!(matches!(
        store.soft_delete(missing, None, Utc::now()).await,
        Err(StoreError::NotFound(_))
    ));

    let orphan = FileRecord::new(Uuid::new_v4(), "a.txt", b"a", None);
    assert!(matches!(
        store.update_file(&orphan).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_file_records_are_scoped_per_project() {
    let files: Arc<dyn FileStore> = Arc::new(InMemoryStore::new());
    let (left, right) = (Uuid::new_v4(), Uuid::new_v4());

    files
        .insert_file(&FileRecord::new(left, "src/app.py", b"left", Some("alice")))
        .await
        .unwrap();
    files
        .insert_file(&FileRecord::new(right, "src/app.py", b"right", Some("bob")))
        .await
        .unwrap();
    files
        .insert_file(&FileRecord::new(left, "README.md", b"# left", Some("alice")))
        .await
        .unwrap();

    let paths: Vec<_> = files
        .list_for_project(left)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.file_path)
        .collect();
    assert_eq!(paths, vec!["README.md", "src/app.py"]);

    let right_app = files.find_by_path(right, "src/app.py").await.unwrap().unwrap();
    assert_eq!(right_app.content, "right");
}

#[tokio::test]
async fn test_soft_deleted_record_stays_readable_by_id() {
    let files = Arc::new(InMemoryStore::new());
    let project_id = Uuid::new_v4();
    let record = FileRecord::new(project_id, "notes.txt", b"hello", Some("alice"));
    files.insert_file(&record).await.unwrap();

    let deleted = files
        .soft_delete(record.id, Some("alice"), Utc::now())
        .await
        .unwrap();
    assert!(deleted.is_deleted);
    assert!(files.find_by_path(project_id, "notes.txt").await.unwrap().is_none());

    let by_id = files.get_file(record.id).await.unwrap();
    assert!(by_id.is_deleted);
    assert_eq!(by_id.content, "hello");
}
