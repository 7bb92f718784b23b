mod support;

use std::sync::Arc;

use async_trait::async_trait;
use devbox_common::model::hash_bytes;
use devbox_common::{
    ContainerStatus, ContentScanner, DevboxError, FileEncoding, FileNode, RiskLevel, ScanReport,
};
use devbox_lib::{PullOptions, WorkspaceService};
use devbox_runtime::{InMemoryRuntime, RuntimeError};
use devbox_store::{InMemoryProjects, InMemoryStore};
use support::{cmd, harness, harness_with, test_config, Harness};
use uuid::Uuid;

const AUTHORITATIVE: PullOptions = PullOptions {
    authoritative: true,
};

#[tokio::test]
async fn test_push_then_pull_preserves_content() {
    let h = harness();
    let (project, container) = h.running("alice").await;
    let external_id = Harness::external_id(&container);

    let record = h
        .service
        .write_file(project.id, "alice", "src/app.py", b"print(1)")
        .await
        .unwrap();
    assert_eq!(record.created_by.as_deref(), Some("alice"));
    assert_eq!(
        h.runtime.file(&external_id, "/workspace/src/app.py").await.as_deref(),
        Some(&b"print(1)"[..])
    );

    let report = h
        .service
        .pull_all(project.id, "alice", PullOptions::default())
        .await
        .unwrap();
    assert_eq!((report.total, report.created, report.updated), (1, 0, 0));

    let stored = h.service.read_file(project.id, "alice", "src/app.py").await.unwrap();
    assert_eq!(stored.content_hash, hash_bytes(b"print(1)"));
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn test_pull_imports_files_created_in_the_container() {
    let h = harness();
    let (project, container) = h.running("alice").await;
    h.runtime
        .write_in_container(&Harness::external_id(&container), "/workspace/notes.txt", b"hello")
        .await;

    let report = h
        .service
        .pull_all(project.id, "alice", PullOptions::default())
        .await
        .unwrap();
    assert_eq!(report.created, 1);

    let notes = h.service.read_file(project.id, "alice", "notes.txt").await.unwrap();
    assert_eq!(notes.content, "hello");
    assert!(!notes.is_binary);
    assert_eq!(notes.encoding, FileEncoding::Utf8);
    assert_eq!(notes.created_by, None);
    assert!(notes.metadata.scanned_at.is_some());
}

#[tokio::test]
async fn test_pull_overwrites_record_when_container_differs() {
    let h = harness();
    let (project, container) = h.running("alice").await;
    h.service
        .write_file(project.id, "alice", "a.txt", b"v1")
        .await
        .unwrap();
    h.runtime
        .write_in_container(&Harness::external_id(&container), "/workspace/a.txt", b"v2")
        .await;

    let report = h
        .service
        .pull_all(project.id, "alice", PullOptions::default())
        .await
        .unwrap();
    assert_eq!(report.updated, 1);

    let stored = h.service.read_file(project.id, "alice", "a.txt").await.unwrap();
    assert_eq!(stored.content, "v2");
    assert_eq!(stored.version, 2);
    assert_eq!(stored.updated_by, None);
    assert_eq!(stored.created_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_binary_content_round_trips() {
    let h = harness();
    let (project, container) = h.running("alice").await;
    let external_id = Harness::external_id(&container);
    let png = [0x89, b'P', b'N', b'G', 0x00, 0xff, 0xfe];

    let record = h
        .service
        .write_file(project.id, "alice", "img/logo.png", &png)
        .await
        .unwrap();
    assert!(record.is_binary);
    assert_eq!(record.encoding, FileEncoding::Base64);
    assert_eq!(record.size, png.len() as u64);
    assert_eq!(
        h.runtime.file(&external_id, "/workspace/img/logo.png").await.as_deref(),
        Some(&png[..])
    );

    h.runtime
        .write_in_container(&external_id, "/workspace/img/icon.bin", &[0, 1, 2, 3])
        .await;
    h.service
        .pull_all(project.id, "alice", PullOptions::default())
        .await
        .unwrap();
    let icon = h.service.read_file(project.id, "alice", "img/icon.bin").await.unwrap();
    assert!(icon.is_binary);
    assert_eq!(icon.decoded_bytes(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_unchanged_write_keeps_version_and_skips_push() {
    let h = harness();
    let (project, _) = h.running("alice").await;
    h.service
        .write_file(project.id, "alice", "a.txt", b"same")
        .await
        .unwrap();
    let pushes = h.runtime.calls("put_file").await;

    let again = h
        .service
        .write_file(project.id, "alice", "./a.txt", b"same")
        .await
        .unwrap();
    assert_eq!(again.version, 1);
    assert_eq!(h.runtime.calls("put_file").await, pushes);
}

#[tokio::test]
async fn test_files_written_before_container_are_pushed_on_creation() {
    let h = harness();
    let project = h.project("alice").await;
    h.service
        .write_file(project.id, "alice", "src/main.py", b"print('hi')")
        .await
        .unwrap();
    h.service
        .write_file(project.id, "alice", "README.md", b"# demo")
        .await
        .unwrap();
    assert_eq!(h.runtime.container_count().await, 0);

    let container = h
        .service
        .ensure_running(project.id, "alice", &Default::default())
        .await
        .unwrap();
    let external_id = Harness::external_id(&container);
    assert!(h.runtime.file(&external_id, "/workspace/src/main.py").await.is_some());
    assert!(h.runtime.file(&external_id, "/workspace/README.md").await.is_some());

    let out = h
        .service
        .execute_command(project.id, "alice", &cmd(&["cat", "src/main.py"]), None)
        .await
        .unwrap();
    assert_eq!(out.output, "print('hi')");
}

#[tokio::test]
async fn test_write_starts_a_stopped_container() {
    let h = harness();
    let (project, container) = h.running("alice").await;
    h.service.stop(project.id, "alice").await.unwrap();

    h.service
        .write_file(project.id, "alice", "late.txt", b"x")
        .await
        .unwrap();
    let current = h.service.container(project.id, "alice").await.unwrap();
    assert_eq!(current.id, container.id);
    assert_eq!(current.status, ContainerStatus::Running);
    assert!(h
        .runtime
        .file(&Harness::external_id(&container), "/workspace/late.txt")
        .await
        .is_some());
}

#[tokio::test]
async fn test_push_all_reports_partial_failure() {
    let h = harness();
    let (project, _) = h.running("alice").await;
    for path in ["a.txt", "b.txt"] {
        h.service
            .write_file(project.id, "alice", path, path.as_bytes())
            .await
            .unwrap();
    }
    h.runtime
        .fail_next(
            "put_file",
            RuntimeError::Api {
                operation: "put_file",
                message: "disk quota exceeded".into(),
            },
        )
        .await;

    let report = h.service.push_all(project.id, "alice").await.unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].path, "a.txt");
}

#[tokio::test]
async fn test_push_all_requires_a_container() {
    let h = harness();
    let project = h.project("alice").await;
    let err = h.service.push_all(project.id, "alice").await.unwrap_err();
    assert!(matches!(err, DevboxError::NotFound(_)));
}

#[tokio::test]
async fn test_authoritative_pull_soft_deletes_missing_files() {
    let h = harness();
    let (project, _) = h.running("alice").await;
    for path in ["keep.txt", "gone.txt", ".git/HEAD"] {
        h.service
            .write_file(project.id, "alice", path, b"data")
            .await
            .unwrap();
    }
    h.service
        .execute_command(project.id, "alice", &cmd(&["rm", "-f", "gone.txt"]), None)
        .await
        .unwrap();

    let report = h
        .service
        .pull_all(project.id, "alice", PullOptions::default())
        .await
        .unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(h.service.list_files(project.id, "alice").await.unwrap().len(), 3);

    let report = h
        .service
        .pull_all(project.id, "alice", AUTHORITATIVE)
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    let err = h
        .service
        .read_file(project.id, "alice", "gone.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, DevboxError::NotFound(_)));
    // Excluded paths are never touched by a pull
    h.service.read_file(project.id, "alice", ".git/HEAD").await.unwrap();
}

#[tokio::test]
async fn test_pull_skips_excluded_and_oversized_files() {
    let mut config = test_config();
    config.max_pull_file_bytes = 8;
    let h = harness_with(config);
    let (project, container) = h.running("alice").await;
    let external_id = Harness::external_id(&container);
    for (path, bytes) in [
        ("/workspace/node_modules/left-pad/index.js", &b"x"[..]),
        ("/workspace/src/__pycache__/app.cpython-311.pyc", b"x"),
        ("/workspace/src/stale.pyc", b"x"),
        ("/workspace/main.py", b"ok"),
        ("/workspace/data.csv", b"far too large"),
    ] {
        h.runtime.write_in_container(&external_id, path, bytes).await;
    }

    let report = h
        .service
        .pull_all(project.id, "alice", PullOptions::default())
        .await
        .unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.created, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].path, "data.csv");

    let paths: Vec<_> = h
        .service
        .list_files(project.id, "alice")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.file_path)
        .collect();
    assert_eq!(paths, vec!["main.py".to_string()]);
}

#[tokio::test]
async fn test_move_file_renames_record_and_container_file() {
    let h = harness();
    let (project, container) = h.running("alice").await;
    let external_id = Harness::external_id(&container);
    let original = h
        .service
        .write_file(project.id, "alice", "src/old.py", b"x = 1")
        .await
        .unwrap();

    let moved = h
        .service
        .move_file(project.id, "alice", "src/old.py", "pkg/new.py")
        .await
        .unwrap();
    assert_eq!(moved.id, original.id);
    assert_eq!(moved.file_path, "pkg/new.py");
    assert!(h.runtime.file(&external_id, "/workspace/src/old.py").await.is_none());
    assert_eq!(
        h.runtime.file(&external_id, "/workspace/pkg/new.py").await.as_deref(),
        Some(&b"x = 1"[..])
    );

    let err = h
        .service
        .read_file(project.id, "alice", "src/old.py")
        .await
        .unwrap_err();
    assert!(matches!(err, DevboxError::NotFound(_)));
}

#[tokio::test]
async fn test_move_file_pushes_when_old_path_never_reached_container() {
    let h = harness();
    let (project, container) = h.running("alice").await;
    let external_id = Harness::external_id(&container);
    h.runtime
        .fail_next("put_file", RuntimeError::Unavailable("socket closed".into()))
        .await;
    h.service
        .write_file(project.id, "alice", "draft.md", b"notes")
        .await
        .unwrap();
    assert!(h.runtime.file(&external_id, "/workspace/draft.md").await.is_none());

    h.service
        .move_file(project.id, "alice", "draft.md", "docs/final.md")
        .await
        .unwrap();
    assert_eq!(
        h.runtime.file(&external_id, "/workspace/docs/final.md").await.as_deref(),
        Some(&b"notes"[..])
    );
}

#[tokio::test]
async fn test_move_file_onto_existing_path_conflicts() {
    let h = harness();
    let project = h.project("alice").await;
    for path in ["a.txt", "b.txt"] {
        h.service
            .write_file(project.id, "alice", path, path.as_bytes())
            .await
            .unwrap();
    }
    let err = h
        .service
        .move_file(project.id, "alice", "a.txt", "b.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, DevboxError::Conflict(_)));
    assert_eq!(
        h.service.read_file(project.id, "alice", "b.txt").await.unwrap().content,
        "b.txt"
    );
}

#[tokio::test]
async fn test_remove_file_soft_deletes_and_removes_from_container() {
    let h = harness();
    let (project, container) = h.running("alice").await;
    let external_id = Harness::external_id(&container);
    h.service
        .write_file(project.id, "alice", "tmp/scratch.txt", b"bye")
        .await
        .unwrap();

    let removed = h
        .service
        .remove_file(project.id, "alice", "tmp/scratch.txt")
        .await
        .unwrap();
    assert!(removed.is_deleted);
    assert_eq!(removed.updated_by.as_deref(), Some("alice"));
    assert!(h.runtime.file(&external_id, "/workspace/tmp/scratch.txt").await.is_none());
    assert!(h.service.list_files(project.id, "alice").await.unwrap().is_empty());

    // The path can be reused after deletion
    let again = h
        .service
        .write_file(project.id, "alice", "tmp/scratch.txt", b"back")
        .await
        .unwrap();
    assert_ne!(again.id, removed.id);
}

#[tokio::test]
async fn test_file_tree_nests_directories() {
    let h = harness();
    let project = h.project("alice").await;
    for path in ["README.md", "src/app.py", "src/lib/util.py"] {
        h.service
            .write_file(project.id, "alice", path, b"x")
            .await
            .unwrap();
    }

    let FileNode::Directory { children } = h.service.file_tree(project.id, "alice").await.unwrap()
    else {
        panic!("root must be a directory");
    };
    assert!(matches!(children.get("README.md"), Some(FileNode::File(_))));
    let Some(FileNode::Directory { children: src }) = children.get("src") else {
        panic!("src must be a directory");
    };
    assert!(matches!(src.get("app.py"), Some(FileNode::File(_))));
    assert!(matches!(src.get("lib"), Some(FileNode::Directory { .. })));
}

#[tokio::test]
async fn test_access_is_checked_before_anything_else() {
    let h = harness();
    let project = h.project("alice").await;
    h.service
        .write_file(project.id, "alice", "a.txt", b"secret plans")
        .await
        .unwrap();

    let err = h
        .service
        .read_file(project.id, "mallory", "a.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, DevboxError::Forbidden(_)));
    let err = h
        .service
        .ensure_running(project.id, "mallory", &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DevboxError::Forbidden(_)));
    assert_eq!(h.runtime.calls("create").await, 0);

    let err = h
        .service
        .list_files(Uuid::new_v4(), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, DevboxError::NotFound(_)));
}

#[tokio::test]
async fn test_paths_outside_the_workspace_are_rejected() {
    let h = harness();
    let project = h.project("alice").await;
    for path in ["../etc/passwd", "/etc/passwd", "src/../../x", "", "./"] {
        let err = h
            .service
            .write_file(project.id, "alice", path, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, DevboxError::Validation(_)), "{path}: {err:?}");
    }
    assert!(h.service.list_files(project.id, "alice").await.unwrap().is_empty());
}

struct KeyScanner;

#[async_trait]
impl ContentScanner for KeyScanner {
    async fn scan(&self, content: &[u8]) -> ScanReport {
        let flagged = content.windows(4).any(|w| w == &b"AKIA"[..]);
        ScanReport {
            has_secrets: flagged,
            risk_level: if flagged {
                RiskLevel::High
            } else {
                RiskLevel::None
            },
        }
    }
}

#[tokio::test]
async fn test_scanner_findings_are_recorded_without_blocking() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let store = InMemoryStore::new();
    let projects = InMemoryProjects::new();
    let service = WorkspaceService::builder(test_config())
        .runtime(runtime.clone())
        .container_store(Arc::new(store.clone()))
        .file_store(Arc::new(store))
        .projects(Arc::new(projects.clone()))
        .scanner(Arc::new(KeyScanner))
        .build()
        .unwrap();
    let project = projects.create("alice", "demo").await;

    let record = service
        .write_file(project.id, "alice", ".env", b"AWS_KEY=AKIA0000")
        .await
        .unwrap();
    assert!(record.metadata.has_secrets);
    assert_eq!(record.metadata.risk_level, RiskLevel::High);

    let clean = service
        .write_file(project.id, "alice", "app.py", b"print(1)")
        .await
        .unwrap();
    assert!(!clean.metadata.has_secrets);
}
