use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::FileRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: Uuid,
    pub size: u64,
    pub content_hash: String,
    pub is_binary: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&FileRecord> for FileMeta {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id,
            size: record.size,
            content_hash: record.content_hash.clone(),
            is_binary: record.is_binary,
            updated_at: record.updated_at,
        }
    }
}

/// Project file tree. The root is always a `Directory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileNode {
    File(FileMeta),
    Directory { children: BTreeMap<String, FileNode> },
}

impl Default for FileNode {
    fn default() -> Self {
        FileNode::Directory {
            children: BTreeMap::new(),
        }
    }
}

impl FileNode {
    /// Builds a tree from live records. Deleted and superseded records are skipped.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a FileRecord>) -> Self {
        let mut root = FileNode::default();
        for record in records {
            if record.is_deleted || !record.is_latest {
                continue;
            }
            root.insert(&record.file_path, FileMeta::from(record));
        }
        root
    }

    /// Inserts a file at `path`, creating intermediate directories. A directory
    /// already occupying a name wins over a file with the same name.
    pub fn insert(&mut self, path: &str, meta: FileMeta) {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some(file_name) = segments.pop() else {
            return;
        };

        let mut node = self;
        for segment in segments {
            node = match node {
                FileNode::Directory { children } => {
                    let child = children
                        .entry(segment.to_string())
                        .or_insert_with(FileNode::default);
                    if matches!(child, FileNode::File(_)) {
                        *child = FileNode::default();
                    }
                    child
                }
                FileNode::File(_) => return,
            };
        }

        if let FileNode::Directory { children } = node {
            if !matches!(children.get(file_name), Some(FileNode::Directory { .. })) {
                children.insert(file_name.to_string(), FileNode::File(meta));
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileNode> {
        let mut node = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match node {
                FileNode::Directory { children } => node = children.get(segment)?,
                FileNode::File(_) => return None,
            }
        }
        Some(node)
    }

    pub fn file_count(&self) -> usize {
        match self {
            FileNode::File(_) => 1,
            FileNode::Directory { children } => children.values().map(FileNode::file_count).sum(),
        }
    }
}
