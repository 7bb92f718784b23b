// devbox record store: containers, workspace files and the project directory
use devbox_common::DevboxError;
use thiserror::Error;

mod projects;
mod storage;

pub use projects::InMemoryProjects;
pub use storage::{ContainerStore, FileStore, InMemoryStore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("Constraint violated: {0}")]
    Conflict(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for DevboxError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => DevboxError::Conflict(msg),
            StoreError::NotFound(msg) => DevboxError::NotFound(msg),
            StoreError::Backend(msg) => DevboxError::service(msg),
        }
    }
}
