// Re-export dependencies used in public interfaces of common types

use async_trait::async_trait;
pub use chrono;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;
use uuid::Uuid;

pub mod config;
pub mod model;
pub mod paths;
pub mod tree;

pub use config::{DevboxConfig, LimitBounds, Range, RuntimeKind};
pub use model::{
    Container, ContainerMetrics, ContainerRequest, ContainerStatus, ExecOutput, FileEncoding,
    FileMetadata, FileRecord, ResourceLimits, RiskLevel, ScanReport,
};
pub use tree::FileNode;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DevboxError {
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service Error: {message}")]
    Service { message: String, retryable: bool },
}

impl DevboxError {
    pub fn service(message: impl Into<String>) -> Self {
        DevboxError::Service {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        DevboxError::Service {
            message: message.into(),
            retryable: true,
        }
    }

    /// True only for transient runtime failures (unreachable engine, timeouts).
    pub fn is_retryable(&self) -> bool {
        matches!(self, DevboxError::Service { retryable: true, .. })
    }
}

// Define the primary Result type for devbox operations
pub type Result<T> = std::result::Result<T, DevboxError>;

/// Minimal view of a project as seen by the container layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
}

/// Project existence and ownership lookup, provided by the host application.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn get_project(&self, project_id: Uuid) -> Result<Project>;
}

/// Secret/security content gate. Findings are recorded, never enforced here.
#[async_trait]
pub trait ContentScanner: Send + Sync {
    async fn scan(&self, content: &[u8]) -> ScanReport;
}

/// Scanner that reports every payload as clean.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScanner;

#[async_trait]
impl ContentScanner for NoopScanner {
    async fn scan(&self, _content: &[u8]) -> ScanReport {
        ScanReport::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DevboxError::retryable("docker timed out").is_retryable());
        assert!(!DevboxError::service("exec failed").is_retryable());
        assert!(!DevboxError::Validation("bad cpu".into()).is_retryable());
    }

    #[test]
    fn test_project_serialization() {
        let project = Project {
            id: Uuid::new_v4(),
            owner_id: "user-1".to_string(),
            name: "demo".to_string(),
        };
        let json = serde_json::to_string(&project).unwrap();
        assert!(json.contains("user-1"));
        let back: Project = serde_json::from_str(&json).unwrap();
        assert_eq!(back, project);
    }

    #[tokio::test]
    async fn test_noop_scanner_is_clean() {
        let report = NoopScanner.scan(b"AWS_SECRET=abc").await;
        assert!(!report.has_secrets);
        assert_eq!(report.risk_level, RiskLevel::None);
    }
}
