use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devbox_common::{DevboxError, ExecOutput};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the lifecycle manager)
pub use bollard;
pub use devbox_common as common;

pub mod docker;
pub mod memory;
pub mod test_utils;

pub use docker::{DockerOptions, DockerRuntime};
pub use memory::InMemoryRuntime;

// --- Custom Error Type ---
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("Runtime call {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("Container not found: {0}")]
    NotFound(String),
    #[error("Container {0} is not running")]
    NotRunning(String),
    #[error("Runtime rejected {operation}: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
    #[error("Archive error: {0}")]
    Archive(String),
}

impl RuntimeError {
    /// Transport failures and timeouts; the call may succeed if re-issued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_) | RuntimeError::Timeout { .. })
    }
}

// Runtime failures surface to callers as service errors, except unknown ids
// and the not-running precondition
impl From<RuntimeError> for DevboxError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(what) => DevboxError::NotFound(what),
            RuntimeError::NotRunning(id) => {
                DevboxError::Validation(format!("container {id} is not running"))
            }
            e if e.is_retryable() => DevboxError::retryable(e.to_string()),
            e => DevboxError::service(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything the runtime needs to allocate a container. Creating does not start it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cpu: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub env_vars: BTreeMap<String, String>,
    /// Mounted as the container's working directory.
    pub workspace_root: String,
    /// Named volume for the workspace; an anonymous volume is used when `None`.
    pub volume: Option<String>,
    pub network: Option<String>,
    pub internal_port: u16,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedContainer {
    pub external_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_limit_mb: f64,
    pub net_in_mb: f64,
    pub net_out_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute path inside the container.
    pub path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// Thin adapter over a container engine. Holds no business state.
///
/// Every call is bounded by the implementation's timeout; unknown ids yield
/// [`RuntimeError::NotFound`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer>;

    /// Idempotent; returns the published host port if any.
    async fn start(&self, external_id: &str) -> Result<Option<u16>>;

    async fn stop(&self, external_id: &str, timeout: Duration) -> Result<()>;

    async fn pause(&self, external_id: &str) -> Result<()>;

    async fn unpause(&self, external_id: &str) -> Result<()>;

    async fn restart(&self, external_id: &str, timeout: Duration) -> Result<()>;

    async fn remove(&self, external_id: &str, force: bool) -> Result<()>;

    async fn stats(&self, external_id: &str) -> Result<RuntimeStats>;

    async fn logs(
        &self,
        external_id: &str,
        tail: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<String>;

    async fn exec(
        &self,
        external_id: &str,
        command: &[String],
        workdir: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<ExecOutput>;

    async fn put_file(&self, external_id: &str, path: &str, bytes: &[u8]) -> Result<()>;

    /// `None` when nothing regular exists at `path`.
    async fn get_file(&self, external_id: &str, path: &str) -> Result<Option<Vec<u8>>>;

    async fn list_files(&self, external_id: &str, dir: &str, recursive: bool)
        -> Result<Vec<FileEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let not_found: DevboxError = RuntimeError::NotFound("abc".into()).into();
        assert!(matches!(not_found, DevboxError::NotFound(_)));

        let paused: DevboxError = RuntimeError::NotRunning("abc".into()).into();
        assert!(matches!(paused, DevboxError::Validation(_)));

        let timeout: DevboxError = RuntimeError::Timeout {
            operation: "stats",
            after: Duration::from_secs(1),
        }
        .into();
        assert!(timeout.is_retryable());

        let api: DevboxError = RuntimeError::Api {
            operation: "pause",
            message: "conflict".into(),
        }
        .into();
        assert!(matches!(api, DevboxError::Service { retryable: false, .. }));
    }
}
