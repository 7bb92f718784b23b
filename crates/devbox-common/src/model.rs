use std::collections::BTreeMap;
use std::fmt::Display;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{DevboxError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Running,
    Sleeping,
    Stopped,
    Error,
    Deleted,
}

impl ContainerStatus {
    /// Active containers count against the one-per-project invariant and user quotas.
    pub fn is_active(&self) -> bool {
        !matches!(self, ContainerStatus::Deleted | ContainerStatus::Error)
    }

    pub fn can_transition_to(&self, next: ContainerStatus) -> bool {
        use ContainerStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => matches!(self, Stopped | Error | Creating),
            (Creating, Running) | (Creating, Error) => true,
            (Running, Running) | (Running, Sleeping) | (Running, Stopped) | (Running, Error) => {
                true
            }
            (Sleeping, Running) | (Sleeping, Stopped) | (Sleeping, Error) => true,
            (Stopped, Running) | (Stopped, Error) => true,
            (Error, Running) => true,
            _ => false,
        }
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerStatus::Creating => "creating",
            ContainerStatus::Running => "running",
            ContainerStatus::Sleeping => "sleeping",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Error => "error",
            ContainerStatus::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Cores, fractional allowed.
    pub cpu: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

/// Last observed usage. Zeroed whenever the container is not running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_limit_mb: f64,
    pub disk_mb: f64,
    pub net_in_mb: f64,
    pub net_out_mb: f64,
}

/// What a caller asks for when a project has no container yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: Uuid,
    pub project_id: Uuid,
    pub owner_id: String,
    /// Runtime-assigned id, absent until the runtime object exists.
    pub external_id: Option<String>,
    pub name: String,
    pub limits: ResourceLimits,
    pub env_vars: BTreeMap<String, String>,
    pub internal_port: u16,
    pub external_port: Option<u16>,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub sleep_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errored_at: Option<DateTime<Utc>>,
    pub metrics: ContainerMetrics,
    pub health_failures: u32,
    pub restart_attempted: bool,
    pub error_message: Option<String>,
}

impl Container {
    pub fn new(
        project_id: Uuid,
        owner_id: impl Into<String>,
        limits: ResourceLimits,
        env_vars: BTreeMap<String, String>,
        internal_port: u16,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let name = format!(
            "devbox-{}-{}",
            &project_id.simple().to_string()[..8],
            &id.simple().to_string()[..8]
        );
        Self {
            id,
            project_id,
            owner_id: owner_id.into(),
            external_id: None,
            name,
            limits,
            env_vars,
            internal_port,
            external_port: None,
            status: ContainerStatus::Creating,
            created_at: now,
            started_at: None,
            last_activity_at: now,
            sleep_at: None,
            stopped_at: None,
            errored_at: None,
            metrics: ContainerMetrics::default(),
            health_failures: 0,
            restart_attempted: false,
            error_message: None,
        }
    }

    /// The runtime id, or `NotFound` if the runtime object was never created.
    pub fn runtime_id(&self) -> Result<&str> {
        self.external_id.as_deref().ok_or_else(|| {
            DevboxError::NotFound(format!("container {} has no runtime instance", self.id))
        })
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity_at
    }

    /// Moves to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: ContainerStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DevboxError::Validation(format!(
                "container {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.apply(next, now);
        Ok(())
    }

    /// Force-delete path: any state may become `Deleted`.
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) {
        self.apply(ContainerStatus::Deleted, now);
    }

    pub fn mark_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.apply(ContainerStatus::Error, now);
        self.error_message = Some(message.into());
    }

    fn apply(&mut self, next: ContainerStatus, now: DateTime<Utc>) {
        match next {
            ContainerStatus::Running => {
                // Waking from sleep keeps the original start time.
                if self.status != ContainerStatus::Sleeping {
                    self.started_at = Some(now);
                }
                self.last_activity_at = now;
                self.sleep_at = None;
                self.stopped_at = None;
                self.errored_at = None;
                self.error_message = None;
            }
            ContainerStatus::Sleeping => self.sleep_at = Some(now),
            ContainerStatus::Stopped => {
                self.stopped_at = Some(now);
                self.sleep_at = None;
                self.external_port = None;
            }
            ContainerStatus::Deleted => {
                self.external_port = None;
                if self.stopped_at.is_none() {
                    self.stopped_at = Some(now);
                }
            }
            ContainerStatus::Error => self.errored_at = Some(now),
            ContainerStatus::Creating => {}
        }
        if next != ContainerStatus::Running {
            self.metrics = ContainerMetrics::default();
        }
        self.status = next;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Interleaved stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub has_secrets: bool,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub has_secrets: bool,
    pub risk_level: RiskLevel,
    pub scanned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    /// POSIX, project-relative.
    pub file_path: String,
    /// UTF-8 text, or base64 when `is_binary`.
    pub content: String,
    pub content_hash: String,
    pub size: u64,
    pub is_binary: bool,
    pub encoding: FileEncoding,
    pub is_latest: bool,
    pub is_deleted: bool,
    pub version: u32,
    /// `None` for files discovered inside the container.
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: FileMetadata,
}

impl FileRecord {
    pub fn new(project_id: Uuid, file_path: impl Into<String>, bytes: &[u8], actor: Option<&str>) -> Self {
        let now = Utc::now();
        let (content, is_binary, encoding) = encode_content(bytes);
        Self {
            id: Uuid::new_v4(),
            project_id,
            file_path: file_path.into(),
            content,
            content_hash: hash_bytes(bytes),
            size: bytes.len() as u64,
            is_binary,
            encoding,
            is_latest: true,
            is_deleted: false,
            version: 1,
            created_by: actor.map(str::to_string),
            updated_by: actor.map(str::to_string),
            created_at: now,
            updated_at: now,
            metadata: FileMetadata::default(),
        }
    }

    /// Replaces the content and bumps the version. Returns false when the bytes are unchanged.
    pub fn set_content(&mut self, bytes: &[u8], actor: Option<&str>, now: DateTime<Utc>) -> bool {
        let hash = hash_bytes(bytes);
        if hash == self.content_hash {
            return false;
        }
        let (content, is_binary, encoding) = encode_content(bytes);
        self.content = content;
        self.content_hash = hash;
        self.size = bytes.len() as u64;
        self.is_binary = is_binary;
        self.encoding = encoding;
        self.updated_by = actor.map(str::to_string);
        self.updated_at = now;
        self.version += 1;
        true
    }

    /// Raw bytes as they should land in the container. Base64 that fails to
    /// decode is written verbatim.
    pub fn decoded_bytes(&self) -> Vec<u8> {
        match self.encoding {
            FileEncoding::Utf8 => self.content.as_bytes().to_vec(),
            FileEncoding::Base64 => BASE64
                .decode(self.content.as_bytes())
                .unwrap_or_else(|_| self.content.as_bytes().to_vec()),
        }
    }
}

/// SHA-256 hex digest of raw file bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn is_binary_content(bytes: &[u8]) -> bool {
    bytes.contains(&0) || std::str::from_utf8(bytes).is_err()
}

fn encode_content(bytes: &[u8]) -> (String, bool, FileEncoding) {
    if is_binary_content(bytes) {
        (BASE64.encode(bytes), true, FileEncoding::Base64)
    } else {
        (
            String::from_utf8_lossy(bytes).into_owned(),
            false,
            FileEncoding::Utf8,
        )
    }
}
