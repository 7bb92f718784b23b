use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DevboxError, ResourceLimits, Result};

/// Container runtime backend. Resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Memory,
}

impl FromStr for RuntimeKind {
    type Err = DevboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeKind::Docker),
            "memory" => Ok(RuntimeKind::Memory),
            other => Err(DevboxError::Validation(format!(
                "unknown runtime kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> Range<T> {
    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitBounds {
    pub cpu: Range<f64>,
    pub memory_mb: Range<u64>,
    pub disk_mb: Range<u64>,
}

impl Default for LimitBounds {
    fn default() -> Self {
        Self {
            cpu: Range { min: 0.25, max: 8.0 },
            memory_mb: Range {
                min: 256,
                max: 16384,
            },
            disk_mb: Range {
                min: 1024,
                max: 51200,
            },
        }
    }
}

impl LimitBounds {
    pub fn check(&self, limits: &ResourceLimits) -> Result<()> {
        if !limits.cpu.is_finite() || !self.cpu.contains(limits.cpu) {
            return Err(DevboxError::Validation(format!(
                "cpu limit {} outside [{}, {}]",
                limits.cpu, self.cpu.min, self.cpu.max
            )));
        }
        if !self.memory_mb.contains(limits.memory_mb) {
            return Err(DevboxError::Validation(format!(
                "memory limit {}MB outside [{}, {}]",
                limits.memory_mb, self.memory_mb.min, self.memory_mb.max
            )));
        }
        if !self.disk_mb.contains(limits.disk_mb) {
            return Err(DevboxError::Validation(format!(
                "disk limit {}MB outside [{}, {}]",
                limits.disk_mb, self.disk_mb.min, self.disk_mb.max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevboxConfig {
    pub runtime: RuntimeKind,
    pub image: String,
    pub workspace_root: String,
    pub network: Option<String>,
    pub internal_port: u16,
    pub default_limits: ResourceLimits,
    pub limit_bounds: LimitBounds,
    pub max_active_containers_per_user: usize,
    /// Idle time before a running container is paused.
    pub sleep_after: Duration,
    /// Idle time before a running or sleeping container is stopped.
    pub stop_after: Duration,
    /// Time spent stopped before the container is removed.
    pub delete_after: Duration,
    pub cleanup_interval: Duration,
    pub health_check_interval: Duration,
    pub health_failure_threshold: u32,
    /// Upper bound on every runtime call.
    pub runtime_timeout: Duration,
    pub stop_timeout: Duration,
    pub max_pull_file_bytes: u64,
    pub sync_exclude: Vec<String>,
    pub enforce_disk_limit: bool,
}

impl Default for DevboxConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Docker,
            image: "python:3.11-slim".to_string(),
            workspace_root: "/workspace".to_string(),
            network: None,
            internal_port: 8080,
            default_limits: ResourceLimits {
                cpu: 1.0,
                memory_mb: 1024,
                disk_mb: 5120,
            },
            limit_bounds: LimitBounds::default(),
            max_active_containers_per_user: 3,
            sleep_after: Duration::from_secs(30 * 60),
            stop_after: Duration::from_secs(2 * 60 * 60),
            delete_after: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(60),
            health_failure_threshold: 3,
            runtime_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            max_pull_file_bytes: 10 * 1024 * 1024,
            sync_exclude: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                "__pycache__".to_string(),
                ".venv".to_string(),
                "target".to_string(),
                "*.pyc".to_string(),
            ],
            enforce_disk_limit: false,
        }
    }
}

impl DevboxConfig {
    /// Defaults overlaid with `DEVBOX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Reads a JSON config file. Missing keys fall back to defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            DevboxError::Validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            DevboxError::Validation(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from a key lookup, then validates.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("DEVBOX_RUNTIME") {
            self.runtime = v.parse()?;
        }
        if let Some(v) = lookup("DEVBOX_IMAGE") {
            self.image = v;
        }
        if let Some(v) = lookup("DEVBOX_WORKSPACE_ROOT") {
            self.workspace_root = v;
        }
        if let Some(v) = lookup("DEVBOX_NETWORK") {
            self.network = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("DEVBOX_INTERNAL_PORT") {
            self.internal_port = parse("DEVBOX_INTERNAL_PORT", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_DEFAULT_CPU") {
            self.default_limits.cpu = parse("DEVBOX_DEFAULT_CPU", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_DEFAULT_MEMORY_MB") {
            self.default_limits.memory_mb = parse("DEVBOX_DEFAULT_MEMORY_MB", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_DEFAULT_DISK_MB") {
            self.default_limits.disk_mb = parse("DEVBOX_DEFAULT_DISK_MB", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_MAX_CONTAINERS_PER_USER") {
            self.max_active_containers_per_user = parse("DEVBOX_MAX_CONTAINERS_PER_USER", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_SLEEP_AFTER_SECS") {
            self.sleep_after = secs("DEVBOX_SLEEP_AFTER_SECS", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_STOP_AFTER_SECS") {
            self.stop_after = secs("DEVBOX_STOP_AFTER_SECS", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_DELETE_AFTER_DAYS") {
            let days: u64 = parse("DEVBOX_DELETE_AFTER_DAYS", &v)?;
            self.delete_after = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(v) = lookup("DEVBOX_CLEANUP_INTERVAL_SECS") {
            self.cleanup_interval = secs("DEVBOX_CLEANUP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_HEALTH_INTERVAL_SECS") {
            self.health_check_interval = secs("DEVBOX_HEALTH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_HEALTH_FAILURES") {
            self.health_failure_threshold = parse("DEVBOX_HEALTH_FAILURES", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_RUNTIME_TIMEOUT_SECS") {
            self.runtime_timeout = secs("DEVBOX_RUNTIME_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_STOP_TIMEOUT_SECS") {
            self.stop_timeout = secs("DEVBOX_STOP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_MAX_PULL_FILE_BYTES") {
            self.max_pull_file_bytes = parse("DEVBOX_MAX_PULL_FILE_BYTES", &v)?;
        }
        if let Some(v) = lookup("DEVBOX_ENFORCE_DISK_LIMIT") {
            self.enforce_disk_limit = parse("DEVBOX_ENFORCE_DISK_LIMIT", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let bounds = &self.limit_bounds;
        if bounds.cpu.min > bounds.cpu.max
            || bounds.memory_mb.min > bounds.memory_mb.max
            || bounds.disk_mb.min > bounds.disk_mb.max
        {
            return Err(DevboxError::Validation(
                "limit bounds have min greater than max".to_string(),
            ));
        }
        bounds.check(&self.default_limits)?;
        if self.sleep_after >= self.stop_after {
            return Err(DevboxError::Validation(
                "sleep_after must be shorter than stop_after".to_string(),
            ));
        }
        if self.health_failure_threshold == 0 {
            return Err(DevboxError::Validation(
                "health_failure_threshold must be at least 1".to_string(),
            ));
        }
        if !self.workspace_root.starts_with('/')
            || self.workspace_root.trim_end_matches('/').is_empty()
        {
            return Err(DevboxError::Validation(format!(
                "workspace_root must be an absolute directory, got {}",
                self.workspace_root
            )));
        }
        for pattern in &self.sync_exclude {
            glob::Pattern::new(pattern).map_err(|e| {
                DevboxError::Validation(format!("invalid sync_exclude pattern {pattern}: {e}"))
            })?;
        }
        Ok(())
    }

    /// True when a relative path should not be imported from the container.
    pub fn is_excluded(&self, relative: &str) -> bool {
        let file_name = relative.rsplit('/').next().unwrap_or(relative);
        self.sync_exclude.iter().any(|pattern| {
            relative.split('/').any(|segment| segment == pattern)
                || glob::Pattern::new(pattern)
                    .map(|p| p.matches(relative) || p.matches(file_name))
                    .unwrap_or(false)
        })
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DevboxError::Validation(format!("{key}={value}: {e}")))
}

fn secs(key: &str, value: &str) -> Result<Duration> {
    parse::<u64>(key, value).map(Duration::from_secs)
}
