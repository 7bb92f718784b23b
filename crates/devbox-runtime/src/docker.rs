//! Docker-backed [`ContainerRuntime`] built on bollard.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    LogsOptions, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, Stats,
    StatsOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use chrono::{DateTime, TimeZone, Utc};
use devbox_common::paths;
use devbox_common::ExecOutput;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, instrument, warn};

use crate::{
    ContainerRuntime, ContainerSpec, CreatedContainer, FileEntry, Result, RuntimeError,
    RuntimeStats,
};

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Bound on every engine call except image pulls.
    pub timeout: Duration,
    pub pull_timeout: Duration,
    /// Apply `storage_opt.size`; only some storage drivers support it.
    pub enforce_disk_limit: bool,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            pull_timeout: Duration::from_secs(300),
            enforce_disk_limit: false,
        }
    }
}

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
    options: DockerOptions,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>, options: DockerOptions) -> Self {
        Self { docker, options }
    }

    pub fn connect_local(options: DockerOptions) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self::new(Arc::new(docker), options))
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.call_within(operation, self.options.timeout, fut).await
    }

    async fn call_within<T>(
        &self,
        operation: &'static str,
        after: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(after, fut)
            .await
            .map_err(|_| RuntimeError::Timeout { operation, after })?
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let inspected = self
            .call("inspect_image", async {
                self.docker
                    .inspect_image(image)
                    .await
                    .map(|_| ())
                    .map_err(|e| map_err("inspect_image", image, e))
            })
            .await;
        if !needs_pull(inspected)? {
            return Ok(());
        }
        info!(%image, "Pulling image...");
        let pull = self
            .docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>();
        self.call_within("pull_image", self.options.pull_timeout, async {
            pull.await.map_err(|e| map_err("pull_image", image, e))
        })
        .await?;
        Ok(())
    }

    async fn published_port(&self, external_id: &str) -> Result<Option<u16>> {
        let inspect = self
            .docker
            .inspect_container(external_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err("inspect", external_id, e))?;
        let ports = inspect.network_settings.and_then(|settings| settings.ports);
        Ok(ports.as_ref().and_then(first_host_port))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        self.ensure_image(&spec.image).await?;

        let port_key = format!("{}/tcp", spec.internal_port);
        let env: Vec<String> = spec
            .env_vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let mut labels = spec.labels.clone();
        labels.insert("devbox.disk_mb".to_string(), spec.disk_mb.to_string());

        let (volumes, binds) = match &spec.volume {
            Some(volume) => (None, Some(vec![format!("{volume}:{}", spec.workspace_root)])),
            None => (
                Some(HashMap::from([(spec.workspace_root.clone(), HashMap::new())])),
                None,
            ),
        };
        let storage_opt = self
            .options
            .enforce_disk_limit
            .then(|| HashMap::from([("size".to_string(), format!("{}M", spec.disk_mb))]));

        let host_config = HostConfig {
            nano_cpus: Some((spec.cpu * 1_000_000_000.0) as i64),
            memory: Some(spec.memory_mb as i64 * 1024 * 1024),
            storage_opt,
            binds,
            network_mode: spec.network.clone(),
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: None,
                }]),
            )])),
            ..Default::default()
        };

        // Keep-alive command so exec has something to attach to
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "while true; do sleep 30; done".to_string(),
            ]),
            env: Some(env),
            working_dir: Some(spec.workspace_root.clone()),
            labels: Some(labels),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            volumes,
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .call("create", async {
                self.docker
                    .create_container(
                        Some(CreateContainerOptions {
                            name: spec.name.clone(),
                            platform: None,
                        }),
                        config,
                    )
                    .await
                    .map_err(|e| map_err("create", &spec.name, e))
            })
            .await?;

        for warning in &response.warnings {
            warn!(name = %spec.name, %warning, "Docker create warning");
        }
        info!(external_id = %response.id, name = %spec.name, "Container created.");
        Ok(CreatedContainer {
            external_id: response.id,
            name: spec.name.clone(),
        })
    }

    #[instrument(skip(self))]
    async fn start(&self, external_id: &str) -> Result<Option<u16>> {
        self.call("start", async {
            match self
                .docker
                .start_container(external_id, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(()) => {}
                // 304: already running
                Err(BollardError::DockerResponseServerError {
                    status_code: 304, ..
                }) => debug!(%external_id, "Container already running"),
                Err(e) => return Err(map_err("start", external_id, e)),
            }
            self.published_port(external_id).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn stop(&self, external_id: &str, timeout: Duration) -> Result<()> {
        self.call_within("stop", self.options.timeout + timeout, async {
            match self
                .docker
                .stop_container(
                    external_id,
                    Some(StopContainerOptions {
                        t: timeout.as_secs() as i64,
                    }),
                )
                .await
            {
                Ok(()) => Ok(()),
                Err(BollardError::DockerResponseServerError {
                    status_code: 304, ..
                }) => Ok(()),
                Err(e) => Err(map_err("stop", external_id, e)),
            }
        })
        .await
    }

    #[instrument(skip(self))]
    async fn pause(&self, external_id: &str) -> Result<()> {
        self.call("pause", async {
            self.docker
                .pause_container(external_id)
                .await
                .map_err(|e| map_err("pause", external_id, e))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn unpause(&self, external_id: &str) -> Result<()> {
        self.call("unpause", async {
            self.docker
                .unpause_container(external_id)
                .await
                .map_err(|e| map_err("unpause", external_id, e))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn restart(&self, external_id: &str, timeout: Duration) -> Result<()> {
        self.call_within("restart", self.options.timeout + timeout, async {
            self.docker
                .restart_container(
                    external_id,
                    Some(RestartContainerOptions {
                        t: timeout.as_secs() as isize,
                    }),
                )
                .await
                .map_err(|e| map_err("restart", external_id, e))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn remove(&self, external_id: &str, force: bool) -> Result<()> {
        self.call("remove", async {
            self.docker
                .remove_container(
                    external_id,
                    Some(RemoveContainerOptions {
                        force,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| map_err("remove", external_id, e))
        })
        .await
    }

    async fn stats(&self, external_id: &str) -> Result<RuntimeStats> {
        self.call("stats", async {
            let mut stream = self.docker.stats(
                external_id,
                Some(StatsOptions {
                    stream: false,
                    one_shot: false,
                }),
            );
            let stats = stream
                .next()
                .await
                .ok_or_else(|| RuntimeError::Api {
                    operation: "stats",
                    message: "stats stream ended without a sample".to_string(),
                })?
                .map_err(|e| map_err("stats", external_id, e))?;
            Ok(summarize_stats(&stats))
        })
        .await
    }

    async fn logs(
        &self,
        external_id: &str,
        tail: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<String> {
        self.call("logs", async {
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                since: since.map(|t| t.timestamp()).unwrap_or(0),
                ..Default::default()
            };
            let mut stream = self.docker.logs(external_id, Some(options));
            let mut collected = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| map_err("logs", external_id, e))?;
                collected.extend_from_slice(&chunk.into_bytes());
            }
            Ok(String::from_utf8_lossy(&collected).into_owned())
        })
        .await
    }

    #[instrument(skip(self, env))]
    async fn exec(
        &self,
        external_id: &str,
        command: &[String],
        workdir: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<ExecOutput> {
        self.call("exec", async {
            let exec_config = CreateExecOptions::<String> {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(command.to_vec()),
                working_dir: workdir.map(str::to_string),
                env: env.map(|vars| vars.iter().map(|(k, v)| format!("{k}={v}")).collect()),
                ..Default::default()
            };
            let exec = self
                .docker
                .create_exec(external_id, exec_config)
                .await
                .map_err(|e| map_err("exec", external_id, e))?;

            let mut collected = Vec::new();
            match self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| map_err("exec", external_id, e))?
            {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        let chunk = chunk.map_err(|e| map_err("exec", external_id, e))?;
                        collected.extend_from_slice(&chunk.into_bytes());
                    }
                }
                StartExecResults::Detached => {}
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| map_err("exec", external_id, e))?;
            Ok(ExecOutput {
                exit_code: inspect.exit_code.unwrap_or(-1),
                output: String::from_utf8_lossy(&collected).into_owned(),
            })
        })
        .await
    }

    async fn put_file(&self, external_id: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let (parent, name) = split_container_path(path)?;
        let archive = file_archive(name, bytes)?;
        self.call("put_file", async {
            self.docker
                .upload_to_container(
                    external_id,
                    Some(UploadToContainerOptions {
                        path: parent.to_string(),
                        ..Default::default()
                    }),
                    archive.into(),
                )
                .await
                .map_err(|e| map_err("put_file", external_id, e))
        })
        .await
    }

    async fn get_file(&self, external_id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        self.call("get_file", async {
            let mut stream = self.docker.download_from_container(
                external_id,
                Some(DownloadFromContainerOptions {
                    path: path.to_string(),
                }),
            );
            let mut archive = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => archive.extend_from_slice(&bytes),
                    Err(BollardError::DockerResponseServerError {
                        status_code: 404,
                        message,
                    }) if !message.contains("No such container") => return Ok(None),
                    Err(e) => return Err(map_err("get_file", external_id, e)),
                }
            }
            first_regular_file(&archive)
        })
        .await
    }

    async fn list_files(
        &self,
        external_id: &str,
        dir: &str,
        recursive: bool,
    ) -> Result<Vec<FileEntry>> {
        let output = self
            .exec(external_id, &listing_command(dir, recursive), None, None)
            .await?;
        let entries = parse_stat_listing(&output.output);
        if !output.success() && entries.is_empty() {
            if output.output.contains("No such file") {
                return Ok(Vec::new());
            }
            return Err(RuntimeError::Api {
                operation: "list_files",
                message: output.output,
            });
        }
        Ok(entries)
    }
}

/// Maps bollard failures onto the adapter taxonomy.
pub(crate) fn map_err(operation: &'static str, target: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{target}: {message}")),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } if message.contains("is not running") || message.contains("is paused") => {
            RuntimeError::NotRunning(target.to_string())
        }
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            operation,
            message: format!("{status_code}: {message}"),
        },
        // Anything that never produced an HTTP status is a transport failure
        other => RuntimeError::Unavailable(format!("{operation} {target}: {other}")),
    }
}

/// Only a missing image is pulled; an unreachable or slow daemon is reported as is.
fn needs_pull(inspected: Result<()>) -> Result<bool> {
    match inspected {
        Ok(()) => Ok(false),
        Err(RuntimeError::NotFound(_)) => Ok(true),
        Err(e) => Err(e),
    }
}

fn first_host_port(ports: &HashMap<String, Option<Vec<PortBinding>>>) -> Option<u16> {
    ports
        .values()
        .flatten()
        .flatten()
        .filter_map(|binding| binding.host_port.as_deref())
        .find_map(|port| port.parse().ok())
}

pub(crate) fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u64) -> f64 {
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }
    (cpu_delta as f64 / system_delta as f64) * online_cpus.max(1) as f64 * 100.0
}

fn summarize_stats(stats: &Stats) -> RuntimeStats {
    let cpu = &stats.cpu_stats;
    let pre = &stats.precpu_stats;
    let cpu_delta = cpu.cpu_usage.total_usage.saturating_sub(pre.cpu_usage.total_usage);
    let system_delta = cpu
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(pre.system_cpu_usage.unwrap_or(0));
    let online = cpu
        .online_cpus
        .or_else(|| cpu.cpu_usage.percpu_usage.as_ref().map(|v| v.len() as u64))
        .unwrap_or(1);

    let (rx, tx) = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks
                .values()
                .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
        })
        .unwrap_or((0, 0));

    RuntimeStats {
        cpu_percent: cpu_percent(cpu_delta, system_delta, online),
        memory_used_mb: stats.memory_stats.usage.unwrap_or(0) as f64 / MB,
        memory_limit_mb: stats.memory_stats.limit.unwrap_or(0) as f64 / MB,
        net_in_mb: rx as f64 / MB,
        net_out_mb: tx as f64 / MB,
    }
}

fn split_container_path(path: &str) -> Result<(&str, &str)> {
    let parent = paths::parent_dir(path).unwrap_or("/");
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || !path.starts_with('/') {
        return Err(RuntimeError::Archive(format!(
            "expected an absolute file path, got {path}"
        )));
    }
    Ok((parent, name))
}

/// Single-entry tar archive as expected by the upload endpoint.
pub(crate) fn file_archive(name: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_entry_type(tar::EntryType::Regular);

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, name, bytes)
        .map_err(|e| RuntimeError::Archive(e.to_string()))?;
    builder
        .into_inner()
        .map_err(|e| RuntimeError::Archive(e.to_string()))
}

/// Content of the archive's first entry if it is a regular file.
pub(crate) fn first_regular_file(archive: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(archive);
    let mut entries = archive
        .entries()
        .map_err(|e| RuntimeError::Archive(e.to_string()))?;
    let Some(entry) = entries.next() else {
        return Ok(None);
    };
    let mut entry = entry.map_err(|e| RuntimeError::Archive(e.to_string()))?;
    if entry.header().entry_type() != tar::EntryType::Regular {
        return Ok(None);
    }
    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|e| RuntimeError::Archive(e.to_string()))?;
    Ok(Some(content))
}

/// `find` + `stat -c` works on both GNU coreutils and busybox images.
pub(crate) fn listing_command(dir: &str, recursive: bool) -> Vec<String> {
    let mut cmd = vec!["find".to_string(), dir.to_string()];
    if !recursive {
        cmd.extend(["-maxdepth".to_string(), "1".to_string()]);
    }
    cmd.extend(
        ["-type", "f", "-exec", "stat", "-c", "%s %Y %n", "{}", "+"]
            .into_iter()
            .map(str::to_string),
    );
    cmd
}

/// Parses `<size> <mtime> <path>` lines, skipping anything else.
pub(crate) fn parse_stat_listing(output: &str) -> Vec<FileEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ' ');
            let size = parts.next()?.parse().ok()?;
            let mtime: i64 = parts.next()?.parse().ok()?;
            let path = parts.next()?;
            if !path.starts_with('/') {
                return None;
            }
            Some(FileEntry {
                path: path.to_string(),
                size,
                mtime: Utc.timestamp_opt(mtime, 0).single()?,
            })
        })
        .collect()
}
