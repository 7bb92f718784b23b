//! Process-local [`ContainerRuntime`] used by tests and by `devboxd --runtime memory`.
//!
//! Containers are plain structs holding a file map. `exec` understands the
//! handful of commands the lifecycle manager and the synchronizer issue
//! (`echo`, `true`, `mkdir -p`, `mv`, `rm`, `cat`, `du -sm`, `find ... stat`).
//! Every call is recorded so tests can assert which adapter calls happened,
//! and failures can be injected per operation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devbox_common::ExecOutput;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::{
    ContainerRuntime, ContainerSpec, CreatedContainer, FileEntry, Result, RuntimeError,
    RuntimeStats,
};

const FIRST_HOST_PORT: u16 = 40000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeState {
    Created,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
struct FakeFile {
    bytes: Vec<u8>,
    mtime: DateTime<Utc>,
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    state: FakeState,
    port: Option<u16>,
    files: BTreeMap<String, FakeFile>,
    dirs: BTreeSet<String>,
    unhealthy: bool,
    executed: Vec<Vec<String>>,
}

impl FakeContainer {
    fn require_running(&self, id: &str) -> Result<()> {
        match self.state {
            FakeState::Running => Ok(()),
            _ => Err(RuntimeError::NotRunning(id.to_string())),
        }
    }

    fn dir_exists(&self, dir: &str) -> bool {
        let dir = dir.trim_end_matches('/');
        let prefix = format!("{dir}/");
        dir.is_empty()
            || dir == self.spec.workspace_root.trim_end_matches('/')
            || self.dirs.contains(dir)
            || self.files.keys().any(|p| p.starts_with(&prefix))
    }

    fn resolve(&self, workdir: Option<&str>, path: &str) -> String {
        if path.starts_with('/') {
            return path.trim_end_matches('/').to_string();
        }
        let base = workdir.unwrap_or(&self.spec.workspace_root);
        format!("{}/{}", base.trim_end_matches('/'), path.trim_end_matches('/'))
    }

    fn entries_under(&self, dir: &str, recursive: bool) -> Vec<FileEntry> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .iter()
            .filter(|(path, _)| match path.strip_prefix(&prefix) {
                Some(rest) => recursive || !rest.contains('/'),
                None => false,
            })
            .map(|(path, file)| FileEntry {
                path: path.clone(),
                size: file.bytes.len() as u64,
                mtime: file.mtime,
            })
            .collect()
    }

    fn run(&mut self, command: &[String], workdir: Option<&str>) -> ExecOutput {
        self.executed.push(command.to_vec());
        if self.unhealthy {
            return exit(1, "container is unresponsive\n");
        }
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["true"] => exit(0, ""),
            ["echo", rest @ ..] => exit(0, &format!("{}\n", rest.join(" "))),
            ["mkdir", "-p", dirs @ ..] => {
                for dir in dirs {
                    let dir = self.resolve(workdir, dir);
                    self.dirs.insert(dir);
                }
                exit(0, "")
            }
            ["mv", "-f", from, to] | ["mv", from, to] => {
                let from = self.resolve(workdir, from);
                let to = self.resolve(workdir, to);
                self.move_path(&from, &to)
            }
            ["rm", flags, targets @ ..] if flags.starts_with('-') => {
                let recursive = flags.contains('r');
                for target in targets {
                    let target = self.resolve(workdir, target);
                    self.files.remove(&target);
                    if recursive {
                        let prefix = format!("{target}/");
                        self.files.retain(|p, _| !p.starts_with(&prefix));
                        self.dirs.retain(|d| d != &target && !d.starts_with(&prefix));
                    }
                }
                exit(0, "")
            }
            ["cat", path] => {
                let path = self.resolve(workdir, path);
                match self.files.get(&path) {
                    Some(file) => exit(0, &String::from_utf8_lossy(&file.bytes)),
                    None => exit(1, &format!("cat: {path}: No such file or directory\n")),
                }
            }
            ["du", "-sm", dir] => {
                let dir = self.resolve(workdir, dir);
                let bytes: u64 = self
                    .entries_under(&dir, true)
                    .iter()
                    .map(|entry| entry.size)
                    .sum();
                let mb = bytes.div_ceil(1024 * 1024);
                exit(0, &format!("{mb}\t{dir}\n"))
            }
            ["find", dir, rest @ ..] => {
                let dir = self.resolve(workdir, dir);
                if !self.dir_exists(&dir) {
                    return exit(1, &format!("find: '{dir}': No such file or directory\n"));
                }
                let recursive = !rest.contains(&"-maxdepth");
                let listing: String = self
                    .entries_under(&dir, recursive)
                    .iter()
                    .map(|e| format!("{} {} {}\n", e.size, e.mtime.timestamp(), e.path))
                    .collect();
                exit(0, &listing)
            }
            [program, ..] => exit(127, &format!("sh: {program}: not found\n")),
            [] => exit(127, "empty command\n"),
        }
    }

    fn move_path(&mut self, from: &str, to: &str) -> ExecOutput {
        if let Some(file) = self.files.remove(from) {
            self.files.insert(to.to_string(), file);
            return exit(0, "");
        }
        let prefix = format!("{from}/");
        let moved: Vec<String> = self
            .files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        if moved.is_empty() && !self.dirs.contains(from) {
            return exit(1, &format!("mv: can't rename '{from}': No such file or directory\n"));
        }
        for path in moved {
            if let Some(file) = self.files.remove(&path) {
                self.files
                    .insert(format!("{to}/{}", &path[prefix.len()..]), file);
            }
        }
        if self.dirs.remove(from) {
            self.dirs.insert(to.to_string());
        }
        exit(0, "")
    }
}

fn exit(exit_code: i64, output: &str) -> ExecOutput {
    ExecOutput {
        exit_code,
        output: output.to_string(),
    }
}

#[derive(Debug, Default)]
struct Inner {
    containers: HashMap<String, FakeContainer>,
    calls: Vec<&'static str>,
    unreachable: bool,
    failures: HashMap<&'static str, VecDeque<RuntimeError>>,
    fail_restarts: bool,
    exec_delay: Duration,
    next_port: u16,
}

impl Inner {
    fn container(&mut self, id: &str) -> Result<&mut FakeContainer> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    inner: Mutex<Inner>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the call and applies any injected failure.
    async fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(operation);
        if inner.unreachable {
            return Err(RuntimeError::Unavailable(format!(
                "{operation}: in-memory runtime marked unreachable"
            )));
        }
        if let Some(err) = inner
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(inner)
    }

    /// Number of recorded calls to `operation` (`"create"`, `"start"`, ...).
    pub async fn calls(&self, operation: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.calls.iter().filter(|op| **op == operation).count()
    }

    pub async fn reset_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Every call fails with `Unavailable` while set.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().await.unreachable = unreachable;
    }

    /// Fails the next call to `operation` with `error`. Queued failures stack.
    pub async fn fail_next(&self, operation: &'static str, error: RuntimeError) {
        self.inner
            .lock()
            .await
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Makes every exec in the container exit non-zero until it is restarted.
    pub async fn set_unhealthy(&self, external_id: &str, unhealthy: bool) {
        if let Some(container) = self.inner.lock().await.containers.get_mut(external_id) {
            container.unhealthy = unhealthy;
        }
    }

    /// Restarts fail with an API error while set.
    pub async fn fail_restarts(&self, fail: bool) {
        self.inner.lock().await.fail_restarts = fail;
    }

    /// Every exec sleeps this long before it looks at the container.
    pub async fn set_exec_delay(&self, delay: Duration) {
        self.inner.lock().await.exec_delay = delay;
    }

    pub async fn state(&self, external_id: &str) -> Option<FakeState> {
        let inner = self.inner.lock().await;
        inner.containers.get(external_id).map(|c| c.state)
    }

    pub async fn spec(&self, external_id: &str) -> Option<ContainerSpec> {
        let inner = self.inner.lock().await;
        inner.containers.get(external_id).map(|c| c.spec.clone())
    }

    pub async fn container_count(&self) -> usize {
        self.inner.lock().await.containers.len()
    }

    /// Reads a file without recording a call.
    pub async fn file(&self, external_id: &str, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner
            .containers
            .get(external_id)
            .and_then(|c| c.files.get(path))
            .map(|f| f.bytes.clone())
    }

    /// Writes a file as a process inside the container would, without recording a call.
    pub async fn write_in_container(&self, external_id: &str, path: &str, bytes: &[u8]) {
        let mut inner = self.inner.lock().await;
        if let Some(container) = inner.containers.get_mut(external_id) {
            container.files.insert(
                path.to_string(),
                FakeFile {
                    bytes: bytes.to_vec(),
                    mtime: Utc::now(),
                },
            );
        }
    }

    /// Commands executed in the container, oldest first.
    pub async fn executed(&self, external_id: &str) -> Vec<Vec<String>> {
        let inner = self.inner.lock().await;
        inner
            .containers
            .get(external_id)
            .map(|c| c.executed.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        let mut inner = self.enter("create").await?;
        if inner.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::Api {
                operation: "create",
                message: format!("container name {} is already in use", spec.name),
            });
        }
        let external_id = Uuid::new_v4().simple().to_string();
        inner.containers.insert(
            external_id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: FakeState::Created,
                port: None,
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                unhealthy: false,
                executed: Vec::new(),
            },
        );
        debug!(%external_id, name = %spec.name, "In-memory container created");
        Ok(CreatedContainer {
            external_id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, external_id: &str) -> Result<Option<u16>> {
        let mut inner = self.enter("start").await?;
        let port = FIRST_HOST_PORT + inner.next_port;
        let container = inner.container(external_id)?;
        if container.state == FakeState::Paused {
            return Err(RuntimeError::Api {
                operation: "start",
                message: "cannot start a paused container, unpause it instead".to_string(),
            });
        }
        container.state = FakeState::Running;
        let assigned = *container.port.get_or_insert(port);
        if assigned == port {
            inner.next_port += 1;
        }
        Ok(Some(assigned))
    }

    async fn stop(&self, external_id: &str, _timeout: Duration) -> Result<()> {
        let mut inner = self.enter("stop").await?;
        let container = inner.container(external_id)?;
        container.state = FakeState::Stopped;
        container.port = None;
        Ok(())
    }

    async fn pause(&self, external_id: &str) -> Result<()> {
        let mut inner = self.enter("pause").await?;
        let container = inner.container(external_id)?;
        container.require_running(external_id)?;
        container.state = FakeState::Paused;
        Ok(())
    }

    async fn unpause(&self, external_id: &str) -> Result<()> {
        let mut inner = self.enter("unpause").await?;
        let container = inner.container(external_id)?;
        if container.state != FakeState::Paused {
            return Err(RuntimeError::Api {
                operation: "unpause",
                message: format!("container {external_id} is not paused"),
            });
        }
        container.state = FakeState::Running;
        Ok(())
    }

    async fn restart(&self, external_id: &str, _timeout: Duration) -> Result<()> {
        let mut inner = self.enter("restart").await?;
        if inner.fail_restarts {
            return Err(RuntimeError::Api {
                operation: "restart",
                message: "restart refused".to_string(),
            });
        }
        let container = inner.container(external_id)?;
        container.state = FakeState::Running;
        container.unhealthy = false;
        Ok(())
    }

    async fn remove(&self, external_id: &str, force: bool) -> Result<()> {
        let mut inner = self.enter("remove").await?;
        let container = inner.container(external_id)?;
        if !force && matches!(container.state, FakeState::Running | FakeState::Paused) {
            return Err(RuntimeError::Api {
                operation: "remove",
                message: "cannot remove a running container without force".to_string(),
            });
        }
        inner.containers.remove(external_id);
        Ok(())
    }

    async fn stats(&self, external_id: &str) -> Result<RuntimeStats> {
        let mut inner = self.enter("stats").await?;
        let container = inner.container(external_id)?;
        let memory_limit_mb = container.spec.memory_mb as f64;
        if container.state != FakeState::Running {
            return Ok(RuntimeStats {
                memory_limit_mb,
                ..Default::default()
            });
        }
        Ok(RuntimeStats {
            cpu_percent: 1.5,
            memory_used_mb: 64.0,
            memory_limit_mb,
            net_in_mb: 0.1,
            net_out_mb: 0.05,
        })
    }

    async fn logs(
        &self,
        external_id: &str,
        tail: usize,
        _since: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let mut inner = self.enter("logs").await?;
        let container = inner.container(external_id)?;
        let lines: Vec<String> = container
            .executed
            .iter()
            .map(|cmd| format!("$ {}", cmd.join(" ")))
            .collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines[skip..].iter().map(|l| format!("{l}\n")).collect())
    }

    async fn exec(
        &self,
        external_id: &str,
        command: &[String],
        workdir: Option<&str>,
        _env: Option<&BTreeMap<String, String>>,
    ) -> Result<ExecOutput> {
        let delay = self.inner.lock().await.exec_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.enter("exec").await?;
        let container = inner.container(external_id)?;
        container.require_running(external_id)?;
        Ok(container.run(command, workdir))
    }

    async fn put_file(&self, external_id: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let mut inner = self.enter("put_file").await?;
        let container = inner.container(external_id)?;
        container.files.insert(
            path.to_string(),
            FakeFile {
                bytes: bytes.to_vec(),
                mtime: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_file(&self, external_id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.enter("get_file").await?;
        let container = inner.container(external_id)?;
        Ok(container.files.get(path).map(|f| f.bytes.clone()))
    }

    async fn list_files(
        &self,
        external_id: &str,
        dir: &str,
        recursive: bool,
    ) -> Result<Vec<FileEntry>> {
        let mut inner = self.enter("list_files").await?;
        let container = inner.container(external_id)?;
        container.require_running(external_id)?;
        Ok(container.entries_under(dir, recursive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_spec;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn running(runtime: &InMemoryRuntime) -> String {
        let created = runtime.create(&test_spec("devbox-test")).await.unwrap();
        runtime.start(&created.external_id).await.unwrap();
        created.external_id
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let runtime = InMemoryRuntime::new();
        let created = runtime.create(&test_spec("devbox-a")).await.unwrap();
        let first = runtime.start(&created.external_id).await.unwrap();
        let second = runtime.start(&created.external_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(runtime.calls("start").await, 2);
        assert_eq!(runtime.state(&created.external_id).await, Some(FakeState::Running));
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let runtime = InMemoryRuntime::new();
        let id = running(&runtime).await;
        runtime.pause(&id).await.unwrap();
        let err = runtime.exec(&id, &cmd(&["echo", "hi"]), None, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotRunning(_)));

        runtime.unpause(&id).await.unwrap();
        let out = runtime.exec(&id, &cmd(&["echo", "hi"]), None, None).await.unwrap();
        assert!(out.success());
        assert_eq!(out.output, "hi\n");
    }

    #[tokio::test]
    async fn test_unknown_container_is_not_found() {
        let runtime = InMemoryRuntime::new();
        let err = runtime.stop("nope", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let runtime = InMemoryRuntime::new();
        let id = running(&runtime).await;
        runtime
            .fail_next(
                "stats",
                RuntimeError::Timeout {
                    operation: "stats",
                    after: Duration::from_secs(1),
                },
            )
            .await;
        assert!(runtime.stats(&id).await.unwrap_err().is_retryable());
        assert!(runtime.stats(&id).await.is_ok());

        runtime.set_unreachable(true).await;
        assert!(matches!(
            runtime.logs(&id, 10, None).await,
            Err(RuntimeError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_file_commands() {
        let runtime = InMemoryRuntime::new();
        let id = running(&runtime).await;
        runtime
            .put_file(&id, "/workspace/src/app.py", b"print(1)")
            .await
            .unwrap();
        runtime
            .put_file(&id, "/workspace/src/lib/util.py", b"x = 1")
            .await
            .unwrap();

        let flat = runtime.list_files(&id, "/workspace/src", false).await.unwrap();
        assert_eq!(flat.len(), 1);
        let deep = runtime.list_files(&id, "/workspace", true).await.unwrap();
        assert_eq!(deep.len(), 2);

        let out = runtime
            .exec(&id, &cmd(&["mv", "-f", "/workspace/src", "/workspace/pkg"]), None, None)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(
            runtime.file(&id, "/workspace/pkg/lib/util.py").await.as_deref(),
            Some(&b"x = 1"[..])
        );

        runtime
            .exec(&id, &cmd(&["rm", "-rf", "/workspace/pkg/lib"]), None, None)
            .await
            .unwrap();
        assert!(runtime.file(&id, "/workspace/pkg/lib/util.py").await.is_none());
        assert!(runtime.file(&id, "/workspace/pkg/app.py").await.is_some());
    }

    #[tokio::test]
    async fn test_find_listing_matches_docker_format() {
        let runtime = InMemoryRuntime::new();
        let id = running(&runtime).await;
        runtime.write_in_container(&id, "/workspace/notes.txt", b"hello").await;

        let out = runtime
            .exec(&id, &crate::docker::listing_command("/workspace", true), None, None)
            .await
            .unwrap();
        let entries = crate::docker::parse_stat_listing(&out.output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/workspace/notes.txt");
        assert_eq!(entries[0].size, 5);

        let missing = runtime
            .exec(&id, &crate::docker::listing_command("/nowhere", true), None, None)
            .await
            .unwrap();
        assert!(!missing.success());
        assert!(missing.output.contains("No such file"));
    }

    #[tokio::test]
    async fn test_restart_clears_unhealthy() {
        let runtime = InMemoryRuntime::new();
        let id = running(&runtime).await;
        runtime.set_unhealthy(&id, true).await;
        let probe = runtime.exec(&id, &cmd(&["echo", "health"]), None, None).await.unwrap();
        assert!(!probe.success());

        runtime.restart(&id, Duration::from_secs(1)).await.unwrap();
        let probe = runtime.exec(&id, &cmd(&["echo", "health"]), None, None).await.unwrap();
        assert!(probe.success());
    }
}
