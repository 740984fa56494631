/// Sandbox Lifecycle Manager - Isolated Execution Environments
///
/// **Core Responsibility:**
/// Provision, run code in, and tear down isolated sandboxes.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to isolate and execute (Docker today)
/// - Engine does NOT know about sessions, retries or workflows
/// - Engine returns raw outcomes; interpretation happens upstream
///
/// **Sandbox lifecycle:** `creating -> running -> idle -> terminated`.
/// A sandbox is a long-lived container kept alive by a sleep command; each
/// submission is written into `/workspace` and executed with `docker exec`.

use crate::config::LanguageAdapter;
use crate::error::ExecutionError;
use async_trait::async_trait;
use autocoder_common::types::EventResult;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Safety limit to prevent pathological inputs from reaching Docker
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB

/// Working directory inside every sandbox
pub const SANDBOX_WORKDIR: &str = "/workspace";

/// Exit status reported for a timed-out execution
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Base64 chunk size per write exec; a multiple of 4 keeps chunks independently decodable
const WRITE_CHUNK_CHARS: usize = 64 * 1024;

/// Keep-alive command for idle sandboxes
const KEEPALIVE_SECS: &str = "86400";

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one execution inside a sandbox. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub fn to_event_result(&self) -> EventResult {
        EventResult {
            stdout: Some(self.stdout.clone()),
            stderr: Some(self.stderr.clone()),
            exit_code: Some(self.exit_code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Creating,
    Running,
    Idle,
    Terminated,
}

/// Handle to one isolated environment. Owned by exactly one session.
#[derive(Debug)]
pub struct Sandbox {
    pub id: String,
    pub image: String,
    pub language: String,
    pub workdir: String,
    pub created_at: DateTime<Utc>,
    pub state: SandboxState,
}

impl Sandbox {
    pub fn new(id: impl Into<String>, adapter: &LanguageAdapter) -> Self {
        Self {
            id: id.into(),
            image: adapter.image.clone(),
            language: adapter.name.clone(),
            workdir: SANDBOX_WORKDIR.to_string(),
            created_at: Utc::now(),
            state: SandboxState::Creating,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SandboxState::Terminated
    }

    /// Path of the source file for an adapter inside this sandbox
    pub fn source_path(&self, adapter: &LanguageAdapter) -> String {
        format!("{}/{}", self.workdir, adapter.source_file_name())
    }
}

/// Isolation backend contract: `acquire`, `run`, `release`.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Check that the isolation runtime is reachable
    async fn ping(&self) -> Result<(), ExecutionError>;

    /// Provision a sandbox for an adapter. Never fetches images.
    async fn acquire(
        &self,
        adapter: &LanguageAdapter,
        session_id: &str,
    ) -> Result<Sandbox, ExecutionError>;

    /// Write `code` into the sandbox and run the adapter's command.
    ///
    /// A non-zero exit is returned as `Ok`; `Timeout` and `Cancelled` kill
    /// the sandbox and leave it `terminated`.
    async fn run(
        &self,
        sandbox: &mut Sandbox,
        adapter: &LanguageAdapter,
        code: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError>;

    /// Tear the sandbox down. Releasing a terminated sandbox is a no-op.
    async fn release(&self, sandbox: &mut Sandbox);

    /// Drop any persistent workspace kept for a session
    async fn discard_workspace(&self, _session_id: &str) {}
}

/// Where sandbox working directories live
#[derive(Debug, Clone)]
pub struct WorkspacePolicy {
    /// Host directory for bind-mounted workspaces; tmpfs when `None`
    pub root: Option<PathBuf>,
    pub mode: u32,
}

impl WorkspacePolicy {
    fn host_dir(&self, session_id: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(sanitize_session_id(session_id)))
    }
}

/// Numeric `uid[:gid]` of the sandbox user; `None` for named users
pub fn sandbox_owner(user: &str) -> Option<(u32, Option<u32>)> {
    let (uid, gid) = match user.trim().split_once(':') {
        Some((uid, gid)) => (uid, Some(gid)),
        None => (user.trim(), None),
    };
    let uid = uid.parse().ok()?;
    let gid = match gid {
        Some(gid) => Some(gid.parse().ok()?),
        None => None,
    };
    Some((uid, gid))
}

/// Map a session id onto a safe single path component
pub fn sanitize_session_id(session_id: &str) -> String {
    let cleaned: String = session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Container cleanup guard - removes a half-provisioned container on drop
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
    armed: bool,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cannot be async in Drop
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to cleanup container");
            }
        });
    }
}

enum ExecOutcome {
    Finished,
    TimedOut,
    Cancelled,
}

/// Docker-backed sandbox runtime
///
/// **Isolation rules:**
/// 1. Image must already be present locally (no implicit pulls)
/// 2. Network disabled, all capabilities dropped, `no-new-privileges`
/// 3. Memory (no swap), CPU and pids caps from the adapter
/// 4. Read-only root filesystem; writable `/workspace` and `/tmp` only
/// 5. Unprivileged user
pub struct DockerEngine {
    docker: Docker,
    workspace: WorkspacePolicy,
    sandbox_user: String,
    live: Mutex<HashSet<String>>,
}

impl DockerEngine {
    pub fn new(workspace: WorkspacePolicy, sandbox_user: impl Into<String>) -> Result<Self, ExecutionError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutionError::Runtime(format!("Failed to connect to Docker daemon: {}", e)))?;

        Ok(Self {
            docker,
            workspace,
            sandbox_user: sandbox_user.into(),
            live: Mutex::new(HashSet::new()),
        })
    }

    /// Number of containers this engine currently owns
    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Remove every container still owned by this engine
    pub async fn shutdown(&self) {
        let ids: Vec<String> = match self.live.lock() {
            Ok(mut live) => live.drain().collect(),
            Err(_) => return,
        };

        for id in ids {
            self.remove_container(&id).await;
        }
    }

    async fn ensure_image_present(&self, image: &str) -> Result<(), ExecutionError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!(image = %image, "Image cache hit");
                Ok(())
            }
            Err(e) => {
                warn!(image = %image, error = %e, "Image not available locally");
                Err(ExecutionError::Provisioning(format!(
                    "image '{}' is not available locally",
                    image
                )))
            }
        }
    }

    async fn prepare_host_dir(&self, session_id: &str) -> Result<Option<PathBuf>, ExecutionError> {
        let Some(dir) = self.workspace.host_dir(session_id) else {
            return Ok(None);
        };

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ExecutionError::Provisioning(format!("cannot create workspace {}: {}", dir.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(self.workspace.mode))
                .await
                .map_err(|e| {
                    ExecutionError::Provisioning(format!(
                        "cannot set permissions on {}: {}",
                        dir.display(),
                        e
                    ))
                })?;

            // The sandbox user writes through the bind mount, so it must own the directory
            let (uid, gid) = sandbox_owner(&self.sandbox_user).ok_or_else(|| {
                ExecutionError::Provisioning(format!(
                    "sandbox user '{}' must be numeric uid[:gid] for host workspaces",
                    self.sandbox_user
                ))
            })?;
            std::os::unix::fs::chown(&dir, Some(uid), gid).map_err(|e| {
                ExecutionError::Provisioning(format!("cannot chown {}: {}", dir.display(), e))
            })?;
        }

        Ok(Some(dir))
    }

    async fn remove_container(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(container_id, Some(options)).await {
            warn!(container_id = %container_id, error = %e, "Failed to remove container");
        }
    }

    async fn kill_container(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id = %container_id, error = %e, "Failed to kill container");
        }
    }

    /// Run a short helper command and return its exit code
    async fn exec_simple(&self, container_id: &str, cmd: Vec<String>) -> Result<Option<i64>, ExecutionError> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            user: Some(self.sandbox_user.clone()),
            ..Default::default()
        };

        let exec = self.docker.create_exec(container_id, exec_config).await?;
        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, Some(start_config)).await?
        {
            while output.next().await.is_some() {
                // Drain the stream
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code)
    }

    /// Write source code into the sandbox working directory
    async fn write_source(&self, container_id: &str, path: &str, source_code: &str) -> Result<(), ExecutionError> {
        let encoded = general_purpose::STANDARD.encode(source_code);

        let chunks: Vec<&str> = if encoded.is_empty() {
            vec![""]
        } else {
            encoded
                .as_bytes()
                .chunks(WRITE_CHUNK_CHARS)
                .map(|c| std::str::from_utf8(c).unwrap_or_default())
                .collect()
        };

        for (idx, chunk) in chunks.iter().enumerate() {
            let redirect = if idx == 0 { ">" } else { ">>" };
            let script = format!("printf '%s' '{}' | base64 -d {} '{}'", chunk, redirect, path);
            let code = self
                .exec_simple(container_id, vec!["sh".to_string(), "-c".to_string(), script])
                .await?;
            if code != Some(0) {
                return Err(ExecutionError::Runtime(format!(
                    "failed to write source to {} (exit {:?})",
                    path, code
                )));
            }
        }

        Ok(())
    }

    /// Kill and remove a sandbox whose execution cannot complete
    async fn terminate(&self, sandbox: &mut Sandbox) {
        self.kill_container(&sandbox.id).await;
        self.release(sandbox).await;
    }
}

#[async_trait]
impl SandboxRuntime for DockerEngine {
    async fn ping(&self) -> Result<(), ExecutionError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ExecutionError::Runtime(format!("Docker daemon unreachable: {}", e)))
    }

    #[instrument(skip(self, adapter), fields(language = %adapter.name, image = %adapter.image))]
    async fn acquire(
        &self,
        adapter: &LanguageAdapter,
        session_id: &str,
    ) -> Result<Sandbox, ExecutionError> {
        self.ensure_image_present(&adapter.image).await?;

        let host_dir = self.prepare_host_dir(session_id).await?;

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,size=16m,mode=1777".to_string());
        let binds = match &host_dir {
            Some(dir) => Some(vec![format!("{}:{}:rw", dir.display(), SANDBOX_WORKDIR)]),
            None => {
                tmpfs.insert(
                    SANDBOX_WORKDIR.to_string(),
                    format!("rw,size={}m,mode=1777", adapter.disk_quota_mb),
                );
                None
            }
        };

        let mut labels = HashMap::new();
        labels.insert("autocoder.session".to_string(), session_id.to_string());
        labels.insert("autocoder.language".to_string(), adapter.name.clone());

        let config = Config {
            image: Some(adapter.image.clone()),
            cmd: Some(vec!["sleep".to_string(), KEEPALIVE_SECS.to_string()]),
            entrypoint: Some(vec![]),
            user: Some(self.sandbox_user.clone()),
            working_dir: Some(SANDBOX_WORKDIR.to_string()),
            network_disabled: Some(true),
            labels: Some(labels),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(adapter.memory_limit_bytes()),
                memory_swap: Some(adapter.memory_limit_bytes()),
                nano_cpus: Some(adapter.nano_cpus()),
                pids_limit: Some(adapter.pids_limit as i64),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                binds,
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_name = format!("autocoder-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| ExecutionError::Provisioning(format!("container creation failed: {}", e)))?;

        let guard = ContainerGuard::new(&self.docker, container.id.clone());
        let mut sandbox = Sandbox::new(container.id.clone(), adapter);

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecutionError::Provisioning(format!("container start failed: {}", e)))?;

        guard.disarm();
        if let Ok(mut live) = self.live.lock() {
            live.insert(container.id.clone());
        }
        sandbox.state = SandboxState::Idle;

        info!(container_id = %sandbox.id, session_id = %session_id, "Sandbox provisioned");
        Ok(sandbox)
    }

    #[instrument(skip(self, sandbox, adapter, code, cancel), fields(container_id = %sandbox.id, timeout_ms = timeout.as_millis() as u64))]
    async fn run(
        &self,
        sandbox: &mut Sandbox,
        adapter: &LanguageAdapter,
        code: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        if sandbox.is_terminated() {
            return Err(ExecutionError::Runtime(format!("sandbox {} is terminated", sandbox.id)));
        }
        if code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(ExecutionError::Runtime(format!(
                "source code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }

        sandbox.state = SandboxState::Running;
        let source_path = sandbox.source_path(adapter);

        match tokio::time::timeout(WRITE_TIMEOUT, self.write_source(&sandbox.id, &source_path, code)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                sandbox.state = SandboxState::Idle;
                return Err(e);
            }
            Err(_) => {
                self.terminate(sandbox).await;
                return Err(ExecutionError::Runtime("timed out writing source code".to_string()));
            }
        }

        let exec_config = CreateExecOptions {
            cmd: Some(adapter.command_line(&source_path)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(SANDBOX_WORKDIR.to_string()),
            user: Some(self.sandbox_user.clone()),
            ..Default::default()
        };

        let exec = self.docker.create_exec(&sandbox.id, exec_config).await?;
        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let start_time = Instant::now();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut stdout = String::new();
        let mut stderr = String::new();

        let started = self.docker.start_exec(&exec.id, Some(start_config)).await?;
        let StartExecResults::Attached { mut output, .. } = started else {
            sandbox.state = SandboxState::Idle;
            return Err(ExecutionError::Runtime("failed to attach to execution".to_string()));
        };

        let outcome = loop {
            tokio::select! {
                msg = output.next() => match msg {
                    Some(Ok(LogOutput::StdOut { message })) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        stderr.push_str(&format!("\n[Execution error: {}]", e));
                        break ExecOutcome::Finished;
                    }
                    None => break ExecOutcome::Finished,
                },
                _ = &mut deadline => break ExecOutcome::TimedOut,
                _ = cancel.cancelled() => break ExecOutcome::Cancelled,
            }
        };
        drop(output);
        let duration = start_time.elapsed();

        match outcome {
            ExecOutcome::Finished => {
                let inspect = self.docker.inspect_exec(&exec.id).await?;
                let Some(exit_code) = inspect.exit_code else {
                    self.terminate(sandbox).await;
                    return Err(ExecutionError::Runtime("no exit code captured from sandbox".to_string()));
                };

                annotate_exit(exit_code, &mut stderr);
                sandbox.state = SandboxState::Idle;

                debug!(exit_code, duration_ms = duration.as_millis() as u64, "Execution finished");
                Ok(ExecutionResult { stdout, stderr, exit_code, duration })
            }
            ExecOutcome::TimedOut => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Execution timed out - killing sandbox");
                self.terminate(sandbox).await;

                stderr.push_str(&format!("\n[Execution timed out after {}ms]", timeout.as_millis()));
                Err(ExecutionError::Timeout {
                    timeout,
                    partial: ExecutionResult {
                        stdout,
                        stderr,
                        exit_code: TIMEOUT_EXIT_CODE,
                        duration,
                    },
                })
            }
            ExecOutcome::Cancelled => {
                warn!("Execution cancelled - killing sandbox");
                self.terminate(sandbox).await;
                Err(ExecutionError::Cancelled)
            }
        }
    }

    async fn release(&self, sandbox: &mut Sandbox) {
        if sandbox.is_terminated() {
            return;
        }

        self.remove_container(&sandbox.id).await;
        if let Ok(mut live) = self.live.lock() {
            live.remove(&sandbox.id);
        }
        sandbox.state = SandboxState::Terminated;
        debug!(container_id = %sandbox.id, "Sandbox released");
    }

    async fn discard_workspace(&self, session_id: &str) {
        if let Some(dir) = self.workspace.host_dir(session_id) {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dir.display(), error = %e, "Failed to remove session workspace");
                }
            }
        }
    }
}

/// Out-of-resource exit conventions
fn annotate_exit(exit_code: i64, stderr: &mut String) {
    match exit_code {
        137 => stderr.push_str("\n[Sandbox killed: likely OOM or exceeded memory limit]"),
        139 => stderr.push_str("\n[Sandbox killed: segmentation fault]"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageRegistry;

    #[test]
    fn test_sanitize_session_id() {
        assert_eq!(sanitize_session_id("abc-123_x"), "abc-123_x");
        assert_eq!(sanitize_session_id("../../etc"), "______etc");
        assert_eq!(sanitize_session_id(""), "_");
    }

    #[test]
    fn test_workspace_policy_host_dir() {
        let policy = WorkspacePolicy {
            root: Some(PathBuf::from("/srv/ws")),
            mode: 0o770,
        };
        assert_eq!(policy.host_dir("s/1"), Some(PathBuf::from("/srv/ws/s_1")));

        let tmpfs = WorkspacePolicy { root: None, mode: 0o770 };
        assert_eq!(tmpfs.host_dir("s1"), None);
    }

    #[test]
    fn test_annotate_exit() {
        let mut stderr = String::new();
        annotate_exit(137, &mut stderr);
        assert!(stderr.contains("OOM"));

        let mut stderr = String::from("boom");
        annotate_exit(1, &mut stderr);
        assert_eq!(stderr, "boom");
    }

    #[test]
    fn test_sandbox_source_path() {
        let registry = LanguageRegistry::builtin();
        let bash = registry.resolve("bash").unwrap();
        let sandbox = Sandbox::new("c1", &bash);
        assert_eq!(sandbox.source_path(&bash), "/workspace/main.sh");
        assert_eq!(sandbox.state, SandboxState::Creating);
    }

    #[test]
    fn test_sandbox_owner() {
        assert_eq!(sandbox_owner("1000:1000"), Some((1000, Some(1000))));
        assert_eq!(sandbox_owner("65534"), Some((65534, None)));
        assert_eq!(sandbox_owner("nobody"), None);
        assert_eq!(sandbox_owner("1000:staff"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_workspace_mode_and_owner() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let root = tempfile::tempdir().unwrap();
        let owner = std::fs::metadata(root.path()).unwrap();
        let engine = DockerEngine::new(
            WorkspacePolicy {
                root: Some(root.path().to_path_buf()),
                mode: 0o750,
            },
            format!("{}:{}", owner.uid(), owner.gid()),
        )
        .unwrap();

        let dir = engine.prepare_host_dir("s/1").await.unwrap().unwrap();
        assert_eq!(dir, root.path().join("s_1"));

        let meta = std::fs::metadata(&dir).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o750);
        assert_eq!((meta.uid(), meta.gid()), (owner.uid(), owner.gid()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_workspace_rejects_named_user() {
        let root = tempfile::tempdir().unwrap();
        let engine = DockerEngine::new(
            WorkspacePolicy {
                root: Some(root.path().to_path_buf()),
                mode: 0o770,
            },
            "nobody",
        )
        .unwrap();

        let err = engine.prepare_host_dir("s1").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_release_terminated_sandbox_is_noop() {
        let engine = docker_engine();
        let bash = LanguageRegistry::builtin().resolve("bash").unwrap();
        let mut sandbox = Sandbox::new("never-created", &bash);
        sandbox.state = SandboxState::Terminated;

        engine.release(&mut sandbox).await;
        engine.release(&mut sandbox).await;

        assert!(sandbox.is_terminated());
        assert_eq!(engine.live_count(), 0);
    }

    fn docker_engine() -> DockerEngine {
        DockerEngine::new(WorkspacePolicy { root: None, mode: 0o770 }, "1000:1000")
            .expect("Failed to create Docker engine")
    }

    #[tokio::test]
    #[ignore] // Requires Docker with bash:5.2 present
    async fn test_docker_echo() {
        let engine = docker_engine();
        let registry = LanguageRegistry::builtin();
        let bash = registry.resolve("bash").unwrap();
        let cancel = CancellationToken::new();

        let mut sandbox = engine.acquire(&bash, "docker-echo").await.unwrap();
        let result = engine
            .run(&mut sandbox, &bash, "echo bash-ok", Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        engine.release(&mut sandbox).await;
        engine.release(&mut sandbox).await;

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "bash-ok\n");
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Docker with bash:5.2 present
    async fn test_docker_timeout_kills_sandbox() {
        let engine = docker_engine();
        let registry = LanguageRegistry::builtin();
        let bash = registry.resolve("bash").unwrap();
        let cancel = CancellationToken::new();

        let mut sandbox = engine.acquire(&bash, "docker-timeout").await.unwrap();
        let err = engine
            .run(&mut sandbox, &bash, "echo start; sleep 30", Duration::from_millis(500), &cancel)
            .await
            .unwrap_err();

        match err {
            ExecutionError::Timeout { partial, .. } => {
                assert_eq!(partial.exit_code, TIMEOUT_EXIT_CODE);
                assert!(partial.stderr.contains("timed out"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(sandbox.is_terminated());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_missing_image_is_provisioning_error() {
        let engine = docker_engine();
        let mut registry_adapter = (*LanguageRegistry::builtin().resolve("bash").unwrap()).clone();
        registry_adapter.image = "autocoder-missing-image:never".to_string();

        let err = engine.acquire(&registry_adapter, "missing").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Provisioning(_)));
    }
}
