// Scripted in-memory sandbox runtime for exercising sessions, the execution
// service and the orchestrator without Docker.
//
// Each line of submitted code is one instruction:
//   echo <text>   append "<text>\n" to stdout
//   err <text>    append "<text>\n" to stderr
//   raise <text>  append a traceback line to stderr and exit 1
//   sleep <ms>    wait, honouring timeout and cancellation
//   exit <n>      stop with exit code n
//   fail <text>   runtime error with the sandbox left idle, like a failed
//                 source write

use crate::config::LanguageAdapter;
use crate::engine::{ExecutionResult, Sandbox, SandboxRuntime, SandboxState, TIMEOUT_EXIT_CODE};
use crate::error::ExecutionError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub session_id: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    acquired: usize,
    live: HashMap<String, String>,
    max_live_per_session: HashMap<String, usize>,
    runs: Vec<RunRecord>,
    discarded: Vec<String>,
    missing_images: HashSet<String>,
    unreachable: bool,
}

pub struct ScriptedRuntime {
    inner: Mutex<Inner>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Treat `image` as absent so `acquire` fails with a provisioning error
    pub fn with_missing_image(self, image: &str) -> Self {
        self.inner.lock().unwrap().missing_images.insert(image.to_string());
        self
    }

    pub fn unreachable(self) -> Self {
        self.inner.lock().unwrap().unreachable = true;
        self
    }

    pub fn acquired(&self) -> usize {
        self.inner.lock().unwrap().acquired
    }

    pub fn live(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    pub fn max_live_for_session(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .max_live_per_session
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn runs_for_session(&self, session_id: &str) -> Vec<RunRecord> {
        self.inner
            .lock()
            .unwrap()
            .runs
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.inner.lock().unwrap().discarded.clone()
    }

    fn session_of(&self, sandbox: &Sandbox) -> String {
        self.inner
            .lock()
            .unwrap()
            .live
            .get(&sandbox.id)
            .cloned()
            .unwrap_or_default()
    }

    fn terminate(&self, sandbox: &mut Sandbox) {
        self.inner.lock().unwrap().live.remove(&sandbox.id);
        sandbox.state = SandboxState::Terminated;
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    async fn ping(&self) -> Result<(), ExecutionError> {
        if self.inner.lock().unwrap().unreachable {
            return Err(ExecutionError::Runtime("runtime unreachable".to_string()));
        }
        Ok(())
    }

    async fn acquire(&self, adapter: &LanguageAdapter, session_id: &str) -> Result<Sandbox, ExecutionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.missing_images.contains(&adapter.image) {
            return Err(ExecutionError::Provisioning(format!(
                "image '{}' is not available locally",
                adapter.image
            )));
        }

        inner.next_id += 1;
        inner.acquired += 1;
        let id = format!("scripted-{}", inner.next_id);
        inner.live.insert(id.clone(), session_id.to_string());

        let live_for_session = inner.live.values().filter(|s| s.as_str() == session_id).count();
        let max = inner.max_live_per_session.entry(session_id.to_string()).or_insert(0);
        *max = (*max).max(live_for_session);

        let mut sandbox = Sandbox::new(id, adapter);
        sandbox.state = SandboxState::Idle;
        Ok(sandbox)
    }

    async fn run(
        &self,
        sandbox: &mut Sandbox,
        _adapter: &LanguageAdapter,
        code: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        if sandbox.is_terminated() {
            return Err(ExecutionError::Runtime("sandbox terminated".to_string()));
        }
        sandbox.state = SandboxState::Running;

        let session_id = self.session_of(sandbox);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0;

        for line in code.lines() {
            let (op, arg) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));
            match op {
                "echo" => stdout.push_str(&format!("{}\n", arg)),
                "err" => stderr.push_str(&format!("{}\n", arg)),
                "raise" => {
                    stderr.push_str(&format!("Traceback (most recent call last):\n{}\n", arg));
                    exit_code = 1;
                    break;
                }
                "fail" => {
                    sandbox.state = SandboxState::Idle;
                    return Err(ExecutionError::Runtime(arg.to_string()));
                }
                "exit" => {
                    exit_code = arg.trim().parse().unwrap_or(1);
                    break;
                }
                "sleep" => {
                    let ms: u64 = arg.trim().parse().unwrap_or(0);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            self.terminate(sandbox);
                            stderr.push_str(&format!("\n[Execution timed out after {}ms]", timeout.as_millis()));
                            return Err(ExecutionError::Timeout {
                                timeout,
                                partial: ExecutionResult {
                                    stdout,
                                    stderr,
                                    exit_code: TIMEOUT_EXIT_CODE,
                                    duration: started.elapsed(),
                                },
                            });
                        }
                        _ = cancel.cancelled() => {
                            self.terminate(sandbox);
                            return Err(ExecutionError::Cancelled);
                        }
                    }
                }
                "" => {}
                other => {
                    stderr.push_str(&format!("{}: command not found\n", other));
                    exit_code = 127;
                    break;
                }
            }
        }

        sandbox.state = SandboxState::Idle;
        self.inner.lock().unwrap().runs.push(RunRecord {
            session_id,
            started,
            finished: Instant::now(),
        });

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
            duration: started.elapsed(),
        })
    }

    async fn release(&self, sandbox: &mut Sandbox) {
        if sandbox.is_terminated() {
            return;
        }
        self.terminate(sandbox);
    }

    async fn discard_workspace(&self, session_id: &str) {
        self.inner.lock().unwrap().discarded.push(session_id.to_string());
    }
}
