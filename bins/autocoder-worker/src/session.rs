/// Execution Sessions - continuity and single-flight per `session_id`
///
/// A session owns at most one live sandbox. Reusable adapters keep it warm
/// between calls; others acquire and release a sandbox per call. Calls for
/// the same session queue on the session's FIFO mutex instead of running in
/// parallel against one working directory.

use crate::config::LanguageAdapter;
use crate::engine::{ExecutionResult, Sandbox, SandboxRuntime};
use crate::error::ExecutionError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            default_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(60),
        }
    }
}

struct SessionState {
    sandbox: Option<Sandbox>,
    steps: u64,
    last_used: Instant,
    closed: bool,
}

pub struct Session {
    state: Mutex<SessionState>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState {
                sandbox: None,
                steps: 0,
                last_used: Instant::now(),
                closed: false,
            }),
        }
    }
}

/// Process-wide `session_id -> Session` registry
pub struct SessionManager {
    runtime: Arc<dyn SandboxRuntime>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SessionConfig) -> Self {
        Self {
            runtime,
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    /// Per-call override, else adapter default, else global default; clamped to the ceiling
    pub fn resolve_timeout(&self, adapter: &LanguageAdapter, requested: Option<Duration>) -> Duration {
        requested
            .or_else(|| adapter.default_timeout())
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout)
    }

    async fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %session_id, "Session created");
                Arc::new(Session::new())
            })
            .clone()
    }

    /// Execute code within a session, creating it on first use.
    #[instrument(skip(self, adapter, code, cancel), fields(language = %adapter.name))]
    pub async fn execute(
        &self,
        session_id: &str,
        adapter: &LanguageAdapter,
        code: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let timeout = self.resolve_timeout(adapter, timeout);

        loop {
            let session = self.get_or_create(session_id).await;
            // Queued behind another call; a cancelled caller must not run
            let mut state = tokio::select! {
                state = session.state.lock() => state,
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            };
            if state.closed {
                // Raced with close or reap; the entry is gone, start a fresh one
                continue;
            }
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            state.steps += 1;
            state.last_used = Instant::now();
            debug!(session_id = %session_id, step = state.steps, "Session execution started");

            let result = if adapter.reuse_workspace {
                self.run_warm(&mut state, session_id, adapter, code, timeout, cancel).await
            } else {
                self.run_cold(&mut state, session_id, adapter, code, timeout, cancel).await
            };

            state.last_used = Instant::now();
            return result;
        }
    }

    async fn run_warm(
        &self,
        state: &mut SessionState,
        session_id: &str,
        adapter: &LanguageAdapter,
        code: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.drop_mismatched_sandbox(state, adapter).await;

        if state.sandbox.is_none() {
            state.sandbox = Some(self.runtime.acquire(adapter, session_id).await?);
        }

        let result = match state.sandbox.as_mut() {
            Some(sandbox) => self.runtime.run(sandbox, adapter, code, timeout, cancel).await,
            None => Err(ExecutionError::Runtime("session sandbox unavailable".to_string())),
        };

        // A sandbox that errored mid-run is in an unknown state; never reuse it
        let discard = result.is_err() || state.sandbox.as_ref().is_some_and(|s| s.is_terminated());
        if discard {
            if let Some(mut sandbox) = state.sandbox.take() {
                debug!(container_id = %sandbox.id, "Discarding warm sandbox after failed run");
                self.runtime.release(&mut sandbox).await;
            }
        }
        result
    }

    async fn run_cold(
        &self,
        state: &mut SessionState,
        session_id: &str,
        adapter: &LanguageAdapter,
        code: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        // A warm sandbox from an earlier reusable adapter must not coexist
        if let Some(mut previous) = state.sandbox.take() {
            self.runtime.release(&mut previous).await;
        }

        let mut sandbox = self.runtime.acquire(adapter, session_id).await?;
        let result = self.runtime.run(&mut sandbox, adapter, code, timeout, cancel).await;
        self.runtime.release(&mut sandbox).await;
        result
    }

    async fn drop_mismatched_sandbox(&self, state: &mut SessionState, adapter: &LanguageAdapter) {
        let stale = state
            .sandbox
            .as_ref()
            .is_some_and(|s| s.is_terminated() || s.language != adapter.name || s.image != adapter.image);

        if stale {
            if let Some(mut sandbox) = state.sandbox.take() {
                debug!(container_id = %sandbox.id, "Releasing sandbox for a different adapter");
                self.runtime.release(&mut sandbox).await;
            }
        }
    }

    /// Close a session: release its sandbox and forget it.
    /// Waits for an in-flight execution of that session to finish.
    pub async fn close(&self, session_id: &str) -> bool {
        let session = self.sessions.lock().await.remove(session_id);
        let Some(session) = session else {
            return false;
        };

        let mut state = session.state.lock().await;
        state.closed = true;
        if let Some(mut sandbox) = state.sandbox.take() {
            self.runtime.release(&mut sandbox).await;
        }
        drop(state);

        self.runtime.discard_workspace(session_id).await;
        info!(session_id = %session_id, "Session closed");
        true
    }

    /// Close every session; used on shutdown
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    /// Reap sessions idle longer than the idle timeout. Sessions with an
    /// execution in flight are skipped. Returns the reaped ids.
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout;
        let mut reaped: Vec<(String, Option<Sandbox>)> = Vec::new();

        {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|id, session| match session.state.try_lock() {
                Ok(mut state) if state.last_used.elapsed() >= idle_timeout => {
                    state.closed = true;
                    reaped.push((id.clone(), state.sandbox.take()));
                    false
                }
                _ => true,
            });
        }

        let mut ids = Vec::with_capacity(reaped.len());
        for (id, sandbox) in reaped {
            if let Some(mut sandbox) = sandbox {
                self.runtime.release(&mut sandbox).await;
            }
            self.runtime.discard_workspace(&id).await;
            info!(session_id = %id, "Idle session reaped");
            ids.push(id);
        }
        ids
    }

    /// Periodically reap idle sessions until `shutdown` fires
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = self.reap_idle().await;
                        if !reaped.is_empty() {
                            debug!(count = reaped.len(), "Reaper pass complete");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Number of executions started in a session
    pub async fn steps(&self, session_id: &str) -> Option<u64> {
        let session = self.sessions.lock().await.get(session_id).cloned()?;
        let state = session.state.lock().await;
        Some(state.steps)
    }

    /// Whether a session currently holds a warm sandbox
    pub async fn has_sandbox(&self, session_id: &str) -> bool {
        let session = self.sessions.lock().await.get(session_id).cloned();
        match session {
            Some(session) => session.state.lock().await.sandbox.is_some(),
            None => false,
        }
    }
}
