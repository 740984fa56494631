/// Code Execution Service - the façade the orchestrator calls
///
/// **Responsibility:**
/// Given code, a language and a session id, return a structured result.
///
/// **Architecture:**
/// 1. Resolve the language through the registry (config.rs)
/// 2. Hand the call to the session layer (session.rs)
/// 3. The session layer drives the sandbox runtime (engine.rs)
///
/// Unknown languages fail here, before any sandbox is touched.

use crate::config::{LanguageAdapter, LanguageRegistry};
use crate::engine::ExecutionResult;
use crate::error::ExecutionError;
use crate::session::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// One execution request. Stateless value.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    pub session_id: String,
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            session_id: session_id.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct CodeExecutionService {
    registry: Arc<LanguageRegistry>,
    sessions: Arc<SessionManager>,
}

impl CodeExecutionService {
    pub fn new(registry: Arc<LanguageRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self { registry, sessions }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn resolve(&self, language: &str) -> Result<Arc<LanguageAdapter>, ExecutionError> {
        Ok(self.registry.resolve(language)?)
    }

    /// Check that the isolation runtime is reachable
    pub async fn ping(&self) -> Result<(), ExecutionError> {
        self.sessions.runtime().ping().await
    }

    #[instrument(
        skip(self, request, cancel),
        fields(
            session_id = %request.session_id,
            language = %request.language,
            source_size = request.code.len()
        )
    )]
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let adapter = self.resolve(&request.language).map_err(|e| {
            warn!(error = %e, "Rejected execution request");
            e
        })?;

        let result = self
            .sessions
            .execute(&request.session_id, &adapter, &request.code, request.timeout, cancel)
            .await;

        match &result {
            Ok(result) => info!(
                exit_code = result.exit_code,
                execution_ms = result.duration.as_millis() as u64,
                "Execution completed"
            ),
            Err(e) => warn!(error = %e, "Execution did not complete"),
        }

        result
    }

    pub async fn close_session(&self, session_id: &str) -> bool {
        self.sessions.close(session_id).await
    }
}
