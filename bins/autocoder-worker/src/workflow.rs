/// Fix-Retry Workflow Orchestrator
///
/// **Core Responsibility:**
/// Drive execute -> evaluate -> request fix -> re-execute until the code
/// succeeds, the collaborator gives up, or the retry budget is spent.
///
/// **Step numbering:**
/// Step 1 is an `execute` step. Every fix request opens the next step with
/// kind `fix_request`; when replacement code arrives that same step turns
/// into an `execute` step. A fail -> fix -> pass workflow therefore has two
/// steps, and the steps beyond the first are exactly the fix requests.
///
/// **Guarantees:**
/// - Step numbers are 1..=N, contiguous
/// - Exactly one terminal event (`completed`, `no_fix` or `exhausted`)
/// - Fix requests never exceed the retry budget
/// - Failures never escape as errors; only an unreachable isolation
///   runtime aborts a workflow, before step 1

use crate::engine::ExecutionResult;
use crate::error::{ExecutionError, FixError};
use crate::events::{EventLog, EventSink, EventStream};
use crate::executor::{CodeExecutionService, ExecutionRequest};
use crate::fixer::{FixGenerator, FixProposal, FixRequest};
use autocoder_common::types::{Status, StepKind, WorkflowEvent, WorkflowJob};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const CANCELLED_DETAIL: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Maximum number of fix requests per workflow
    pub retry_budget: u32,
    /// Treat provisioning failures as transient and eligible for a fix
    pub retry_provisioning: bool,
    /// Upper bound on one fix-generation call
    pub fix_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            retry_provisioning: false,
            fix_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("isolation runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}

/// Why an execute step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ExitStatus,
    Timeout,
    Provisioning,
    NotSupported,
    Runtime,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub number: u32,
    pub kind: StepKind,
    pub language: String,
    pub status: Status,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub id: Uuid,
    pub session_id: String,
    pub language: String,
    pub code: String,
    pub timeout: Option<Duration>,
}

impl WorkflowRequest {
    pub fn new(session_id: impl Into<String>, language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            language: language.into(),
            code: code.into(),
            timeout: None,
        }
    }
}

impl From<WorkflowJob> for WorkflowRequest {
    fn from(job: WorkflowJob) -> Self {
        Self {
            id: job.id,
            session_id: job.session_id,
            language: job.language,
            code: job.code,
            timeout: job.timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub id: Uuid,
    pub status: Status,
    pub steps: Vec<Step>,
    /// Last code submitted for execution
    pub final_code: String,
    pub cancelled: bool,
}

impl WorkflowReport {
    /// Number of fix requests issued
    pub fn fix_requests(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }
}

/// A spawned workflow
pub struct WorkflowHandle {
    pub id: Uuid,
    pub events: EventLog,
    pub cancel: CancellationToken,
    pub join: JoinHandle<Result<WorkflowReport, WorkflowError>>,
}

/// Classified outcome of one execute step
struct Attempt {
    result: Option<ExecutionResult>,
    failure: FailureKind,
    error: String,
    retryable: bool,
}

enum FixOutcome {
    Code(String),
    NoFix(String),
    Cancelled,
}

/// Mutable state of one running workflow; sole owner of the event sink
struct Run {
    id: Uuid,
    language: String,
    sink: EventSink,
    steps: Vec<Step>,
}

impl Run {
    fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.sink.append(event) {
            error!(workflow_id = %self.id, error = %e, "Dropped workflow event");
        }
    }

    fn current(&mut self) -> Option<&mut Step> {
        self.steps.last_mut()
    }

    /// Open (or convert the pending fix-request step into) an execute step
    fn begin_execute(&mut self, number: u32) {
        let language = self.language.clone();
        match self.steps.last_mut() {
            Some(step) if step.number == number => {
                step.kind = StepKind::Execute;
                step.status = Status::Executing;
            }
            _ => self.steps.push(Step {
                number,
                kind: StepKind::Execute,
                language: language.clone(),
                status: Status::Executing,
                result: None,
                error: None,
                failure: None,
            }),
        }
        self.emit(
            WorkflowEvent::new(Status::Executing, number)
                .with_kind(StepKind::Execute)
                .with_language(language),
        );
    }

    fn complete(&mut self, number: u32, result: ExecutionResult) {
        let event = WorkflowEvent::new(Status::Completed, number)
            .with_kind(StepKind::Execute)
            .with_language(self.language.clone())
            .with_result(result.to_event_result());
        if let Some(step) = self.current() {
            step.status = Status::Completed;
            step.result = Some(result);
        }
        self.emit(event);
    }

    fn fail(&mut self, number: u32, attempt: &Attempt) {
        let mut event = WorkflowEvent::new(Status::Failed, number)
            .with_kind(StepKind::Execute)
            .with_language(self.language.clone())
            .with_error(attempt.error.clone());
        if let Some(result) = &attempt.result {
            event = event.with_result(result.to_event_result());
        }
        if let Some(step) = self.current() {
            step.status = Status::Failed;
            step.result = attempt.result.clone();
            step.error = Some(attempt.error.clone());
            step.failure = Some(attempt.failure);
        }
        self.emit(event);
    }

    fn begin_fix_request(&mut self, number: u32) {
        self.steps.push(Step {
            number,
            kind: StepKind::FixRequest,
            language: self.language.clone(),
            status: Status::FixRequest,
            result: None,
            error: None,
            failure: None,
        });
        self.emit(
            WorkflowEvent::new(Status::FixRequest, number)
                .with_kind(StepKind::FixRequest)
                .with_language(self.language.clone()),
        );
    }

    /// Terminal transition. Only the workflow status changes for an already
    /// failed step; a pending step takes the terminal status itself.
    fn finish(&mut self, number: u32, status: Status, error: Option<String>) {
        let mut event = WorkflowEvent::new(status, number).with_language(self.language.clone());
        if let Some(step) = self.current() {
            event = event.with_kind(step.kind);
            if step.status != Status::Failed {
                step.status = status;
            }
            if step.error.is_none() {
                step.error = error.clone();
            }
        }
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.emit(event);
    }

    fn into_report(self, status: Status, final_code: String, cancelled: bool) -> WorkflowReport {
        WorkflowReport {
            id: self.id,
            status,
            steps: self.steps,
            final_code,
            cancelled,
        }
    }
}

pub struct WorkflowRunner {
    service: Arc<CodeExecutionService>,
    fixer: Arc<dyn FixGenerator>,
    config: WorkflowConfig,
}

impl WorkflowRunner {
    pub fn new(service: Arc<CodeExecutionService>, fixer: Arc<dyn FixGenerator>, config: WorkflowConfig) -> Self {
        Self { service, fixer, config }
    }

    /// Run a workflow on its own task
    pub fn spawn(self: Arc<Self>, request: WorkflowRequest, cancel: CancellationToken) -> WorkflowHandle {
        let (sink, events) = EventStream::new();
        let id = request.id;
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(request, sink, token).await });

        WorkflowHandle { id, events, cancel, join }
    }

    /// Run a workflow to its terminal status, writing every transition to `sink`.
    #[instrument(
        skip(self, request, sink, cancel),
        fields(workflow_id = %request.id, session_id = %request.session_id, language = %request.language)
    )]
    pub async fn run(
        &self,
        request: WorkflowRequest,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<WorkflowReport, WorkflowError> {
        if let Err(e) = self.service.ping().await {
            error!(error = %e, "Isolation runtime unreachable; workflow not started");
            return Err(WorkflowError::RuntimeUnavailable(e.to_string()));
        }

        let mut run = Run {
            id: request.id,
            language: request.language.clone(),
            sink,
            steps: Vec::new(),
        };
        let mut code = request.code.clone();
        let mut step: u32 = 1;
        let mut fixes_used: u32 = 0;

        info!(retry_budget = self.config.retry_budget, "Workflow started");

        loop {
            run.begin_execute(step);
            if cancel.is_cancelled() {
                return Ok(self.cancelled(run, &request, step, code).await);
            }

            let mut exec_request =
                ExecutionRequest::new(code.clone(), request.language.clone(), request.session_id.clone());
            if let Some(timeout) = request.timeout {
                exec_request = exec_request.with_timeout(timeout);
            }

            let attempt = match self.service.execute(&exec_request, &cancel).await {
                Ok(result) if result.succeeded() => {
                    info!(step, execution_ms = result.duration.as_millis() as u64, "Workflow completed");
                    run.complete(step, result);
                    return Ok(run.into_report(Status::Completed, code, false));
                }
                Ok(result) => Attempt {
                    error: format!("exit code {}", result.exit_code),
                    result: Some(result),
                    failure: FailureKind::ExitStatus,
                    retryable: true,
                },
                Err(ExecutionError::Cancelled) => {
                    return Ok(self.cancelled(run, &request, step, code).await);
                }
                Err(e) => self.classify(e),
            };

            warn!(step, error = %attempt.error, retryable = attempt.retryable, "Execution step failed");
            run.fail(step, &attempt);

            if !attempt.retryable {
                run.finish(step, Status::Exhausted, Some(attempt.error.clone()));
                return Ok(run.into_report(Status::Exhausted, code, false));
            }

            if fixes_used >= self.config.retry_budget {
                info!(step, retry_budget = self.config.retry_budget, "Retry budget exhausted");
                run.finish(
                    step,
                    Status::Exhausted,
                    Some(format!("retry budget of {} exhausted", self.config.retry_budget)),
                );
                return Ok(run.into_report(Status::Exhausted, code, false));
            }

            step += 1;
            fixes_used += 1;
            run.begin_fix_request(step);

            let fix_request = FixRequest {
                failing_code: code.clone(),
                language: request.language.clone(),
                stderr: attempt
                    .result
                    .as_ref()
                    .map(|r| r.stderr.clone())
                    .unwrap_or_else(|| attempt.error.clone()),
                exit_code: attempt.result.as_ref().map(|r| r.exit_code),
                detail: Some(attempt.error.clone()),
            };

            match self.request_fix(fix_request, &cancel).await {
                FixOutcome::Code(fixed) => {
                    info!(step, "Received replacement code");
                    code = fixed;
                }
                FixOutcome::NoFix(reason) => {
                    info!(step, reason = %reason, "No fix available");
                    run.finish(step, Status::NoFix, Some(reason));
                    return Ok(run.into_report(Status::NoFix, code, false));
                }
                FixOutcome::Cancelled => {
                    return Ok(self.cancelled(run, &request, step, code).await);
                }
            }
        }
    }

    fn classify(&self, err: ExecutionError) -> Attempt {
        let error = err.detail();
        match err {
            ExecutionError::Timeout { partial, .. } => Attempt {
                result: Some(partial),
                failure: FailureKind::Timeout,
                error,
                retryable: true,
            },
            ExecutionError::Provisioning(_) => Attempt {
                result: None,
                failure: FailureKind::Provisioning,
                error,
                retryable: self.config.retry_provisioning,
            },
            ExecutionError::NotSupported(_) => Attempt {
                result: None,
                failure: FailureKind::NotSupported,
                error,
                retryable: false,
            },
            ExecutionError::Runtime(_) | ExecutionError::Cancelled => Attempt {
                result: None,
                failure: FailureKind::Runtime,
                error,
                retryable: true,
            },
        }
    }

    /// Call the collaborator on its own task, bounded by the fix timeout and
    /// the workflow's cancellation. Every failure mode becomes `NoFix`.
    async fn request_fix(&self, request: FixRequest, cancel: &CancellationToken) -> FixOutcome {
        let fixer = self.fixer.clone();
        let mut task = tokio::spawn(async move { fixer.propose_fix(&request).await });
        let timeout = self.config.fix_timeout;

        let joined = tokio::select! {
            joined = tokio::time::timeout(timeout, &mut task) => joined,
            _ = cancel.cancelled() => {
                task.abort();
                return FixOutcome::Cancelled;
            }
        };

        match joined {
            Ok(Ok(Ok(FixProposal::Code(code)))) if !code.trim().is_empty() => FixOutcome::Code(code),
            Ok(Ok(Ok(FixProposal::Code(_)))) => {
                FixOutcome::NoFix(FixError::Malformed("empty code".to_string()).to_string())
            }
            Ok(Ok(Ok(FixProposal::NoFix))) => FixOutcome::NoFix("no correction available".to_string()),
            Ok(Ok(Err(e))) => FixOutcome::NoFix(e.to_string()),
            Ok(Err(join_err)) => FixOutcome::NoFix(format!("fix generator failed: {}", join_err)),
            Err(_) => {
                task.abort();
                FixOutcome::NoFix(FixError::Timeout(timeout).to_string())
            }
        }
    }

    async fn cancelled(&self, mut run: Run, request: &WorkflowRequest, step: u32, code: String) -> WorkflowReport {
        warn!(step, "Workflow cancelled");

        // A warm sandbox stays with its session; anything else is released
        let keep_warm = self
            .service
            .resolve(&request.language)
            .map(|adapter| adapter.reuse_workspace)
            .unwrap_or(false);
        if !keep_warm {
            self.service.close_session(&request.session_id).await;
        }

        run.finish(step, Status::Exhausted, Some(CANCELLED_DETAIL.to_string()));
        run.into_report(Status::Exhausted, code, true)
    }
}
