use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Workflow step status. Closed set shared by the worker, the event stream and
/// every presentation layer reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Executing,
    Completed,
    Failed,
    FixRequest,
    NoFix,
    Exhausted,
}

impl Status {
    /// `completed`, `no_fix` and `exhausted` end a workflow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::NoFix | Status::Exhausted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Executing => "executing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::FixRequest => "fix_request",
            Status::NoFix => "no_fix",
            Status::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Execute,
    FixRequest,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Execute => f.write_str("execute"),
            StepKind::FixRequest => f.write_str("fix_request"),
        }
    }
}

/// Captured process output attached to an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

/// One entry of a workflow's event stream.
///
/// Serialized shape:
/// `{ "type": "workflow", "status", "step", "kind"?, "language"?, "result"?, "error"? }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: Status,
    pub step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<StepKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EventResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowEvent {
    pub const TYPE: &'static str = "workflow";

    pub fn new(status: Status, step: u32) -> Self {
        Self {
            event_type: Self::TYPE.to_string(),
            status,
            step,
            kind: None,
            language: None,
            result: None,
            error: None,
        }
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_result(mut self, result: EventResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A workflow submission travelling through the Redis queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: Uuid,
    pub session_id: String,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl WorkflowJob {
    pub fn new(session_id: impl Into<String>, language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            language: language.into(),
            code: code.into(),
            timeout_ms: None,
            submitted_at: Utc::now(),
        }
    }
}
