// Fix-generation collaborator contract.
//
// The collaborator is external and unreliable: the orchestrator wraps every
// call in a timeout and maps any failure onto `no_fix`.

use crate::error::FixError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Everything the collaborator receives about a failed attempt
#[derive(Debug, Clone, Serialize)]
pub struct FixRequest {
    pub failing_code: String,
    pub language: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    /// Status detail such as `timeout: ...`, so the collaborator can tell
    /// slow code from wrong code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixProposal {
    Code(String),
    NoFix,
}

#[async_trait]
pub trait FixGenerator: Send + Sync {
    async fn propose_fix(&self, request: &FixRequest) -> Result<FixProposal, FixError>;
}

/// Collaborator used when no fix service is configured
pub struct NoFixGenerator;

#[async_trait]
impl FixGenerator for NoFixGenerator {
    async fn propose_fix(&self, _request: &FixRequest) -> Result<FixProposal, FixError> {
        Ok(FixProposal::NoFix)
    }
}

/// Wire response: `{ "code": "..." }` or `{ "no_fix": true }`
#[derive(Debug, Deserialize)]
struct FixResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    no_fix: bool,
}

impl FixResponse {
    fn into_proposal(self) -> Result<FixProposal, FixError> {
        if self.no_fix {
            return Ok(FixProposal::NoFix);
        }
        match self.code {
            Some(code) if !code.trim().is_empty() => Ok(FixProposal::Code(code)),
            Some(_) => Err(FixError::Malformed("empty code".to_string())),
            None => Err(FixError::Malformed("neither code nor no_fix present".to_string())),
        }
    }
}

/// Collaborator reached over HTTP: POSTs the `FixRequest` as JSON
pub struct HttpFixGenerator {
    client: reqwest::Client,
    url: String,
}

impl HttpFixGenerator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FixError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl FixGenerator for HttpFixGenerator {
    async fn propose_fix(&self, request: &FixRequest) -> Result<FixProposal, FixError> {
        debug!(url = %self.url, language = %request.language, "Requesting fix");

        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FixError::Status(status.as_u16()));
        }

        let body: FixResponse = response.json().await?;
        body.into_proposal()
    }
}
