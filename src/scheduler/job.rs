use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoderunError, Result};
use crate::toolchain::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    /// Only `pending -> running -> {success, error}` is allowed.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

/// Why a terminal job ended in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    InternalError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::CompileError => "CompileError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ResourceExceeded => "ResourceExceeded",
            ErrorKind::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// Terminal result produced by the executor and recorded on the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: JobStatus,
    pub output: String,
    pub exit_code: Option<i32>,
    pub error_kind: Option<ErrorKind>,
    /// Error-stream text from a successful run (warnings and the like).
    pub diagnostics: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(output: String, diagnostics: Option<String>) -> Self {
        Self {
            status: JobStatus::Success,
            output,
            exit_code: Some(0),
            error_kind: None,
            diagnostics,
        }
    }

    pub fn failure(kind: ErrorKind, output: String, exit_code: Option<i32>) -> Self {
        Self {
            status: JobStatus::Error,
            output,
            exit_code,
            error_kind: Some(kind),
            diagnostics: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::failure(ErrorKind::InternalError, message.into(), None)
    }
}

/// Snapshot of one code-execution request. Serializes to the shape returned
/// by `GET /status`; the submitted source never leaves the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub language: Language,
    #[serde(skip_serializing, default)]
    pub source: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<usize>,
}

impl Job {
    pub fn new(language: Language, source: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            language,
            source,
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
            exit_code: None,
            error_kind: None,
            diagnostics: None,
            executed_by: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the job as owned by `worker_id`. Timestamps never run backwards,
    /// even if the wall clock does.
    pub fn start(&mut self, worker_id: usize, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now.max(self.submitted_at));
        self.executed_by = Some(worker_id);
        Ok(())
    }

    pub fn finish(&mut self, outcome: ExecutionOutcome, now: DateTime<Utc>) -> Result<()> {
        if !outcome.status.is_terminal() {
            return Err(CoderunError::Internal(format!(
                "outcome for job {} has non-terminal status {}",
                self.id, outcome.status
            )));
        }
        self.transition(outcome.status)?;
        let floor = self.started_at.unwrap_or(self.submitted_at);
        self.completed_at = Some(now.max(floor));
        self.output = Some(outcome.output);
        self.exit_code = outcome.exit_code;
        self.error_kind = outcome.error_kind;
        self.diagnostics = outcome.diagnostics;
        Ok(())
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(CoderunError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
