use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum CoderunError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Source code is empty")]
    EmptySource,

    #[error("Source code is {size} bytes, the limit is {limit} bytes")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("Execution queue is at capacity")]
    QueueFull,

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoderunError {
    /// Stable identifier reported to HTTP clients in the `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            CoderunError::UnsupportedLanguage(_) => "UnsupportedLanguage",
            CoderunError::EmptySource => "EmptySource",
            CoderunError::SourceTooLarge { .. } => "SourceTooLarge",
            CoderunError::QueueFull => "QueueFull",
            CoderunError::JobNotFound(_) => "NotFound",
            CoderunError::InvalidTransition { .. } => "InvalidTransition",
            CoderunError::ShuttingDown => "ShuttingDown",
            CoderunError::Config(_) => "InvalidConfig",
            CoderunError::Io(_) | CoderunError::Internal(_) => "InternalError",
        }
    }

    /// Rejections raised by request validation, before any job exists.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoderunError::UnsupportedLanguage(_)
                | CoderunError::EmptySource
                | CoderunError::SourceTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoderunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_wire_names() {
        assert_eq!(
            CoderunError::UnsupportedLanguage("java".into()).kind(),
            "UnsupportedLanguage"
        );
        assert_eq!(CoderunError::EmptySource.kind(), "EmptySource");
        assert_eq!(CoderunError::QueueFull.kind(), "QueueFull");
        assert_eq!(CoderunError::JobNotFound(Uuid::nil()).kind(), "NotFound");
    }

    #[test]
    fn only_request_problems_are_validation_errors() {
        assert!(CoderunError::EmptySource.is_validation());
        assert!(CoderunError::SourceTooLarge { size: 2, limit: 1 }.is_validation());
        assert!(!CoderunError::QueueFull.is_validation());
        assert!(!CoderunError::Internal("x".into()).is_validation());
    }
}
