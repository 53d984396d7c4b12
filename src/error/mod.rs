//! Error handling module for vidshrink

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::model::{PipelineState, RunId};

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Input could not be decoded (corrupt or unsupported)
    #[error("Failed to load input: {message}")]
    Load { message: String },

    /// Source never reported its metadata within the readiness bound
    #[error("Source metadata not available after {waited:?}")]
    MetadataTimeout { waited: Duration },

    /// Live output of the source cannot be captured or encoded here
    #[error("Capture unavailable: {message}")]
    CaptureUnavailable { message: String },

    /// Assembling the output artifact failed
    #[error("Failed to finalize artifact: {message}")]
    Finalize { message: String },

    /// Another run already holds the input (or this run is already encoding)
    #[error("A run is already active for this input: {run_id}")]
    RunAlreadyActive { run_id: RunId },

    /// No run registered under this id
    #[error("Unknown run: {run_id}")]
    UnknownRun { run_id: RunId },

    /// Operation not allowed in the run's current state
    #[error("Run {run_id} cannot {operation} while {state}")]
    InvalidState {
        run_id: RunId,
        state: PipelineState,
        operation: &'static str,
    },

    /// Configuration value rejected
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Taxonomy bucket reported to callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Load { .. } => ErrorKind::LoadError,
            PipelineError::MetadataTimeout { .. } => ErrorKind::MetadataTimeout,
            PipelineError::CaptureUnavailable { .. } => ErrorKind::CaptureUnavailable,
            PipelineError::Finalize { .. } | PipelineError::Io(_) => ErrorKind::FinalizeError,
            PipelineError::RunAlreadyActive { .. }
            | PipelineError::UnknownRun { .. }
            | PipelineError::InvalidState { .. }
            | PipelineError::Config { .. } => ErrorKind::Usage,
        }
    }

    /// Whether resubmitting the same input may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::MetadataTimeout
    }

    pub(crate) fn finalize(message: impl Into<String>) -> Self {
        PipelineError::Finalize {
            message: message.into(),
        }
    }

    pub(crate) fn capture(message: impl Into<String>) -> Self {
        PipelineError::CaptureUnavailable {
            message: message.into(),
        }
    }

    pub(crate) fn load(message: impl Into<String>) -> Self {
        PipelineError::Load {
            message: message.into(),
        }
    }
}

/// Error categories surfaced in terminal result events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    LoadError,
    MetadataTimeout,
    CaptureUnavailable,
    FinalizeError,
    /// Caller mistake: unknown run, wrong state, bad config
    Usage,
}

/// Clonable, serializable summary of a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for ErrorReport {
    fn from(error: &PipelineError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_metadata_timeout_is_retryable() {
        let timeout = PipelineError::MetadataTimeout {
            waited: Duration::from_secs(10),
        };
        assert!(timeout.is_retryable());
        assert!(!PipelineError::load("corrupt header").is_retryable());
        assert!(!PipelineError::capture("no encoder").is_retryable());
        assert!(!PipelineError::finalize("flush failed").is_retryable());
    }

    #[test]
    fn test_io_errors_surface_as_finalize() {
        let error = PipelineError::from(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        ));
        assert_eq!(error.kind(), ErrorKind::FinalizeError);
    }

    #[test]
    fn test_error_report_keeps_message() {
        let error = PipelineError::load("unsupported codec");
        let report = ErrorReport::from(&error);
        assert_eq!(report.kind, ErrorKind::LoadError);
        assert_eq!(report.message, "Failed to load input: unsupported codec");
    }
}
