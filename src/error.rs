//! Error types shared across the engine.
//!
//! Every failure carries a semantic [`ErrorKind`]. The planner only inspects
//! kinds at its documented boundaries: fatal kinds end the run with a
//! checkpoint, retryable kinds back off, and everything else burns the
//! current action and continues.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Semantic classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    ExternalToolMissing,
    LlmUnreachable,
    LlmMalformedResponse,
    AnalyzerParseFailed,
    FormatFailed,
    BuildFailed,
    TestFailed,
    Timeout,
    SandboxIo,
    EmbeddingFailed,
    PatchOutOfBounds,
    BaselineRegressed,
    InternalInvariant,
}

impl ErrorKind {
    /// Fatal kinds end the run: the planner writes a checkpoint and exits
    /// non-zero.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigInvalid | ErrorKind::ExternalToolMissing | ErrorKind::InternalInvariant
        )
    }

    /// Retryable kinds get exponential backoff (max 3 attempts) before the
    /// action is treated as a no-op for the round.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::LlmUnreachable | ErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::ExternalToolMissing => "external_tool_missing",
            ErrorKind::LlmUnreachable => "llm_unreachable",
            ErrorKind::LlmMalformedResponse => "llm_malformed_response",
            ErrorKind::AnalyzerParseFailed => "analyzer_parse_failed",
            ErrorKind::FormatFailed => "format_failed",
            ErrorKind::BuildFailed => "build_failed",
            ErrorKind::TestFailed => "test_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SandboxIo => "sandbox_io",
            ErrorKind::EmbeddingFailed => "embedding_failed",
            ErrorKind::PatchOutOfBounds => "patch_out_of_bounds",
            ErrorKind::BaselineRegressed => "baseline_regressed",
            ErrorKind::InternalInvariant => "internal_invariant",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An engine error: a semantic kind plus human-readable detail.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalInvariant, message)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::SandboxIo, e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::new(ErrorKind::InternalInvariant, format!("store: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display_snake_case() {
        assert_eq!(ErrorKind::LlmMalformedResponse.to_string(), "llm_malformed_response");
        assert_eq!(ErrorKind::PatchOutOfBounds.to_string(), "patch_out_of_bounds");
        assert_eq!(ErrorKind::BaselineRegressed.to_string(), "baseline_regressed");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ErrorKind::ConfigInvalid.is_fatal());
        assert!(ErrorKind::ExternalToolMissing.is_fatal());
        assert!(ErrorKind::InternalInvariant.is_fatal());
        assert!(!ErrorKind::BuildFailed.is_fatal());
        assert!(!ErrorKind::Timeout.is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ErrorKind::LlmUnreachable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::LlmMalformedResponse.is_retryable());
        assert!(!ErrorKind::FormatFailed.is_retryable());
    }

    #[test]
    fn test_error_message_includes_kind() {
        let err = Error::new(ErrorKind::BuildFailed, "javac exited 1");
        assert_eq!(err.to_string(), "build_failed: javac exited 1");
    }
}
