//! Typed error hierarchy for the pipeline engine.
//!
//! Three top-level enums cover the three layers:
//! - `GatewayError`: failures of a single generation call
//! - `StoreError`: artifact, journal and manifest I/O
//! - `PipelineError`: run submission, registry and phase failures

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::run::{RunId, RunOutcome};

/// Stable, serializable tag for an error, carried in events and manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GatewayTimeout,
    GatewayUnavailable,
    GatewayEmptyResponse,
    Store,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatewayTimeout => "gateway_timeout",
            Self::GatewayUnavailable => "gateway_unavailable",
            Self::GatewayEmptyResponse => "gateway_empty_response",
            Self::Store => "store",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from one call to the generation backend.
///
/// All variants are transient from the engine's point of view; the gateway never
/// retries on its own, the phase executor decides.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Generation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Generation backend unavailable: {0}")]
    Unavailable(String),

    #[error("Generation backend returned an empty response")]
    EmptyResponse,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::GatewayTimeout,
            Self::Unavailable(_) => ErrorKind::GatewayUnavailable,
            Self::EmptyResponse => ErrorKind::GatewayEmptyResponse,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable(_) | Self::EmptyResponse
        )
    }
}

/// Errors from the artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid artifact file name '{0}'")]
    InvalidFileName(String),
}

/// Errors from run submission, the registry and phase execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Run {run_id} already has an active execution")]
    RunAlreadyActive { run_id: RunId },

    #[error("Run {run_id} already finished ({outcome})")]
    RunAlreadyFinished { run_id: RunId, outcome: RunOutcome },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: RunId },

    #[error("Phase {phase} failed in round {round}: {source}")]
    PhaseFailed {
        phase: String,
        round: u32,
        #[source]
        source: GatewayError,
    },

    /// Cancellation observed at a suspension point. Unwinds the sequencer; never
    /// surfaced to callers as a failure.
    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid pipeline: {0}")]
    InvalidTopology(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// The error kind recorded when this error terminates a run.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PhaseFailed { source, .. } => source.kind(),
            Self::Store(_) => ErrorKind::Store,
            _ => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_map_to_distinct_kinds() {
        assert_eq!(
            GatewayError::Timeout { seconds: 600 }.kind(),
            ErrorKind::GatewayTimeout
        );
        assert_eq!(
            GatewayError::Unavailable("refused".into()).kind(),
            ErrorKind::GatewayUnavailable
        );
        assert_eq!(
            GatewayError::EmptyResponse.kind(),
            ErrorKind::GatewayEmptyResponse
        );
    }

    #[test]
    fn all_gateway_errors_are_retryable() {
        assert!(GatewayError::Timeout { seconds: 1 }.is_retryable());
        assert!(GatewayError::Unavailable("x".into()).is_retryable());
        assert!(GatewayError::EmptyResponse.is_retryable());
    }

    #[test]
    fn phase_failed_carries_phase_round_and_kind() {
        let err = PipelineError::PhaseFailed {
            phase: "code_generation".to_string(),
            round: 2,
            source: GatewayError::EmptyResponse,
        };
        assert_eq!(err.kind(), ErrorKind::GatewayEmptyResponse);
        let msg = err.to_string();
        assert!(msg.contains("code_generation"));
        assert!(msg.contains("round 2"));
    }

    #[test]
    fn store_error_converts_into_pipeline_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PipelineError = StoreError::Write {
            path: PathBuf::from("/out/manifest.json"),
            source: io_err,
        }
        .into();
        assert!(matches!(err, PipelineError::Store(StoreError::Write { .. })));
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::GatewayEmptyResponse).unwrap();
        assert_eq!(json, "\"gateway_empty_response\"");
        assert_eq!(ErrorKind::GatewayTimeout.to_string(), "gateway_timeout");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GatewayError::EmptyResponse);
        assert_std_error(&StoreError::InvalidFileName("../x".into()));
        assert_std_error(&PipelineError::Cancelled);
    }
}
