//! Error types for broker-bench-core

use crate::traits::TerminalStatus;
use thiserror::Error;

/// Core error type covering every failure class the sequencer can observe
#[derive(Error, Debug)]
pub enum LabError {
    /// Configuration rejected at the boundary; no cloud work has started
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The external provisioner subprocess failed
    #[error("provisioner failed: {0}")]
    ProvisionerFailed(String),

    /// A readiness stage exceeded its deadline
    #[error("readiness timeout in stage {stage}: {detail}")]
    ReadinessTimeout {
        /// Stage that timed out (1-based, per the readiness cascade)
        stage: u8,
        /// What was still unhealthy when the deadline expired
        detail: String,
    },

    /// A remote command reached a non-success terminal status
    #[error("remote execution failed on {host}: {status:?}: {stderr}")]
    ExecutionFailed {
        /// Host the command ran on
        host: String,
        /// Terminal status reported by the control plane
        status: TerminalStatus,
        /// Captured standard error (may be empty)
        stderr: String,
    },

    /// A cloud list/describe call failed persistently
    #[error("resource discovery failed: {0}")]
    ResourceDiscoveryFailed(String),

    /// User interrupt or upstream cancellation
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation (bug)
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error on the experiment store or local artefacts
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error on a generated or consumed document
    #[error("serialization error: {0}")]
    Serde(String),
}

impl LabError {
    /// Configuration error with context
    pub fn config(msg: impl Into<String>) -> Self {
        LabError::ConfigInvalid(msg.into())
    }

    /// Internal invariant violation
    pub fn internal(msg: impl Into<String>) -> Self {
        LabError::Internal(msg.into())
    }

    /// Discovery failure with context
    pub fn discovery(msg: impl Into<String>) -> Self {
        LabError::ResourceDiscoveryFailed(msg.into())
    }

    /// Whether this error is the user-interrupt kind
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LabError::Cancelled)
    }

    /// Process exit code for the CLI surface
    pub fn exit_code(&self) -> i32 {
        match self {
            LabError::Cancelled => 130,
            LabError::ConfigInvalid(_) => 2,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for LabError {
    fn from(e: serde_json::Error) -> Self {
        LabError::Serde(e.to_string())
    }
}

impl From<serde_yaml::Error> for LabError {
    fn from(e: serde_yaml::Error) -> Self {
        LabError::Serde(e.to_string())
    }
}

/// Result type alias
pub type LabResult<T> = std::result::Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(LabError::Cancelled.exit_code(), 130);
        assert_eq!(LabError::config("bad").exit_code(), 2);
        assert_eq!(LabError::ProvisionerFailed("boom".into()).exit_code(), 1);
        assert_eq!(
            LabError::ReadinessTimeout {
                stage: 3,
                detail: "broker-1".into()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_is_cancelled() {
        assert!(LabError::Cancelled.is_cancelled());
        assert!(!LabError::internal("bug").is_cancelled());
    }
}
