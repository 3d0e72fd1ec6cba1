//! Central error types for the Agones load balancer operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Message fragment the API server returns when etcd leadership moved mid-request
const LEADER_CHANGED: &str = "leader changed";

/// Central error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A deterministically named resource that must exist does not.
    /// Indicates a logic or schema defect, never an environmental one.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// A reference annotation or label is missing or malformed
    #[error("Missing reference {key} on {kind}/{name}")]
    MissingReference {
        kind: String,
        name: String,
        key: String,
    },

    /// A sub-operation did not finish within its time budget
    #[error("Operation {operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the store reported a condition that a fresh read-modify-write
    /// attempt can resolve: version conflict (409), expired watch bookmark
    /// (410) or a leadership change on the API server side.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(response)) => {
                response.code == 409
                    || response.code == 410
                    || response.message.contains(LEADER_CHANGED)
            }
            _ => false,
        }
    }

    /// Check if this error type should trigger a quick retry by the controller
    pub fn is_retriable(&self) -> bool {
        self.is_transient() || matches!(self, Error::KubeError(_) | Error::Timeout { .. })
    }
}
