//! Error types for endpoint discovery and reconciliation.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for endpoint updater operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or contradictory settings. Raised before any external call.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A discovery backend failed to produce replica addresses.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A resource that must exist was not found.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind, e.g. `Service`.
        kind: &'static str,
        /// Namespace of the resource.
        namespace: String,
        /// Name of the resource.
        name: String,
    },

    /// The record being created already exists.
    #[error("Endpoints {namespace}/{name} already exists")]
    AlreadyExists {
        /// Namespace of the record.
        namespace: String,
        /// Name of the record.
        name: String,
    },

    /// Any other failure reading or writing the record store.
    #[error("store error: {0}")]
    Store(#[from] kube::Error),

    /// An internal invariant did not hold.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl Error {
    /// Create an invalid config error with the given message
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a discovery error with the given message
    #[must_use]
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create an execution failed error with the given message
    #[must_use]
    pub fn execution_failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Create a not found error for the given resource
    #[must_use]
    pub fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether the failure may be transient and worth another attempt.
    ///
    /// Configuration problems and missing resources point at misconfiguration,
    /// and `AlreadyExists` is the trigger for the merge path, so none of them
    /// are retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Discovery(_) | Self::Store(_) | Self::ExecutionFailed(_) => true,
            Self::InvalidConfig(_) | Self::NotFound { .. } | Self::AlreadyExists { .. } => false,
        }
    }
}
