//! Error types for the fleet query service
//!
//! Every failure is classified into one of a small number of categories so the
//! protocol layer can map it to a status without inspecting messages:
//!
//! - `NotFound` - object or namespace absent
//! - `PermissionDenied` - the caller lacks a grant on a cluster
//! - `Unavailable` - one specific cluster is unreachable or timed out
//! - `Internal` - unexpected transport/decoding failure
//! - `Misconfigured` / `DuplicateClusterName` - server or fleet configuration problems

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fleet operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Object or namespace does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller identity lacks the required grant
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A specific cluster could not be reached (or did not answer in time)
    #[error("cluster {cluster} unavailable: {message}")]
    Unavailable {
        /// Name of the unreachable cluster
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Unexpected transport, decoding or internal failure
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Operation that failed (e.g., "list resource", "rules review")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Two fleet entries share the same cluster name
    #[error("duplicate cluster name: {0}")]
    DuplicateClusterName(String),

    /// Server configuration or install precondition problem
    #[error("misconfigured: {0}")]
    Misconfigured(String),
}

/// Status code handed to the protocol layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Caller is not allowed to perform the operation
    PermissionDenied,
    /// Requested object does not exist
    NotFound,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Stable string form used in response bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Internal => "internal",
        }
    }
}

impl Error {
    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a permission-denied error
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create an unavailable error for a specific cluster
    pub fn unavailable(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unavailable {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            context: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create an internal error naming the operation that failed
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a misconfiguration error
    pub fn misconfigured(msg: impl Into<String>) -> Self {
        Self::Misconfigured(msg.into())
    }

    /// Classify a kube-rs error returned by `operation` against `cluster`.
    ///
    /// 401/403 map to `PermissionDenied`, 404 to `NotFound`. Transport failures
    /// (connection refused, timeouts inside the client stack) become
    /// `Unavailable` for that cluster. Everything else is `Internal`.
    pub fn from_kube(cluster: &str, operation: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(status) if status.code == 401 || status.code == 403 => {
                Self::PermissionDenied(format!("{operation}: {}", status.message))
            }
            kube::Error::Api(status) if status.code == 404 => {
                Self::NotFound(format!("{operation}: {}", status.message))
            }
            kube::Error::Service(_) => Self::unavailable(cluster, format!("{operation}: {err}")),
            _ => Self::internal_with_context(operation, err.to_string()),
        }
    }

    /// Protocol code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::NotFound(_) => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether this error should stop a retry loop immediately
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_) | Error::DuplicateClusterName(_) | Error::Misconfigured(_)
        )
    }
}
