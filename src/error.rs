//! Error types for the Pod Tracker Operator
//!
//! Provides structured error types shared by the controller, the node agent,
//! and the store adapters. Classification helpers decide whether a failure is
//! benign, retried in place, or left to the next scheduled cycle.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource modified concurrently: {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Transient store error: {0}")]
    Transient(String),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("Gave up on {name} after {attempts} conflicting status writes")]
    ConflictRetriesExhausted { name: String, attempts: u32 },

    #[error("Unexpected object: expected {expected}, got {found}")]
    UnexpectedObject { expected: String, found: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build a not-found error for a kind/name pair
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Build a conflict error for a kind/name pair
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Translate a kube client error, lifting 404 and 409 into their own variants
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, name),
            kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, name),
            _ => Error::Kube(err),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Timeout { .. }
            | Error::Transient(_)
            | Error::Conflict { .. } => ErrorAction::RequeueWithBackoff,

            // Lost the race repeatedly - let the contending writer settle
            Error::ConflictRetriesExhausted { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(5))
            }

            // Vanished resources and malformed input never heal by retrying
            Error::ResourceNotFound { .. }
            | Error::UnexpectedObject { .. }
            | Error::Configuration(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::Transient(_) => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code >= 500 || ae.code == 429,
            Error::Kube(_) => true,
            _ => false,
        }
    }

    /// Optimistic-concurrency rejection
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// The addressed resource no longer exists
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
