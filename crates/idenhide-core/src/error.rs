//! Error types for the batch orchestrator.

use crate::job::JobId;
use idenhide_abstraction::ProcessingError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while orchestrating a batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The origin (folder or bucket prefix) cannot be listed.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Reading an item or artifact failed.
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// The object vanished between listing and fetch.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The external detection/blur capability failed on an item.
    #[error("Processing failed: {0}")]
    ProcessingFailed(#[from] ProcessingError),

    /// A systemic failure ended the job.
    #[error("Batch aborted: {0}")]
    BatchAborted(Box<BatchError>),

    /// The archive container could not be finalized.
    #[error("Packaging failed: {0}")]
    PackagingFailed(String),

    /// The credentials lack permission for the operation.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The remote backend rejected the credentials.
    #[error("Invalid credentials: {0}")]
    CredentialsInvalid(String),

    /// An item pipeline exceeded its soft timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The job was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// Invalid request or configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation does not apply to this kind of reference.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// No job with this ID is registered.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    /// Wraps `self` as the cause of a job abort.
    #[must_use]
    pub fn aborted(self) -> Self {
        match self {
            already @ Self::BatchAborted(_) => already,
            other => Self::BatchAborted(Box::new(other)),
        }
    }

    /// Classification used in records and manifests.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            Self::FetchFailed(_) | Self::Io(_) => ErrorKind::FetchFailed,
            Self::NotFound(_) | Self::JobNotFound(_) => ErrorKind::NotFound,
            Self::ProcessingFailed(_) => ErrorKind::ProcessingFailed,
            Self::BatchAborted(_) => ErrorKind::BatchAborted,
            Self::PackagingFailed(_) => ErrorKind::PackagingFailed,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::CredentialsInvalid(_) => ErrorKind::CredentialsInvalid,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Remote-auth failures abort the whole job and are never retried.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.kind(), ErrorKind::AccessDenied | ErrorKind::CredentialsInvalid)
    }

    /// The innermost cause of a `BatchAborted` chain.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::BatchAborted(inner) => inner.root_cause(),
            other => other,
        }
    }
}

/// Error classification carried by records and manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    FetchFailed,
    NotFound,
    ProcessingFailed,
    BatchAborted,
    PackagingFailed,
    AccessDenied,
    CredentialsInvalid,
    Timeout,
    Cancelled,
    InvalidConfig,
    Unsupported,
}

/// Serializable snapshot of an error attached to an item or a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable cause.
    pub message: String,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl From<&BatchError> for ErrorInfo {
    fn from(err: &BatchError) -> Self {
        Self { kind: err.kind(), message: err.to_string() }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, BatchError>;
