//! Batch job and item records.

use crate::error::{BatchError, ErrorInfo};
use crate::source::SourceRef;
use chrono::{DateTime, Utc};
use idenhide_abstraction::{DetectionResult, ProcessOptions, Strategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identifier for a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not dispatched yet.
    #[default]
    Pending,
    /// Items are being dispatched.
    Running,
    /// Every item settled and at least one failed.
    PartiallyFailed,
    /// Every item succeeded.
    Completed,
    /// Cancellation was requested before the job settled.
    Cancelled,
    /// A systemic failure ended the job.
    Aborted,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::PartiallyFailed => "partially_failed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Lifecycle of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl ItemStatus {
    /// Succeeded and Failed are terminal.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Dispatcher state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum DispatchState {
    #[default]
    Idle,
    Dispatching(Strategy),
    Settling,
    Terminal(JobStatus),
}

impl DispatchState {
    /// Job status implied by this state.
    #[must_use]
    pub fn job_status(self) -> JobStatus {
        match self {
            Self::Idle => JobStatus::Pending,
            Self::Dispatching(_) | Self::Settling => JobStatus::Running,
            Self::Terminal(status) => status,
        }
    }
}

/// Reference to a stored artifact. Never embeds credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Where the artifact was written.
    pub location: SourceRef,
    /// Hex SHA-256 of the stored bytes.
    pub sha256: String,
    /// Size of the stored bytes.
    pub size_bytes: u64,
}

impl ArtifactRef {
    #[must_use]
    pub fn new(location: SourceRef, bytes: &[u8]) -> Self {
        Self { location, sha256: sha256_hex(bytes), size_bytes: bytes.len() as u64 }
    }
}

/// Hex-encoded SHA-256 digest.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Terminal result of one item pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Succeeded { detection: DetectionResult, artifact: Option<ArtifactRef> },
    Failed(ErrorInfo),
}

impl ItemOutcome {
    #[must_use]
    pub fn failed(err: &BatchError) -> Self {
        Self::Failed(ErrorInfo::from(err))
    }
}

/// Tracking state for one item within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Position in enumeration order. Immutable and the sole ordering key.
    pub index: usize,
    /// Display name (file name, or key relative to the remote prefix).
    pub name: String,
    pub source_ref: SourceRef,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// How many times a worker claimed the item.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl ItemRecord {
    #[must_use]
    pub fn new(index: usize, name: impl Into<String>, source_ref: SourceRef) -> Self {
        Self {
            index,
            name: name.into(),
            source_ref,
            status: ItemStatus::Pending,
            detection: None,
            artifact_ref: None,
            error: None,
            attempt: 0,
            elapsed_ms: None,
        }
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.status.is_settled()
    }

    /// Copy of this record carrying `outcome`. Index, name, source and
    /// attempt count are kept.
    #[must_use]
    pub fn settled(&self, outcome: ItemOutcome, elapsed_ms: Option<u64>) -> Self {
        let mut next = Self {
            status: ItemStatus::Pending,
            detection: None,
            artifact_ref: None,
            error: None,
            elapsed_ms,
            ..self.clone()
        };
        match outcome {
            ItemOutcome::Succeeded { detection, artifact } => {
                next.status = ItemStatus::Succeeded;
                next.detection = Some(detection);
                next.artifact_ref = artifact;
            }
            ItemOutcome::Failed(error) => {
                next.status = ItemStatus::Failed;
                next.error = Some(error);
            }
        }
        next
    }
}

/// Read-only snapshot of a batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: JobId,
    /// Human-readable description of the origin.
    pub origin: String,
    /// Records in index order.
    pub items: Vec<ItemRecord>,
    pub concurrency: usize,
    pub strategy: Strategy,
    pub status: JobStatus,
    pub options: ProcessOptions,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the job was aborted, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_cause: Option<ErrorInfo>,
}

impl BatchJob {
    /// Record at `index`, if any.
    #[must_use]
    pub fn item(&self, index: usize) -> Option<&ItemRecord> {
        self.items.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_job_id_is_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert_eq!(JobId::from("job-1").to_string(), "job-1");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Aborted.is_terminal());
        assert_eq!(DispatchState::Dispatching(Strategy::Parallel).job_status(), JobStatus::Running);
        assert_eq!(
            DispatchState::Terminal(JobStatus::Cancelled).job_status(),
            JobStatus::Cancelled
        );
    }

    #[test]
    fn test_settled_keeps_identity() {
        let mut record = ItemRecord::new(3, "a.jpg", SourceRef::local("/tmp/a.jpg"));
        record.attempt = 2;

        let failed = record.settled(
            ItemOutcome::Failed(ErrorInfo::new(ErrorKind::ProcessingFailed, "boom")),
            Some(12),
        );
        assert_eq!(failed.index, 3);
        assert_eq!(failed.attempt, 2);
        assert_eq!(failed.status, ItemStatus::Failed);
        assert_eq!(failed.elapsed_ms, Some(12));

        let succeeded = failed.settled(
            ItemOutcome::Succeeded { detection: DetectionResult::default(), artifact: None },
            Some(5),
        );
        assert_eq!(succeeded.status, ItemStatus::Succeeded);
        assert!(succeeded.error.is_none());
        assert!(succeeded.detection.is_some());
    }

    #[test]
    fn test_artifact_ref_checksum() {
        let artifact = ArtifactRef::new(SourceRef::local("/tmp/out.jpg"), b"abc");
        assert_eq!(
            artifact.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(artifact.size_bytes, 3);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&JobStatus::PartiallyFailed).unwrap();
        assert_eq!(json, "\"partially_failed\"");
    }
}
