//! Iden-Hide Core - batch orchestration for face/plate redaction.
//!
//! This crate turns a folder, a file selection or an object-storage prefix
//! into a batch job, runs every image through an [`ItemProcessor`], and
//! exposes the results as ordered records, summaries, a downloadable archive
//! and presigned links.
//!
//! # Example
//!
//! ```rust,no_run
//! use idenhide_core::{BatchService, Origin, SubmitRequest};
//! # use std::sync::Arc;
//! # async fn run(processor: Arc<dyn idenhide_core::ItemProcessor>) -> idenhide_core::Result<()> {
//! let service = BatchService::new(processor);
//! let job = service
//!     .submit_batch(SubmitRequest::new(Origin::LocalFolder { path: "photos".into() }))
//!     .await?;
//! let status = service.wait(&job).await?;
//! println!("{status}: {:?}", service.summary(&job).await?);
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod aggregator;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod layout;
pub mod packager;
pub mod progress;
pub mod retry;
pub mod service;
pub mod source;

pub use access::{AccessLayer, DEFAULT_PRESIGN_TTL, MAX_PRESIGN_TTL};
pub use aggregator::{BatchSummary, ItemCounts, ResultAggregator};
pub use config::{ConfigError, IdenhideConfig};
pub use credentials::Credentials;
pub use dispatcher::{BatchDispatcher, DispatchContext, DispatcherConfig, JobState};
pub use error::{BatchError, ErrorInfo, ErrorKind, Result};
pub use job::{ArtifactRef, BatchJob, DispatchState, ItemOutcome, ItemRecord, ItemStatus, JobId, JobStatus};
pub use layout::ArtifactLayout;
pub use packager::{ArchiveManifest, ArtifactPackager, ManifestEntry};
pub use progress::{JobProgress, ProgressEvent, ProgressReporter};
pub use retry::{RetryError, RetryFetcher, RetryPolicy, Retryable};
pub use service::{BatchService, JobInfo, SubmitRequest};
pub use source::{
    MemoryBackend, MemoryConnector, Origin, PresignedUrl, RemoteConnector, RemoteLocation, S3Connector,
    SourceBackend, SourceProvider, SourceRef,
};

pub use idenhide_abstraction::{
    DetectionResult, ItemPayload, ItemProcessor, ProcessOptions, ProcessingError, RenderHandle, Strategy,
};
