//! Caller-facing batch API.
//!
//! [`BatchService`] accepts submissions, owns the in-memory job registry and
//! answers progress, summary, archive and presign queries. Jobs live until
//! they are discarded; nothing is persisted.

use crate::access::AccessLayer;
use crate::aggregator::BatchSummary;
use crate::config::IdenhideConfig;
use crate::credentials::Credentials;
use crate::dispatcher::{BatchDispatcher, DispatchContext, DispatcherConfig, normalize_concurrency};
use crate::error::{BatchError, Result};
use crate::job::{BatchJob, ItemRecord, JobId, JobStatus};
use crate::layout::{ArtifactLayout, safe_relative_name};
use crate::packager::{ArtifactPackager, claim_unique};
use crate::progress::{JobProgress, ProgressEvent};
use crate::source::{Origin, PresignedUrl, RemoteConnector, S3Connector, SourceProvider};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use idenhide_abstraction::{ItemProcessor, ProcessOptions, Strategy};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info};

/// A batch submission.
#[derive(Debug)]
pub struct SubmitRequest {
    pub origin: Origin,
    /// Required when the origin or the output is remote. Consumed at submit.
    pub credentials: Option<Credentials>,
    pub options: ProcessOptions,
    /// Overrides the service's default worker count.
    pub concurrency: Option<usize>,
    /// Overrides the service's default strategy.
    pub strategy: Option<Strategy>,
    /// Overrides the default artifact layout.
    pub output: Option<ArtifactLayout>,
}

impl SubmitRequest {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            credentials: None,
            options: ProcessOptions::default(),
            concurrency: None,
            strategy: None,
            output: None,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ProcessOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: ArtifactLayout) -> Self {
        self.output = Some(output);
        self
    }

    /// Region of the single remote backend the job needs. A remote origin
    /// and a remote output must share it.
    fn remote_region(&self) -> Result<Option<String>> {
        match (&self.origin, &self.output) {
            (Origin::Remote(input), Some(ArtifactLayout::Remote(output))) if input.region != output.region => {
                Err(BatchError::InvalidConfig(format!(
                    "output region {} differs from source region {}",
                    output.region, input.region
                )))
            }
            (Origin::Remote(location), _) | (_, Some(ArtifactLayout::Remote(location))) => {
                Ok(Some(location.region.clone()))
            }
            _ => Ok(None),
        }
    }
}

/// Row of [`BatchService::list_jobs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub origin: String,
    pub status: JobStatus,
    pub processed: usize,
    pub total: usize,
    pub created_at: DateTime<Utc>,
}

struct JobHandle {
    ctx: Arc<DispatchContext>,
    origin: String,
    concurrency: usize,
    created_at: DateTime<Utc>,
    done: watch::Receiver<Option<JobStatus>>,
}

impl JobHandle {
    fn snapshot(&self) -> BatchJob {
        let state = self.ctx.state();
        BatchJob {
            id: self.ctx.job_id.clone(),
            origin: self.origin.clone(),
            items: self.ctx.aggregator.records(),
            concurrency: self.concurrency,
            strategy: state.strategy,
            status: state.status(),
            options: self.ctx.options.clone(),
            created_at: self.created_at,
            finished_at: state.finished_at,
            abort_cause: state.abort_cause,
        }
    }

    fn summary(&self) -> BatchSummary {
        self.ctx.aggregator.summary(self.ctx.elapsed())
    }
}

/// Batch orchestration entry point.
pub struct BatchService {
    processor: Arc<dyn ItemProcessor>,
    connector: Arc<dyn RemoteConnector>,
    config: DispatcherConfig,
    output_dir: PathBuf,
    jobs: RwLock<HashMap<JobId, Arc<JobHandle>>>,
}

impl std::fmt::Debug for BatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchService")
            .field("config", &self.config)
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

impl BatchService {
    /// Service with default settings and an S3 connector.
    pub fn new(processor: Arc<dyn ItemProcessor>) -> Self {
        Self {
            processor,
            connector: Arc::new(S3Connector::new()),
            config: DispatcherConfig::default(),
            output_dir: IdenhideConfig::default().output_dir(),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Service configured from a loaded [`IdenhideConfig`].
    pub fn from_config(config: &IdenhideConfig, processor: Arc<dyn ItemProcessor>) -> Result<Self> {
        config.validate().map_err(|e| BatchError::InvalidConfig(e.to_string()))?;
        let dispatcher = config.dispatcher_config().map_err(|e| BatchError::InvalidConfig(e.to_string()))?;
        let mut connector = S3Connector::new();
        if let Some(endpoint) = &config.storage.endpoint_url {
            connector = connector.with_endpoint_url(endpoint);
        }
        Ok(Self::new(processor)
            .with_connector(Arc::new(connector))
            .with_dispatcher_config(dispatcher)
            .with_output_dir(config.output_dir()))
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = connector;
        self
    }

    #[must_use]
    pub fn with_dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Validates the request, connects to the remote backend if needed,
    /// enumerates the origin and starts dispatch.
    ///
    /// Source and credential failures come back as `BatchAborted(cause)` and
    /// register no job.
    pub async fn submit_batch(&self, mut request: SubmitRequest) -> Result<JobId> {
        request.options.validate().map_err(|e| BatchError::InvalidConfig(e.to_string()))?;
        let concurrency = normalize_concurrency(request.concurrency.unwrap_or(self.config.concurrency))?;
        let strategy = request.strategy.unwrap_or(self.config.strategy);

        let provider = match request.remote_region()? {
            Some(region) => {
                let credentials = request.credentials.take().ok_or_else(|| {
                    BatchError::CredentialsInvalid("remote storage requires credentials".to_string()).aborted()
                })?;
                let backend = self.connector.connect(&region, credentials).await.map_err(BatchError::aborted)?;
                SourceProvider::local_only().with_remote(backend)
            }
            None => SourceProvider::local_only(),
        };
        drop(request.credentials.take());

        let layout = request.output.take().unwrap_or_else(|| match &request.origin {
            Origin::Remote(location) => ArtifactLayout::default_remote_for(location),
            _ => ArtifactLayout::local(self.output_dir.clone()),
        });

        let refs = provider.enumerate(&request.origin).await.map_err(|err| match err {
            BatchError::SourceUnavailable(_) | BatchError::CredentialsInvalid(_) | BatchError::AccessDenied(_) => {
                err.aborted()
            }
            other => other,
        })?;

        let mut used = HashSet::new();
        let records: Vec<ItemRecord> = refs
            .into_iter()
            .filter(|location| !layout.contains(location))
            .enumerate()
            .map(|(index, location)| {
                let name = safe_relative_name(&request.origin.item_name(&location), index);
                let name = claim_unique(&mut used, name, index);
                ItemRecord::new(index, name, location)
            })
            .collect();

        let job_id = JobId::new();
        let total = records.len();
        let ctx = Arc::new(
            DispatchContext::new(job_id.clone(), records, Arc::clone(&self.processor), provider)
                .with_options(request.options)
                .with_layout(layout),
        );

        let dispatcher = BatchDispatcher::new(DispatcherConfig { concurrency, strategy, ..self.config.clone() });
        let (done_tx, done_rx) = watch::channel(None);
        let task = dispatcher.spawn(Arc::clone(&ctx));
        tokio::spawn(async move {
            let status = task.await.unwrap_or(JobStatus::Aborted);
            let _ = done_tx.send(Some(status));
        });

        let origin = request.origin.describe();
        info!(job_id = %job_id, origin = %origin, total, concurrency, strategy = %strategy, "Batch submitted");
        let handle = JobHandle { ctx, origin, concurrency, created_at: Utc::now(), done: done_rx };
        self.jobs.write().await.insert(job_id.clone(), Arc::new(handle));
        Ok(job_id)
    }

    async fn handle(&self, id: &JobId) -> Result<Arc<JobHandle>> {
        self.jobs.read().await.get(id).cloned().ok_or_else(|| BatchError::JobNotFound(id.clone()))
    }

    /// `(processed, total)` with the current status and strategy.
    pub async fn progress(&self, id: &JobId) -> Result<JobProgress> {
        let handle = self.handle(id).await?;
        let state = handle.ctx.state();
        let counts = handle.ctx.aggregator.counts();
        Ok(JobProgress {
            processed: counts.processed(),
            total: counts.total,
            status: state.status(),
            strategy: state.strategy,
        })
    }

    /// Live progress events for a job.
    pub async fn subscribe(&self, id: &JobId) -> Result<broadcast::Receiver<ProgressEvent>> {
        Ok(self.handle(id).await?.ctx.progress.subscribe())
    }

    pub async fn summary(&self, id: &JobId) -> Result<BatchSummary> {
        Ok(self.handle(id).await?.summary())
    }

    /// Read-only snapshot of the job and its records.
    pub async fn snapshot(&self, id: &JobId) -> Result<BatchJob> {
        Ok(self.handle(id).await?.snapshot())
    }

    /// Packages the job into a tar.gz archive.
    pub async fn archive(&self, id: &JobId) -> Result<Bytes> {
        let handle = self.handle(id).await?;
        let job = handle.snapshot();
        let summary = handle.summary();
        ArtifactPackager::new(handle.ctx.provider.clone()).package(&job, &summary).await
    }

    /// Presigned URL for the artifact of item `index`.
    pub async fn presign(&self, id: &JobId, index: usize, ttl: Duration) -> Result<PresignedUrl> {
        let handle = self.handle(id).await?;
        let record = handle
            .ctx
            .aggregator
            .get(index)
            .ok_or_else(|| BatchError::NotFound(format!("item {index} in job {id}")))?;
        let artifact = record
            .artifact_ref
            .ok_or_else(|| BatchError::NotFound(format!("item {index} in job {id} has no artifact")))?;
        AccessLayer::new(handle.ctx.provider.clone()).presign_artifact(&artifact, ttl).await
    }

    /// Requests cancellation. In-flight items finish; the rest settle as
    /// cancelled.
    pub async fn cancel(&self, id: &JobId) -> Result<()> {
        let handle = self.handle(id).await?;
        handle.ctx.cancel.cancel();
        info!(job_id = %id, "Cancellation requested");
        Ok(())
    }

    /// Waits for the job to reach a terminal state.
    pub async fn wait(&self, id: &JobId) -> Result<JobStatus> {
        let mut done = self.handle(id).await?.done.clone();
        let status = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BatchError::JobNotFound(id.clone()))?
            .unwrap_or(JobStatus::Aborted);
        Ok(status)
    }

    /// Removes the job, cancelling it first if it is still running. The
    /// backend client, and with it the credentials, go away with the job.
    pub async fn discard(&self, id: &JobId) -> Result<()> {
        let handle = self.jobs.write().await.remove(id).ok_or_else(|| BatchError::JobNotFound(id.clone()))?;
        handle.ctx.cancel.cancel();
        debug!(job_id = %id, "Job discarded");
        Ok(())
    }

    /// Every registered job, oldest first.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.read().await;
        let mut infos: Vec<JobInfo> = jobs
            .values()
            .map(|handle| {
                let counts = handle.ctx.aggregator.counts();
                JobInfo {
                    id: handle.ctx.job_id.clone(),
                    origin: handle.origin.clone(),
                    status: handle.ctx.state().status(),
                    processed: counts.processed(),
                    total: counts.total,
                    created_at: handle.created_at,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }
}
