//! Batch dispatcher.
//!
//! Runs the items of one job through the [`ItemProcessor`], first with a pool
//! of workers and, if the pool cannot start or breaks before any item has an
//! outcome, once more one item at a time. The dispatcher is the only writer of
//! the job state; callers read it through [`DispatchContext::state`].

use crate::aggregator::ResultAggregator;
use crate::error::{BatchError, ErrorInfo, Result};
use crate::job::{ArtifactRef, DispatchState, ItemOutcome, ItemRecord, JobId, JobStatus};
use crate::layout::{ARTIFACT_CONTENT_TYPE, ArtifactLayout};
use crate::progress::ProgressReporter;
use crate::retry::{RetryError, RetryFetcher, RetryPolicy};
use crate::source::SourceProvider;
use chrono::{DateTime, Utc};
use idenhide_abstraction::{ItemPayload, ItemProcessor, ProcessOptions, ProcessingError, Strategy};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of parallel workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Upper bound on parallel workers; larger requests are clamped.
pub const MAX_CONCURRENCY: usize = 8;

/// Default soft timeout for one item pipeline.
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(300);

/// Validates a requested worker count. Zero is rejected, values above
/// [`MAX_CONCURRENCY`] are clamped.
pub fn normalize_concurrency(requested: usize) -> Result<usize> {
    match requested {
        0 => Err(BatchError::InvalidConfig("concurrency must be at least 1".to_string())),
        n if n > MAX_CONCURRENCY => {
            warn!(requested = n, max = MAX_CONCURRENCY, "Clamping concurrency");
            Ok(MAX_CONCURRENCY)
        }
        n => Ok(n),
    }
}

/// Configuration for the batch dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker count for the parallel strategy.
    pub concurrency: usize,
    /// Strategy tried first.
    pub strategy: Strategy,
    /// Soft timeout per item pipeline.
    pub item_timeout: Duration,
    /// Retry policy for rendered-artifact fetches.
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            strategy: Strategy::Parallel,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// Config with a validated worker count.
    pub fn with_concurrency(concurrency: usize) -> Result<Self> {
        Ok(Self { concurrency: normalize_concurrency(concurrency)?, ..Self::default() })
    }
}

/// Mutable job-level state owned by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct JobState {
    pub dispatch: DispatchState,
    pub strategy: Strategy,
    pub abort_cause: Option<ErrorInfo>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall time from dispatch start to terminal state.
    pub elapsed: Option<Duration>,
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        self.dispatch.job_status()
    }
}

/// Everything the workers of one job share.
pub struct DispatchContext {
    pub job_id: JobId,
    pub aggregator: Arc<ResultAggregator>,
    pub provider: SourceProvider,
    pub processor: Arc<dyn ItemProcessor>,
    pub options: ProcessOptions,
    pub layout: ArtifactLayout,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
    state: RwLock<JobState>,
    abort: Mutex<Option<BatchError>>,
    started: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("job_id", &self.job_id)
            .field("items", &self.aggregator.len())
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl DispatchContext {
    pub fn new(
        job_id: JobId,
        records: Vec<ItemRecord>,
        processor: Arc<dyn ItemProcessor>,
        provider: SourceProvider,
    ) -> Self {
        let total = records.len();
        Self {
            progress: ProgressReporter::new(job_id.clone(), total),
            job_id,
            aggregator: Arc::new(ResultAggregator::new(records)),
            provider,
            processor,
            options: ProcessOptions::default(),
            layout: ArtifactLayout::default(),
            cancel: CancellationToken::new(),
            state: RwLock::new(JobState::default()),
            abort: Mutex::new(None),
            started: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ProcessOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: ArtifactLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Snapshot of the job-level state.
    pub fn state(&self) -> JobState {
        self.state.read().clone()
    }

    /// Time since dispatch started, frozen once the job is terminal.
    pub fn elapsed(&self) -> Duration {
        let state = self.state.read();
        if let Some(elapsed) = state.elapsed {
            return elapsed;
        }
        self.started.lock().map_or(Duration::ZERO, |started| started.elapsed())
    }

    fn set_dispatch(&self, dispatch: DispatchState) {
        let mut state = self.state.write();
        if let DispatchState::Dispatching(strategy) = dispatch {
            state.strategy = strategy;
        }
        state.dispatch = dispatch;
    }

    /// Records the first systemic failure; later ones are ignored.
    fn abort_with(&self, cause: BatchError) {
        let mut abort = self.abort.lock();
        if abort.is_none() {
            error!(job_id = %self.job_id, error = %cause, "Aborting job");
            *abort = Some(cause.aborted());
        }
    }

    fn is_aborting(&self) -> bool {
        self.abort.lock().is_some()
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.is_aborting()
    }
}

/// Runs the items of a job to a terminal state.
#[derive(Debug, Clone)]
pub struct BatchDispatcher {
    config: DispatcherConfig,
    fetcher: RetryFetcher,
}

impl BatchDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let fetcher = RetryFetcher::new(config.retry.clone());
        Self { config, fetcher }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs the job on the runtime. A panic in the dispatch loop itself
    /// aborts the job so that every record still ends terminal.
    pub fn spawn(self, ctx: Arc<DispatchContext>) -> JoinHandle<JobStatus> {
        tokio::spawn(async move {
            let run = {
                let this = self.clone();
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { this.run(ctx).await })
            };
            match run.await {
                Ok(status) => status,
                Err(join_err) => {
                    ctx.abort_with(BatchError::ProcessingFailed(ProcessingError::Other(format!(
                        "dispatcher failed: {join_err}"
                    ))));
                    self.finish(&ctx).await
                }
            }
        })
    }

    /// Dispatches every unsettled item and settles the job.
    pub async fn run(&self, ctx: Arc<DispatchContext>) -> JobStatus {
        *ctx.started.lock() = Some(Instant::now());
        info!(
            job_id = %ctx.job_id,
            total = ctx.aggregator.len(),
            strategy = %self.config.strategy,
            concurrency = self.config.concurrency,
            "Starting batch dispatch"
        );

        let mut strategy = self.config.strategy;
        if strategy == Strategy::Parallel && !ctx.should_stop() {
            match self.run_parallel(&ctx).await {
                Ok(()) => {}
                Err(cause) if !ctx.should_stop() => {
                    warn!(
                        job_id = %ctx.job_id,
                        error = %cause,
                        "Parallel dispatch failed before any outcome, falling back to sequential"
                    );
                    let reset = ctx.aggregator.reset_unsettled();
                    debug!(job_id = %ctx.job_id, reset, "Returned claimed items to pending");
                    ctx.progress.emit_strategy_changed(Strategy::Parallel, Strategy::Sequential, cause.to_string());
                    strategy = Strategy::Sequential;
                }
                Err(cause) => {
                    debug!(job_id = %ctx.job_id, error = %cause, "Parallel dispatch stopped");
                }
            }
        }

        if strategy == Strategy::Sequential && !ctx.should_stop() {
            if let Err(cause) = self.run_sequential(&ctx).await {
                ctx.abort_with(cause);
            }
        }

        self.finish(&ctx).await
    }

    async fn run_parallel(&self, ctx: &Arc<DispatchContext>) -> Result<()> {
        let concurrency = self.config.concurrency.max(1);
        ctx.processor.prepare(Strategy::Parallel, concurrency).await?;
        ctx.set_dispatch(DispatchState::Dispatching(Strategy::Parallel));
        ctx.progress.emit_job_started(Strategy::Parallel);

        let queue = Arc::new(ctx.aggregator.unsettled_indices());
        let cursor = Arc::new(AtomicUsize::new(0));
        let stop = ctx.cancel.child_token();
        let worker_count = concurrency.min(queue.len()).max(1);

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let this = self.clone();
            let ctx = Arc::clone(ctx);
            let queue = Arc::clone(&queue);
            let cursor = Arc::clone(&cursor);
            let stop = stop.clone();
            workers.spawn(async move { this.worker(worker_id, &ctx, &queue, &cursor, &stop).await });
        }
        debug!(job_id = %ctx.job_id, workers = worker_count, queued = queue.len(), "Worker pool started");

        let mut broken: Option<BatchError> = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(join_err) = joined {
                error!(job_id = %ctx.job_id, error = %join_err, "Worker task failed");
                if broken.is_none() && !ctx.aggregator.has_outcome() {
                    broken = Some(BatchError::ProcessingFailed(ProcessingError::Other(format!(
                        "worker pool failed: {join_err}"
                    ))));
                    stop.cancel();
                }
            }
        }

        if let Some(cause) = broken {
            return Err(cause);
        }

        if !ctx.should_stop() {
            // A worker died mid-item after other items already settled.
            let stranded = ctx.aggregator.settle_pending(&BatchError::ProcessingFailed(
                ProcessingError::Other("worker terminated before settling the item".to_string()),
            ));
            if stranded > 0 {
                warn!(job_id = %ctx.job_id, stranded, "Settled items left behind by a failed worker");
            }
        }
        Ok(())
    }

    async fn worker(
        &self,
        worker_id: usize,
        ctx: &DispatchContext,
        queue: &[usize],
        cursor: &AtomicUsize,
        stop: &CancellationToken,
    ) {
        loop {
            if stop.is_cancelled() || ctx.is_aborting() {
                break;
            }
            let position = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(&index) = queue.get(position) else {
                break;
            };
            debug!(job_id = %ctx.job_id, worker_id, index, "Worker claimed item");
            self.run_item(ctx, index).await;
        }
    }

    async fn run_sequential(&self, ctx: &DispatchContext) -> Result<()> {
        ctx.processor.prepare(Strategy::Sequential, 1).await?;
        ctx.set_dispatch(DispatchState::Dispatching(Strategy::Sequential));
        ctx.progress.emit_job_started(Strategy::Sequential);

        for index in ctx.aggregator.unsettled_indices() {
            if ctx.should_stop() {
                break;
            }
            self.run_item(ctx, index).await;
        }
        Ok(())
    }

    async fn run_item(&self, ctx: &DispatchContext, index: usize) {
        let Some(record) = ctx.aggregator.mark_processing(index) else {
            return;
        };
        ctx.progress.emit_item_started(index, record.attempt);
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.config.item_timeout, self.pipeline(ctx, &record)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(job_id = %ctx.job_id, index, name = %record.name, error = %err, "Item failed");
                let outcome = ItemOutcome::failed(&err);
                if err.is_auth_failure() {
                    ctx.abort_with(err);
                }
                outcome
            }
            Err(_) => {
                warn!(job_id = %ctx.job_id, index, name = %record.name, "Item timed out");
                ItemOutcome::failed(&BatchError::Timeout(self.config.item_timeout))
            }
        };

        match ctx.aggregator.record(index, outcome, Some(started.elapsed())) {
            Ok(settled) => {
                let processed = ctx.aggregator.counts().processed();
                debug!(
                    job_id = %ctx.job_id,
                    index,
                    status = ?settled.status,
                    elapsed_ms = settled.elapsed_ms.unwrap_or_default(),
                    "Item settled"
                );
                ctx.progress.emit_item_settled(index, settled.status, processed);
            }
            Err(err) => error!(job_id = %ctx.job_id, index, error = %err, "Failed to record outcome"),
        }
    }

    /// fetch -> process -> optional render + retrying fetch -> store artifact.
    async fn pipeline(&self, ctx: &DispatchContext, record: &ItemRecord) -> Result<ItemOutcome> {
        let bytes = ctx.provider.fetch_bytes(&record.source_ref).await?;
        let payload = ItemPayload::new(record.name.clone(), bytes);
        let detection = ctx.processor.process(&payload, &ctx.options).await?;

        if !ctx.options.render_blur {
            return Ok(ItemOutcome::Succeeded { detection, artifact: None });
        }

        let handle = ctx.processor.render_blur(&payload, &detection, &ctx.options).await?;
        let processor = &ctx.processor;
        let handle = &handle;
        let rendered = self
            .fetcher
            .fetch(&ctx.cancel, move |attempt| {
                debug!(job_id = %ctx.job_id, index = record.index, attempt, "Fetching rendered artifact");
                processor.fetch_rendered(handle)
            })
            .await
            .map_err(|err| match err {
                RetryError::Cancelled => BatchError::Cancelled,
                RetryError::Failed { last, .. } => BatchError::ProcessingFailed(last),
            })?;

        let target = ctx.layout.artifact_ref(&ctx.job_id, record.index, &record.name);
        ctx.provider.store(&target, rendered.clone(), ARTIFACT_CONTENT_TYPE).await?;
        Ok(ItemOutcome::Succeeded { detection, artifact: Some(ArtifactRef::new(target, &rendered)) })
    }

    async fn finish(&self, ctx: &DispatchContext) -> JobStatus {
        ctx.set_dispatch(DispatchState::Settling);

        let abort = ctx.abort.lock().take();
        let status = if let Some(cause) = abort {
            let settled = ctx.aggregator.settle_pending(&cause);
            ctx.state.write().abort_cause = Some(ErrorInfo::from(&cause));
            debug!(job_id = %ctx.job_id, settled, "Settled remaining items after abort");
            JobStatus::Aborted
        } else if ctx.cancel.is_cancelled() {
            let settled = ctx.aggregator.settle_pending(&BatchError::Cancelled);
            debug!(job_id = %ctx.job_id, settled, "Settled unclaimed items after cancel");
            JobStatus::Cancelled
        } else if ctx.aggregator.counts().failed > 0 {
            JobStatus::PartiallyFailed
        } else {
            JobStatus::Completed
        };

        let elapsed = ctx.elapsed();
        {
            let mut state = ctx.state.write();
            state.dispatch = DispatchState::Terminal(status);
            state.finished_at = Some(Utc::now());
            state.elapsed = Some(elapsed);
        }

        let counts = ctx.aggregator.counts();
        ctx.progress.emit_job_finished(status);
        info!(
            job_id = %ctx.job_id,
            status = %status,
            succeeded = counts.succeeded,
            failed = counts.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch finished"
        );
        status
    }
}
