//! Progress reporting for batch jobs.
//!
//! Events are broadcast to any number of subscribers. Polling callers read
//! counts from the aggregator through `BatchService::progress`.

use crate::job::{ItemStatus, JobId, JobStatus};
use idenhide_abstraction::Strategy;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Progress event types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Dispatch started under a strategy.
    JobStarted { job_id: JobId, total: usize, strategy: Strategy },
    /// A worker claimed an item.
    ItemStarted { job_id: JobId, index: usize, attempt: u32 },
    /// An item reached a terminal state.
    ItemSettled { job_id: JobId, index: usize, status: ItemStatus, processed: usize, total: usize },
    /// The dispatcher fell back to another strategy.
    StrategyChanged { job_id: JobId, from: Strategy, to: Strategy, reason: String },
    /// The job reached a terminal state.
    JobFinished { job_id: JobId, status: JobStatus },
}

/// Polling snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub processed: usize,
    pub total: usize,
    pub status: JobStatus,
    pub strategy: Strategy,
}

/// Progress reporter for one job.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    total: usize,
    broadcast_tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, total: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(100);
        Self { job_id, total, broadcast_tx }
    }

    /// Subscribes to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.broadcast_tx.subscribe()
    }

    fn send(&self, event: ProgressEvent) {
        debug!(job_id = %self.job_id, "Progress event: {:?}", event);
        let _ = self.broadcast_tx.send(event);
    }

    pub fn emit_job_started(&self, strategy: Strategy) {
        self.send(ProgressEvent::JobStarted { job_id: self.job_id.clone(), total: self.total, strategy });
    }

    pub fn emit_item_started(&self, index: usize, attempt: u32) {
        self.send(ProgressEvent::ItemStarted { job_id: self.job_id.clone(), index, attempt });
    }

    pub fn emit_item_settled(&self, index: usize, status: ItemStatus, processed: usize) {
        self.send(ProgressEvent::ItemSettled {
            job_id: self.job_id.clone(),
            index,
            status,
            processed,
            total: self.total,
        });
    }

    pub fn emit_strategy_changed(&self, from: Strategy, to: Strategy, reason: String) {
        self.send(ProgressEvent::StrategyChanged { job_id: self.job_id.clone(), from, to, reason });
    }

    pub fn emit_job_finished(&self, status: JobStatus) {
        self.send(ProgressEvent::JobFinished { job_id: self.job_id.clone(), status });
    }
}
