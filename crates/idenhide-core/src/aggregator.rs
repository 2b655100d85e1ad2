//! Result aggregation for batch jobs.
//!
//! The aggregator owns the job's item records. Workers settle records as
//! outcomes land; readers take snapshots at any time. Each write replaces a
//! whole record under the lock, so a snapshot never shows a torn record.

use crate::error::{BatchError, ErrorInfo, Result};
use crate::job::{ItemOutcome, ItemRecord, ItemStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Item counts at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub processing: usize,
    pub pending: usize,
}

impl ItemCounts {
    /// Items in a terminal state.
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn all_settled(&self) -> bool {
        self.processed() == self.total
    }
}

/// Summary statistics derived from the records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items not settled yet (pending or processing).
    pub pending: usize,
    pub elapsed_ms: u64,
    pub throughput_items_per_sec: f64,
    pub average_item_ms: f64,
    pub faces_detected: u64,
    pub plates_detected: u64,
}

impl BatchSummary {
    /// Get success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / self.total as f64) * 100.0
    }

    /// Get completion percentage.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        ((self.succeeded + self.failed) as f64 / self.total as f64) * 100.0
    }

    /// Estimated time remaining, from the average item time and the
    /// remaining count. `None` until an item has settled.
    pub fn eta(&self) -> Option<Duration> {
        if self.succeeded + self.failed == 0 || self.average_item_ms <= 0.0 {
            return None;
        }
        let remaining = self.pending as f64 * self.average_item_ms;
        Some(Duration::from_millis(remaining as u64))
    }
}

/// Index-ordered record store shared by the workers of one job.
#[derive(Debug)]
pub struct ResultAggregator {
    records: RwLock<Vec<ItemRecord>>,
}

impl ResultAggregator {
    /// Takes ownership of the records. Indices are reassigned to positions
    /// so that `index` is always the position in enumeration order.
    pub fn new(mut records: Vec<ItemRecord>) -> Self {
        for (position, record) in records.iter_mut().enumerate() {
            record.index = position;
        }
        Self { records: RwLock::new(records) }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Settles the record at `index`. Idempotent: the latest outcome wins.
    pub fn record(&self, index: usize, outcome: ItemOutcome, elapsed: Option<Duration>) -> Result<ItemRecord> {
        let mut records = self.records.write();
        let current = records
            .get(index)
            .ok_or_else(|| BatchError::NotFound(format!("item index {index}")))?;
        let next = current.settled(outcome, elapsed.map(|d| d.as_millis() as u64));
        records[index] = next.clone();
        Ok(next)
    }

    /// Marks an unsettled record as claimed by a worker and bumps its attempt
    /// count. Returns `None` for settled or unknown indices.
    pub fn mark_processing(&self, index: usize) -> Option<ItemRecord> {
        let mut records = self.records.write();
        let current = records.get(index)?;
        if current.is_settled() {
            return None;
        }
        let mut next = current.clone();
        next.status = ItemStatus::Processing;
        next.attempt += 1;
        records[index] = next.clone();
        Some(next)
    }

    /// Returns records left `Processing` to `Pending`. Returns how many moved.
    pub fn reset_unsettled(&self) -> usize {
        let mut records = self.records.write();
        let mut reset = 0;
        for record in records.iter_mut().filter(|r| r.status == ItemStatus::Processing) {
            let mut next = record.clone();
            next.status = ItemStatus::Pending;
            *record = next;
            reset += 1;
        }
        reset
    }

    /// Fails every unsettled record with `error`. Returns how many settled.
    pub fn settle_pending(&self, error: &BatchError) -> usize {
        let info = ErrorInfo::from(error);
        let mut records = self.records.write();
        let mut settled = 0;
        for record in records.iter_mut().filter(|r| !r.is_settled()) {
            *record = record.settled(ItemOutcome::Failed(info.clone()), None);
            settled += 1;
        }
        settled
    }

    /// Indices not settled yet, ascending.
    pub fn unsettled_indices(&self) -> Vec<usize> {
        self.records.read().iter().filter(|r| !r.is_settled()).map(|r| r.index).collect()
    }

    /// True once any record carries an outcome.
    pub fn has_outcome(&self) -> bool {
        self.records.read().iter().any(ItemRecord::is_settled)
    }

    pub fn get(&self, index: usize) -> Option<ItemRecord> {
        self.records.read().get(index).cloned()
    }

    /// Snapshot of every record, index-ascending.
    pub fn records(&self) -> Vec<ItemRecord> {
        self.records.read().clone()
    }

    pub fn counts(&self) -> ItemCounts {
        let records = self.records.read();
        let mut counts = ItemCounts { total: records.len(), ..ItemCounts::default() };
        for record in records.iter() {
            match record.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Succeeded => counts.succeeded += 1,
                ItemStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Summary computed from the current records.
    pub fn summary(&self, elapsed: Duration) -> BatchSummary {
        let records = self.records.read();
        let mut summary = BatchSummary { total: records.len(), ..BatchSummary::default() };
        let mut timed_items = 0u64;
        let mut timed_total_ms = 0u64;

        for record in records.iter() {
            match record.status {
                ItemStatus::Succeeded => summary.succeeded += 1,
                ItemStatus::Failed => summary.failed += 1,
                ItemStatus::Pending | ItemStatus::Processing => summary.pending += 1,
            }
            if let Some(detection) = &record.detection {
                summary.faces_detected += u64::from(detection.face_count);
                summary.plates_detected += u64::from(detection.plate_count);
            }
            if let Some(ms) = record.elapsed_ms {
                timed_items += 1;
                timed_total_ms += ms;
            }
        }

        summary.elapsed_ms = elapsed.as_millis() as u64;
        let settled = (summary.succeeded + summary.failed) as f64;
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            summary.throughput_items_per_sec = settled / secs;
        }
        if timed_items > 0 {
            summary.average_item_ms = timed_total_ms as f64 / timed_items as f64;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::source::SourceRef;
    use idenhide_abstraction::DetectionResult;
    use std::sync::Arc;

    fn aggregator(n: usize) -> ResultAggregator {
        ResultAggregator::new(
            (0..n)
                .map(|i| ItemRecord::new(i, format!("{i}.jpg"), SourceRef::local(format!("/in/{i}.jpg"))))
                .collect(),
        )
    }

    fn success(faces: u32) -> ItemOutcome {
        ItemOutcome::Succeeded {
            detection: DetectionResult { face_count: faces, ..DetectionResult::default() },
            artifact: None,
        }
    }

    #[test]
    fn test_record_is_idempotent_latest_wins() {
        let agg = aggregator(2);
        agg.record(0, success(1), None).unwrap();
        agg.record(
            0,
            ItemOutcome::Failed(ErrorInfo::new(ErrorKind::ProcessingFailed, "second")),
            None,
        )
        .unwrap();

        let record = agg.get(0).unwrap();
        assert_eq!(record.status, ItemStatus::Failed);
        assert!(record.detection.is_none());
        assert_eq!(agg.counts().failed, 1);
        assert_eq!(agg.counts().succeeded, 0);
    }

    #[test]
    fn test_record_unknown_index() {
        let agg = aggregator(1);
        assert!(matches!(agg.record(5, success(0), None), Err(BatchError::NotFound(_))));
    }

    #[test]
    fn test_mark_processing_skips_settled() {
        let agg = aggregator(2);
        assert_eq!(agg.mark_processing(0).unwrap().attempt, 1);
        agg.record(0, success(0), None).unwrap();
        assert!(agg.mark_processing(0).is_none());
        assert!(agg.mark_processing(9).is_none());
    }

    #[test]
    fn test_reset_and_settle_pending() {
        let agg = aggregator(4);
        agg.record(0, success(0), None).unwrap();
        agg.mark_processing(1);
        agg.mark_processing(2);

        assert_eq!(agg.reset_unsettled(), 2);
        assert_eq!(agg.counts().pending, 3);
        assert_eq!(agg.unsettled_indices(), vec![1, 2, 3]);

        assert_eq!(agg.settle_pending(&BatchError::Cancelled), 3);
        let counts = agg.counts();
        assert!(counts.all_settled());
        assert_eq!(agg.get(3).unwrap().error.unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(agg.get(0).unwrap().status, ItemStatus::Succeeded);
    }

    #[test]
    fn test_summary() {
        let agg = aggregator(4);
        agg.record(0, success(2), Some(Duration::from_millis(100))).unwrap();
        agg.record(1, success(1), Some(Duration::from_millis(300))).unwrap();
        agg.record(
            2,
            ItemOutcome::Failed(ErrorInfo::new(ErrorKind::Timeout, "slow")),
            Some(Duration::from_millis(200)),
        )
        .unwrap();

        let summary = agg.summary(Duration::from_secs(2));
        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.faces_detected, 3);
        assert!((summary.average_item_ms - 200.0).abs() < f64::EPSILON);
        assert!((summary.throughput_items_per_sec - 1.5).abs() < f64::EPSILON);
        assert!((summary.success_rate() - 50.0).abs() < 0.1);
        assert!((summary.percentage() - 75.0).abs() < 0.1);
        assert_eq!(summary.eta(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_records_stay_index_ordered_under_concurrency() {
        let agg = Arc::new(aggregator(64));
        let handles: Vec<_> = (0..64)
            .rev()
            .map(|i| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    agg.mark_processing(i);
                    agg.record(i, success(0), None).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let indices: Vec<usize> = agg.records().iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..64).collect::<Vec<_>>());
        assert!(agg.counts().all_settled());
    }
}
