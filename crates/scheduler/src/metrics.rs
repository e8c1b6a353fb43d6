use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Dispatch counters. Written by the dispatch thread, read through
/// [`Scheduler::metrics`](crate::Scheduler::metrics).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Batches handed to a worker (or compiled directly).
    pub batches_sent: u64,
    /// Batches whose response came back.
    pub batches_completed: u64,
    /// Size of the largest batch ever sent.
    pub largest_batch: usize,
    /// Jobs with a result, successful or not.
    pub jobs_completed: u64,
    /// Jobs whose compile reported failure.
    pub jobs_failed: u64,
    /// Worker processes started.
    pub worker_launches: u64,
    /// Batches lost to a crashed, hung or misbehaving worker.
    pub lost_batches: u64,
    /// Jobs put back on the queue after a lost batch.
    pub requeued_jobs: u64,
    /// Jobs failed after exhausting their attempts.
    pub jobs_exhausted: u64,
    /// Rolling mean of batch round-trip time.
    pub avg_batch_duration: Duration,
    /// When the last batch completed.
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    pub fn record_batch_sent(&mut self, size: usize) {
        self.batches_sent += 1;
        self.largest_batch = self.largest_batch.max(size);
    }

    pub fn record_launch(&mut self) {
        self.worker_launches += 1;
    }

    /// Record a completed batch and its round-trip time.
    pub fn record_batch_completed(&mut self, duration: Duration, jobs: usize, failed: usize) {
        self.batches_completed += 1;
        self.jobs_completed += jobs as u64;
        self.jobs_failed += failed as u64;
        self.last_completed_at = Some(Utc::now());

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.batches_completed;
        self.avg_batch_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = self.avg_batch_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }

    pub fn record_lost_batch(&mut self, requeued: usize, exhausted: usize) {
        self.lost_batches += 1;
        self.requeued_jobs += requeued as u64;
        self.jobs_exhausted += exhausted as u64;
        self.jobs_completed += exhausted as u64;
        self.jobs_failed += exhausted as u64;
    }
}
