//! State shared between the façade and the dispatch thread.
//!
//! Everything here sits behind one mutex. Critical sections only move jobs
//! and adjust counters; serialization and process I/O happen outside.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::warn;

use kiln_core::{GroupId, Job};

use crate::aggregator::GroupAggregator;
use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;

#[derive(Debug, Default)]
pub(crate) struct SharedState {
    /// Jobs waiting for a worker slot.
    pub queue: VecDeque<Job>,
    /// Groups with jobs still in flight.
    pub groups: HashMap<GroupId, GroupAggregator>,
    /// Groups whose jobs are all finalized, waiting for the caller.
    pub pending_finalize: VecDeque<GroupAggregator>,
    /// Jobs enqueued but not yet finalized.
    pub num_outstanding_jobs: usize,
    /// Set when the dispatch loop dies.
    pub fatal: Option<String>,
}

impl SharedState {
    /// Queue jobs and register them with their groups.
    pub fn enqueue(&mut self, jobs: Vec<Job>, apply_results: bool) {
        for job in jobs {
            let group = job.group();
            let agg = self
                .groups
                .entry(group)
                .or_insert_with(|| GroupAggregator::new(group, apply_results));
            agg.set_apply_results(apply_results);
            agg.add_queued(1);
            self.queue.push_back(job);
            self.num_outstanding_jobs += 1;
        }
    }

    /// Put jobs from a lost batch back at the front, keeping their order.
    pub fn requeue_front(&mut self, jobs: Vec<Job>) {
        for job in jobs.into_iter().rev() {
            self.queue.push_front(job);
        }
    }

    /// Deliver a completed job to its group.
    pub fn commit(&mut self, mut job: Job) {
        job.mark_finalized();
        self.num_outstanding_jobs = self.num_outstanding_jobs.saturating_sub(1);

        let group = job.group();
        let complete = match self.groups.get_mut(&group) {
            Some(agg) => agg.record(job),
            None => {
                warn!(group = %group, job = %job.id(), "completed job has no group aggregator");
                false
            }
        };
        if complete {
            if let Some(agg) = self.groups.remove(&group) {
                self.pending_finalize.push_back(agg);
            }
        }
    }

    /// Remove completed groups matching `keep`, preserving completion order.
    pub fn take_pending(&mut self, mut keep: impl FnMut(GroupId) -> bool) -> Vec<GroupAggregator> {
        let mut taken = Vec::new();
        let mut rest = VecDeque::with_capacity(self.pending_finalize.len());
        for agg in self.pending_finalize.drain(..) {
            if keep(agg.group()) {
                taken.push(agg);
            } else {
                rest.push_back(agg);
            }
        }
        self.pending_finalize = rest;
        taken
    }
}

/// Shared handle owned jointly by the façade and the dispatch thread.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub state: Mutex<SharedState>,
    /// Signalled when jobs are queued or shutdown is requested.
    pub work_available: Condvar,
    /// Signalled when the dispatch thread commits completed jobs.
    pub jobs_committed: Condvar,
    pub shutdown: AtomicBool,
    pub interactive: AtomicBool,
    pub metrics: RwLock<SchedulerMetrics>,
}

impl Shared {
    /// Lock for a façade call. Fails once the dispatch loop has died.
    pub fn lock(&self) -> Result<MutexGuard<'_, SharedState>, SchedulerError> {
        let poisoned = self.state.is_poisoned();
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = &guard.fatal {
            return Err(SchedulerError::DispatchFailed(reason.clone()));
        }
        if poisoned {
            return Err(SchedulerError::LockPoisoned("shared scheduler state".into()));
        }
        Ok(guard)
    }

    /// Lock without the health check, for approximate reads.
    pub fn lock_relaxed(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a fatal dispatch failure and wake everyone waiting on it.
    pub fn record_fatal(&self, reason: String) {
        let mut state = self.lock_relaxed();
        if state.fatal.is_none() {
            state.fatal = Some(reason);
        }
        drop(state);
        self.work_available.notify_all();
        self.jobs_committed.notify_all();
    }

    pub fn update_metrics(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        if let Ok(mut m) = self.metrics.write() {
            f(&mut m);
        }
    }

    pub fn metrics_snapshot(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}
