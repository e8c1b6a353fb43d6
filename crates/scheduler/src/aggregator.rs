//! Per-group completion bookkeeping.

use kiln_core::{GroupId, Job, JobId};

/// Tracks the jobs of one group until all of them have a result.
#[derive(Debug)]
pub(crate) struct GroupAggregator {
    group: GroupId,
    queued_count: usize,
    all_succeeded: bool,
    finished_jobs: Vec<Job>,
    apply_results: bool,
}

impl GroupAggregator {
    pub fn new(group: GroupId, apply_results: bool) -> Self {
        Self {
            group,
            queued_count: 0,
            all_succeeded: true,
            finished_jobs: Vec::new(),
            apply_results,
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn queued_count(&self) -> usize {
        self.queued_count
    }

    pub fn apply_results(&self) -> bool {
        self.apply_results
    }

    pub fn set_apply_results(&mut self, apply: bool) {
        self.apply_results = apply;
    }

    pub fn add_queued(&mut self, count: usize) {
        self.queued_count += count;
    }

    /// Take a finalized job. Returns true when the group has no jobs left in flight.
    pub fn record(&mut self, job: Job) -> bool {
        debug_assert_eq!(job.group(), self.group);
        self.all_succeeded &= job.succeeded();
        self.queued_count = self.queued_count.saturating_sub(1);
        self.finished_jobs.push(job);
        self.queued_count == 0
    }

    pub fn is_complete(&self) -> bool {
        self.queued_count == 0
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &Job> {
        self.finished_jobs.iter().filter(|j| !j.succeeded())
    }

    /// Fold another aggregator of the same group into this one. A job with
    /// an id already present (a retry) replaces the earlier attempt.
    pub fn absorb(&mut self, other: GroupAggregator) {
        for job in other.finished_jobs {
            match self.finished_jobs.iter_mut().find(|j| j.id() == job.id()) {
                Some(slot) => *slot = job,
                None => self.finished_jobs.push(job),
            }
        }
        self.all_succeeded = self.finished_jobs.iter().all(Job::succeeded);
    }

    pub fn into_results(self) -> GroupResults {
        GroupResults {
            group: self.group,
            all_succeeded: self.all_succeeded,
            jobs: self.finished_jobs,
        }
    }
}

/// The finalized, caller-visible outcome of a group.
#[derive(Debug, Clone)]
pub struct GroupResults {
    pub group: GroupId,
    /// AND of every job outcome.
    pub all_succeeded: bool,
    /// Finished jobs in completion order.
    pub jobs: Vec<Job>,
}

impl GroupResults {
    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id() == id)
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| !j.succeeded())
    }

    pub fn succeeded_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.succeeded()).count()
    }

    /// Combine two finalized batches of the same group that were staged
    /// before the caller consumed the first one.
    pub(crate) fn merge(&mut self, other: GroupResults) {
        self.all_succeeded &= other.all_succeeded;
        self.jobs.extend(other.jobs);
    }
}
