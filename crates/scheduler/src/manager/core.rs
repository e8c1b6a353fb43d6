use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use kiln_core::{GroupId, Job, JobId};

use crate::aggregator::GroupResults;
use crate::config::SchedulerConfig;
use crate::dispatch::{Backend, DispatchThread};
use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::retry::RetryPrompt;
use crate::shared::Shared;

use super::{ResultHandler, SchedulerBuilder};

/// Schedules jobs onto worker processes and hands back finished groups.
///
/// Owns the dispatch thread: dropping the scheduler stops the thread and
/// kills every worker, discarding in-flight work. Call
/// [`Scheduler::shutdown`] to drain first.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) shared: Arc<Shared>,
    dispatch: Option<JoinHandle<()>>,
    /// Groups always drained by a blocking results pass.
    pub(super) critical: HashSet<GroupId>,
    /// Finalized groups not handed to the result handler, in completion order.
    pub(super) staged: Vec<GroupResults>,
    pub(super) result_handler: Option<ResultHandler>,
    pub(super) retry_prompt: Option<Box<dyn RetryPrompt>>,
}

impl Scheduler {
    /// Start a scheduler with default collaborators.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        SchedulerBuilder::new(config).start()
    }

    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub(super) fn start(
        config: SchedulerConfig,
        backend: Backend,
        result_handler: Option<ResultHandler>,
        retry_prompt: Option<Box<dyn RetryPrompt>>,
    ) -> Result<Self, SchedulerError> {
        let shared = Arc::new(Shared::default());
        let dispatch = DispatchThread::spawn(Arc::clone(&shared), config.clone(), backend)?;
        Ok(Self {
            config,
            shared,
            dispatch: Some(dispatch),
            critical: HashSet::new(),
            staged: Vec::new(),
            result_handler,
            retry_prompt,
        })
    }

    /// Queue jobs for compilation. Never waits on workers.
    ///
    /// `apply_results` routes the finalized groups to the result handler
    /// instead of staging them.
    pub fn add_jobs(&self, jobs: Vec<Job>, apply_results: bool) -> Result<Vec<JobId>, SchedulerError> {
        if jobs.is_empty() {
            self.check_health()?;
            return Ok(Vec::new());
        }
        let ids: Vec<JobId> = jobs.iter().map(Job::id).collect();
        {
            let mut state = self.shared.lock()?;
            state.enqueue(jobs, apply_results);
            debug!(
                added = ids.len(),
                queued = state.queue.len(),
                outstanding = state.num_outstanding_jobs,
                "jobs added"
            );
        }
        self.shared.work_available.notify_all();
        Ok(ids)
    }

    /// Whether any job is still waiting for a result. Approximate.
    pub fn is_compiling(&self) -> bool {
        self.num_remaining_jobs() > 0
    }

    /// Jobs submitted but not yet finalized. Approximate.
    pub fn num_remaining_jobs(&self) -> usize {
        self.shared.lock_relaxed().num_outstanding_jobs
    }

    /// Always drain `group` in a results pass with `block_on_critical` set.
    pub fn mark_critical(&mut self, group: GroupId) {
        self.critical.insert(group);
    }

    pub fn clear_critical(&mut self, group: GroupId) {
        self.critical.remove(&group);
    }

    /// Switch between the loading and interactive worker counts. Batches
    /// already in flight finish on their slots.
    pub fn set_interactive(&self, interactive: bool) {
        let was = self.shared.interactive.swap(interactive, Ordering::Relaxed);
        if was != interactive {
            info!(
                interactive,
                workers = self.config.active_slots(interactive),
                "worker count changed"
            );
            self.shared.work_available.notify_all();
        }
    }

    /// Remove and return the staged results of `group`.
    pub fn take_group_results(&mut self, group: GroupId) -> Option<GroupResults> {
        let pos = self.staged.iter().position(|r| r.group == group)?;
        Some(self.staged.remove(pos))
    }

    /// Remove and return every staged group, in completion order.
    pub fn drain_staged_results(&mut self) -> Vec<GroupResults> {
        std::mem::take(&mut self.staged)
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.shared.metrics_snapshot()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Fails once the dispatch thread has died.
    pub fn check_health(&self) -> Result<(), SchedulerError> {
        self.shared.lock().map(|_| ())
    }

    /// Wait for every outstanding job, then stop the dispatch thread.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        let drained = self.finish_all_compilation();
        self.stop();
        drained
    }

    fn stop(&mut self) {
        let Some(handle) = self.dispatch.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::Release);
        {
            // Holding the lock orders the flag before the dispatch thread's next wait.
            let _state = self.shared.lock_relaxed();
            self.shared.work_available.notify_all();
        }
        if handle.join().is_err() {
            warn!("dispatch thread panicked during shutdown");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
