use std::sync::PoisonError;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use kiln_core::{GroupId, Job};

use crate::aggregator::GroupAggregator;
use crate::error::SchedulerError;

use super::Scheduler;

/// Upper bound on one wait for the dispatch thread before re-checking.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Which groups a blocking wait is for.
enum WaitFor<'a> {
    All,
    Groups(&'a [GroupId]),
}

impl WaitFor<'_> {
    fn includes(&self, group: GroupId) -> bool {
        match self {
            WaitFor::All => true,
            WaitFor::Groups(groups) => groups.contains(&group),
        }
    }
}

impl Scheduler {
    /// Block until every job of `groups` is finalized, then deliver them.
    /// Groups never submitted are ignored.
    pub fn finish_compilation(&mut self, groups: &[GroupId]) -> Result<(), SchedulerError> {
        self.finish(WaitFor::Groups(groups))
    }

    /// Block until nothing is outstanding, then deliver every finished group.
    pub fn finish_all_compilation(&mut self) -> Result<(), SchedulerError> {
        self.finish(WaitFor::All)
    }

    /// Deliver finished groups until the time budget runs out.
    ///
    /// With `limit_execution_time` unset every finished group is delivered.
    /// With `block_on_critical` set the critical groups are first waited on
    /// and delivered regardless of budget. Does nothing when no group is
    /// finished.
    pub fn process_async_results(
        &mut self,
        limit_execution_time: bool,
        block_on_critical: bool,
    ) -> Result<(), SchedulerError> {
        self.check_health()?;

        if block_on_critical && !self.critical.is_empty() {
            let critical: Vec<GroupId> = self.critical.iter().copied().collect();
            for agg in collapse(self.block_until_done(&WaitFor::Groups(&critical))?) {
                self.deliver(agg);
            }
        }

        let deadline = Instant::now() + self.config.process_results_target_time();
        let mut delivered = 0usize;
        loop {
            if limit_execution_time && delivered > 0 && Instant::now() >= deadline {
                break;
            }
            let next = self.shared.lock()?.pending_finalize.pop_front();
            let Some(agg) = next else {
                break;
            };
            self.deliver(agg);
            delivered += 1;
        }
        if delivered > 0 {
            let left = self.shared.lock_relaxed().pending_finalize.len();
            debug!(delivered, left, "results pass");
        }
        Ok(())
    }

    fn finish(&mut self, wait: WaitFor<'_>) -> Result<(), SchedulerError> {
        let mut finished = collapse(self.block_until_done(&wait)?);

        while self.config.prompt_to_retry_on_error {
            let failed: Vec<Job> = finished
                .iter()
                .flat_map(|agg| agg.failed_jobs().cloned())
                .collect();
            if failed.is_empty() {
                break;
            }
            let Some(prompt) = self.retry_prompt.as_mut() else {
                break;
            };
            let refs: Vec<&Job> = failed.iter().collect();
            if !prompt.should_retry(&refs) {
                break;
            }

            let groups = self.resubmit(&finished, failed)?;
            for retried in collapse(self.block_until_done(&WaitFor::Groups(&groups))?) {
                match finished.iter_mut().find(|a| a.group() == retried.group()) {
                    Some(agg) => agg.absorb(retried),
                    None => finished.push(retried),
                }
            }
        }

        for agg in finished {
            self.deliver(agg);
        }
        Ok(())
    }

    /// Queue failed jobs again under their original ids. Returns the groups touched.
    fn resubmit(
        &self,
        finished: &[GroupAggregator],
        failed: Vec<Job>,
    ) -> Result<Vec<GroupId>, SchedulerError> {
        info!(jobs = failed.len(), "retrying failed jobs");
        let mut groups: Vec<GroupId> = Vec::new();
        {
            let mut state = self.shared.lock()?;
            for mut job in failed {
                job.reset_for_retry();
                let group = job.group();
                let apply = finished
                    .iter()
                    .find(|a| a.group() == group)
                    .map(GroupAggregator::apply_results)
                    .unwrap_or(false);
                if !groups.contains(&group) {
                    groups.push(group);
                }
                state.enqueue(vec![job], apply);
            }
        }
        self.shared.work_available.notify_all();
        Ok(groups)
    }

    /// Wait until the groups selected by `wait` have nothing in flight,
    /// taking their finished aggregators as they complete.
    fn block_until_done(&self, wait: &WaitFor<'_>) -> Result<Vec<GroupAggregator>, SchedulerError> {
        let mut taken = Vec::new();
        let mut state = self.shared.lock()?;
        loop {
            taken.extend(state.take_pending(|g| wait.includes(g)));
            let done = match wait {
                WaitFor::All => state.num_outstanding_jobs == 0,
                WaitFor::Groups(groups) => groups.iter().all(|g| !state.groups.contains_key(g)),
            };
            if done {
                return Ok(taken);
            }

            // The timeout keeps this loop checking even if a notification is missed.
            let (guard, _) = self
                .shared
                .jobs_committed
                .wait_timeout(state, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if let Some(reason) = &state.fatal {
                return Err(SchedulerError::DispatchFailed(reason.clone()));
            }
        }
    }

    /// Hand a finalized group to the result handler or stage it.
    fn deliver(&mut self, agg: GroupAggregator) {
        let apply = agg.apply_results();
        let results = agg.into_results();
        debug!(
            group = %results.group,
            jobs = results.jobs.len(),
            all_succeeded = results.all_succeeded,
            apply,
            "group finalized"
        );
        match self.result_handler.as_mut() {
            Some(handler) if apply => handler(results),
            _ => match self.staged.iter_mut().find(|r| r.group == results.group) {
                Some(existing) => existing.merge(results),
                None => self.staged.push(results),
            },
        }
    }
}

/// Merge aggregators of the same group that completed separately.
fn collapse(aggs: Vec<GroupAggregator>) -> Vec<GroupAggregator> {
    let mut out: Vec<GroupAggregator> = Vec::with_capacity(aggs.len());
    for agg in aggs {
        match out.iter_mut().find(|a| a.group() == agg.group()) {
            Some(existing) => existing.absorb(agg),
            None => out.push(agg),
        }
    }
    out
}
