use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};

use kiln_core::{panic_message, CompileOutput, Job};

use crate::error::SchedulerError;
use crate::slot::{FeedOutcome, SlotPoll, WorkerSlot};

use super::core::{DispatchThread, Execution};

/// Consecutive lost batches on one slot before it is reported as an error.
const REPEATED_FAILURE_THRESHOLD: u32 = 3;
/// Lost batches a job may share with others before it is sent on its own.
const ISOLATE_AFTER_LOSSES: u32 = 2;

impl DispatchThread {
    /// Run until shutdown. A panic or error inside the loop is recorded as
    /// fatal so the façade reports it on its next call.
    pub(crate) fn run(mut self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        match outcome {
            Ok(Ok(())) => info!("dispatch thread stopped"),
            Ok(Err(e)) => {
                error!(error = %e, "dispatch thread failed");
                self.shared.record_fatal(e.to_string());
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(%reason, "dispatch thread panicked");
                self.shared.record_fatal(format!("dispatch thread panicked: {reason}"));
            }
        }
        self.teardown();
    }

    pub(super) fn run_loop(&mut self) -> Result<(), SchedulerError> {
        if let Execution::Workers { slots, naming } = &self.execution {
            naming.prepare()?;
            info!(
                slots = slots.len(),
                batch = self.config.max_batch_size,
                dir = %naming.root().display(),
                "dispatch thread started"
            );
        } else {
            info!(mode = self.mode(), "dispatch thread started");
        }

        while !self.shared.shutdown.load(Ordering::Acquire) {
            let direct_batch = self.commit_and_pull();
            let progressed = match direct_batch {
                Some(batch) => {
                    self.compile_direct(batch);
                    true
                }
                None => self.service_slots(),
            };
            if !progressed {
                self.idle_wait();
            }
        }
        Ok(())
    }

    /// Under the shared lock: put lost jobs back at the front of the queue,
    /// commit completed jobs to their groups, then pull new work. Returns the
    /// batch to compile in direct mode.
    pub(super) fn commit_and_pull(&mut self) -> Option<Vec<Job>> {
        let committed = self.completed.len();
        let interactive = self.shared.interactive.load(Ordering::Relaxed);
        let max_batch = self.config.max_batch_size;

        let mut state = self.shared.lock_relaxed();
        if !self.lost.is_empty() {
            state.requeue_front(std::mem::take(&mut self.lost));
        }
        for job in self.completed.drain(..) {
            state.commit(job);
        }

        let direct_batch = match &mut self.execution {
            Execution::Workers { slots, .. } => {
                let active = self.config.active_slots(interactive);
                assign_idle_slots(slots, &mut state.queue, active, max_batch);
                None
            }
            Execution::Direct(_) => {
                let n = max_batch.min(state.queue.len());
                (n > 0).then(|| state.queue.drain(..n).collect())
            }
        };
        drop(state);

        if committed > 0 {
            self.shared.jobs_committed.notify_all();
        }
        direct_batch
    }

    /// Feed, launch and drain every slot. Returns whether anything moved.
    pub(super) fn service_slots(&mut self) -> bool {
        let Execution::Workers { slots, naming } = &mut self.execution else {
            return false;
        };
        let liveness = self.config.worker_liveness_timeout();
        let mut progressed = false;
        let mut lost = Vec::new();

        for slot in slots.iter_mut() {
            match slot.feed(naming) {
                FeedOutcome::Nothing => {}
                FeedOutcome::Sent {
                    batch_id,
                    size,
                    launched,
                } => {
                    debug!(slot = slot.index(), batch = batch_id, size, launched, "batch dispatched");
                    self.shared.update_metrics(|m| {
                        m.record_batch_sent(size);
                        if launched {
                            m.record_launch();
                        }
                    });
                    progressed = true;
                }
                FeedOutcome::Failed { jobs, reason } => {
                    lost.push(LostBatch::from_slot(slot, jobs, reason));
                    progressed = true;
                }
            }

            match slot.poll(liveness) {
                SlotPoll::Idle | SlotPoll::Pending => {}
                SlotPoll::Completed { jobs, duration } => {
                    let failed = jobs.iter().filter(|j| !j.succeeded()).count();
                    debug!(
                        slot = slot.index(),
                        jobs = jobs.len(),
                        failed,
                        ms = duration.as_millis() as u64,
                        "batch completed"
                    );
                    self.shared
                        .update_metrics(|m| m.record_batch_completed(duration, jobs.len(), failed));
                    self.completed.extend(jobs);
                    progressed = true;
                }
                SlotPoll::Lost { jobs, reason } => {
                    lost.push(LostBatch::from_slot(slot, jobs, reason));
                    progressed = true;
                }
            }
        }

        for batch in lost {
            self.handle_lost(batch);
        }
        progressed
    }

    /// Route the jobs of a lost batch: back to the queue, or failed once
    /// they have used up their attempts.
    fn handle_lost(&mut self, batch: LostBatch) {
        let max_attempts = self.config.max_job_attempts;
        let mut requeued = 0;
        let mut exhausted = 0;
        for mut job in batch.jobs {
            job.note_lost();
            if job.attempts() >= max_attempts {
                job.complete(CompileOutput::failure(vec![format!(
                    "worker lost this job {} times, last: {}",
                    job.attempts(),
                    batch.reason
                )]));
                self.completed.push(job);
                exhausted += 1;
            } else {
                self.lost.push(job);
                requeued += 1;
            }
        }

        warn!(slot = batch.slot, requeued, exhausted, reason = %batch.reason, "worker batch lost");
        if batch.failures >= REPEATED_FAILURE_THRESHOLD {
            error!(slot = batch.slot, failures = batch.failures, "worker keeps failing");
        }
        self.shared
            .update_metrics(|m| m.record_lost_batch(requeued, exhausted));
    }

    /// Wait for new work or the next polling interval. Returns early when
    /// jobs are submitted or shutdown is requested.
    fn idle_wait(&self) {
        let state = self.shared.lock_relaxed();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        // Spurious wakeups only shorten the pause.
        let _ = self
            .shared
            .work_available
            .wait_timeout(state, self.config.idle_sleep());
    }

    /// Kill every worker and remove this thread's IPC artifacts. Anything
    /// still held is discarded for this run.
    fn teardown(&mut self) {
        if let Execution::Workers { slots, naming } = &mut self.execution {
            let dropped: usize = slots.iter_mut().map(|s| s.shutdown().len()).sum();
            if dropped > 0 {
                warn!(jobs = dropped, "discarding in-flight jobs at teardown");
            }
            naming.cleanup();
        }
    }
}

/// Hand up to `max_batch` queued jobs to each idle active slot, the slot
/// idle the longest first. A job whose batches were lost repeatedly goes
/// out alone so it cannot take healthy jobs down with it. Returns the
/// number of jobs assigned.
pub(super) fn assign_idle_slots(
    slots: &mut [WorkerSlot],
    queue: &mut VecDeque<Job>,
    active: usize,
    max_batch: usize,
) -> usize {
    let active = active.min(slots.len());
    let mut idle: Vec<&mut WorkerSlot> = slots[..active].iter_mut().filter(|s| s.is_idle()).collect();
    idle.sort_by_key(|s| s.last_activity());

    let mut assigned = 0;
    for slot in idle {
        let batch = next_batch(queue, max_batch);
        if batch.is_empty() {
            break;
        }
        assigned += batch.len();
        slot.assign(batch);
    }
    assigned
}

/// Pop the next batch off the queue front. Stops before a job that has to
/// travel alone, or returns just that job when it is first.
pub(super) fn next_batch(queue: &mut VecDeque<Job>, max_batch: usize) -> Vec<Job> {
    let mut batch = Vec::new();
    while batch.len() < max_batch {
        let Some(front) = queue.front() else {
            break;
        };
        let isolate = front.times_lost() >= ISOLATE_AFTER_LOSSES;
        if isolate && !batch.is_empty() {
            break;
        }
        batch.extend(queue.pop_front());
        if isolate {
            break;
        }
    }
    batch
}

struct LostBatch {
    slot: usize,
    failures: u32,
    jobs: Vec<Job>,
    reason: String,
}

impl LostBatch {
    fn from_slot(slot: &WorkerSlot, jobs: Vec<Job>, reason: String) -> Self {
        Self {
            slot: slot.index(),
            failures: slot.consecutive_failures(),
            jobs,
            reason,
        }
    }
}
