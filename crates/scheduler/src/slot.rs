//! Scheduler-side bookkeeping for one worker process.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use kiln_core::wire::{BatchRequest, BatchResponse, RequestEntry};
use kiln_core::Job;

use crate::ipc::{BatchArtifacts, IpcNaming};
use crate::transport::{TransportPoll, WorkerTransport};

/// A batch handed to the worker and not yet answered.
struct InFlight {
    batch_id: u64,
    jobs: Vec<Job>,
    artifacts: BatchArtifacts,
    sent_at: Instant,
}

/// Outcome of [`WorkerSlot::feed`].
#[derive(Debug)]
pub(crate) enum FeedOutcome {
    /// Nothing queued, or a batch is already in flight.
    Nothing,
    Sent { batch_id: u64, size: usize, launched: bool },
    /// The batch could not be handed over; its jobs come back.
    Failed { jobs: Vec<Job>, reason: String },
}

/// Outcome of [`WorkerSlot::poll`].
#[derive(Debug)]
pub(crate) enum SlotPoll {
    Idle,
    Pending,
    /// The response round-tripped; every job carries its result.
    Completed { jobs: Vec<Job>, duration: Duration },
    /// The worker crashed, hung or answered garbage.
    Lost { jobs: Vec<Job>, reason: String },
}

pub(crate) struct WorkerSlot {
    index: usize,
    queued: Vec<Job>,
    in_flight: Option<InFlight>,
    transport: Box<dyn WorkerTransport>,
    last_activity: Instant,
    batch_counter: u64,
    consecutive_failures: u32,
}

impl WorkerSlot {
    pub fn new(index: usize, transport: Box<dyn WorkerTransport>) -> Self {
        Self {
            index,
            queued: Vec::new(),
            in_flight: None,
            transport,
            last_activity: Instant::now(),
            batch_counter: 0,
            consecutive_failures: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// No queued jobs and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_none()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn assign(&mut self, jobs: impl IntoIterator<Item = Job>) {
        self.queued.extend(jobs);
    }

    /// Send the queued jobs as one batch if nothing is in flight.
    pub fn feed(&mut self, naming: &IpcNaming) -> FeedOutcome {
        if self.in_flight.is_some() || self.queued.is_empty() {
            return FeedOutcome::Nothing;
        }

        self.batch_counter += 1;
        let batch_id = self.batch_counter;
        let artifacts = naming.artifacts(self.index, batch_id);
        let mut jobs = std::mem::take(&mut self.queued);

        let request = BatchRequest {
            batch_id,
            jobs: jobs
                .iter_mut()
                .enumerate()
                .map(|(i, job)| {
                    job.note_attempt();
                    RequestEntry {
                        index: i as u32,
                        worker_type: job.worker_type().clone(),
                        input: job.input().clone(),
                    }
                })
                .collect(),
        };

        match self.transport.send(&artifacts, &request) {
            Ok(launched) => {
                let size = jobs.len();
                trace!(slot = self.index, batch = batch_id, size, launched, "batch sent");
                self.in_flight = Some(InFlight {
                    batch_id,
                    jobs,
                    artifacts,
                    sent_at: Instant::now(),
                });
                FeedOutcome::Sent {
                    batch_id,
                    size,
                    launched,
                }
            }
            Err(e) => {
                self.transport.kill();
                artifacts.remove();
                self.consecutive_failures += 1;
                self.last_activity = Instant::now();
                FeedOutcome::Failed {
                    jobs,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Check the in-flight batch. A request outstanding longer than
    /// `liveness` counts as a hung worker.
    pub fn poll(&mut self, liveness: Duration) -> SlotPoll {
        let Some(flight) = self.in_flight.as_ref() else {
            return SlotPoll::Idle;
        };

        let failure = match self.transport.poll() {
            Ok(TransportPoll::Pending) => {
                if flight.sent_at.elapsed() <= liveness {
                    return SlotPoll::Pending;
                }
                format!("no response within {liveness:?}")
            }
            Ok(TransportPoll::Ready(resp)) => match validate(&resp, flight) {
                Ok(()) => return self.complete(resp),
                Err(reason) => reason,
            },
            Ok(TransportPoll::Exited(Some(code))) => {
                format!("worker exited with code {code} before answering")
            }
            Ok(TransportPoll::Exited(None)) => "worker exited before answering".to_string(),
            Err(e) => e.to_string(),
        };
        self.lose(failure)
    }

    fn complete(&mut self, resp: BatchResponse) -> SlotPoll {
        let Some(flight) = self.in_flight.take() else {
            return SlotPoll::Idle;
        };
        flight.artifacts.remove();

        let mut jobs = flight.jobs;
        for entry in resp.results {
            let index = entry.index as usize;
            jobs[index].complete(entry.into_output());
        }
        self.consecutive_failures = 0;
        self.last_activity = Instant::now();
        SlotPoll::Completed {
            jobs,
            duration: flight.sent_at.elapsed(),
        }
    }

    fn lose(&mut self, reason: String) -> SlotPoll {
        self.transport.kill();
        self.consecutive_failures += 1;
        self.last_activity = Instant::now();
        match self.in_flight.take() {
            Some(flight) => {
                flight.artifacts.remove();
                debug!(slot = self.index, batch = flight.batch_id, %reason, "batch lost");
                SlotPoll::Lost {
                    jobs: flight.jobs,
                    reason,
                }
            }
            None => SlotPoll::Idle,
        }
    }

    /// Kill the worker and give back every job the slot still holds.
    pub fn shutdown(&mut self) -> Vec<Job> {
        self.transport.kill();
        let mut jobs = std::mem::take(&mut self.queued);
        if let Some(flight) = self.in_flight.take() {
            flight.artifacts.remove();
            jobs.extend(flight.jobs);
        }
        jobs
    }
}

/// A response is applied only if it answers exactly this batch: same id,
/// one result per job, every index in range and used once.
fn validate(resp: &BatchResponse, flight: &InFlight) -> Result<(), String> {
    if resp.batch_id != flight.batch_id {
        return Err(format!(
            "response for batch {} while waiting on batch {}",
            resp.batch_id, flight.batch_id
        ));
    }
    if resp.results.len() != flight.jobs.len() {
        return Err(format!(
            "{} results for a batch of {} jobs",
            resp.results.len(),
            flight.jobs.len()
        ));
    }
    let mut seen = HashSet::with_capacity(resp.results.len());
    for entry in &resp.results {
        let index = entry.index as usize;
        if index >= flight.jobs.len() {
            return Err(format!("result index {index} out of range"));
        }
        if !seen.insert(index) {
            return Err(format!("duplicate result index {index}"));
        }
    }
    Ok(())
}
