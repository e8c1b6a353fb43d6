//! In-memory transport for dispatch and façade tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use kiln_core::wire::{BatchRequest, BatchResponse, ResponseEntry};
use kiln_core::{Compiler, DigestCompiler};

use crate::error::SchedulerError;
use crate::ipc::BatchArtifacts;

use super::{TransportFactory, TransportPoll, WorkerTransport};

/// What the fake worker does with the next batch it receives.
#[derive(Debug, Clone)]
pub(crate) enum FakeBehavior {
    /// Compile and answer (results in reverse order).
    Answer,
    /// Answer once `delay` has passed.
    Slow(Duration),
    /// Never answer.
    Hang,
    /// Exit without answering.
    Exit,
    /// Answer with an index outside the batch.
    CorruptIndex,
}

#[derive(Debug, Clone)]
pub(crate) struct SentBatch {
    pub slot: usize,
    pub batch_id: u64,
    pub inputs: Vec<Value>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeLog {
    pub launches: usize,
    pub kills: usize,
    pub batches: Vec<SentBatch>,
}

/// Hands out fake transports that share one behavior plan and one log.
#[derive(Clone, Default)]
pub(crate) struct FakeFactory {
    pub log: Arc<Mutex<FakeLog>>,
    plan: Arc<Mutex<VecDeque<FakeBehavior>>>,
    crash_marker: Option<String>,
}

impl FakeFactory {
    /// Batches beyond the plan are answered normally.
    pub fn with_plan(plan: impl IntoIterator<Item = FakeBehavior>) -> Self {
        Self {
            plan: Arc::new(Mutex::new(plan.into_iter().collect())),
            ..Self::default()
        }
    }

    /// Workers exit on any batch holding a source that contains `marker`.
    pub fn crashing_on(marker: &str) -> Self {
        Self {
            crash_marker: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<SentBatch> {
        self.log.lock().unwrap().batches.clone()
    }

    pub fn launches(&self) -> usize {
        self.log.lock().unwrap().launches
    }

    pub fn kills(&self) -> usize {
        self.log.lock().unwrap().kills
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, slot_index: usize) -> Box<dyn WorkerTransport> {
        Box::new(FakeTransport {
            slot: slot_index,
            log: Arc::clone(&self.log),
            plan: Arc::clone(&self.plan),
            crash_marker: self.crash_marker.clone(),
            alive: false,
            pending: None,
        })
    }
}

struct Pending {
    behavior: FakeBehavior,
    ready_at: Instant,
    response: BatchResponse,
}

struct FakeTransport {
    slot: usize,
    log: Arc<Mutex<FakeLog>>,
    plan: Arc<Mutex<VecDeque<FakeBehavior>>>,
    crash_marker: Option<String>,
    alive: bool,
    pending: Option<Pending>,
}

impl WorkerTransport for FakeTransport {
    fn send(
        &mut self,
        _artifacts: &BatchArtifacts,
        request: &BatchRequest,
    ) -> Result<bool, SchedulerError> {
        let mut behavior = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeBehavior::Answer);
        if let Some(marker) = &self.crash_marker {
            let poisoned = request.jobs.iter().any(|e| {
                e.input["source"]
                    .as_str()
                    .is_some_and(|s| s.contains(marker.as_str()))
            });
            if poisoned {
                behavior = FakeBehavior::Exit;
            }
        }

        let launched = !self.alive;
        self.alive = true;
        {
            let mut log = self.log.lock().unwrap();
            if launched {
                log.launches += 1;
            }
            log.batches.push(SentBatch {
                slot: self.slot,
                batch_id: request.batch_id,
                inputs: request.jobs.iter().map(|e| e.input.clone()).collect(),
            });
        }

        let compiler = DigestCompiler;
        let mut results: Vec<ResponseEntry> = request
            .jobs
            .iter()
            .map(|e| ResponseEntry::from_output(e.index, compiler.compile(&e.worker_type, &e.input)))
            .collect();
        results.reverse();
        if let FakeBehavior::CorruptIndex = behavior {
            if let Some(first) = results.first_mut() {
                first.index = request.jobs.len() as u32 + 100;
            }
        }

        let ready_at = match behavior {
            FakeBehavior::Slow(delay) => Instant::now() + delay,
            _ => Instant::now(),
        };
        self.pending = Some(Pending {
            behavior,
            ready_at,
            response: BatchResponse {
                batch_id: request.batch_id,
                results,
            },
        });
        Ok(launched)
    }

    fn poll(&mut self) -> Result<TransportPoll, SchedulerError> {
        let Some(pending) = self.pending.take() else {
            return Ok(TransportPoll::Pending);
        };
        match pending.behavior {
            FakeBehavior::Hang => {
                self.pending = Some(pending);
                Ok(TransportPoll::Pending)
            }
            FakeBehavior::Exit => {
                self.alive = false;
                Ok(TransportPoll::Exited(Some(1)))
            }
            _ if Instant::now() < pending.ready_at => {
                self.pending = Some(pending);
                Ok(TransportPoll::Pending)
            }
            _ => Ok(TransportPoll::Ready(pending.response)),
        }
    }

    fn kill(&mut self) {
        if self.alive {
            self.log.lock().unwrap().kills += 1;
        }
        self.alive = false;
        self.pending = None;
    }
}
