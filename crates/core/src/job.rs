//! The unit of work handed to the scheduler.
//!
//! A [`Job`] is created by the caller with an opaque input payload, moved
//! into the scheduler, and handed back once its result has been delivered
//! to its group. Input fields never change after creation; the result
//! fields are filled in by the scheduler.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compiler::CompileOutput;

/// Caller-defined aggregation key. Many jobs map to one group, and the
/// group is what callers wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single job. Stable across re-queueing and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which code path or variant produced a job. Passed through to the
/// compiler untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerTypeKey(pub String);

impl WorkerTypeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerTypeKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for WorkerTypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of out-of-process work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    group: GroupId,
    worker_type: WorkerTypeKey,
    input: Value,
    output: Option<Value>,
    errors: Vec<String>,
    succeeded: bool,
    finalized: bool,
    attempts: u32,
    losses: u32,
}

impl Job {
    /// Create a job for `group`. The id is unique within the process.
    pub fn new(group: GroupId, worker_type: impl Into<WorkerTypeKey>, input: Value) -> Self {
        Self {
            id: JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)),
            group,
            worker_type: worker_type.into(),
            input,
            output: None,
            errors: Vec::new(),
            succeeded: false,
            finalized: false,
            attempts: 0,
            losses: 0,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn worker_type(&self) -> &WorkerTypeKey {
        &self.worker_type
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Response payload; `None` until the job completed with output.
    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    /// Diagnostics reported by the compiler.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Only meaningful once [`Job::is_finalized`] is true.
    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// True once the result has been delivered to the group aggregator.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Number of times this job was handed to a worker.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record that the job is being handed to a worker.
    pub fn note_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Number of batches containing this job that a worker lost.
    pub fn times_lost(&self) -> u32 {
        self.losses
    }

    /// Record that the batch carrying this job was lost.
    pub fn note_lost(&mut self) {
        self.losses += 1;
    }

    /// Store the result of a compile.
    pub fn complete(&mut self, outcome: CompileOutput) {
        self.succeeded = outcome.succeeded;
        self.output = outcome.output;
        self.errors = outcome.errors;
    }

    /// Mark the result as delivered to its group.
    pub fn mark_finalized(&mut self) {
        self.finalized = true;
    }

    /// Clear all result fields so the job can be submitted again.
    /// Identity, group and payload are kept.
    pub fn reset_for_retry(&mut self) {
        self.output = None;
        self.errors.clear();
        self.succeeded = false;
        self.finalized = false;
        self.attempts = 0;
        self.losses = 0;
    }
}
