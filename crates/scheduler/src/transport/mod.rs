//! How a worker slot talks to its worker process.
//!
//! The dispatch thread only needs "send a batch" and "poll for the answer";
//! [`FileTransport`] does that with per-batch request/response files and a
//! fresh process per batch, [`PipeTransport`] with one long-lived process
//! per slot fed over stdin/stdout.

mod file;
mod pipe;
#[cfg(test)]
pub(crate) mod fake;

use std::path::PathBuf;
use std::process::Child;

use tracing::debug;

use kiln_core::wire::{BatchRequest, BatchResponse};

use crate::error::SchedulerError;
use crate::ipc::BatchArtifacts;

pub use file::FileTransport;
pub use pipe::PipeTransport;

/// Result of polling a transport with a request outstanding.
#[derive(Debug)]
pub enum TransportPoll {
    /// No answer yet and the worker is still running.
    Pending,
    /// A complete response arrived.
    Ready(BatchResponse),
    /// The worker exited without answering. Carries the exit code if any.
    Exited(Option<i32>),
}

/// Request/response channel to one worker process.
///
/// Owned by a single worker slot and only touched by the dispatch thread.
/// Implementations must kill their process when dropped.
pub trait WorkerTransport: Send {
    /// Hand a batch to the worker, launching a process if none is running.
    /// Returns `true` when a new process was started.
    fn send(&mut self, artifacts: &BatchArtifacts, request: &BatchRequest)
        -> Result<bool, SchedulerError>;

    /// Check for the response to the last request without blocking.
    fn poll(&mut self) -> Result<TransportPoll, SchedulerError>;

    /// Kill the worker and forget the outstanding request.
    fn kill(&mut self);
}

/// Creates the transport for each worker slot.
pub trait TransportFactory: Send + Sync {
    fn create(&self, slot_index: usize) -> Box<dyn WorkerTransport>;
}

/// Launches real worker processes, using pipes or files per config.
#[derive(Debug, Clone)]
pub struct ProcessTransportFactory {
    executable: PathBuf,
    args: Vec<String>,
    use_pipes: bool,
}

impl ProcessTransportFactory {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>, use_pipes: bool) -> Self {
        Self {
            executable: executable.into(),
            args,
            use_pipes,
        }
    }
}

impl TransportFactory for ProcessTransportFactory {
    fn create(&self, slot_index: usize) -> Box<dyn WorkerTransport> {
        if self.use_pipes {
            Box::new(PipeTransport::new(slot_index, &self.executable, self.args.clone()))
        } else {
            Box::new(FileTransport::new(slot_index, &self.executable, self.args.clone()))
        }
    }
}

/// Kill a child and reap it so it does not linger as a zombie.
pub(crate) fn kill_child(slot: usize, child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => debug!(slot, error = %e, "try_wait failed before kill"),
    }
    if let Err(e) = child.kill() {
        debug!(slot, error = %e, "failed to kill worker");
    }
    if let Err(e) = child.wait() {
        debug!(slot, error = %e, "failed to reap worker");
    }
}
