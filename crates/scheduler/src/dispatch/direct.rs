use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use tracing::{debug, warn};

use kiln_core::{panic_message, CompileOutput, Job};

use super::core::{DispatchThread, Execution};

impl DispatchThread {
    /// Compile a batch on this thread. Results are committed on the next
    /// pass exactly like worker responses.
    pub(super) fn compile_direct(&mut self, mut batch: Vec<Job>) {
        let Execution::Direct(compiler) = &self.execution else {
            self.lost.extend(batch);
            return;
        };
        let started = Instant::now();
        let size = batch.len();
        self.shared.update_metrics(|m| m.record_batch_sent(size));

        for job in batch.iter_mut() {
            job.note_attempt();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                compiler.compile(job.worker_type(), job.input())
            }));
            let outcome = outcome.unwrap_or_else(|payload| {
                let reason = panic_message(payload.as_ref());
                warn!(compiler = compiler.name(), job = %job.id(), %reason, "compiler panicked");
                CompileOutput::failure(vec![format!("compiler panicked: {reason}")])
            });
            job.complete(outcome);
        }

        let failed = batch.iter().filter(|j| !j.succeeded()).count();
        let duration = started.elapsed();
        debug!(compiler = compiler.name(), jobs = size, failed, "direct batch compiled");
        self.shared
            .update_metrics(|m| m.record_batch_completed(duration, size, failed));
        self.completed.extend(batch);
    }
}
