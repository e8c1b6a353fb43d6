//! Worker side of the scheduler's IPC contract.
//!
//! A worker receives a [`BatchRequest`], compiles every entry with a
//! [`Compiler`] and answers with a [`BatchResponse`] carrying the same
//! batch id and one result per request index. Two ways to be driven:
//! - [`serve_file`]: one batch from a request file to a response file,
//!   published with a rename so the scheduler never reads a partial answer
//! - [`serve_pipe`]: a stream of batches over stdin/stdout until EOF

use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use tracing::{debug, info, warn};

use kiln_core::wire::{self, BatchRequest, BatchResponse, ResponseEntry};
use kiln_core::{panic_message, CompileOutput, Compiler, KilnError};

/// Compile every entry of a batch. A panicking compile fails only its own entry.
pub fn compile_batch(compiler: &dyn Compiler, request: BatchRequest) -> BatchResponse {
    let results = request
        .jobs
        .into_iter()
        .map(|entry| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                compiler.compile(&entry.worker_type, &entry.input)
            }))
            .unwrap_or_else(|payload| {
                let reason = panic_message(payload.as_ref());
                warn!(index = entry.index, %reason, "compiler panicked");
                CompileOutput::failure(vec![format!("compiler panicked: {reason}")])
            });
            ResponseEntry::from_output(entry.index, outcome)
        })
        .collect();

    BatchResponse {
        batch_id: request.batch_id,
        results,
    }
}

/// Answer the single batch in `input` by writing `output`.
pub fn serve_file(compiler: &dyn Compiler, input: &Path, output: &Path) -> Result<usize, KilnError> {
    let request: BatchRequest = wire::read_frame_file(input)?
        .ok_or_else(|| KilnError::Frame(format!("no request at {}", input.display())))?;
    let jobs = request.jobs.len();
    debug!(batch = request.batch_id, jobs, "compiling batch");

    let response = compile_batch(compiler, request);
    wire::write_frame_file(output, &response)?;
    Ok(jobs)
}

/// Answer request frames from `reader` on `writer` until the reader closes.
/// Returns the number of batches served.
pub fn serve_pipe<R: Read, W: Write>(
    compiler: &dyn Compiler,
    mut reader: R,
    mut writer: W,
) -> Result<u64, KilnError> {
    let mut served = 0;
    while let Some(request) = wire::read_frame::<_, BatchRequest>(&mut reader)? {
        debug!(batch = request.batch_id, jobs = request.jobs.len(), "compiling batch");
        let response = compile_batch(compiler, request);
        wire::write_frame(&mut writer, &response)?;
        served += 1;
    }
    info!(batches = served, "input closed, worker exiting");
    Ok(served)
}
