use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{debug, trace};

use kiln_core::wire::{self, BatchRequest, BatchResponse, FrameStatus};

use crate::error::SchedulerError;
use crate::ipc::BatchArtifacts;

use super::{kill_child, TransportPoll, WorkerTransport};

/// One worker process per batch, talking through files.
///
/// The request is written to `artifacts.input`, the worker is started as
/// `<exe> [args] --input <in> --output <out>` and must write its response
/// to `<out>.tmp` and rename it to `<out>` before exiting.
pub struct FileTransport {
    slot: usize,
    executable: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
    current: Option<BatchArtifacts>,
}

impl FileTransport {
    pub fn new(slot: usize, executable: &Path, args: Vec<String>) -> Self {
        Self {
            slot,
            executable: executable.to_path_buf(),
            args,
            child: None,
            current: None,
        }
    }

    fn launch(&mut self, artifacts: &BatchArtifacts) -> Result<(), SchedulerError> {
        let child = Command::new(&self.executable)
            .args(&self.args)
            .arg("--input")
            .arg(&artifacts.input)
            .arg("--output")
            .arg(&artifacts.output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                SchedulerError::Transport(format!(
                    "failed to launch {}: {e}",
                    self.executable.display()
                ))
            })?;
        debug!(slot = self.slot, pid = child.id(), "worker launched");
        self.child = Some(child);
        Ok(())
    }

    /// Read the response file if it is complete.
    fn read_response(&self, output: &Path) -> Result<Option<BatchResponse>, SchedulerError> {
        let bytes = match fs::read(output) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match wire::frame_status(&bytes) {
            FrameStatus::Complete => Ok(Some(wire::decode_frame(&bytes)?)),
            FrameStatus::Incomplete => {
                trace!(slot = self.slot, len = bytes.len(), "response still being written");
                Ok(None)
            }
            FrameStatus::Invalid(reason) => Err(SchedulerError::Transport(format!(
                "malformed response in {}: {reason}",
                output.display()
            ))),
        }
    }

    /// The worker answered: drop the artifacts and reap the process if it is done.
    fn finish_batch(&mut self) {
        if let Some(artifacts) = self.current.take() {
            artifacts.remove();
        }
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                self.child = None;
            }
        }
    }
}

impl WorkerTransport for FileTransport {
    fn send(
        &mut self,
        artifacts: &BatchArtifacts,
        request: &BatchRequest,
    ) -> Result<bool, SchedulerError> {
        // A worker still alive from the previous batch has already answered; it
        // must not pick up the new request.
        if let Some(mut stale) = self.child.take() {
            kill_child(self.slot, &mut stale);
        }

        wire::write_frame_file(&artifacts.input, request)?;
        self.current = Some(artifacts.clone());
        if let Err(e) = self.launch(artifacts) {
            artifacts.remove();
            self.current = None;
            return Err(e);
        }
        Ok(true)
    }

    fn poll(&mut self) -> Result<TransportPoll, SchedulerError> {
        let Some(output) = self.current.as_ref().map(|a| a.output.clone()) else {
            return Ok(TransportPoll::Pending);
        };

        if let Some(resp) = self.read_response(&output)? {
            self.finish_batch();
            return Ok(TransportPoll::Ready(resp));
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(TransportPoll::Exited(None));
        };
        match child.try_wait()? {
            None => Ok(TransportPoll::Pending),
            Some(status) => {
                self.child = None;
                // The response may have landed between the read and the exit check.
                if let Some(resp) = self.read_response(&output)? {
                    self.finish_batch();
                    return Ok(TransportPoll::Ready(resp));
                }
                Ok(TransportPoll::Exited(status.code()))
            }
        }
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill_child(self.slot, &mut child);
        }
        if let Some(artifacts) = self.current.take() {
            artifacts.remove();
        }
    }
}

impl Drop for FileTransport {
    fn drop(&mut self) {
        self.kill();
    }
}
