use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, warn};

use kiln_core::wire::{self, BatchRequest, BatchResponse};

use crate::error::SchedulerError;
use crate::ipc::BatchArtifacts;

use super::{kill_child, TransportPoll, WorkerTransport};

/// How long to wait for a last frame after the worker exited.
const EXIT_DRAIN: Duration = Duration::from_millis(50);

type Frame = Result<BatchResponse, String>;

/// One long-lived worker per slot, fed frames over stdin/stdout.
///
/// The worker is started as `<exe> [args] --pipe` and answers each request
/// frame with one response frame, staying alive between batches. A reader
/// thread forwards decoded responses so polling never blocks.
pub struct PipeTransport {
    slot: usize,
    executable: PathBuf,
    args: Vec<String>,
    worker: Option<PipeWorker>,
}

struct PipeWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    responses: Receiver<Frame>,
    reader: Option<JoinHandle<()>>,
}

impl PipeTransport {
    pub fn new(slot: usize, executable: &Path, args: Vec<String>) -> Self {
        Self {
            slot,
            executable: executable.to_path_buf(),
            args,
            worker: None,
        }
    }

    fn launch(&mut self) -> Result<(), SchedulerError> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .arg("--pipe")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                SchedulerError::Transport(format!(
                    "failed to launch {}: {e}",
                    self.executable.display()
                ))
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                kill_child(self.slot, &mut child);
                return Err(SchedulerError::Transport("worker pipes unavailable".into()));
            }
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        let slot = self.slot;
        let reader = std::thread::Builder::new()
            .name(format!("kiln-pipe-{slot}"))
            .spawn(move || read_responses(slot, stdout, tx));
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                kill_child(self.slot, &mut child);
                return Err(e.into());
            }
        };

        debug!(slot = self.slot, pid = child.id(), "pipe worker launched");
        self.worker = Some(PipeWorker {
            child,
            stdin: Some(stdin),
            responses: rx,
            reader: Some(reader),
        });
        Ok(())
    }

    fn worker_alive(&mut self) -> bool {
        match self.worker.as_mut() {
            Some(w) => matches!(w.child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

fn read_responses(slot: usize, stdout: ChildStdout, tx: Sender<Frame>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match wire::read_frame::<_, BatchResponse>(&mut reader) {
            Ok(Some(resp)) => {
                if tx.send(Ok(resp)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(slot, error = %e, "pipe worker sent a malformed frame");
                let _ = tx.send(Err(e.to_string()));
                break;
            }
        }
    }
}

impl WorkerTransport for PipeTransport {
    fn send(
        &mut self,
        _artifacts: &BatchArtifacts,
        request: &BatchRequest,
    ) -> Result<bool, SchedulerError> {
        let mut launched = false;
        if !self.worker_alive() {
            self.kill();
            self.launch()?;
            launched = true;
        }

        let Some(stdin) = self.worker.as_mut().and_then(|w| w.stdin.as_mut()) else {
            return Err(SchedulerError::Transport("pipe worker has no stdin".into()));
        };
        if let Err(e) = wire::write_frame(stdin, request) {
            warn!(slot = self.slot, error = %e, "failed to write request to pipe worker");
            self.kill();
            return Err(e.into());
        }
        Ok(launched)
    }

    fn poll(&mut self) -> Result<TransportPoll, SchedulerError> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(TransportPoll::Exited(None));
        };

        match worker.responses.try_recv() {
            Ok(Ok(resp)) => return Ok(TransportPoll::Ready(resp)),
            Ok(Err(reason)) => {
                self.kill();
                return Err(SchedulerError::Transport(reason));
            }
            Err(TryRecvError::Disconnected) => {
                // stdout closed: the worker is gone or about to be.
                let code = worker.child.try_wait().ok().flatten().and_then(|s| s.code());
                self.kill();
                return Ok(TransportPoll::Exited(code));
            }
            Err(TryRecvError::Empty) => {}
        }

        let Some(status) = worker.child.try_wait()? else {
            return Ok(TransportPoll::Pending);
        };
        let last = match worker.responses.recv_timeout(EXIT_DRAIN) {
            Ok(Ok(resp)) => Some(resp),
            Ok(Err(_)) | Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                None
            }
        };
        self.kill();
        Ok(match last {
            Some(resp) => TransportPoll::Ready(resp),
            None => TransportPoll::Exited(status.code()),
        })
    }

    fn kill(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        // Closing stdin lets a well-behaved worker exit on its own.
        drop(worker.stdin.take());
        kill_child(self.slot, &mut worker.child);
        if let Some(reader) = worker.reader.take() {
            if reader.join().is_err() {
                warn!(slot = self.slot, "pipe reader thread panicked");
            }
        }
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.kill();
    }
}
