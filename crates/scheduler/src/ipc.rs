//! IPC artifact naming.
//!
//! Request and response files live at
//! `{working_directory}/{process id}/{thread id}-{slot}-{batch}.in|.out`.
//! The thread id is the dispatch thread's, so two schedulers in one
//! process never share a name, and the batch counter keeps consecutive
//! batches of a slot apart. Directories left behind by processes that
//! are no longer running are swept when a dispatch thread starts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Request/response paths of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchArtifacts {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl BatchArtifacts {
    /// Remove both files (and any staged response), ignoring missing ones.
    pub fn remove(&self) {
        for path in [
            &self.input,
            &self.output,
            &kiln_core::wire::staging_path(&self.output),
        ] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "failed to remove IPC artifact");
                }
            }
        }
    }
}

/// Names artifacts for one dispatch thread.
#[derive(Debug, Clone)]
pub struct IpcNaming {
    base: PathBuf,
    process_id: u32,
    root: PathBuf,
    thread_tag: String,
}

impl IpcNaming {
    /// Naming for the calling thread under `working_directory`.
    pub fn for_current_thread(working_directory: &Path) -> Self {
        Self::new(
            working_directory,
            std::process::id(),
            thread_tag(std::thread::current().id()),
        )
    }

    pub fn new(working_directory: &Path, process_id: u32, thread_tag: impl Into<String>) -> Self {
        Self {
            base: working_directory.to_path_buf(),
            process_id,
            root: working_directory.join(process_id.to_string()),
            thread_tag: thread_tag.into(),
        }
    }

    /// Per-process artifact directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifacts(&self, slot: usize, batch: u64) -> BatchArtifacts {
        let stem = format!("{}-{}-{}", self.thread_tag, slot, batch);
        BatchArtifacts {
            input: self.root.join(format!("{stem}.in")),
            output: self.root.join(format!("{stem}.out")),
        }
    }

    /// Create the artifact directory, delete leftovers carrying this
    /// thread's tag (only possible after process id reuse) and sweep the
    /// directories of dead processes.
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        self.remove_own_files()?;
        self.sweep_dead_processes();
        Ok(())
    }

    /// Remove `{working_directory}/{pid}` directories whose process is gone.
    /// Entries that are not numeric are left alone.
    fn sweep_dead_processes(&self) {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.base.display(), error = %e, "cannot scan for stale IPC dirs");
                return;
            }
        };
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if pid == self.process_id || process_alive(pid) {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!(dir = %path.display(), "removed stale IPC dir"),
                Err(e) => debug!(dir = %path.display(), error = %e, "failed to remove stale IPC dir"),
            }
        }
    }

    /// Delete this thread's artifacts and the directory if it ends up empty.
    pub fn cleanup(&self) {
        if let Err(e) = self.remove_own_files() {
            debug!(dir = %self.root.display(), error = %e, "failed to clean IPC artifacts");
        }
        // Fails while other schedulers in this process still use it.
        let _ = fs::remove_dir(&self.root);
    }

    fn remove_own_files(&self) -> io::Result<()> {
        let prefix = format!("{}-", self.thread_tag);
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without a cheap liveness check, every other directory is assumed in use.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Numeric part of a `ThreadId`, which only exposes it through `Debug`.
fn thread_tag(id: std::thread::ThreadId) -> String {
    let digits: String = format!("{id:?}").chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        "0".to_string()
    } else {
        digits
    }
}
