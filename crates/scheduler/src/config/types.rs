use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduler configuration, typically parsed from TOML.
///
/// Read once when the scheduler starts. The interactive/loading split of
/// the worker count is switched at runtime with
/// [`Scheduler::set_interactive`](crate::Scheduler::set_interactive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker processes used while the caller is loading. 0 = available parallelism.
    #[serde(default)]
    pub num_worker_threads: usize,

    /// Worker processes used while the caller's main loop is live.
    /// 0 = half of the loading count (at least one).
    #[serde(default)]
    pub num_worker_threads_during_interactive: usize,

    /// Jobs per IPC round-trip.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Wall-clock budget for one non-blocking results pass, in milliseconds.
    #[serde(default = "default_process_results_target_time")]
    pub process_results_target_time_ms: u64,

    /// `false` compiles jobs on the dispatch thread without worker processes.
    #[serde(default = "default_true")]
    pub allow_out_of_process_workers: bool,

    /// Offer to re-submit failed jobs from `finish_compilation`.
    #[serde(default)]
    pub prompt_to_retry_on_error: bool,

    /// Base directory for IPC artifacts.
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,

    /// Program launched for each worker slot.
    #[serde(default = "default_worker_executable")]
    pub worker_executable: PathBuf,

    /// Extra arguments passed to every worker before the IPC arguments.
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Talk to long-lived workers over stdin/stdout instead of per-batch files.
    #[serde(default)]
    pub use_pipes: bool,

    /// A worker holding a request this long without answering is considered hung.
    #[serde(default = "default_worker_liveness_timeout")]
    pub worker_liveness_timeout_ms: u64,

    /// Dispatch loop pause when there is nothing to do.
    #[serde(default = "default_idle_sleep")]
    pub idle_sleep_ms: u64,

    /// Times a job may be lost to a failing worker before it is failed outright.
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,
}

fn default_max_batch_size() -> usize { 10 }
fn default_process_results_target_time() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_working_directory() -> PathBuf { std::env::temp_dir().join("kiln") }
fn default_worker_executable() -> PathBuf { PathBuf::from("kiln-worker") }
fn default_worker_liveness_timeout() -> u64 { 60_000 }
fn default_idle_sleep() -> u64 { 10 }
fn default_max_job_attempts() -> u32 { 4 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_worker_threads: 0,
            num_worker_threads_during_interactive: 0,
            max_batch_size: default_max_batch_size(),
            process_results_target_time_ms: default_process_results_target_time(),
            allow_out_of_process_workers: default_true(),
            prompt_to_retry_on_error: false,
            working_directory: default_working_directory(),
            worker_executable: default_worker_executable(),
            worker_args: Vec::new(),
            use_pipes: false,
            worker_liveness_timeout_ms: default_worker_liveness_timeout(),
            idle_sleep_ms: default_idle_sleep(),
            max_job_attempts: default_max_job_attempts(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve the loading-phase worker count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.num_worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.num_worker_threads
        }
    }

    /// Resolve the interactive-phase worker count, never above the loading count.
    pub fn resolved_interactive_threads(&self) -> usize {
        let loading = self.resolved_worker_threads();
        if self.num_worker_threads_during_interactive == 0 {
            (loading / 2).max(1)
        } else {
            self.num_worker_threads_during_interactive.min(loading)
        }
    }

    /// Number of worker slots to allocate up front.
    pub fn slot_count(&self) -> usize {
        self.resolved_worker_threads()
    }

    /// Slots allowed to take new batches in the given phase.
    pub fn active_slots(&self, interactive: bool) -> usize {
        if interactive {
            self.resolved_interactive_threads()
        } else {
            self.resolved_worker_threads()
        }
    }

    pub fn process_results_target_time(&self) -> Duration {
        Duration::from_millis(self.process_results_target_time_ms)
    }

    pub fn worker_liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_liveness_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}
