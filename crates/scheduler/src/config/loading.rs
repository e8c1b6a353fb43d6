use std::path::{Path, PathBuf};

use kiln_core::config::{env_flag, env_opt, env_parse};

use crate::error::SchedulerError;

use super::types::SchedulerConfig;

impl SchedulerConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, SchedulerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, SchedulerError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `KILN_<FIELD>` overrides the field of the same name.
    /// Examples:
    /// - `KILN_NUM_WORKER_THREADS` -> `num_worker_threads`
    /// - `KILN_MAX_BATCH_SIZE` -> `max_batch_size`
    /// - `KILN_ALLOW_OUT_OF_PROCESS_WORKERS` -> `allow_out_of_process_workers`
    /// - `KILN_WORKER_ARGS` -> `worker_args` (whitespace separated)
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("KILN_NUM_WORKER_THREADS") {
            self.num_worker_threads = v;
        }
        if let Some(v) = env_parse("KILN_NUM_WORKER_THREADS_DURING_INTERACTIVE") {
            self.num_worker_threads_during_interactive = v;
        }
        if let Some(v) = env_parse("KILN_MAX_BATCH_SIZE") {
            self.max_batch_size = v;
        }
        if let Some(v) = env_parse("KILN_PROCESS_RESULTS_TARGET_TIME_MS") {
            self.process_results_target_time_ms = v;
        }
        if let Some(v) = env_flag("KILN_ALLOW_OUT_OF_PROCESS_WORKERS") {
            self.allow_out_of_process_workers = v;
        }
        if let Some(v) = env_flag("KILN_PROMPT_TO_RETRY_ON_ERROR") {
            self.prompt_to_retry_on_error = v;
        }
        if let Some(v) = env_opt("KILN_WORKING_DIRECTORY") {
            self.working_directory = PathBuf::from(v);
        }
        if let Some(v) = env_opt("KILN_WORKER_EXECUTABLE") {
            self.worker_executable = PathBuf::from(v);
        }
        if let Some(v) = env_opt("KILN_WORKER_ARGS") {
            self.worker_args = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = env_flag("KILN_USE_PIPES") {
            self.use_pipes = v;
        }
        if let Some(v) = env_parse("KILN_WORKER_LIVENESS_TIMEOUT_MS") {
            self.worker_liveness_timeout_ms = v;
        }
        if let Some(v) = env_parse("KILN_IDLE_SLEEP_MS") {
            self.idle_sleep_ms = v;
        }
        if let Some(v) = env_parse("KILN_MAX_JOB_ATTEMPTS") {
            self.max_job_attempts = v;
        }
    }
}
