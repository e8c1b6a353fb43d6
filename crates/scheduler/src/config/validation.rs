use crate::error::SchedulerError;

use super::types::SchedulerConfig;

impl SchedulerConfig {
    /// Validate the config: reject values the dispatch loop cannot work with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_batch_size == 0 {
            return Err(SchedulerError::Config("max_batch_size must be at least 1".into()));
        }
        if self.max_job_attempts == 0 {
            return Err(SchedulerError::Config("max_job_attempts must be at least 1".into()));
        }
        if self.allow_out_of_process_workers {
            self.validate_worker_settings()?;
        }
        Ok(())
    }

    /// Out-of-process mode needs something to launch and a way to detect hangs.
    fn validate_worker_settings(&self) -> Result<(), SchedulerError> {
        if self.worker_executable.as_os_str().is_empty() {
            return Err(SchedulerError::Config(
                "worker_executable is required when out-of-process workers are allowed".into(),
            ));
        }
        if self.worker_liveness_timeout_ms == 0 {
            return Err(SchedulerError::Config(
                "worker_liveness_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.working_directory.as_os_str().is_empty() {
            return Err(SchedulerError::Config("working_directory must not be empty".into()));
        }
        Ok(())
    }
}
