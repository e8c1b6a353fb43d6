use kiln_core::Job;

/// Asked by [`Scheduler::finish_compilation`](crate::Scheduler::finish_compilation)
/// whether failed jobs should be compiled again.
///
/// Only consulted when `prompt_to_retry_on_error` is set. Returning `true`
/// re-submits exactly the failed jobs and waits for them again.
pub trait RetryPrompt: Send {
    fn should_retry(&mut self, failed: &[&Job]) -> bool;
}

impl<F> RetryPrompt for F
where
    F: FnMut(&[&Job]) -> bool + Send,
{
    fn should_retry(&mut self, failed: &[&Job]) -> bool {
        self(failed)
    }
}
