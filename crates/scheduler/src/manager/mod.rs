//! The scheduler façade.
//!
//! [`SchedulerBuilder`] configures and starts a [`Scheduler`]; the
//! scheduler owns the dispatch thread and is the only thing callers talk
//! to. Split into:
//! - `core`: the struct, submission and cheap queries
//! - `finish`: blocking waits, the time-budgeted results pass, retries and delivery

mod core;
mod finish;

use std::sync::Arc;

use tracing::info;

use kiln_core::{Compiler, DigestCompiler};

use crate::aggregator::GroupResults;
use crate::config::SchedulerConfig;
use crate::dispatch::Backend;
use crate::error::SchedulerError;
use crate::retry::RetryPrompt;
use crate::transport::{ProcessTransportFactory, TransportFactory};

pub use self::core::Scheduler;

/// Called at finalize time for groups submitted with `apply_results = true`.
pub type ResultHandler = Box<dyn FnMut(GroupResults) + Send>;

// ── SchedulerBuilder ─────────────────────────────────────────────────

/// Fluent builder for a [`Scheduler`].
///
/// # Example
/// ```ignore
/// let scheduler = Scheduler::builder(config)
///     .on_results(|group| println!("{} done: {}", group.group, group.all_succeeded))
///     .start()?;
/// ```
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    compiler: Option<Arc<dyn Compiler>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    result_handler: Option<ResultHandler>,
    retry_prompt: Option<Box<dyn RetryPrompt>>,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            compiler: None,
            transport_factory: None,
            result_handler: None,
            retry_prompt: None,
        }
    }

    /// Compiler used when out-of-process workers are disabled
    /// (default: [`DigestCompiler`]).
    pub fn compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Replace the process-launching transports, e.g. with in-memory ones.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Receive finalized groups submitted with `apply_results = true`.
    /// Without a handler they are staged like every other group.
    pub fn on_results<F>(mut self, handler: F) -> Self
    where
        F: FnMut(GroupResults) + Send + 'static,
    {
        self.result_handler = Some(Box::new(handler));
        self
    }

    /// Ask this prompt before re-submitting failed jobs.
    pub fn retry_prompt(mut self, prompt: impl RetryPrompt + 'static) -> Self {
        self.retry_prompt = Some(Box::new(prompt));
        self
    }

    /// Validate the config and start the dispatch thread.
    pub fn start(self) -> Result<Scheduler, SchedulerError> {
        self.config.validate()?;

        let backend = if self.config.allow_out_of_process_workers {
            let factory = self.transport_factory.unwrap_or_else(|| {
                Arc::new(ProcessTransportFactory::new(
                    self.config.worker_executable.clone(),
                    self.config.worker_args.clone(),
                    self.config.use_pipes,
                ))
            });
            info!(
                workers = self.config.resolved_worker_threads(),
                interactive_workers = self.config.resolved_interactive_threads(),
                executable = %self.config.worker_executable.display(),
                pipes = self.config.use_pipes,
                "starting scheduler"
            );
            Backend::Workers(factory)
        } else {
            let compiler = self
                .compiler
                .unwrap_or_else(|| Arc::new(DigestCompiler));
            info!(compiler = compiler.name(), "starting scheduler in direct mode");
            Backend::Direct(compiler)
        };

        Scheduler::start(self.config, backend, self.result_handler, self.retry_prompt)
    }
}
