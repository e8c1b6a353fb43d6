//! Out-of-process compilation scheduler.
//!
//! Callers submit [`Job`]s tagged with a [`GroupId`] to a [`Scheduler`]. A
//! dedicated dispatch thread batches them onto a pool of worker processes,
//! harvests the responses and hands completed groups back either through a
//! blocking wait ([`Scheduler::finish_compilation`]) or an incremental,
//! time-budgeted tick ([`Scheduler::process_async_results`]).

pub mod aggregator;
pub mod config;
mod dispatch;
pub mod error;
pub mod ipc;
pub mod manager;
pub mod metrics;
pub mod retry;
mod shared;
mod slot;
pub mod transport;

pub use aggregator::GroupResults;
pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use ipc::BatchArtifacts;
pub use manager::{ResultHandler, Scheduler, SchedulerBuilder};
pub use metrics::SchedulerMetrics;
pub use retry::RetryPrompt;
pub use transport::{ProcessTransportFactory, TransportFactory, TransportPoll, WorkerTransport};

pub use kiln_core::{CompileOutput, Compiler, GroupId, Job, JobId, WorkerTypeKey};
